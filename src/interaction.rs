//! Generic interaction payloads and the synchronous response bodies the
//! server sends back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::routing::{Choice, HandlerKind};

/// Interaction types as numbered by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionType {
    Ping,
    ApplicationCommand,
    MessageComponent,
    Autocomplete,
    ModalSubmit,
}

impl InteractionType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Ping),
            2 => Some(Self::ApplicationCommand),
            3 => Some(Self::MessageComponent),
            4 => Some(Self::Autocomplete),
            5 => Some(Self::ModalSubmit),
            _ => None,
        }
    }

    /// The handler table consulted for this type. Pings have none.
    pub fn handler_kind(self) -> Option<HandlerKind> {
        match self {
            Self::Ping => None,
            Self::ApplicationCommand => Some(HandlerKind::Command),
            Self::MessageComponent => Some(HandlerKind::Component),
            Self::Autocomplete => Some(HandlerKind::Autocomplete),
            Self::ModalSubmit => Some(HandlerKind::Modal),
        }
    }
}

/// The subset of an inbound interaction the relay needs to route it.
///
/// Unknown fields are ignored here; the original bytes travel to agents
/// untouched inside the envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub data: Option<InteractionData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InteractionData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub custom_id: Option<String>,
}

impl Interaction {
    pub fn interaction_type(&self) -> Option<InteractionType> {
        InteractionType::from_code(self.kind)
    }

    /// Route key: `data.name` for commands and autocomplete, `data.custom_id`
    /// for components and modals.
    pub fn route_key(&self, kind: HandlerKind) -> Option<&str> {
        let data = self.data.as_ref()?;
        let key = match kind {
            HandlerKind::Command | HandlerKind::Autocomplete => data.name.as_deref(),
            HandlerKind::Component | HandlerKind::Modal => data.custom_id.as_deref(),
        };
        key.map(str::trim).filter(|key| !key.is_empty())
    }
}

const RESPONSE_PONG: u8 = 1;
const RESPONSE_DEFERRED_CHANNEL_MESSAGE: u8 = 5;
const RESPONSE_AUTOCOMPLETE_RESULT: u8 = 8;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InteractionResponse {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl InteractionResponse {
    pub fn pong() -> Self {
        Self {
            kind: RESPONSE_PONG,
            data: None,
        }
    }

    pub fn deferred() -> Self {
        Self {
            kind: RESPONSE_DEFERRED_CHANNEL_MESSAGE,
            data: None,
        }
    }

    /// Autocomplete results carry only `name` and `value`; descriptions stay
    /// local to the configuration.
    pub fn autocomplete(choices: &[Choice]) -> Self {
        let choices: Vec<Value> = choices
            .iter()
            .map(|choice| serde_json::json!({ "name": choice.name, "value": choice.value }))
            .collect();
        Self {
            kind: RESPONSE_AUTOCOMPLETE_RESULT,
            data: Some(serde_json::json!({ "choices": choices })),
        }
    }
}
