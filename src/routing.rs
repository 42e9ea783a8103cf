//! Handler bindings compiled from configuration, and the lookup the server
//! uses to pick a route for an inbound interaction.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::{HandlersConfig, InteractionSettings, RouteConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Command,
    Component,
    Modal,
    Autocomplete,
}

impl HandlerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Component => "component",
            Self::Modal => "modal",
            Self::Autocomplete => "autocomplete",
        }
    }

    /// Commands and autocomplete names are case-insensitive; component and
    /// modal custom ids are matched exactly.
    pub fn normalize_key(self, key: &str) -> String {
        match self {
            Self::Command | Self::Autocomplete => key.trim().to_lowercase(),
            Self::Component | Self::Modal => key.trim().to_string(),
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub value: Value,
}

/// What a binding resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Agent(String),
    Choices(Vec<Choice>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerBinding {
    pub kind: HandlerKind,
    pub key: String,
    pub route: Route,
}

impl HandlerBinding {
    pub fn agent(&self) -> Option<&str> {
        match &self.route {
            Route::Agent(agent) => Some(agent),
            Route::Choices(_) => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no interaction handlers configured")]
    NoHandlers,
    #[error("autocomplete handler {0} missing choices")]
    MissingChoices(String),
    #[error("no {kind} handler registered for {key:?}")]
    NotFound { kind: HandlerKind, key: String },
}

/// Compile the configured route tables into bindings.
///
/// Non-autocomplete routes without an agent are dropped; autocomplete routes
/// keep only choices with a non-blank name and a value. Returns nothing when
/// interactions are disabled.
pub fn collect_handler_bindings(settings: &InteractionSettings) -> Vec<HandlerBinding> {
    if !settings.enabled {
        return Vec::new();
    }

    let HandlersConfig {
        commands,
        components,
        modals,
        autocomplete,
    } = &settings.handlers;

    let mut bindings = Vec::with_capacity(settings.handlers.total());
    for (kind, table) in [
        (HandlerKind::Command, commands),
        (HandlerKind::Component, components),
        (HandlerKind::Modal, modals),
    ] {
        for (key, route) in table {
            let agent = route.agent.trim();
            let key = kind.normalize_key(key);
            if agent.is_empty() || key.is_empty() {
                tracing::warn!(
                    target = "discord_relay::routing",
                    kind = %kind,
                    key = %key,
                    "dropping handler without agent"
                );
                continue;
            }
            bindings.push(HandlerBinding {
                kind,
                key,
                route: Route::Agent(agent.to_string()),
            });
        }
    }

    for (key, route) in autocomplete {
        bindings.push(HandlerBinding {
            kind: HandlerKind::Autocomplete,
            key: HandlerKind::Autocomplete.normalize_key(key),
            route: Route::Choices(build_choices(route)),
        });
    }

    bindings
}

fn build_choices(route: &RouteConfig) -> Vec<Choice> {
    route
        .choices
        .iter()
        .filter(|choice| !choice.name.trim().is_empty())
        .filter_map(|choice| {
            let value = choice.value.clone().filter(|value| !value.is_null())?;
            Some(Choice {
                name: choice.name.clone(),
                description: Some(choice.description.clone()).filter(|d| !d.is_empty()),
                value,
            })
        })
        .collect()
}

/// Immutable (kind, key) lookup table shared by request handlers.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    bindings: HashMap<(HandlerKind, String), HandlerBinding>,
}

impl Dispatcher {
    /// Register bindings. Fails when none are given or when an autocomplete
    /// binding has no usable choices.
    pub fn new(bindings: Vec<HandlerBinding>) -> Result<Self, RouteError> {
        if bindings.is_empty() {
            return Err(RouteError::NoHandlers);
        }

        let mut table = HashMap::with_capacity(bindings.len());
        for binding in bindings {
            if let Route::Choices(choices) = &binding.route {
                if choices.is_empty() {
                    return Err(RouteError::MissingChoices(binding.key));
                }
            }
            table.insert((binding.kind, binding.key.clone()), binding);
        }
        Ok(Self { bindings: table })
    }

    pub fn from_settings(settings: &InteractionSettings) -> Result<Self, RouteError> {
        Self::new(collect_handler_bindings(settings))
    }

    /// Find the binding for `key`.
    ///
    /// Components and modals fall back to the longest bound prefix ending at
    /// a `:` boundary, so `approve:42` reaches a binding for `approve`.
    pub fn lookup(&self, kind: HandlerKind, key: &str) -> Result<&HandlerBinding, RouteError> {
        let normalized = kind.normalize_key(key);
        if let Some(binding) = self.bindings.get(&(kind, normalized.clone())) {
            return Ok(binding);
        }

        if matches!(kind, HandlerKind::Component | HandlerKind::Modal) {
            let mut candidate = normalized.as_str();
            while let Some((prefix, _)) = candidate.rsplit_once(':') {
                if let Some(binding) = self.bindings.get(&(kind, prefix.to_string())) {
                    return Ok(binding);
                }
                candidate = prefix;
            }
        }

        Err(RouteError::NotFound {
            kind,
            key: normalized,
        })
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{ChoiceConfig, Settings};

    fn settings() -> InteractionSettings {
        Settings::from_yaml(
            r#"
interactions:
  handlers:
    commands:
      Help: { agent: claude }
      orphan: { agent: "  " }
    components:
      approve: { agent: codex }
      approve:deploy: { agent: ops }
    modals:
      Feedback: { agent: claude }
    autocomplete:
      Model:
        choices:
          - { name: Fast, value: fast }
          - { name: "", value: skipped }
          - { name: NoValue }
"#,
        )
        .unwrap()
        .interactions
    }

    #[test]
    fn collects_bindings_and_drops_agentless_routes() {
        let bindings = collect_handler_bindings(&settings());
        assert_eq!(bindings.len(), 5);
        assert!(bindings.iter().all(|b| b.key != "orphan"));

        let autocomplete = bindings
            .iter()
            .find(|b| b.kind == HandlerKind::Autocomplete)
            .unwrap();
        assert_eq!(autocomplete.key, "model");
        match &autocomplete.route {
            Route::Choices(choices) => {
                assert_eq!(choices.len(), 1);
                assert_eq!(choices[0].value, json!("fast"));
            }
            other => panic!("expected choices, got {other:?}"),
        }
    }

    #[test]
    fn disabled_interactions_produce_no_bindings() {
        let mut settings = settings();
        settings.enabled = false;
        assert!(collect_handler_bindings(&settings).is_empty());
        assert_eq!(
            Dispatcher::from_settings(&settings).unwrap_err(),
            RouteError::NoHandlers
        );
    }

    #[test]
    fn autocomplete_without_choices_fails_registration() {
        let mut settings = InteractionSettings::default();
        settings.handlers.autocomplete.insert(
            "model".into(),
            RouteConfig {
                choices: vec![ChoiceConfig {
                    name: "Broken".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        assert_eq!(
            Dispatcher::from_settings(&settings).unwrap_err(),
            RouteError::MissingChoices("model".into())
        );
    }

    #[test]
    fn commands_match_case_insensitively() {
        let dispatcher = Dispatcher::from_settings(&settings()).unwrap();
        let binding = dispatcher.lookup(HandlerKind::Command, "HELP").unwrap();
        assert_eq!(binding.agent(), Some("claude"));
        assert!(dispatcher.lookup(HandlerKind::Modal, "feedback").is_err());
        assert!(dispatcher.lookup(HandlerKind::Modal, "Feedback").is_ok());
    }

    #[test]
    fn components_fall_back_to_longest_prefix() {
        let dispatcher = Dispatcher::from_settings(&settings()).unwrap();
        let exact = dispatcher.lookup(HandlerKind::Component, "approve").unwrap();
        assert_eq!(exact.agent(), Some("codex"));

        let nested = dispatcher
            .lookup(HandlerKind::Component, "approve:deploy:42")
            .unwrap();
        assert_eq!(nested.agent(), Some("ops"));

        let shallow = dispatcher
            .lookup(HandlerKind::Component, "approve:7")
            .unwrap();
        assert_eq!(shallow.agent(), Some("codex"));

        assert!(dispatcher
            .lookup(HandlerKind::Component, "approved")
            .is_err());
    }

    #[test]
    fn unknown_key_reports_kind() {
        let dispatcher = Dispatcher::from_settings(&settings()).unwrap();
        let err = dispatcher.lookup(HandlerKind::Command, "deploy").unwrap_err();
        assert_eq!(err.to_string(), "no command handler registered for \"deploy\"");
    }
}
