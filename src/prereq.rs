//! Startup prerequisite checks for `server start`, and the example settings
//! file printed by `--example`.

use std::{fmt, fmt::Write as _, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;

use crate::broker::RedisBroker;
use crate::config::{
    config_candidates, InteractionSettings, LoadedSettings, RedisSettings, Settings,
    TunnelSettings, CONFIG_PATH_ENV, NGROK_AUTH_TOKEN_ENV, PUBLIC_KEY_ENV, REDIS_ADDR_ENV,
    TUNNEL_PROVIDER_ENV,
};
use crate::tunnel::{ProviderChoice, ProviderKind};

pub const REDIS_PING_TIMEOUT: Duration = Duration::from_secs(3);
const RULE_WIDTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrereqStatus {
    Ok,
    Missing,
    Invalid,
    Unreachable,
}

impl fmt::Display for PrereqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Missing => "MISSING",
            Self::Invalid => "INVALID",
            Self::Unreachable => "UNREACHABLE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrereqCheck {
    pub name: &'static str,
    pub status: PrereqStatus,
    pub value: String,
    pub required: bool,
    pub description: &'static str,
    pub how_to_fix: String,
    pub example: String,
    pub config_key: String,
    pub env_var: Option<&'static str>,
}

impl PrereqCheck {
    fn new(name: &'static str, description: &'static str, config_key: impl Into<String>) -> Self {
        Self {
            name,
            status: PrereqStatus::Ok,
            value: String::new(),
            required: true,
            description,
            how_to_fix: String::new(),
            example: String::new(),
            config_key: config_key.into(),
            env_var: None,
        }
    }

    fn env(mut self, var: &'static str) -> Self {
        self.env_var = Some(var);
        self
    }

    fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    fn ok(mut self, value: impl Into<String>) -> Self {
        self.status = PrereqStatus::Ok;
        self.value = value.into();
        self
    }

    fn fail(
        mut self,
        status: PrereqStatus,
        value: impl Into<String>,
        how_to_fix: impl Into<String>,
        example: impl Into<String>,
    ) -> Self {
        self.status = status;
        self.value = value.into();
        self.how_to_fix = how_to_fix.into();
        self.example = example.into();
        self
    }

    pub fn passed(&self) -> bool {
        self.status == PrereqStatus::Ok
    }

    /// A failed check that blocks startup.
    pub fn blocking(&self) -> bool {
        self.required && !self.passed()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrereqReport {
    pub config_path: Option<PathBuf>,
    pub checks: Vec<PrereqCheck>,
}

impl PrereqReport {
    pub fn all_passed(&self) -> bool {
        !self.checks.iter().any(PrereqCheck::blocking)
    }

    pub fn check(&self, name: &str) -> Option<&PrereqCheck> {
        self.checks.iter().find(|check| check.name == name)
    }

    /// Full report for `--check-prereqs`.
    pub fn format_report(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(RULE_WIDTH);
        let thin = "-".repeat(RULE_WIDTH);

        let _ = writeln!(out, "Discord Relay Server Prerequisites");
        let _ = writeln!(out, "{rule}\n");
        if let Some(path) = &self.config_path {
            let _ = writeln!(out, "Config: {}\n", path.display());
        }

        let (passed, failed): (Vec<_>, Vec<_>) = self.checks.iter().partition(|c| c.passed());

        if !passed.is_empty() {
            let _ = writeln!(out, "Passed:");
            for check in &passed {
                if check.value.is_empty() {
                    let _ = writeln!(out, "  [OK] {}", check.name);
                } else {
                    let _ = writeln!(out, "  [OK] {}: {}", check.name, check.value);
                }
            }
            out.push('\n');
        }

        if !failed.is_empty() {
            let _ = writeln!(out, "Issues Found:");
            let _ = writeln!(out, "{thin}\n");
            for (index, check) in failed.iter().enumerate() {
                let label = if check.required { " (REQUIRED)" } else { "" };
                let _ = writeln!(out, "Step {}: {}{}", index + 1, check.name, label);
                let _ = writeln!(out, "Status: {}", check.status);
                if !check.value.is_empty() {
                    let _ = writeln!(out, "Current: {}", check.value);
                }
                let _ = writeln!(out, "\n{}", check.description);
                if !check.how_to_fix.is_empty() {
                    let _ = writeln!(out, "\nHow to fix:\n{}", check.how_to_fix);
                }
                if !check.config_key.is_empty() || check.env_var.is_some() {
                    let _ = writeln!(out, "\nConfiguration:");
                    if !check.config_key.is_empty() {
                        let _ = writeln!(out, "  Config key: {}", check.config_key);
                    }
                    if let Some(var) = check.env_var {
                        let _ = writeln!(out, "  Env var:    {var}");
                    }
                }
                if !check.example.is_empty() {
                    let _ = writeln!(out, "\nExample:\n{}", indent(&check.example));
                }
                let _ = writeln!(out, "\n{thin}\n");
            }
        }

        if self.all_passed() {
            let _ = writeln!(out, "All prerequisites passed. Ready to start server.");
        } else {
            let blocking = self.checks.iter().filter(|c| c.blocking()).count();
            let _ = writeln!(out, "Found {blocking} issue(s) that need to be resolved.");
            let _ = writeln!(out, "Fix the issues above and try again.");
        }
        out
    }

    /// Short summary of blocking failures, `None` when nothing blocks.
    pub fn format_quick_fix(&self) -> Option<String> {
        let issues: Vec<String> = self
            .checks
            .iter()
            .filter(|check| check.blocking())
            .map(|check| format!("- {}: {}", check.name, check.how_to_fix))
            .collect();
        if issues.is_empty() {
            return None;
        }
        Some(format!(
            "Prerequisites not met:\n\n{}\n\nRun with --check-prereqs for detailed setup instructions.\n",
            issues.join("\n")
        ))
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reachability test for the broker.
#[async_trait]
pub trait RedisPing: Send + Sync {
    async fn ping(&self, settings: &RedisSettings) -> Result<()>;
}

/// Opens a real connection within [`REDIS_PING_TIMEOUT`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectPing;

#[async_trait]
impl RedisPing for ConnectPing {
    async fn ping(&self, settings: &RedisSettings) -> Result<()> {
        let broker = RedisBroker::connect_with_timeout(settings, REDIS_PING_TIMEOUT).await?;
        broker.close().await;
        Ok(())
    }
}

pub struct PrereqChecker {
    redis: Arc<dyn RedisPing>,
}

impl PrereqChecker {
    pub fn new(redis: Arc<dyn RedisPing>) -> Self {
        Self { redis }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(ConnectPing))
    }

    /// Run every check against the loaded settings (CLI overrides already
    /// applied). A configuration that failed to load stops the run early.
    pub async fn check(&self, loaded: &Result<LoadedSettings>, dry_run: bool) -> PrereqReport {
        let mut report = PrereqReport::default();

        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(error) => {
                report.checks.push(check_config_file(None, Some(error)));
                return report;
            }
        };
        report.config_path = loaded.path.clone();
        let config = check_config_file(loaded.path.as_ref(), None);
        let config_ok = config.passed();
        report.checks.push(config);
        if !config_ok {
            return report;
        }

        let settings = &loaded.settings;
        report
            .checks
            .push(check_public_key(&settings.discord.public_key, dry_run));
        report.checks.push(self.check_redis(&settings.redis).await);
        report.checks.push(check_interactions(&settings.interactions));
        report
            .checks
            .push(check_tunnel(&settings.tunnel, &settings.discord.public_url));
        report
            .checks
            .push(check_application_id(&settings.discord.application_id));
        report
    }

    async fn check_redis(&self, redis: &RedisSettings) -> PrereqCheck {
        let check = PrereqCheck::new(
            "Redis Connection",
            "Message broker for routing interactions to agents",
            "redis.addr",
        )
        .env(REDIS_ADDR_ENV);

        let addr = redis.addr.trim();
        if addr.is_empty() {
            return check.fail(
                PrereqStatus::Missing,
                "",
                "Configure Redis address",
                format!(
                    "# Option 1: Add to the settings file\nredis:\n  addr: \"127.0.0.1:6379\"\n\n# Option 2: Set environment variable\nexport {REDIS_ADDR_ENV}=\"127.0.0.1:6379\""
                ),
            );
        }

        match self.redis.ping(redis).await {
            Ok(()) => check.ok(addr),
            Err(error) => {
                tracing::debug!(
                    target = "discord_relay::prereq",
                    addr = %addr,
                    error = %format!("{error:#}"),
                    "redis ping failed"
                );
                check.fail(
                    PrereqStatus::Unreachable,
                    addr,
                    format!("Cannot connect to Redis at {addr}"),
                    format!(
                        "# Check if Redis is running:\nredis-cli -h {} ping\n\n# Start Redis:\n# Docker:  docker run -d -p 6379:6379 redis:alpine\n\n# If Redis requires authentication:\nredis:\n  addr: \"{addr}\"\n  password: \"your-password\"",
                        redis_host(addr)
                    ),
                )
            }
        }
    }
}

fn default_config_location() -> String {
    config_candidates(None, |_| None)
        .into_iter()
        .next()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "discord-relay.yaml".to_string())
}

fn check_config_file(path: Option<&PathBuf>, error: Option<&anyhow::Error>) -> PrereqCheck {
    let check = PrereqCheck::new(
        "Configuration File",
        "Settings file with server, broker and handler configuration",
        default_config_location(),
    )
    .env(CONFIG_PATH_ENV);

    if let Some(error) = error {
        return check.fail(
            PrereqStatus::Invalid,
            format!("Error: {error:#}"),
            "Fix the error in your configuration file",
            "",
        );
    }

    match path {
        Some(path) => check.ok(path.display().to_string()),
        None => check.fail(
            PrereqStatus::Missing,
            "",
            "Create a settings file",
            format!(
                "# Create {} with:\n\n{}",
                default_config_location(),
                MINIMAL_CONFIG.trim_end()
            ),
        ),
    }
}

fn check_public_key(public_key: &str, dry_run: bool) -> PrereqCheck {
    let mut check = PrereqCheck::new(
        "Discord Public Key",
        "Used to verify interaction signatures",
        "discord.public_key",
    )
    .env(PUBLIC_KEY_ENV);

    if dry_run {
        check.required = false;
        return check.ok("(skipped - dry-run mode)");
    }

    let key = public_key.trim();
    if key.is_empty() {
        return check.fail(
            PrereqStatus::Missing,
            "",
            "Add your application's public key",
            format!(
                "# Option 1: Add to the settings file\ndiscord:\n  public_key: \"YOUR_PUBLIC_KEY_HERE\"\n\n# Option 2: Set environment variable\nexport {PUBLIC_KEY_ENV}=\"YOUR_PUBLIC_KEY_HERE\"\n\n# Find it under \"PUBLIC KEY\" on the application's General Information page"
            ),
        );
    }

    if key.len() != 64 || hex::decode(key).is_err() {
        let value = if key.len() != 64 {
            format!("{} characters (expected 64)", key.len())
        } else {
            "not hexadecimal".to_string()
        };
        return check.fail(
            PrereqStatus::Invalid,
            value,
            "The public key should be exactly 64 hexadecimal characters",
            "# Copy the full PUBLIC KEY from the developer portal\n# It should look like: a1b2c3d4e5f6...64 characters total",
        );
    }

    check.ok(format!("{}...{}", &key[..8], &key[key.len() - 8..]))
}

fn check_interactions(interactions: &InteractionSettings) -> PrereqCheck {
    let check = PrereqCheck::new(
        "Interaction Handlers",
        "Defines which interactions route to which agents",
        "interactions.handlers",
    );

    if !interactions.enabled {
        return check.fail(
            PrereqStatus::Invalid,
            "disabled",
            "Enable interactions in your configuration",
            "interactions:\n  enabled: true",
        );
    }

    let handlers = &interactions.handlers;
    if handlers.total() == 0 {
        return check.fail(
            PrereqStatus::Missing,
            "",
            "Define at least one interaction handler",
            "interactions:\n  enabled: true\n  handlers:\n    commands:\n      ping:\n        agent: \"default\"\n        description: \"Ping the bot\"",
        );
    }

    let summary: Vec<String> = [
        (handlers.commands.len(), "command(s)"),
        (handlers.components.len(), "component(s)"),
        (handlers.modals.len(), "modal(s)"),
        (handlers.autocomplete.len(), "autocomplete"),
    ]
    .into_iter()
    .filter(|(count, _)| *count > 0)
    .map(|(count, label)| format!("{count} {label}"))
    .collect();
    check.ok(summary.join(", "))
}

fn check_tunnel(tunnel: &TunnelSettings, public_url: &str) -> PrereqCheck {
    let check = PrereqCheck::new(
        "Public URL / Tunnel",
        "How the platform reaches your server (required for production)",
        "tunnel.provider or discord.public_url",
    )
    .env(TUNNEL_PROVIDER_ENV)
    .optional();

    if !public_url.trim().is_empty() {
        return check.ok(public_url.trim());
    }

    match ProviderChoice::parse(&tunnel.provider) {
        Err(error) => check.fail(
            PrereqStatus::Invalid,
            tunnel.provider.trim(),
            error.to_string(),
            "tunnel:\n  provider: \"auto\"  # or ngrok, localtunnel, none",
        ),
        Ok(ProviderChoice::Explicit(ProviderKind::Ngrok))
            if tunnel.ngrok_auth_token.trim().is_empty() =>
        {
            check.fail(
                PrereqStatus::Invalid,
                "ngrok (missing auth token)",
                "Provide ngrok authentication token",
                format!(
                    "# Option 1: Add to the settings file\ntunnel:\n  provider: \"ngrok\"\n  ngrok_auth_token: \"YOUR_NGROK_TOKEN\"\n\n# Option 2: Set environment variable\nexport {NGROK_AUTH_TOKEN_ENV}=\"YOUR_NGROK_TOKEN\""
                ),
            )
        }
        Ok(ProviderChoice::None) => check.fail(
            PrereqStatus::Missing,
            "(not configured)",
            "Configure a tunnel for development or set a public URL for production",
            "# For local development, use a tunnel:\ndiscord-relay server start --tunnel ngrok --ngrok-auth-token $NGROK_TOKEN\ndiscord-relay server start --tunnel localtunnel\ndiscord-relay server start --tunnel auto\n\n# For production, set your public URL:\ndiscord:\n  public_url: \"https://your-domain.com/interactions\"",
        ),
        Ok(_) => check.ok(format!(
            "{} tunnel",
            tunnel.provider.trim().to_ascii_lowercase()
        )),
    }
}

fn check_application_id(application_id: &str) -> PrereqCheck {
    let check = PrereqCheck::new(
        "Application ID",
        "Your application ID (for responding to interactions)",
        "discord.application_id",
    );
    let id = application_id.trim();
    if id.is_empty() {
        return check.fail(
            PrereqStatus::Missing,
            "",
            "Add your application ID",
            "discord:\n  application_id: \"YOUR_APPLICATION_ID\"",
        );
    }
    check.ok(id)
}

fn redis_host(addr: &str) -> &str {
    let addr = addr.split_once("://").map_or(addr, |(_, rest)| rest);
    match addr.rfind(':') {
        Some(idx) if idx > 0 => &addr[..idx],
        _ => addr,
    }
}

const MINIMAL_CONFIG: &str = r#"discord:
  application_id: "YOUR_APP_ID"
  public_key: "YOUR_PUBLIC_KEY"

server:
  listen_addr: "127.0.0.1:8080"

redis:
  addr: "127.0.0.1:6379"

interactions:
  enabled: true
  handlers:
    commands:
      ping:
        agent: "default"
        description: "Ping the bot"
"#;

/// Complete example settings file.
pub fn example_config() -> String {
    format!(
        r#"# Discord relay configuration
# Save this file to: {location}

discord:
  # Required: application ID (General Information page)
  application_id: "YOUR_APPLICATION_ID"

  # Required: application public key (General Information page)
  public_key: "YOUR_PUBLIC_KEY"

  # Optional: the URL the platform sends interactions to
  # public_url: "https://your-domain.com/interactions"

# HTTP server settings
server:
  listen_addr: "127.0.0.1:8080"

# Redis settings (pub/sub to agents)
redis:
  addr: "127.0.0.1:6379"
  # password: ""
  # db: 0
  channel_prefix: "discord:relay"

# Tunnel settings (local development)
tunnel:
  provider: "none"  # or "ngrok", "localtunnel", "auto"
  # ngrok_auth_token: "YOUR_NGROK_TOKEN"

# Interaction handlers
interactions:
  enabled: true
  timeout: 15m

  handlers:
    # Slash command handlers
    commands:
      ping:
        agent: "default"
        description: "Ping the bot"
      ask:
        agent: "claude"
        description: "Ask a question"

    # Button/select menu handlers (custom_id, prefix before ':' also matches)
    components:
      approve_btn:
        agent: "reviewer"

    # Modal submit handlers
    modals:
      feedback_modal:
        agent: "feedback"

    # Autocomplete answered directly from static choices
    autocomplete:
      ask:
        choices:
          - name: "Status"
            value: "status"
          - name: "Deploy"
            value: "deploy"
"#,
        location = default_config_location()
    )
}

/// Convenience used by tests and `--example` consumers.
pub fn parse_example_config() -> Result<Settings> {
    Settings::from_yaml(&example_config())
}
