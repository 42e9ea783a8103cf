//! Command-line surface. Flags override the settings file and environment.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{RedisSettings, Settings};
use crate::daemon::DaemonOptions;
use crate::supervisor::RestartPolicy;

#[derive(Debug, Parser)]
#[command(name = "discord-relay")]
#[command(about = "Relay Discord interactions to agents over Redis pub/sub")]
pub struct Cli {
    /// Settings file; discovered from the usual locations when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable output
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run or control the interaction server
    #[command(subcommand)]
    Server(ServerCommand),
    /// Agent-side commands
    #[command(subcommand)]
    Agent(AgentCommand),
}

#[derive(Debug, Subcommand)]
pub enum ServerCommand {
    Start(ServerStartArgs),
    Stop(PidFileArgs),
    Status(PidFileArgs),
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    /// Receive interactions for one agent and answer them
    Listen(AgentListenArgs),
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct RedisArgs {
    #[arg(long)]
    pub redis_addr: Option<String>,

    #[arg(long)]
    pub redis_db: Option<u8>,

    #[arg(long)]
    pub redis_password: Option<String>,

    #[arg(long)]
    pub redis_prefix: Option<String>,
}

impl RedisArgs {
    pub fn apply(&self, redis: &mut RedisSettings) {
        if let Some(addr) = non_blank(&self.redis_addr) {
            redis.addr = addr;
        }
        if let Some(db) = self.redis_db {
            redis.db = db;
        }
        if let Some(password) = non_blank(&self.redis_password) {
            redis.password = password;
        }
        if let Some(prefix) = non_blank(&self.redis_prefix) {
            redis.channel_prefix = prefix;
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct ServerStartArgs {
    #[arg(long)]
    pub listen: Option<String>,

    #[arg(long)]
    pub public_url: Option<String>,

    #[command(flatten)]
    pub redis: RedisArgs,

    /// ngrok, localtunnel, auto or none
    #[arg(long)]
    pub tunnel: Option<String>,

    #[arg(long)]
    pub ngrok_auth_token: Option<String>,

    /// Accept unsigned requests (development only)
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Detach into the background and write a PID file
    #[arg(long, default_value_t = false)]
    pub daemon: bool,

    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// KEY=VALUE file merged into the daemon's environment
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Print the prerequisite report and exit
    #[arg(long, default_value_t = false)]
    pub check_prereqs: bool,

    /// Print an example settings file and exit
    #[arg(long, default_value_t = false)]
    pub example: bool,
}

impl ServerStartArgs {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(listen) = non_blank(&self.listen) {
            settings.server.listen_addr = listen;
        }
        if let Some(url) = non_blank(&self.public_url) {
            settings.discord.public_url = url;
        }
        self.redis.apply(&mut settings.redis);
        if let Some(tunnel) = non_blank(&self.tunnel) {
            settings.tunnel.provider = tunnel.to_ascii_lowercase();
        }
        if let Some(token) = non_blank(&self.ngrok_auth_token) {
            settings.tunnel.ngrok_auth_token = token;
        }
    }

    pub fn daemon_options(&self) -> DaemonOptions {
        DaemonOptions {
            pid_file: self.pid_file.clone(),
            log_file: self.log_file.clone(),
            workdir: self.workdir.clone(),
            env_file: self.env_file.clone(),
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct PidFileArgs {
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}

impl PidFileArgs {
    pub fn daemon_options(&self) -> DaemonOptions {
        DaemonOptions {
            pid_file: self.pid_file.clone(),
            ..DaemonOptions::default()
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct AgentListenArgs {
    /// Agent id (falls back to DISCORD_RELAY_AGENT_ID)
    #[arg(long)]
    pub agent: Option<String>,

    #[arg(long)]
    pub application_id: Option<String>,

    #[command(flatten)]
    pub redis: RedisArgs,

    /// Resubscribe attempts after a failure; 0 exits on the first error
    #[arg(long, default_value_t = 0)]
    pub max_restarts: u32,

    #[arg(long, default_value_t = 2000)]
    pub restart_cooldown_ms: u64,
}

impl AgentListenArgs {
    /// `--agent` first, then the environment value.
    pub fn resolve_agent(&self, env_value: Option<String>) -> Option<String> {
        non_blank(&self.agent).or_else(|| non_blank(&env_value))
    }

    pub fn apply(&self, settings: &mut Settings) {
        if let Some(id) = non_blank(&self.application_id) {
            settings.discord.application_id = id;
        }
        self.redis.apply(&mut settings.redis);
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            cooldown_ms: self.restart_cooldown_ms,
            ..RestartPolicy::default()
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
