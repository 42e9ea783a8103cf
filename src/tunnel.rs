//! Public ingress for a local listener through an external tunnel binary.
//!
//! Two providers are supported. `ngrok` reports its public URL through a local
//! inspection API, which is polled. `localtunnel` (`lt`) prints the URL on
//! stdout. Both are launched through an injected [`ProcessLauncher`], so tests
//! can drive them without real binaries.

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio_util::sync::CancellationToken;

use crate::process::{
    stop_gracefully, BinaryLocator, ChildStdout, LaunchSpec, PathLocator, ProcessHandle,
    ProcessLauncher, TokioLauncher,
};

pub const NGROK_API_URL: &str = "http://127.0.0.1:4040/api/tunnels";
pub const READY_TIMEOUT: Duration = Duration::from_secs(15);
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);
const NGROK_API_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("listen address required for tunnel")]
    MissingListenAddr,

    #[error("invalid listen addr {addr:?}: {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    #[error("unsupported tunnel provider {0:?} (expected ngrok, localtunnel, auto)")]
    Unsupported(String),

    #[error("no supported tunnel binary found (install ngrok or localtunnel)")]
    NoBinary,

    #[error("start {provider}: {source}")]
    Launch {
        provider: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{provider} tunnel not ready: {reason}")]
    NotReady {
        provider: &'static str,
        reason: String,
    },

    #[error("stop {provider}: {source}")]
    Stop {
        provider: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("build tunnel http client: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Ngrok,
    Localtunnel,
}

impl ProviderKind {
    /// Preference order used by `auto`.
    pub const AUTO_ORDER: [ProviderKind; 2] = [ProviderKind::Ngrok, ProviderKind::Localtunnel];

    pub fn name(self) -> &'static str {
        match self {
            Self::Ngrok => "ngrok",
            Self::Localtunnel => "localtunnel",
        }
    }

    pub fn binary(self) -> &'static str {
        match self {
            Self::Ngrok => "ngrok",
            Self::Localtunnel => "lt",
        }
    }
}

/// Parsed `--tunnel` / `tunnel.provider` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderChoice {
    None,
    Auto,
    Explicit(ProviderKind),
}

impl ProviderChoice {
    pub fn parse(provider: &str) -> Result<Self, TunnelError> {
        match provider.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "auto" => Ok(Self::Auto),
            "ngrok" => Ok(Self::Explicit(ProviderKind::Ngrok)),
            "localtunnel" => Ok(Self::Explicit(ProviderKind::Localtunnel)),
            _ => Err(TunnelError::Unsupported(provider.to_string())),
        }
    }
}

/// Resolve a provider preference to a concrete provider. Explicit names are
/// taken as-is; `auto` picks the first installed binary.
pub fn resolve_provider(
    provider: &str,
    locator: &dyn BinaryLocator,
) -> Result<Option<ProviderKind>, TunnelError> {
    match ProviderChoice::parse(provider)? {
        ProviderChoice::None => Ok(None),
        ProviderChoice::Explicit(kind) => Ok(Some(kind)),
        ProviderChoice::Auto => ProviderKind::AUTO_ORDER
            .into_iter()
            .find(|kind| locator.locate(kind.binary()).is_some())
            .map(Some)
            .ok_or(TunnelError::NoBinary),
    }
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub listen_addr: String,
    pub ngrok_auth_token: Option<String>,
    pub ngrok_api_url: String,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub close_grace: Duration,
}

impl TunnelOptions {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ngrok_auth_token: None,
            ngrok_api_url: NGROK_API_URL.to_string(),
            ready_timeout: READY_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            close_grace: CLOSE_GRACE,
        }
    }

    pub fn with_ngrok_auth_token(mut self, token: Option<String>) -> Self {
        self.ngrok_auth_token = token.filter(|token| !token.trim().is_empty());
        self
    }
}

/// A live tunnel. Owns the provider subprocess until [`TunnelSession::close`].
pub struct TunnelSession {
    provider: &'static str,
    url: String,
    handle: Option<Box<dyn ProcessHandle>>,
    grace: Duration,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("provider", &self.provider)
            .field("url", &self.url)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl TunnelSession {
    fn new(
        provider: &'static str,
        url: String,
        handle: Box<dyn ProcessHandle>,
        grace: Duration,
    ) -> Self {
        Self {
            provider,
            url,
            handle: Some(handle),
            grace,
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|handle| handle.id())
    }

    /// Interrupt the provider, give it the grace period to flush teardown,
    /// then kill. Cancelling `cancel` cuts the grace period short. Calling
    /// this again after it returned is a no-op.
    pub async fn close(&mut self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        tracing::info!(
            target = "discord_relay::tunnel",
            provider = self.provider,
            pid = handle.id().unwrap_or_default(),
            "closing tunnel"
        );
        stop_gracefully(handle.as_mut(), self.grace, cancel)
            .await
            .map_err(|source| TunnelError::Stop {
                provider: self.provider,
                source,
            })
    }
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;
    async fn start(&self, cancel: &CancellationToken) -> Result<TunnelSession, TunnelError>;
}

pub struct NgrokProvider {
    options: TunnelOptions,
    launcher: Arc<dyn ProcessLauncher>,
    http: reqwest::Client,
}

impl NgrokProvider {
    pub fn new(
        options: TunnelOptions,
        launcher: Arc<dyn ProcessLauncher>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            options,
            launcher,
            http,
        }
    }

    fn launch_spec(&self) -> LaunchSpec {
        let mut spec = LaunchSpec::new(ProviderKind::Ngrok.binary())
            .arg("http")
            .arg(self.options.listen_addr.trim())
            .arg("--log=stdout")
            .arg("--log-format=json");
        if let Some(token) = &self.options.ngrok_auth_token {
            spec = spec.env("NGROK_AUTHTOKEN", token);
        }
        spec
    }

    async fn wait_for_url(&self, cancel: &CancellationToken) -> Result<String, String> {
        let poll = async {
            let mut ticker = tokio::time::interval(self.options.poll_interval);
            loop {
                ticker.tick().await;
                match fetch_ngrok_url(&self.http, &self.options.ngrok_api_url).await {
                    Ok(Some(url)) => return url,
                    Ok(None) => {}
                    Err(error) => tracing::debug!(
                        target = "discord_relay::tunnel",
                        error = %error,
                        "ngrok api not ready"
                    ),
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err("cancelled while waiting for ngrok public url".to_string()),
            found = tokio::time::timeout(self.options.ready_timeout, poll) => {
                found.map_err(|_| "timed out waiting for ngrok public url".to_string())
            }
        }
    }
}

#[async_trait]
impl TunnelProvider for NgrokProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ngrok
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<TunnelSession, TunnelError> {
        let provider = ProviderKind::Ngrok.name();
        if self.options.listen_addr.trim().is_empty() {
            return Err(TunnelError::MissingListenAddr);
        }

        let mut handle = self
            .launcher
            .launch(&self.launch_spec())
            .map_err(|source| TunnelError::Launch { provider, source })?;

        match self.wait_for_url(cancel).await {
            Ok(url) => Ok(TunnelSession::new(
                provider,
                url,
                handle,
                self.options.close_grace,
            )),
            Err(reason) => {
                let _ = handle.kill().await;
                Err(TunnelError::NotReady { provider, reason })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct NgrokTunnels {
    #[serde(default)]
    tunnels: Vec<NgrokTunnel>,
}

#[derive(Debug, Deserialize)]
struct NgrokTunnel {
    #[serde(default)]
    public_url: String,
}

/// Ask the ngrok inspection API for a public URL, preferring https.
async fn fetch_ngrok_url(
    http: &reqwest::Client,
    api: &str,
) -> Result<Option<String>, reqwest::Error> {
    let payload: NgrokTunnels = http
        .get(api)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let https = payload
        .tunnels
        .iter()
        .find(|tunnel| tunnel.public_url.starts_with("https://"));
    Ok(https
        .or_else(|| payload.tunnels.first())
        .map(|tunnel| tunnel.public_url.clone())
        .filter(|url| !url.is_empty()))
}

pub struct LocaltunnelProvider {
    options: TunnelOptions,
    launcher: Arc<dyn ProcessLauncher>,
}

impl LocaltunnelProvider {
    pub fn new(options: TunnelOptions, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { options, launcher }
    }

    async fn read_url(
        &self,
        stdout: ChildStdout,
        cancel: &CancellationToken,
    ) -> Result<(String, Lines<BufReader<ChildStdout>>), String> {
        let mut lines = BufReader::new(stdout).lines();
        let scan = async {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(url) = localtunnel_url(&line) {
                            return Ok(url);
                        }
                    }
                    Ok(None) => return Err("localtunnel exited before providing url".to_string()),
                    Err(error) => return Err(format!("read localtunnel output: {error}")),
                }
            }
        };

        let found = tokio::select! {
            _ = cancel.cancelled() => Err("cancelled while waiting for localtunnel url".to_string()),
            found = tokio::time::timeout(self.options.ready_timeout, scan) => {
                found.unwrap_or_else(|_| Err("timed out waiting for localtunnel url".to_string()))
            }
        };
        found.map(|url| (url, lines))
    }
}

#[async_trait]
impl TunnelProvider for LocaltunnelProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Localtunnel
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<TunnelSession, TunnelError> {
        let provider = ProviderKind::Localtunnel.name();
        let (host, port) = split_listen_addr(&self.options.listen_addr)?;
        let spec = LaunchSpec::new(ProviderKind::Localtunnel.binary())
            .arg("--port")
            .arg(port.to_string())
            .arg("--print-requests")
            .arg("false")
            .arg("--local-host")
            .arg(host)
            .capture_stdout();

        let mut handle = self
            .launcher
            .launch(&spec)
            .map_err(|source| TunnelError::Launch { provider, source })?;

        let Some(stdout) = handle.take_stdout() else {
            let _ = handle.kill().await;
            return Err(TunnelError::NotReady {
                provider,
                reason: "localtunnel stdout unavailable".to_string(),
            });
        };

        match self.read_url(stdout, cancel).await {
            Ok((url, mut rest)) => {
                // Keep the pipe drained so lt never blocks on a full buffer.
                tokio::spawn(async move { while let Ok(Some(_)) = rest.next_line().await {} });
                Ok(TunnelSession::new(
                    provider,
                    url,
                    handle,
                    self.options.close_grace,
                ))
            }
            Err(reason) => {
                let _ = handle.kill().await;
                Err(TunnelError::NotReady { provider, reason })
            }
        }
    }
}

fn localtunnel_url(line: &str) -> Option<String> {
    let start = line.find("https://")?;
    line[start..]
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Split `host:port`, mapping wildcard hosts to loopback for the tunnel
/// client.
fn split_listen_addr(addr: &str) -> Result<(String, u16), TunnelError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(TunnelError::MissingListenAddr);
    }
    let invalid = |reason: &str| TunnelError::InvalidListenAddr {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = trimmed
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port in address"))?;
    let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = match host {
        "" | "0.0.0.0" | "::" => "127.0.0.1",
        other => other,
    };
    Ok((host.to_string(), port))
}

/// Builds providers and runs the `auto` fallback.
pub struct TunnelSupervisor {
    options: TunnelOptions,
    launcher: Arc<dyn ProcessLauncher>,
    locator: Arc<dyn BinaryLocator>,
    http: reqwest::Client,
}

impl TunnelSupervisor {
    pub fn new(
        options: TunnelOptions,
        launcher: Arc<dyn ProcessLauncher>,
        locator: Arc<dyn BinaryLocator>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            options,
            launcher,
            locator,
            http,
        }
    }

    /// Real subprocesses, `PATH` lookup and a short-timeout HTTP client.
    pub fn system(options: TunnelOptions) -> Result<Self, TunnelError> {
        let http = reqwest::Client::builder()
            .timeout(NGROK_API_TIMEOUT)
            .build()?;
        Ok(Self::new(
            options,
            Arc::new(TokioLauncher),
            Arc::new(PathLocator),
            http,
        ))
    }

    pub fn provider(&self, kind: ProviderKind) -> Box<dyn TunnelProvider> {
        match kind {
            ProviderKind::Ngrok => Box::new(NgrokProvider::new(
                self.options.clone(),
                self.launcher.clone(),
                self.http.clone(),
            )),
            ProviderKind::Localtunnel => Box::new(LocaltunnelProvider::new(
                self.options.clone(),
                self.launcher.clone(),
            )),
        }
    }

    /// Start the tunnel for `provider`. `none` (or blank) yields no session.
    /// `auto` tries each installed provider in preference order and falls
    /// back on any failure, not just a missing binary.
    pub async fn start(
        &self,
        provider: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TunnelSession>, TunnelError> {
        let Some(preferred) = resolve_provider(provider, self.locator.as_ref())? else {
            return Ok(None);
        };
        if ProviderChoice::parse(provider)? != ProviderChoice::Auto {
            return self.provider(preferred).start(cancel).await.map(Some);
        }

        // `auto` moves on to the next installed provider on any failure.
        let mut last_error = None;
        let candidates = ProviderKind::AUTO_ORDER
            .into_iter()
            .skip_while(|kind| *kind != preferred);
        for kind in candidates {
            if kind != preferred && self.locator.locate(kind.binary()).is_none() {
                continue;
            }
            match self.provider(kind).start(cancel).await {
                Ok(session) => return Ok(Some(session)),
                Err(error) => {
                    tracing::warn!(
                        target = "discord_relay::tunnel",
                        provider = kind.name(),
                        error = %error,
                        "tunnel provider failed; trying next"
                    );
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or(TunnelError::NoBinary))
    }
}
