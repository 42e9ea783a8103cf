//! Resubscribe supervision for a long-running listen loop.
//!
//! Decides whether a subscription that ended in error is retried after a
//! cooldown or given up, based on a restart policy (max restarts, cooldown,
//! consecutive failure limit).

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A run that stayed up at least this long before failing is not counted as
/// a consecutive failure.
pub const STABLE_RUN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive_failures: u32,
}

fn default_max_restarts() -> u32 {
    0
}
fn default_cooldown_ms() -> u64 {
    2000
}
fn default_max_consecutive() -> u32 {
    3
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            cooldown_ms: default_cooldown_ms(),
            max_consecutive_failures: default_max_consecutive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration },
    GiveUp { reason: String },
}

#[derive(Debug)]
pub struct Supervisor {
    policy: RestartPolicy,
    total_restarts: u32,
    consecutive_failures: u32,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            total_restarts: 0,
            consecutive_failures: 0,
        }
    }

    /// Called when a run fails after being up for `ran_for`.
    pub fn on_failure(&mut self, ran_for: Duration) -> RestartDecision {
        if ran_for >= STABLE_RUN {
            self.consecutive_failures = 0;
        }
        self.consecutive_failures += 1;

        if self.policy.max_restarts == 0 {
            return RestartDecision::GiveUp {
                reason: "restarts disabled".to_string(),
            };
        }

        if self.total_restarts >= self.policy.max_restarts {
            return RestartDecision::GiveUp {
                reason: format!("exceeded max restarts ({})", self.policy.max_restarts),
            };
        }

        if self.consecutive_failures > self.policy.max_consecutive_failures {
            return RestartDecision::GiveUp {
                reason: format!(
                    "exceeded max consecutive failures ({})",
                    self.policy.max_consecutive_failures
                ),
            };
        }

        RestartDecision::Restart {
            delay: Duration::from_millis(self.policy.cooldown_ms),
        }
    }

    pub fn on_restarted(&mut self) {
        self.total_restarts += 1;
    }

    pub fn restart_count(&self) -> u32 {
        self.total_restarts
    }
}

/// Run `attempt` until it returns `Ok`, cancellation arrives during a
/// cooldown, or the policy gives up. The last error is returned on give-up.
pub async fn supervise<F, Fut>(
    name: &str,
    policy: RestartPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut supervisor = Supervisor::new(policy);
    loop {
        let started = Instant::now();
        let error = match attempt().await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        match supervisor.on_failure(started.elapsed()) {
            RestartDecision::GiveUp { reason } => {
                if supervisor.restart_count() > 0 {
                    tracing::error!(
                        target = "discord_relay::supervisor",
                        name = %name,
                        restarts = supervisor.restart_count(),
                        reason = %reason,
                        "giving up"
                    );
                }
                return Err(error);
            }
            RestartDecision::Restart { delay } => {
                tracing::warn!(
                    target = "discord_relay::supervisor",
                    name = %name,
                    error = %format!("{error:#}"),
                    delay_ms = delay.as_millis() as u64,
                    attempt = supervisor.restart_count() + 1,
                    "run failed; restarting after cooldown"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                supervisor.on_restarted();
            }
        }
    }
}
