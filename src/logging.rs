use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `level`; an
/// unparsable level falls back to `info`. Logs go to stderr so command
/// output on stdout stays clean.
pub fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), level);
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.with_ansi(true).finish())?;
    }
    Ok(())
}

fn build_filter(rust_log: Option<&str>, level: &str) -> EnvFilter {
    rust_log
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_new(level.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_takes_precedence() {
        assert_eq!(
            build_filter(Some("discord_relay=trace"), "warn").to_string(),
            "discord_relay=trace"
        );
    }

    #[test]
    fn level_used_when_rust_log_blank() {
        assert_eq!(build_filter(Some("  "), "debug").to_string(), "debug");
        assert_eq!(build_filter(None, "warn").to_string(), "warn");
    }

    #[test]
    fn garbage_level_falls_back_to_info() {
        assert_eq!(build_filter(None, "discord_relay=loud").to_string(), "info");
    }
}
