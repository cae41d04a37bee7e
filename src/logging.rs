use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_ENV: &str = "RESULTSD_LOG";
pub const LOG_JSON_ENV: &str = "RESULTSD_LOG_JSON";
const DEFAULT_FILTER: &str = "resultsd=info";

/// Installs the global subscriber. Output always goes to stderr: stdout
/// carries the IPC protocol.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var(LOG_JSON_ENV)
        .map(|v| json_enabled(&v))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_target(false),
            )
            .try_init()?;
    }
    Ok(())
}

fn json_enabled(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_accepts_common_truthy_values() {
        assert!(json_enabled("1"));
        assert!(json_enabled(" TRUE "));
        assert!(!json_enabled("0"));
        assert!(!json_enabled(""));
    }
}
