use tracing::Level;

use crate::core::config::MediatorConfig;

fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install a fmt subscriber at `level`. Returns false if one was already set.
pub fn init_tracing(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(true)
        .try_init()
        .is_ok()
}

pub fn init_tracing_from_config(config: &MediatorConfig) -> bool {
    init_tracing(&config.log_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_second_init_is_harmless() {
        init_tracing("info");
        assert!(!init_tracing("debug"));
    }
}
