//! Process-wide logging setup for NGOBRAS binaries.

use observability::LogConfig;
use tracing::Level;

/// Install JSONL file logging plus compact stderr output as `ngobras-sync`.
pub fn init_logging(level: &str) {
    init_logging_for_service("ngobras-sync", level);
}

pub fn init_logging_for_service(service_name: &str, level: &str) {
    observability::init_with_config(LogConfig {
        service_name: service_name.into(),
        default_level: parse_level(level).as_str().to_ascii_lowercase(),
        also_stderr: true,
        ..Default::default()
    });
}

/// Lenient level parsing; anything unrecognised means INFO.
pub fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_accepts_cli_spellings() {
        for (input, expected) in [
            ("trace", Level::TRACE),
            ("Debug", Level::DEBUG),
            (" info ", Level::INFO),
            ("WARNING", Level::WARN),
            ("error", Level::ERROR),
        ] {
            assert_eq!(parse_level(input), expected, "{input}");
        }
    }

    #[test]
    fn test_parse_level_falls_back_to_info() {
        assert_eq!(parse_level(""), Level::INFO);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }
}
