use env_logger::Env;
use log::LevelFilter;

/// Parse a level name, falling back to `info` for anything unknown.
pub fn parse_level(log_level: &str) -> LevelFilter {
    match log_level.to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{log_level}', using 'info'");
            LevelFilter::Info
        }
    }
}

/// Install the global `env_logger` with millisecond timestamps.
///
/// `RUST_LOG` still refines the filter per module. Calling this again after
/// a logger is installed is harmless.
pub fn init_logging(log_level: &str) {
    let installed = env_logger::Builder::from_env(Env::default())
        .filter_level(parse_level(log_level))
        .format_timestamp_millis()
        .try_init();
    if installed.is_err() {
        log::debug!("Logger already initialized");
    }
}

/// Hex rendering of at most `limit` bytes, for wire traces.
pub fn dump_hex(data: &[u8], limit: usize) -> String {
    let shown = data.len().min(limit);
    let mut out = data[..shown]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > shown {
        out.push_str(&format!(" .. (+{} bytes)", data.len() - shown));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_hex_truncates() {
        assert_eq!(dump_hex(&[0x01, 0x1f, 0x2a], 8), "01 1f 2a");
        assert_eq!(dump_hex(&[0xff; 5], 2), "ff ff .. (+3 bytes)");
        assert_eq!(dump_hex(&[], 4), "");
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("nonsense"), LevelFilter::Info);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging("warn");
        init_logging("debug");
    }
}
