//! Daemon configuration: a JSON file loaded once at start-up (§10.2), mirroring the host
//! system's `/etc/faasnap.json`-style convention.

use std::path::PathBuf;

use log::LevelFilter;
use serde::Deserialize;

/// Errors loading [`Config`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// failed to read config file {0}: {1}
    Read(PathBuf, std::io::Error),
    /// failed to parse config file {0}: {1}
    Parse(PathBuf, serde_json::Error),
    /// base_dir must be an absolute, existing directory: {0}
    InvalidBaseDir(PathBuf),
    /// unrecognized log_level: {0}
    InvalidLogLevel(String),
}

/// Raw, deserialized shape of the config file. [`Config::load`] validates and resolves
/// this into the usable [`Config`].
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    base_dir: PathBuf,
    listen_addr: String,
    metrics_csv_path: PathBuf,
}

fn default_log_level() -> String {
    "Info".to_string()
}

/// Validated daemon configuration. Constructed once per process by [`Config::load`] and
/// never mutated afterward.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LevelFilter,
    pub base_dir: PathBuf,
    /// Path `micro_http`'s `HttpServer` binds a unix-domain socket at. The field is named
    /// `listen_addr` in the config file for parity with the host system's convention, but
    /// `micro_http` (this daemon's control-plane crate, §10.3) only binds filesystem
    /// sockets, not TCP addresses — see DESIGN.md for this decision.
    pub listen_addr: PathBuf,
    pub metrics_csv_path: PathBuf,
}

impl Config {
    /// Reads and validates the config file at `path`. Fails before any `Orchestrator` is
    /// constructed if `base_dir` doesn't exist or isn't absolute (§10.2).
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let raw: RawConfig = serde_json::from_str(&data)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;

        if !raw.base_dir.is_absolute() || !raw.base_dir.is_dir() {
            return Err(ConfigError::InvalidBaseDir(raw.base_dir));
        }

        let log_level = parse_level(&raw.log_level)?;

        Ok(Config {
            log_level,
            base_dir: raw.base_dir,
            listen_addr: PathBuf::from(raw.listen_addr),
            metrics_csv_path: raw.metrics_csv_path,
        })
    }
}

fn parse_level(s: &str) -> Result<LevelFilter, ConfigError> {
    s.parse()
        .map_err(|_| ConfigError::InvalidLogLevel(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_valid_config() {
        let dir = std::env::temp_dir();
        let mut path = dir.clone();
        path.push(format!("reapd-config-test-{}.json", std::process::id()));
        let json = format!(
            r#"{{"log_level":"Debug","base_dir":"{}","listen_addr":"/tmp/reapd.sock","metrics_csv_path":"/tmp/reapd-metrics.csv"}}"#,
            dir.display()
        );
        std::fs::File::create(&path)
            .unwrap()
            .write_all(json.as_bytes())
            .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.base_dir, dir);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_rejects_relative_base_dir() {
        let mut path = std::env::temp_dir();
        path.push(format!("reapd-config-bad-{}.json", std::process::id()));
        let json = r#"{"base_dir":"relative/path","listen_addr":"/tmp/r.sock","metrics_csv_path":"/tmp/m.csv"}"#;
        std::fs::File::create(&path)
            .unwrap()
            .write_all(json.as_bytes())
            .unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBaseDir(_)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_defaults_log_level_to_info() {
        let dir = std::env::temp_dir();
        let mut path = dir.clone();
        path.push(format!("reapd-config-default-{}.json", std::process::id()));
        let json = format!(
            r#"{{"base_dir":"{}","listen_addr":"/tmp/r.sock","metrics_csv_path":"/tmp/m.csv"}}"#,
            dir.display()
        );
        std::fs::File::create(&path)
            .unwrap()
            .write_all(json.as_bytes())
            .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.log_level, LevelFilter::Info);
        std::fs::remove_file(&path).ok();
    }
}
