use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use lib_fleet::SyncConfig;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Fleet State-Sync Server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FLEET_PORT", help = "Port to listen on for dashboard and operator connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "FLEET_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FLEET_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FLEET_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "FLEET_DATABASE_URL", help = "PostgreSQL URL. Without it rows are kept in memory.")]
    pub database_url: Option<String>,

    #[clap(long, env = "FLEET_SHUTDOWN_TIMEOUT_SECONDS", help = "Seconds to wait for background tasks on shutdown.")]
    pub shutdown_timeout_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            database_url: other.database_url.or(self.database_url),
            shutdown_timeout_seconds: other.shutdown_timeout_seconds.or(self.shutdown_timeout_seconds),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9010),
            log_dir: Some(default_log_dir()),
            log_level: Some("info".to_string()),
            shutdown_timeout_seconds: Some(10),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(9010)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(default_log_dir)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_seconds.unwrap_or(10))
    }
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("server_fleet").join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"))
}

/// The configuration file holds the engine configuration at the top level and
/// the server settings under `"server"`.
fn read_file(path: &Path) -> anyhow::Result<(Config, SyncConfig)> {
    let text = fs::read_to_string(path)?;
    split_file(&text)
}

fn split_file(text: &str) -> anyhow::Result<(Config, SyncConfig)> {
    let mut value: serde_json::Value = serde_json::from_str(text)?;
    let server = match value.as_object_mut().and_then(|o| o.remove("server")) {
        Some(section) => serde_json::from_value::<Config>(section)?,
        None => Config::default(),
    };
    let sync: SyncConfig = serde_json::from_value(value)?;
    Ok((server, sync))
}

/// Resolves the server and engine configuration.
///
/// Precedence, lowest first: built-in defaults, the JSON file, environment
/// variables and command line flags (clap reads both).
pub fn load_config() -> anyhow::Result<(Config, SyncConfig)> {
    let cli = Config::parse();
    resolve(cli)
}

fn resolve(cli: Config) -> anyhow::Result<(Config, SyncConfig)> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_fleet.conf"));

    let mut current = Config::defaults();
    let mut sync = SyncConfig::default();

    if config_file_path.exists() {
        let (file_server, file_sync) = read_file(&config_file_path)
            .map_err(|e| anyhow::anyhow!("config file {}: {}", config_file_path.display(), e))?;
        current = current.merge(file_server);
        sync = file_sync;
    } else {
        eprintln!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current = current.merge(cli);
    if current.database_url.is_some() {
        sync.store.database_url = current.database_url.clone();
    }

    sync.validate()?;
    Ok((current, sync))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FILE: &str = r#"{
        "server": { "port": 7000, "logLevel": "debug" },
        "endpoints": [
            { "id": "e1", "baseUrl": "http://10.0.0.1:9090/api", "apiKey": "k" }
        ],
        "writer": { "batchSize": 50 }
    }"#;

    #[test]
    fn file_splits_into_server_and_engine_sections() {
        let (server, sync) = split_file(FILE).unwrap();
        assert_eq!(server.port, Some(7000));
        assert_eq!(server.log_level.as_deref(), Some("debug"));
        assert_eq!(sync.endpoints.len(), 1);
        assert!(sync.endpoints[0].enabled);
        assert_eq!(sync.writer.batch_size, 50);
    }

    #[test]
    fn cli_overrides_file_which_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FILE.as_bytes()).unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            log_level: Some("warn".into()),
            database_url: Some("postgres://fleet@db/fleet".into()),
            ..Default::default()
        };
        let (server, sync) = resolve(cli).unwrap();
        assert_eq!(server.port(), 7000);
        assert_eq!(server.log_level(), "warn");
        assert_eq!(server.shutdown_timeout().as_secs(), 10);
        assert_eq!(sync.store.database_url.as_deref(), Some("postgres://fleet@db/fleet"));
    }

    #[test]
    fn invalid_engine_config_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"state":{"shards":0}}"#).unwrap();
        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(resolve(cli).is_err());
    }
}
