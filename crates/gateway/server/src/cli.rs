//! Command line flags layered over the config file.

use std::path::PathBuf;

use clap::Parser;
use push_core::{Config, ConfigError, StatEngine};

#[derive(Debug, Parser)]
#[command(name = "pushgate")]
#[command(about = "Push notification gateway for APNs and FCM", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    pub address: Option<String>,

    /// Listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of dispatch workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Stats engine: memory or sqlite
    #[arg(long, value_parser = parse_stat_engine)]
    pub stat_engine: Option<StatEngine>,

    /// SQLite database for the sqlite stats engine
    #[arg(long)]
    pub sqlite_path: Option<String>,

    /// Clear every stats counter before serving
    #[arg(long)]
    pub reset_stats: bool,
}

fn parse_stat_engine(value: &str) -> Result<StatEngine, String> {
    match value {
        "memory" => Ok(StatEngine::Memory),
        "sqlite" => Ok(StatEngine::Sqlite),
        other => Err(format!("unknown stats engine `{}`, expected memory or sqlite", other)),
    }
}

impl Cli {
    /// Load the config file, if any, and apply flag overrides on top.
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut Config) {
        if let Some(address) = &self.address {
            config.core.address = address.clone();
        }
        if let Some(port) = self.port {
            config.core.port = port;
        }
        if let Some(workers) = self.workers {
            config.core.worker_num = workers;
        }
        if let Some(engine) = self.stat_engine {
            config.stat.engine = engine;
        }
        if let Some(path) = &self.sqlite_path {
            config.stat.sqlite.path = path.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn test_defaults_without_config_file() {
        let cli = Cli::parse_from(["pushgate"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.core.port, 8088);
        assert_eq!(config.stat.engine, StatEngine::Memory);
        assert!(!cli.reset_stats);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[core]\nport = 9000\nworker_num = 2\n\n[stat]\nengine = \"memory\"").unwrap();
        let path = file.path().to_str().unwrap();

        let cli = Cli::parse_from([
            "pushgate",
            "--config",
            path,
            "--workers",
            "16",
            "--stat-engine",
            "sqlite",
            "--sqlite-path",
            "/tmp/stats.db",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.core.port, 9000);
        assert_eq!(config.core.worker_num, 16);
        assert_eq!(config.stat.engine, StatEngine::Sqlite);
        assert_eq!(config.stat.sqlite.path, "/tmp/stats.db");
    }

    #[test]
    fn test_missing_config_file() {
        let cli = Cli::parse_from(["pushgate", "--config", "/nonexistent/pushgate.toml"]);
        assert!(matches!(cli.load_config(), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cli = Cli::parse_from(["pushgate", "--workers", "0"]);
        assert!(matches!(cli.load_config(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_stat_engine_rejected() {
        assert!(Cli::try_parse_from(["pushgate", "--stat-engine", "redis"]).is_err());
    }
}
