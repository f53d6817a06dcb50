//! Minimal TOML configuration: listener address, poll interval and the
//! loopback cap (spec's `[ADD] Configuration` section). Route definitions
//! are deliberately absent here; they are a `DataClient`'s job, not the
//! static config file's, since the DSL this would otherwise parse is out of
//! scope.

use std::path::Path;
use std::time::Duration;

use pingora::server::configuration::{Opt as PingoraOpt, ServerConf as PingoraServerConf};
use serde::Deserialize;

use crate::cli::{Cli, Commands};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub poll_interval_ms: u64,
    pub loop_cap: u32,
    pub threads: usize,
    pub queue_close_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            poll_interval_ms: 5_000,
            loop_cap: 16,
            threads: 4,
            queue_close_delay_ms: 2_000,
        }
    }
}

impl Config {
    /// Loads `path` if given; a missing `--config` flag falls back to
    /// defaults rather than failing startup, since every field has one. A
    /// `--config` path that fails to read or parse is a hard error.
    pub fn load(path: Option<&Path>) -> miette::Result<Self> {
        let Some(path) = path else {
            tracing::warn!("no --config given, starting with default configuration");
            return Ok(Self::default());
        };

        let text =
            std::fs::read_to_string(path).map_err(|e| miette::miette!("failed to read config file {path:?}: {e}"))?;
        toml::from_str(&text).map_err(|e| miette::miette!("failed to parse config file {path:?}: {e}"))
    }

    /// CLI flags win over whatever the config file says.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.listen = listen.clone();
        }
        if let Some(poll_interval_ms) = cli.poll_interval_ms {
            self.poll_interval_ms = poll_interval_ms;
        }
        if let Some(loop_cap) = cli.loop_cap {
            self.loop_cap = loop_cap;
        }
        if let Some(threads) = cli.threads {
            self.threads = threads;
        }
        if let Some(Commands::Serve { port, .. }) = &cli.command {
            self.listen = format!("0.0.0.0:{port}");
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn queue_close_delay(&self) -> Duration {
        Duration::from_millis(self.queue_close_delay_ms)
    }

    pub fn pingora_opt(&self) -> PingoraOpt {
        PingoraOpt { upgrade: false, daemon: false, nocapture: false, test: false, conf: None }
    }

    pub fn pingora_server_conf(&self) -> PingoraServerConf {
        PingoraServerConf { threads: self.threads, work_stealing: true, ..PingoraServerConf::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_a_config_file() {
        let conf = Config::load(None).unwrap();
        assert_eq!(conf.listen, "0.0.0.0:8080");
        assert_eq!(conf.loop_cap, 16);
    }

    #[test]
    fn cli_overrides_win_over_defaults() {
        let mut conf = Config::default();
        let cli = Cli {
            config: None,
            listen: Some("127.0.0.1:9999".to_string()),
            poll_interval_ms: None,
            loop_cap: Some(4),
            threads: None,
            command: None,
        };
        conf.apply_cli(&cli);
        assert_eq!(conf.listen, "127.0.0.1:9999");
        assert_eq!(conf.loop_cap, 4);
        assert_eq!(conf.poll_interval_ms, 5_000);
    }

    #[test]
    fn serve_subcommand_port_overrides_listen_address() {
        let mut conf = Config::default();
        let cli = Cli {
            config: None,
            listen: None,
            poll_interval_ms: None,
            loop_cap: None,
            threads: None,
            command: Some(Commands::Serve { port: 9001, map: Vec::new() }),
        };
        conf.apply_cli(&cli);
        assert_eq!(conf.listen, "0.0.0.0:9001");
    }

    #[test]
    fn loads_a_config_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junction.toml");
        std::fs::write(&path, "listen = \"0.0.0.0:7777\"\nloop_cap = 3\n").unwrap();
        let conf = Config::load(Some(&path)).unwrap();
        assert_eq!(conf.listen, "0.0.0.0:7777");
        assert_eq!(conf.loop_cap, 3);
    }
}
