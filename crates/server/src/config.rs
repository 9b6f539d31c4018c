use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use townhall_engine::{Backend, Endpoint, LocalBroker, MockBroker, RetryPolicy};
use townhall_protocol::topics;

#[derive(Debug, Parser)]
#[command(name = "townhall-server", version, about = "Townhall chat relay and broker node")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
    #[command(flatten)]
    pub relay: RelayConfig,
}

impl Cli {
    /// The relay is the default when no subcommand is given.
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Relay(self.relay))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// HTTP + WebSocket chat relay.
    Relay(RelayConfig),
    /// Broker node serving topics over HTTP/WebSocket.
    Broker(BrokerConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Remote,
    Memory,
    Sqlite,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Args)]
pub struct RelayConfig {
    #[arg(long, env = "TOWNHALL_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,
    #[arg(long, env = "PORT", default_value_t = 9000)]
    pub port: u16,
    #[arg(long, env = "TOWNHALL_WS_PORT", default_value_t = 9004)]
    pub ws_port: u16,
    #[arg(long, env = "TOWNHALL_WS_PORT_ATTEMPTS", default_value_t = crate::listen::DEFAULT_PORT_ATTEMPTS)]
    pub ws_port_attempts: u16,
    #[arg(long, env = "TOWNHALL_BROKER_ENDPOINT", default_value = "127.0.0.1:9003")]
    pub broker_endpoint: Endpoint,
    #[arg(long, env = "TOWNHALL_BROKER", value_enum, default_value_t = BackendKind::Remote)]
    pub broker: BackendKind,
    #[arg(long, env = "TOWNHALL_DB")]
    pub db: Option<PathBuf>,
    #[arg(long, env = "TOWNHALL_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,
    #[arg(long, env = "TOWNHALL_CONNECT_ATTEMPTS", default_value_t = 3)]
    pub connect_attempts: u32,
    #[arg(long, env = "TOWNHALL_CHAT_TOPIC", default_value = topics::CHAT_MESSAGES)]
    pub chat_topic: String,
    /// Extra CORS origins on top of localhost/127.0.0.1.
    #[arg(long, env = "TOWNHALL_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 9000,
            ws_port: 9004,
            ws_port_attempts: crate::listen::DEFAULT_PORT_ATTEMPTS,
            broker_endpoint: Endpoint::default(),
            broker: BackendKind::Remote,
            db: None,
            connect_timeout_ms: 5000,
            connect_attempts: 3,
            chat_topic: topics::CHAT_MESSAGES.to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RelayConfigOverride {
    host: Option<String>,
    port: Option<u16>,
    ws_port: Option<u16>,
    ws_port_attempts: Option<u16>,
    broker_endpoint: Option<String>,
    broker: Option<BackendKind>,
    db: Option<PathBuf>,
    connect_timeout_ms: Option<u64>,
    connect_attempts: Option<u32>,
    chat_topic: Option<String>,
    allowed_origins: Option<Vec<String>>,
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            ..RetryPolicy::default()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(default_db_path)
    }

    pub fn backend(&self) -> Result<Backend> {
        Ok(match self.broker {
            BackendKind::Remote => Backend::Remote,
            BackendKind::Memory => Backend::InProcess(Arc::new(LocalBroker::memory())),
            BackendKind::Sqlite => {
                Backend::InProcess(Arc::new(LocalBroker::sqlite(self.db_path())?))
            }
            BackendKind::Mock => Backend::InProcess(Arc::new(MockBroker::new())),
        })
    }

    /// Applies the YAML file named by `TOWNHALL_CONFIG`, if set.
    pub fn with_file_overrides(self) -> Result<Self> {
        match std::env::var("TOWNHALL_CONFIG") {
            Ok(path) => {
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("read TOWNHALL_CONFIG: {path}"))?;
                self.apply_yaml(&contents)
            }
            Err(_) => Ok(self),
        }
    }

    pub fn apply_yaml(mut self, contents: &str) -> Result<Self> {
        let o: RelayConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse relay config yaml")?;
        if let Some(value) = o.host {
            self.host = value.parse().with_context(|| "parse host")?;
        }
        if let Some(value) = o.broker_endpoint {
            self.broker_endpoint = value
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| "parse broker_endpoint")?;
        }
        self.port = o.port.unwrap_or(self.port);
        self.ws_port = o.ws_port.unwrap_or(self.ws_port);
        self.ws_port_attempts = o.ws_port_attempts.unwrap_or(self.ws_port_attempts);
        self.broker = o.broker.unwrap_or(self.broker);
        self.db = o.db.or(self.db);
        self.connect_timeout_ms = o.connect_timeout_ms.unwrap_or(self.connect_timeout_ms);
        self.connect_attempts = o.connect_attempts.unwrap_or(self.connect_attempts);
        if let Some(topic) = o.chat_topic {
            self.chat_topic = topic;
        }
        if let Some(origins) = o.allowed_origins {
            self.allowed_origins = origins;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Args)]
pub struct BrokerConfig {
    #[arg(long, env = "TOWNHALL_BROKER_LISTEN", default_value = "127.0.0.1:9003")]
    pub listen: SocketAddr,
    #[arg(long, env = "TOWNHALL_STORE", value_enum, default_value_t = StoreKind::Sqlite)]
    pub store: StoreKind,
    #[arg(long, env = "TOWNHALL_DB")]
    pub db: Option<PathBuf>,
}

impl BrokerConfig {
    pub fn open_broker(&self) -> Result<LocalBroker> {
        match self.store {
            StoreKind::Memory => Ok(LocalBroker::memory()),
            StoreKind::Sqlite => {
                let path = self.db.clone().unwrap_or_else(default_db_path);
                LocalBroker::sqlite(path)
            }
        }
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".townhall")
        .join("broker.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_relay() {
        let cli = Cli::parse_from(["townhall-server", "--ws-port", "9100", "--broker", "memory"]);
        match cli.into_command() {
            Command::Relay(cfg) => {
                assert_eq!(cfg.ws_port, 9100);
                assert_eq!(cfg.broker, BackendKind::Memory);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn broker_subcommand_parses_listen_addr() {
        let cli = Cli::parse_from([
            "townhall-server",
            "broker",
            "--listen",
            "127.0.0.1:9300",
            "--store",
            "memory",
        ]);
        match cli.into_command() {
            Command::Broker(cfg) => {
                assert_eq!(cfg.listen.port(), 9300);
                assert_eq!(cfg.store, StoreKind::Memory);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let cfg = RelayConfig::default()
            .apply_yaml(
                "port: 9100\nbroker_endpoint: \"http://10.0.0.5:9400/\"\nbroker: mock\nallowed_origins: [\"https://town.example\"]\n",
            )
            .unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.ws_port, 9004);
        assert_eq!(cfg.broker_endpoint.to_string(), "10.0.0.5:9400");
        assert_eq!(cfg.broker, BackendKind::Mock);
        assert_eq!(cfg.allowed_origins, vec!["https://town.example".to_string()]);
    }

    #[test]
    fn bad_yaml_host_is_an_error() {
        assert!(RelayConfig::default().apply_yaml("host: nope\n").is_err());
    }
}
