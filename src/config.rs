//! Command-line and environment configuration.
//!
//! Every setting can come from a flag or an environment variable. Flags take
//! precedence over the environment, which takes precedence over the default.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

pub const DEFAULT_RELAY_BIND: &str = "127.0.0.1:5000";
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:5000";
pub const DATABASE_FILE: &str = "tandem.db";
/// Largest client frame the relay will process. A 2 MB image is roughly
/// 2.7 MB once base64'd, so this leaves ample headroom.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no signing secret: pass --jwt-secret or set TANDEM_JWT_SECRET")]
    MissingSecret,
    #[error("invalid value `{value}` for {setting}: expected {expected}")]
    Invalid {
        setting: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Which pairs of identities may exchange messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateMode {
    /// Mutual friends only.
    #[default]
    Friends,
    /// Any two distinct authenticated identities.
    Open,
}

impl FromStr for GateMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "friends" => Ok(GateMode::Friends),
            "open" => Ok(GateMode::Open),
            _ => Err(ConfigError::Invalid {
                setting: "gate",
                value: s.to_string(),
                expected: "friends | open",
            }),
        }
    }
}

/// Where private keys live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyCustody {
    /// The relay stores each private key and hands it back to its owner.
    #[default]
    Escrowed,
    /// Private keys never leave the client; the relay only holds public keys.
    ClientHeld,
}

impl FromStr for KeyCustody {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "escrowed" => Ok(KeyCustody::Escrowed),
            "client-held" | "client_held" => Ok(KeyCustody::ClientHeld),
            _ => Err(ConfigError::Invalid {
                setting: "key custody",
                value: s.to_string(),
                expected: "escrowed | client-held",
            }),
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(".tandem"))
        .unwrap_or_else(|_| PathBuf::from(".tandem"))
}

/// `--data-dir`, else `TANDEM_HOME`, else `~/.tandem`.
pub fn data_dir_from(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var("TANDEM_HOME").ok().map(PathBuf::from))
        .unwrap_or_else(home_dir)
}

/// Parse a flag value, else the environment variable `var`, else the default.
pub fn parse_setting<T>(cli: Option<String>, var: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = ConfigError> + Default,
{
    match cli.or_else(|| std::env::var(var).ok()) {
        Some(value) => value.parse(),
        None => Ok(T::default()),
    }
}

/// Relay server for dual-ciphertext encrypted chat.
///
/// Authenticates WebSocket connections, stores every message in both of its
/// ciphertext variants, and forwards it live to an online recipient.
#[derive(Parser, Debug, Default)]
#[command(name = "tandem-relay", version, about)]
pub struct RelayCli {
    /// Listen address [env: TANDEM_RELAY_BIND] [default: 127.0.0.1:5000]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Directory holding the database [env: TANDEM_HOME] [default: ~/.tandem]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Secret for verifying handshake tokens [env: TANDEM_JWT_SECRET]
    #[arg(long)]
    pub jwt_secret: Option<String>,

    /// Who may message whom: friends | open [env: TANDEM_GATE] [default: friends]
    #[arg(long)]
    pub gate: Option<String>,

    /// Private key custody: escrowed | client-held [env: TANDEM_KEY_CUSTODY] [default: escrowed]
    #[arg(long)]
    pub key_custody: Option<String>,

    /// Largest frame processed, in bytes [env: TANDEM_MAX_FRAME_BYTES] [default: 16777216]
    #[arg(long)]
    pub max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub jwt_secret: String,
    pub gate: GateMode,
    pub key_custody: KeyCustody,
    pub max_frame_bytes: usize,
}

impl RelayConfig {
    pub fn from_cli_and_env(cli: RelayCli) -> Result<Self, ConfigError> {
        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("TANDEM_RELAY_BIND").ok())
            .unwrap_or_else(|| DEFAULT_RELAY_BIND.to_string());

        let jwt_secret = cli
            .jwt_secret
            .or_else(|| std::env::var("TANDEM_JWT_SECRET").ok())
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSecret)?;

        let max_frame_bytes = match cli.max_frame_bytes {
            Some(n) => n,
            None => match std::env::var("TANDEM_MAX_FRAME_BYTES") {
                Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    setting: "max frame bytes",
                    value: raw,
                    expected: "a byte count",
                })?,
                Err(_) => DEFAULT_MAX_FRAME_BYTES,
            },
        };

        Ok(Self {
            bind_addr,
            data_dir: data_dir_from(cli.data_dir),
            jwt_secret,
            gate: parse_setting(cli.gate, "TANDEM_GATE")?,
            key_custody: parse_setting(cli.key_custody, "TANDEM_KEY_CUSTODY")?,
            max_frame_bytes,
        })
    }

    /// Defaults with an explicit secret, for embedding the relay in tests.
    pub fn with_secret(secret: &str) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: PathBuf::from("."),
            jwt_secret: secret.to_string(),
            gate: GateMode::default(),
            key_custody: KeyCustody::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

/// Interactive encrypted chat client.
#[derive(Parser, Debug, Default)]
#[command(name = "tandem-chat", version, about)]
pub struct ChatCli {
    /// Relay base URL [env: TANDEM_RELAY_URL] [default: http://127.0.0.1:5000]
    #[arg(long, short = 'r')]
    pub relay_url: Option<String>,

    /// Handshake token issued for your identity [env: TANDEM_TOKEN]
    #[arg(long, short = 't')]
    pub token: Option<String>,

    /// Key pair JSON file; omit to fetch escrowed keys [env: TANDEM_KEY_FILE]
    #[arg(long, short = 'k')]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub relay_url: String,
    pub token: Option<String>,
    pub key_file: Option<PathBuf>,
}

impl ChatConfig {
    pub fn from_cli_and_env(cli: ChatCli) -> Self {
        let relay_url = cli
            .relay_url
            .or_else(|| std::env::var("TANDEM_RELAY_URL").ok())
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
        let token = cli.token.or_else(|| std::env::var("TANDEM_TOKEN").ok());
        let key_file = cli
            .key_file
            .or_else(|| std::env::var("TANDEM_KEY_FILE").ok().map(PathBuf::from));
        Self {
            relay_url: relay_url.trim_end_matches('/').to_string(),
            token,
            key_file,
        }
    }

    /// The WebSocket endpoint matching `relay_url`.
    pub fn ws_url(&self) -> String {
        ws_url_for(&self.relay_url)
    }
}

/// Map an `http(s)://` relay URL to its `ws(s)://…/ws` endpoint.
pub fn ws_url_for(relay_url: &str) -> String {
    let base = relay_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws")
}
