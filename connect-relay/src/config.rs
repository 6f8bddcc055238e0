use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Connection timeout after missed heartbeats
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 90;

/// Largest single WebSocket message (and frame) accepted, in MiB. A whole
/// file travels base64-encoded in one text frame, so this bounds uploads
/// to roughly three quarters of it.
pub const MAX_MESSAGE_MB: usize = 512;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Where uploaded files land.
    pub download_dir: PathBuf,
    pub heartbeat_interval: Duration,
    /// A connection silent for longer than this is closed.
    pub heartbeat_timeout: Duration,
    /// Whether a notification is also broadcast back to the client that sent it.
    pub echo_to_sender: bool,
    /// In bytes. Larger messages get an error status and a 1009 close.
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], connect_config::DEFAULT_PORT)),
            download_dir: default_download_dir(),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            heartbeat_timeout: Duration::from_secs(HEARTBEAT_TIMEOUT_SECS),
            echo_to_sender: true,
            max_message_size: MAX_MESSAGE_MB << 20,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `CONNECT_RELAY_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(listen) = env_var("CONNECT_RELAY_LISTEN") {
            config.listen = listen
                .parse()
                .with_context(|| format!("invalid CONNECT_RELAY_LISTEN {listen:?} (expected host:port)"))?;
        }
        if let Some(dir) = env_var("CONNECT_RELAY_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_var("CONNECT_RELAY_HEARTBEAT_SECS") {
            config.heartbeat_interval = parse_secs("CONNECT_RELAY_HEARTBEAT_SECS", &secs)?;
        }
        if let Some(secs) = env_var("CONNECT_RELAY_TIMEOUT_SECS") {
            config.heartbeat_timeout = parse_secs("CONNECT_RELAY_TIMEOUT_SECS", &secs)?;
        }
        if let Some(echo) = env_var("CONNECT_RELAY_ECHO_SENDER") {
            config.echo_to_sender = parse_bool(&echo)
                .with_context(|| format!("invalid CONNECT_RELAY_ECHO_SENDER {echo:?}"))?;
        }

        if let Some(mb) = env_var("CONNECT_RELAY_MAX_MESSAGE_MB") {
            config.max_message_size = parse_mb("CONNECT_RELAY_MAX_MESSAGE_MB", &mb)?;
        }

        Ok(config)
    }
}

/// The platform Downloads folder, else `~/Downloads`, else `./downloads`.
pub fn default_download_dir() -> PathBuf {
    dirs_next::download_dir()
        .or_else(|| dirs_next::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

fn env_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn parse_secs(name: &str, value: &str) -> anyhow::Result<Duration> {
    let secs: u64 = value
        .parse()
        .with_context(|| format!("invalid {name} {value:?} (expected seconds)"))?;
    anyhow::ensure!(secs > 0, "{name} must be positive");
    Ok(Duration::from_secs(secs))
}

fn parse_mb(name: &str, value: &str) -> anyhow::Result<usize> {
    let mb: usize = value
        .parse()
        .with_context(|| format!("invalid {name} {value:?} (expected MiB)"))?;
    anyhow::ensure!(mb > 0, "{name} must be positive");
    mb.checked_mul(1 << 20)
        .with_context(|| format!("{name} {mb} is too large"))
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("expected true or false"),
    }
}
