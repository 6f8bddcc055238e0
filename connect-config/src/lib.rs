//! The `{ip, port}` record that tells the phone where the desktop relay
//! listens. The desktop writes it during pairing; the device tooling then
//! pushes a copy into the app's external-files directory.

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 8383;

pub const CONFIG_FILE_NAME: &str = "ws-config.json";

/// Location of the record relative to the Android app's external-files dir.
pub const DEVICE_CONFIG_RELATIVE_PATH: &str = "ADB_Client/ws-config.json";

const APP_DIR_NAME: &str = "connect";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub ip: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
}

impl ConfigRecord {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.ip, self.port)
    }
}

// Older builds of the Android app stored the port as a string.
fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {s:?}"))),
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// `<user data dir>/connect/ws-config.json` on the desktop.
    pub fn desktop_default() -> anyhow::Result<Self> {
        let base = dirs_next::data_dir().context("no user data directory on this platform")?;
        Ok(Self::open(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<Option<ConfigRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };

        let json = String::from_utf8(bytes).context("config file is not utf-8")?;
        let record: ConfigRecord = serde_json::from_str(&json)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(record))
    }

    /// Overwrites any previous record.
    pub fn save(&self, record: &ConfigRecord) -> anyhow::Result<()> {
        write_record(&self.path, record)?;
        log::info!(
            "saved relay config {}:{} to {}",
            record.ip,
            record.port,
            self.path.display()
        );
        Ok(())
    }

    /// Writes the stored record to `dest`, e.g. a staging file that is then
    /// pushed to the device.
    pub fn export_to(&self, dest: impl AsRef<Path>) -> anyhow::Result<ConfigRecord> {
        let record = self
            .load()?
            .with_context(|| format!("no config stored at {}", self.path.display()))?;
        write_record(dest.as_ref(), &record)?;
        Ok(record)
    }
}

fn write_record(path: &Path, record: &ConfigRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string(record)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
