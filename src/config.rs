//! Engine configuration (spec §6.3), loaded with `figment` the way the
//! teacher's `v4_daq::config::V4Config` loads `config.v4.toml` plus
//! `RUSTDAQ_`-prefixed environment overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Top-level configuration document (spec §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub instruments: Vec<InstrumentConfig>,

    #[serde(default = "default_report_root")]
    pub report_root: PathBuf,

    #[serde(default = "default_item_timeout_ms")]
    pub default_item_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub stop_on_fail: bool,

    #[serde(default)]
    pub simulation: bool,
}

fn default_report_root() -> PathBuf {
    PathBuf::from("./reports")
}

fn default_item_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Load from `path`, merging `TESTORCH_`-prefixed environment overrides
    /// on top, mirroring the teacher's `V4Config::load_from`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TESTORCH_").split("_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the conventional `config/engine.toml` path.
    pub fn load() -> EngineResult<Self> {
        Self::load_from("config/engine.toml")
    }

    /// Validate cross-field invariants after loading: instrument IDs unique,
    /// mandatory keys present per §6.3.
    pub fn validate(&self) -> EngineResult<()> {
        let mut seen = std::collections::HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.is_empty() {
                return Err(EngineError::Config(figment::Error::from(
                    "instrument 'id' must not be empty".to_string(),
                )));
            }
            if !seen.insert(instrument.id.clone()) {
                return Err(EngineError::Config(figment::Error::from(format!(
                    "duplicate instrument id '{}'",
                    instrument.id
                ))));
            }
        }
        Ok(())
    }

    pub fn instrument(&self, id: &str) -> EngineResult<&InstrumentConfig> {
        self.instruments
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| EngineError::InstrumentNotFound(id.to_string()))
    }
}

/// One instrument's declarative configuration (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub id: String,
    /// Driver family, matched against `driver::registry::known_driver_types`.
    pub r#type: String,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Externally-tagged connection variant, mirroring the teacher's
/// `InstrumentSpecificConfig` tagging style but as a true sum type rather
/// than an all-optional struct, since exactly one shape applies per
/// instrument (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "PascalCase")]
pub enum ConnectionConfig {
    Serial {
        port: String,
        baud: u32,
        #[serde(default = "default_parity")]
        parity: String,
        #[serde(default = "default_stopbits")]
        stopbits: u8,
        #[serde(default = "default_item_timeout_ms")]
        timeout_ms: u64,
    },
    TcpSocket {
        host: String,
        port: u16,
        #[serde(default = "default_item_timeout_ms")]
        timeout_ms: u64,
    },
    Visa {
        resource: String,
        #[serde(default = "default_item_timeout_ms")]
        timeout_ms: u64,
    },
    Ssh {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        user: String,
        secret: String,
        #[serde(default = "default_item_timeout_ms")]
        timeout_ms: u64,
    },
    SerialPlusSsh {
        port: String,
        baud: u32,
        host: String,
        #[serde(default = "default_ssh_port")]
        ssh_port: u16,
        user: String,
        secret: String,
    },
    Can {
        channel: String,
        interface: String,
        bitrate: u32,
        #[serde(default)]
        fd: bool,
    },
    Simulated {
        model: String,
    },
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stopbits() -> u8 {
    1
}

fn default_ssh_port() -> u16 {
    22
}
