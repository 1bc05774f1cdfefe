//! Client configuration
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ENCLAVE_LINK_DATA_DIR` | Directory holding `pairing.json` | `$HOME/.enclave-link` |
//! | `ENCLAVE_LINK_NAME` | Workstation name shown on the phone | `$HOSTNAME` or `workstation` |
//! | `RUST_LOG` | Log level filter (demo binary) | unset |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::DeliveryPolicy;

pub const DATA_DIR_ENV: &str = "ENCLAVE_LINK_DATA_DIR";
pub const NAME_ENV: &str = "ENCLAVE_LINK_NAME";

const PAIRING_FILE: &str = "pairing.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub workstation_name: String,
    pub data_dir: PathBuf,
    /// Deadline for a profile fetch.
    pub profile_timeout: Duration,
    /// Deadline for a signature request.
    pub signature_timeout: Duration,
    /// Deadline for a list request.
    pub list_timeout: Duration,
    /// Maximum outstanding response callbacks before the least recently
    /// used is evicted.
    pub correlator_capacity: usize,
    /// Maximum messages buffered while the key exchange is pending.
    pub outgoing_queue_capacity: usize,
    /// Pause between relay polls that returned nothing.
    pub drain_interval: Duration,
    pub relay_policy: DeliveryPolicy,
    pub radio_policy: DeliveryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            workstation_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "workstation".to_string()),
            data_dir: default_data_dir(),
            profile_timeout: Duration::from_secs(20),
            signature_timeout: Duration::from_secs(15),
            list_timeout: Duration::from_secs(5),
            correlator_capacity: 128,
            outgoing_queue_capacity: 128,
            drain_interval: Duration::from_millis(250),
            relay_policy: DeliveryPolicy::Authoritative,
            radio_policy: DeliveryPolicy::BestEffort,
        }
    }
}

impl ClientConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var(NAME_ENV) {
            config.workstation_name = name;
        }
        config
    }

    /// Read a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn pairing_path(&self) -> PathBuf {
        self.data_dir.join(PAIRING_FILE)
    }
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".enclave-link")
}
