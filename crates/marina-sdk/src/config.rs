use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::Network;

pub const DEFAULT_GAP_LIMIT: u32 = 20;
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration for a wallet instance.
///
/// Every endpoint is optional in the serialized form and falls back to the
/// network default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub network: Network,
    pub electrum_url: Option<String>,
    pub esplora_url: Option<String>,
    pub taxi_url: Option<String>,
    pub gap_limit: u32,
    #[serde(with = "duration_secs")]
    pub lock_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub data_dir: PathBuf,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Liquid,
            electrum_url: None,
            esplora_url: None,
            taxi_url: None,
            gap_limit: DEFAULT_GAP_LIMIT,
            lock_ttl: DEFAULT_LOCK_TTL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            data_dir: PathBuf::from("."),
        }
    }
}

impl WalletConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn electrum_url(&self) -> &str {
        self.electrum_url
            .as_deref()
            .unwrap_or_else(|| self.network.default_electrum_url())
    }

    pub fn esplora_url(&self) -> &str {
        self.esplora_url
            .as_deref()
            .unwrap_or_else(|| self.network.esplora_url())
    }

    pub fn taxi_url(&self) -> Option<&str> {
        self.taxi_url
            .as_deref()
            .or_else(|| self.network.default_taxi_url())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
