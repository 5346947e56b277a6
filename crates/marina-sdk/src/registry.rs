use std::time::Duration;

use lwk_wollet::elements::AssetId;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::AssetDetails;

/// Source of asset metadata.
pub trait AssetRegistry: Send + Sync {
    fn fetch_asset(&self, asset: &AssetId) -> Result<AssetDetails>;
}

#[derive(Debug, Deserialize)]
struct RegistryAsset {
    name: Option<String>,
    ticker: Option<String>,
    precision: Option<u8>,
}

/// `GET <esplora>/asset/<hash>`.
pub struct EsploraAssetRegistry {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl EsploraAssetRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl AssetRegistry for EsploraAssetRegistry {
    fn fetch_asset(&self, asset: &AssetId) -> Result<AssetDetails> {
        let url = format!("{}/asset/{asset}", self.base_url);
        let resp: RegistryAsset = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Http(format!("GET {url}: {e}")))?
            .json()
            .map_err(|e| Error::Http(format!("asset response: {e}")))?;

        let fallback = AssetDetails::unknown(*asset);
        Ok(AssetDetails {
            asset_hash: *asset,
            name: resp.name.unwrap_or(fallback.name),
            ticker: resp.ticker.unwrap_or(fallback.ticker),
            precision: resp.precision.unwrap_or(fallback.precision),
        })
    }
}
