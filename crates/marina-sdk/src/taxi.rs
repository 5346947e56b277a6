use std::str::FromStr;
use std::time::Duration;

use lwk_wollet::elements::pset::PartiallySignedTransaction;
use lwk_wollet::elements::AssetId;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::serde_utils::{display_fromstr, hex32};
use crate::types::UnblindingData;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopupRequest {
    #[serde(with = "display_fromstr")]
    pub asset_hash: AssetId,
    pub estimated_tx_size: usize,
    pub millisat_per_byte: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topup {
    /// Base64 partial PSET funding the fee.
    pub partial: String,
    pub topup_id: String,
}

/// Blinding data of one sponsor input, in input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxiBlindingData {
    #[serde(with = "display_fromstr")]
    pub asset: AssetId,
    pub value: u64,
    #[serde(with = "hex32")]
    pub asset_blinder: [u8; 32],
    #[serde(with = "hex32")]
    pub value_blinder: [u8; 32],
}

impl From<TaxiBlindingData> for UnblindingData {
    fn from(d: TaxiBlindingData) -> Self {
        UnblindingData {
            value: d.value,
            asset: d.asset,
            asset_blinding_factor: d.asset_blinder,
            value_blinding_factor: d.value_blinder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopupResponse {
    pub topup: Topup,
    /// Amount of the requested asset the wallet pays the sponsor.
    pub asset_amount: u64,
    pub asset_spread: u64,
    pub expiry: i64,
    #[serde(default)]
    pub in_blinding_data: Vec<TaxiBlindingData>,
}

impl TopupResponse {
    pub fn partial_pset(&self) -> Result<PartiallySignedTransaction> {
        PartiallySignedTransaction::from_str(&self.topup.partial)
            .map_err(|e| Error::Taxi(format!("bad partial PSET: {e}")))
    }
}

/// Fee-sponsorship service.
pub trait TaxiApi: Send + Sync {
    fn topup(&self, request: &TopupRequest) -> Result<TopupResponse>;
}

pub struct HttpTaxiApi {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpTaxiApi {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            url: format!("{}/asset/topup", url.trim_end_matches('/')),
            client,
        })
    }
}

impl TaxiApi for HttpTaxiApi {
    fn topup(&self, request: &TopupRequest) -> Result<TopupResponse> {
        log::debug!(
            "taxi: topup {} for ~{} vB at {} msat/B",
            request.asset_hash,
            request.estimated_tx_size,
            request.millisat_per_byte
        );
        self.client
            .post(&self.url)
            .json(request)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Taxi(format!("POST {}: {e}", self.url)))?
            .json()
            .map_err(|e| Error::Taxi(format!("topup response: {e}")))
    }
}
