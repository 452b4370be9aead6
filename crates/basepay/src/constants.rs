use std::collections::BTreeMap;
use std::time::Duration;

use alloy::primitives::{address, Address};
use serde::Serialize;

use crate::BasePayError;

/// Base Sepolia chain ID.
pub const BASE_SEPOLIA_CHAIN_ID: u64 = 84532;

/// Registry key used by [`chain_list`] for Base Sepolia.
pub const BASE_SEPOLIA_KEY: &str = "baseSepolia";

/// Default RPC endpoint for Base Sepolia.
pub const RPC_URL: &str = "https://sepolia.base.org";

/// Block explorer base URL.
pub const EXPLORER_BASE: &str = "https://sepolia-explorer.base.org";

/// USDC on Base Sepolia.
pub const USDC_ADDRESS: Address = address!("036CbD53842c5426634e7929541eC2318f3dCF7e");

/// USDC has 6 decimal places.
pub const USDC_DECIMALS: u8 = 6;

/// BasePay invoice tracker contract on Base Sepolia.
pub const INVOICE_TRACKER_ADDRESS: Address = address!("B8685deAB3a075EC495A4848321567F4224611c9");

/// Demo merchant receiving invoice payments.
pub const MERCHANT_ADDRESS: Address = address!("d38808a2BB9163822aaCeAc2e704b86Aa4F00228");

/// Fixed demo invoice amount, in whole USDC.
pub const INVOICE_AMOUNT: &str = "8";

/// Memo attached to demo invoices.
pub const INVOICE_MEMO: &str = "Test invoice";

/// Native currency decimals (ETH).
pub const NATIVE_DECIMALS: u8 = 18;

/// Default bound on a single confirmation wait.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

/// An ERC-20 token the client can invoice in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

impl TokenConfig {
    pub fn usdc() -> Self {
        Self {
            symbol: "USDC".to_string(),
            address: USDC_ADDRESS,
            decimals: USDC_DECIMALS,
        }
    }
}

/// Runtime chain configuration. All deployment values live here and are
/// consumed, never computed, by the payment flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub display_name: String,
    pub rpc_url: String,
    pub explorer_base: String,
    pub native_ticker: String,
    pub token: TokenConfig,
    pub invoice_tracker: Address,
    pub merchant: Address,
    pub invoice_amount: String,
    pub invoice_memo: String,
    pub confirmation_timeout: Duration,
}

impl Default for ChainConfig {
    /// Defaults to the Base Sepolia demo deployment.
    fn default() -> Self {
        Self {
            chain_id: BASE_SEPOLIA_CHAIN_ID,
            display_name: "Base Sepolia".to_string(),
            rpc_url: RPC_URL.to_string(),
            explorer_base: EXPLORER_BASE.to_string(),
            native_ticker: "ETH".to_string(),
            token: TokenConfig::usdc(),
            invoice_tracker: INVOICE_TRACKER_ADDRESS,
            merchant: MERCHANT_ADDRESS,
            invoice_amount: INVOICE_AMOUNT.to_string(),
            invoice_memo: INVOICE_MEMO.to_string(),
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }
}

impl ChainConfig {
    /// Load configuration from `BASEPAY_*` environment variables, falling back
    /// to the Base Sepolia defaults for anything unset.
    pub fn from_env() -> Result<Self, BasePayError> {
        let mut config = Self::default();

        if let Ok(rpc_url) = std::env::var("BASEPAY_RPC_URL") {
            url::Url::parse(&rpc_url).map_err(|e| {
                BasePayError::ConfigError(format!("invalid BASEPAY_RPC_URL '{rpc_url}': {e}"))
            })?;
            config.rpc_url = rpc_url;
        }

        if let Ok(chain_id) = std::env::var("BASEPAY_CHAIN_ID") {
            config.chain_id = parse_chain_id(&chain_id)?;
        }

        if let Ok(token) = std::env::var("BASEPAY_TOKEN_ADDRESS") {
            config.token.address = parse_address("BASEPAY_TOKEN_ADDRESS", &token)?;
        }

        if let Ok(symbol) = std::env::var("BASEPAY_TOKEN_SYMBOL") {
            config.token.symbol = symbol;
        }

        if let Ok(decimals) = std::env::var("BASEPAY_TOKEN_DECIMALS") {
            config.token.decimals = decimals.parse().map_err(|e| {
                BasePayError::ConfigError(format!("invalid BASEPAY_TOKEN_DECIMALS: {e}"))
            })?;
        }

        if let Ok(tracker) = std::env::var("BASEPAY_TRACKER_ADDRESS") {
            config.invoice_tracker = parse_address("BASEPAY_TRACKER_ADDRESS", &tracker)?;
        }

        if let Ok(merchant) = std::env::var("BASEPAY_MERCHANT_ADDRESS") {
            config.merchant = parse_address("BASEPAY_MERCHANT_ADDRESS", &merchant)?;
        }

        if let Ok(amount) = std::env::var("BASEPAY_INVOICE_AMOUNT") {
            crate::amount::parse_units(&amount, config.token.decimals)?;
            config.invoice_amount = amount;
        }

        if let Ok(memo) = std::env::var("BASEPAY_INVOICE_MEMO") {
            config.invoice_memo = memo;
        }

        if let Ok(secs) = std::env::var("BASEPAY_CONFIRMATION_TIMEOUT_SECS") {
            config.confirmation_timeout = parse_timeout_secs(&secs)?;
        }

        Ok(config)
    }

    /// Chain ID in the `0x`-prefixed hex form wallets report.
    pub fn chain_id_hex(&self) -> String {
        format!("0x{:x}", self.chain_id)
    }

    /// Explorer link for a transaction hash.
    pub fn explorer_tx_url(&self, tx: &impl std::fmt::Display) -> String {
        format!("{}/tx/{}", self.explorer_base.trim_end_matches('/'), tx)
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }
}

/// Named chains the client knows how to connect to.
pub fn chain_list() -> BTreeMap<String, ChainConfig> {
    let mut chains = BTreeMap::new();
    chains.insert(BASE_SEPOLIA_KEY.to_string(), ChainConfig::default());
    chains
}

fn parse_address(var: &str, value: &str) -> Result<Address, BasePayError> {
    value
        .parse()
        .map_err(|e| BasePayError::ConfigError(format!("invalid {var} '{value}': {e}")))
}

/// Accepts both decimal (`84532`) and wallet-style hex (`0x14A34`) chain IDs.
fn parse_chain_id(value: &str) -> Result<u64, BasePayError> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| BasePayError::ConfigError(format!("invalid chain id '{value}': {e}")))
}

/// Whole seconds, at least one.
fn parse_timeout_secs(value: &str) -> Result<Duration, BasePayError> {
    let secs: u64 = value.trim().parse().map_err(|e| {
        BasePayError::ConfigError(format!(
            "invalid BASEPAY_CONFIRMATION_TIMEOUT_SECS '{value}': {e}"
        ))
    })?;
    if secs == 0 {
        return Err(BasePayError::ConfigError(
            "BASEPAY_CONFIRMATION_TIMEOUT_SECS must be at least 1".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
}
