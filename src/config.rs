use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::engine::EngineSettings;
use crate::model::SlotPolicy;
use crate::money::{FeeSchedule, RateError};

const PREFIX: &str = "HOSTBOOK_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
    #[error("both HOSTBOOK_TLS_CERT and HOSTBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error(transparent)]
    Rate(#[from] RateError),
}

/// Server configuration, read once from `HOSTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    /// Zero disables the periodic settlement loop.
    pub settlement_interval: Duration,
    pub webhook_secret: String,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` uses the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(&format!("{PREFIX}{name}")).filter(|v| !v.trim().is_empty());

        let tls_cert = get("TLS_CERT");
        let tls_key = get("TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let commission_rate: Decimal = parse_or(&get, "COMMISSION_RATE", Decimal::new(10, 2))?;
        let vat_rate: Decimal = parse_or(&get, "VAT_RATE", Decimal::new(21, 2))?;
        let fees = FeeSchedule::new(commission_rate, vat_rate)?;

        let slot_policy = match get("SLOT_POLICY") {
            Some(raw) => SlotPolicy::from_str(&raw).map_err(|reason| ConfigError::Invalid {
                var: format!("{PREFIX}SLOT_POLICY"),
                value: raw,
                reason,
            })?,
            None => SlotPolicy::default(),
        };

        let currency = get("CURRENCY").unwrap_or_else(|| "EUR".into()).to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::Invalid {
                var: format!("{PREFIX}CURRENCY"),
                value: currency,
                reason: "expected a three-letter ISO code".into(),
            });
        }

        let engine = EngineSettings {
            fees,
            retention_days: parse_or(&get, "RETENTION_DAYS", 7u32)?,
            currency,
            gateway_timeout: Duration::from_millis(parse_or(&get, "GATEWAY_TIMEOUT_MS", 10_000u64)?),
            slot_policy,
        };

        Ok(Self {
            port: parse_or(&get, "PORT", 5433u16)?,
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "hostbook".into()),
            max_connections: parse_or(&get, "MAX_CONNECTIONS", 256usize)?,
            compact_threshold: parse_or(&get, "COMPACT_THRESHOLD", 1000u64)?,
            tls_cert,
            tls_key,
            metrics_port: get("METRICS_PORT").map(|raw| parse_value("METRICS_PORT", raw)).transpose()?,
            settlement_interval: Duration::from_secs(parse_or(&get, "SETTLEMENT_INTERVAL_SECS", 3600u64)?),
            webhook_secret: get("WEBHOOK_SECRET").unwrap_or_else(|| "whsec_sandbox".into()),
            engine,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(raw) => parse_value(name, raw),
        None => Ok(default),
    }
}

fn parse_value<T>(name: &str, raw: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var: format!("{PREFIX}{name}"),
        reason: e.to_string(),
        value: raw,
    })
}
