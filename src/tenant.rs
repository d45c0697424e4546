use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::config::Config;
use crate::engine::{Engine, EngineSettings, Services};
use crate::limits::*;
use crate::settlement;

/// Builds the external collaborators for a tenant, given its name.
pub type ServicesFactory = Arc<dyn Fn(&str) -> Services + Send + Sync>;

/// WAL file stem for a tenant name: alphanumerics, `_` and `-` only.
pub fn tenant_file_stem(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(safe_name)
}

/// Manages per-tenant engines. Each tenant (marketplace) gets its own
/// Engine, WAL, settlement loop and compactor. Tenant = database name from
/// the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    settlement_interval: Duration,
    settings: EngineSettings,
    services: ServicesFactory,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        settlement_interval: Duration,
        settings: EngineSettings,
        services: ServicesFactory,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            settlement_interval,
            settings,
            services,
        }
    }

    /// Tenants backed by the in-process sandbox gateway.
    pub fn from_config(config: &Config) -> Self {
        let secret = config.webhook_secret.clone();
        Self::new(
            config.data_dir.clone(),
            config.compact_threshold,
            config.settlement_interval,
            config.engine.clone(),
            Arc::new(move |_| Services::sandbox(&secret)),
        )
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = tenant_file_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let services = (self.services)(tenant);
                let engine = Arc::new(Engine::new(wal_path, self.settings.clone(), services)?);
                slot.insert(engine.clone());
                engine
            }
        };

        if !self.settlement_interval.is_zero() {
            tokio::spawn(settlement::run_settlement(engine.clone(), self.settlement_interval));
        }
        tokio::spawn(settlement::run_compactor(engine.clone(), self.compact_threshold));

        info!("tenant {tenant} loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}
