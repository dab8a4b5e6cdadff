use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use ulid::Ulid;

use crate::compactor;
use crate::directory::{DirectoryError, TenantDirectory};
use crate::engine::Engine;
use crate::model::Tenant;
use crate::notify::NotifyHub;

const DIRECTORY_WAL: &str = "tenants.wal";

/// Owns the tenant directory and the per-tenant engines.
/// Each tenant gets its own Engine + WAL + compactor, loaded on first use.
pub struct TenantManager {
    directory: TenantDirectory,
    engines: DashMap<Ulid, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> io::Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        let directory = TenantDirectory::open(&data_dir.join(DIRECTORY_WAL))?;
        Ok(Self {
            directory,
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        })
    }

    pub fn directory(&self) -> &TenantDirectory {
        &self.directory
    }

    /// Get or lazily open the engine for a claimed tenant.
    pub fn engine(&self, tenant_id: Ulid) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(&tenant_id) {
            return Ok(engine.value().clone());
        }
        if self.directory.get(&tenant_id).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown tenant {tenant_id}"),
            ));
        }

        // The entry lock keeps two first requests from opening the same WAL twice.
        let engine = self
            .engines
            .entry(tenant_id)
            .or_try_insert_with(|| -> io::Result<Arc<Engine>> {
                let wal_path = self.data_dir.join(format!("{tenant_id}.wal"));
                let engine = Arc::new(Engine::new(tenant_id, wal_path, Arc::new(NotifyHub::new()))?);

                let compactor_engine = engine.clone();
                let threshold = self.compact_threshold;
                tokio::spawn(async move {
                    compactor::run_compactor(compactor_engine, threshold).await;
                });
                tracing::info!(tenant = %tenant_id, "tenant engine loaded");
                Ok(engine)
            })?
            .value()
            .clone();

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// Subdomain → tenant record and its engine.
    pub fn resolve(&self, subdomain: &str) -> Result<(Tenant, Arc<Engine>), DirectoryError> {
        let tenant = self.directory.resolve(subdomain)?;
        let engine = self
            .engine(tenant.id)
            .map_err(|e| DirectoryError::Storage(e.to_string()))?;
        Ok((tenant, engine))
    }
}
