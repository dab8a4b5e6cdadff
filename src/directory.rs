use std::io;
use std::path::Path;

use chrono_tz::Tz;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::limits::*;
use crate::model::Tenant;
use crate::wal::Wal;

/// Subdomain used when a name has no usable characters.
const FALLBACK_SUBDOMAIN: &str = "shop";

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("no tenant for subdomain {0:?}")]
    NotFound(String),
    #[error("subdomain {0:?} is already taken")]
    SubdomainTaken(String),
    #[error("tenant already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid input: {0}")]
    Invalid(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("directory storage error: {0}")]
    Storage(String),
}

/// Directory log record. Each carries the full tenant so replay is a plain overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum DirectoryEvent {
    TenantClaimed { tenant: Tenant },
    TenantUpdated { tenant: Tenant },
}

/// A request to register a new business.
#[derive(Debug, Clone)]
pub struct TenantClaim {
    pub id: Ulid,
    pub name: String,
    /// Explicit slug; derived from `name` when absent.
    pub subdomain: Option<String>,
    pub timezone: Option<Tz>,
    pub slot_step_minutes: Option<u32>,
}

/// Profile changes. Outer `None` leaves a field alone; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub timezone: Option<Tz>,
    pub slot_step_minutes: Option<Option<u32>>,
    pub headline: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub address: Option<Option<String>>,
    pub logo_url: Option<Option<String>>,
}

/// Lowercase, keep `[a-z0-9]`, truncate to the subdomain limit.
/// Idempotent: deriving an already derived subdomain returns it unchanged.
pub fn derive_subdomain(name: &str) -> String {
    let slug: String = name
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .take(MAX_SUBDOMAIN_LEN)
        .collect();
    if slug.is_empty() {
        FALLBACK_SUBDOMAIN.to_string()
    } else {
        slug
    }
}

/// Trim and lowercase a slug as typed by a visitor.
pub fn normalize_subdomain(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

fn validate_subdomain(slug: &str) -> Result<(), DirectoryError> {
    if slug.is_empty() || slug.len() > MAX_SUBDOMAIN_LEN {
        return Err(DirectoryError::Invalid("subdomain must be 1-20 characters"));
    }
    if !slug.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
        return Err(DirectoryError::Invalid("subdomain may only contain a-z and 0-9"));
    }
    Ok(())
}

fn validate_step(step: Option<u32>) -> Result<(), DirectoryError> {
    if let Some(m) = step
        && !(MIN_SLOT_STEP_MINUTES..=MAX_SLOT_STEP_MINUTES).contains(&m)
    {
        return Err(DirectoryError::Invalid("slot step must be 5-1440 minutes"));
    }
    Ok(())
}

fn validate_text(value: &Option<String>, max: usize, what: &'static str) -> Result<(), DirectoryError> {
    if let Some(v) = value
        && v.len() > max
    {
        return Err(DirectoryError::LimitExceeded(what));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), DirectoryError> {
    if name.trim().is_empty() {
        return Err(DirectoryError::Invalid("tenant name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(DirectoryError::LimitExceeded("tenant name too long"));
    }
    Ok(())
}

/// Append `n` to `base`, cutting the base so the result still fits.
fn with_suffix(base: &str, n: usize) -> String {
    let suffix = n.to_string();
    let keep = MAX_SUBDOMAIN_LEN.saturating_sub(suffix.len()).min(base.len());
    format!("{}{suffix}", &base[..keep])
}

/// All tenants, indexed by id and by subdomain, persisted to their own log.
pub struct TenantDirectory {
    by_id: DashMap<Ulid, Tenant>,
    by_subdomain: DashMap<String, Ulid>,
    /// Claims and updates are serialized under this lock.
    wal: Mutex<Wal>,
}

impl TenantDirectory {
    pub fn open(path: &Path) -> io::Result<Self> {
        let events: Vec<DirectoryEvent> = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let dir = Self {
            by_id: DashMap::new(),
            by_subdomain: DashMap::new(),
            wal: Mutex::new(wal),
        };
        for event in events {
            match event {
                DirectoryEvent::TenantClaimed { tenant } | DirectoryEvent::TenantUpdated { tenant } => {
                    dir.by_subdomain.insert(tenant.subdomain.clone(), tenant.id);
                    dir.by_id.insert(tenant.id, tenant);
                }
            }
        }
        tracing::debug!(tenants = dir.by_id.len(), "tenant directory loaded");
        Ok(dir)
    }

    /// Case-insensitive subdomain lookup. No side effects.
    pub fn resolve(&self, subdomain: &str) -> Result<Tenant, DirectoryError> {
        let slug = normalize_subdomain(subdomain);
        self.by_subdomain
            .get(&slug)
            .and_then(|id| self.get(id.value()))
            .ok_or(DirectoryError::NotFound(slug))
    }

    pub fn get(&self, id: &Ulid) -> Option<Tenant> {
        self.by_id.get(id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Tenant> {
        let mut out: Vec<Tenant> = self.by_id.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        out
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Register a tenant. A derived subdomain that collides gets a numeric
    /// suffix; an explicitly requested one that collides is refused.
    pub async fn claim(&self, claim: TenantClaim) -> Result<Tenant, DirectoryError> {
        validate_name(&claim.name)?;
        validate_step(claim.slot_step_minutes)?;
        let requested = claim.subdomain.as_deref().map(normalize_subdomain);
        if let Some(ref slug) = requested {
            validate_subdomain(slug)?;
        }

        let mut wal = self.wal.lock().await;
        if self.by_id.contains_key(&claim.id) {
            return Err(DirectoryError::AlreadyExists(claim.id));
        }
        if self.by_id.len() >= MAX_TENANTS {
            return Err(DirectoryError::LimitExceeded("too many tenants"));
        }

        let subdomain = match requested {
            Some(slug) if self.by_subdomain.contains_key(&slug) => {
                return Err(DirectoryError::SubdomainTaken(slug));
            }
            Some(slug) => slug,
            None => self.free_subdomain(&derive_subdomain(&claim.name))?,
        };

        let tenant = Tenant {
            id: claim.id,
            subdomain,
            name: claim.name,
            timezone: claim.timezone.unwrap_or(Tz::UTC),
            slot_step_minutes: claim.slot_step_minutes,
            headline: None,
            description: None,
            address: None,
            logo_url: None,
        };
        wal.append(&DirectoryEvent::TenantClaimed { tenant: tenant.clone() })
            .map_err(|e| DirectoryError::Storage(e.to_string()))?;
        self.by_subdomain.insert(tenant.subdomain.clone(), tenant.id);
        self.by_id.insert(tenant.id, tenant.clone());

        tracing::info!(tenant = %tenant.id, subdomain = %tenant.subdomain, "tenant claimed");
        Ok(tenant)
    }

    /// Apply a profile patch. The subdomain never changes.
    pub async fn update_profile(&self, id: Ulid, patch: ProfilePatch) -> Result<Tenant, DirectoryError> {
        if let Some(ref name) = patch.name {
            validate_name(name)?;
        }
        if let Some(step) = patch.slot_step_minutes {
            validate_step(step)?;
        }
        for (value, max, what) in [
            (&patch.headline, MAX_NAME_LEN, "headline too long"),
            (&patch.description, MAX_TEXT_LEN, "description too long"),
            (&patch.address, MAX_TEXT_LEN, "address too long"),
            (&patch.logo_url, MAX_URL_LEN, "logo url too long"),
        ] {
            if let Some(v) = value {
                validate_text(v, max, what)?;
            }
        }

        let mut wal = self.wal.lock().await;
        let mut tenant = self
            .get(&id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
        if let Some(name) = patch.name {
            tenant.name = name;
        }
        if let Some(tz) = patch.timezone {
            tenant.timezone = tz;
        }
        if let Some(step) = patch.slot_step_minutes {
            tenant.slot_step_minutes = step;
        }
        if let Some(v) = patch.headline {
            tenant.headline = v;
        }
        if let Some(v) = patch.description {
            tenant.description = v;
        }
        if let Some(v) = patch.address {
            tenant.address = v;
        }
        if let Some(v) = patch.logo_url {
            tenant.logo_url = v;
        }

        wal.append(&DirectoryEvent::TenantUpdated { tenant: tenant.clone() })
            .map_err(|e| DirectoryError::Storage(e.to_string()))?;
        self.by_id.insert(id, tenant.clone());
        Ok(tenant)
    }

    /// First unclaimed of `base`, `base2`, `base3`, … Caller holds the WAL lock.
    fn free_subdomain(&self, base: &str) -> Result<String, DirectoryError> {
        if !self.by_subdomain.contains_key(base) {
            return Ok(base.to_string());
        }
        (2..=MAX_TENANTS + 1)
            .map(|n| with_suffix(base, n))
            .find(|candidate| !self.by_subdomain.contains_key(candidate))
            .ok_or(DirectoryError::LimitExceeded("no free subdomain"))
    }
}
