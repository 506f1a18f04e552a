use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::accounts::{Accounts, PasswordHasher};
use crate::clock::{Clock, SystemClock};
use crate::engine::Engine;
use crate::limits::*;
use crate::reaper;
use crate::session::SessionStore;
use crate::store::{AuditSink, JsonlAuditLog, Ledger};

/// Settings shared by every tenant a manager creates.
#[derive(Debug, Clone)]
pub struct TenantOptions {
    pub compact_threshold: u64,
    pub session_ttl: Duration,
    pub hasher: PasswordHasher,
}

impl Default for TenantOptions {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            session_ttl: Duration::from_secs(30 * 60),
            hasher: PasswordHasher::new(),
        }
    }
}

/// One isolated enrollment database: its ledger plus the services built on it.
pub struct Tenant {
    pub ledger: Arc<Ledger>,
    pub engine: Engine,
    pub accounts: Accounts,
    pub sessions: Arc<SessionStore>,
}

impl Tenant {
    /// Wire the services around an existing ledger and audit sink.
    pub fn assemble(
        ledger: Arc<Ledger>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        options: &TenantOptions,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(options.session_ttl));
        let engine = Engine::new(ledger.clone(), ledger.clone(), audit.clone(), clock.clone());
        let accounts = Accounts::new(ledger.clone(), sessions.clone(), audit, clock, options.hasher.clone());
        Self {
            ledger,
            engine,
            accounts,
            sessions,
        }
    }

    /// Open `<name>.wal` and `<name>.audit.jsonl` under `data_dir`.
    pub fn open(data_dir: &Path, name: &str, options: &TenantOptions) -> io::Result<Self> {
        let ledger = Arc::new(Ledger::open(&data_dir.join(format!("{name}.wal")))?);
        let audit = Arc::new(JsonlAuditLog::open(&data_dir.join(format!("{name}.audit.jsonl")))?);
        Ok(Self::assemble(ledger, audit, Arc::new(SystemClock), options))
    }
}

/// Manages per-tenant state. Each tenant gets its own ledger, WAL, audit log and
/// background tasks. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    options: TenantOptions,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, options: TenantOptions) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            options,
        }
    }

    /// Get or lazily create the tenant for a database name.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Tenant>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
        }
        if let Some(existing) = self.tenants.get(&safe_name) {
            return Ok(existing.value().clone());
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        match self.tenants.entry(safe_name.clone()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let tenant = Arc::new(Tenant::open(&self.data_dir, &safe_name, &self.options)?);
                self.spawn_background(&safe_name, &tenant);
                slot.insert(tenant.clone());
                info!(tenant = %safe_name, "tenant loaded");
                metrics::gauge!(crate::observability::TENANTS_ACTIVE).increment(1.0);
                Ok(tenant)
            }
        }
    }

    fn spawn_background(&self, name: &str, tenant: &Tenant) {
        let ledger = tenant.ledger.clone();
        let threshold = self.options.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(ledger, threshold).await;
        });
        let sessions = tenant.sessions.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            reaper::run_session_sweeper(name, sessions).await;
        });
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}
