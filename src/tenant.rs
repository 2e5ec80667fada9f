use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::clock::Clock;
use crate::config::CatalogConfig;
use crate::engine::{Engine, EngineOptions};
use crate::limits::*;
use crate::model::Book;
use crate::notify::Dispatcher;
use crate::policy::BookingPolicy;
use crate::reaper;

/// Everything an organization's engines share.
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub catalog: CatalogConfig,
    pub public_url: String,
    pub clock: Arc<dyn Clock>,
    pub dispatcher: Arc<dyn Dispatcher>,
}

/// The two books of one organization, each with its own WAL.
pub struct Organization {
    pub pantry: Arc<Engine>,
    pub volunteer: Arc<Engine>,
}

impl Organization {
    pub fn engine(&self, book: Book) -> &Arc<Engine> {
        match book {
            Book::Pantry => &self.pantry,
            Book::Volunteer => &self.volunteer,
        }
    }
}

/// Manages per-organization engines. Organization = sanitized database name from the
/// pgwire connection. Each book gets its own Engine + WAL + sweeper + compactor.
pub struct TenantManager {
    orgs: DashMap<String, Arc<Organization>>,
    data_dir: PathBuf,
    settings: TenantSettings,
    max_orgs: usize,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            orgs: DashMap::new(),
            data_dir,
            settings,
            max_orgs: MAX_TENANTS,
        }
    }

    /// Lower the organization cap below `MAX_TENANTS`.
    pub fn with_max_orgs(mut self, max_orgs: usize) -> Self {
        self.max_orgs = max_orgs.min(MAX_TENANTS);
        self
    }

    /// Get or lazily open both books of the given organization. Names that
    /// sanitize to the same file stem are the same organization.
    pub fn get_or_create(&self, org: &str) -> std::io::Result<Arc<Organization>> {
        if org.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = org
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if let Some(found) = self.orgs.get(&safe_name) {
            return Ok(found.value().clone());
        }
        if self.orgs.len() >= self.max_orgs {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections may race here; the entry API keeps the first one opened.
        let entry = self.orgs.entry(safe_name.clone());
        if let Entry::Occupied(found) = &entry {
            return Ok(found.get().clone());
        }
        let opened = Arc::new(Organization {
            pantry: self.open_book(&safe_name, Book::Pantry)?,
            volunteer: self.open_book(&safe_name, Book::Volunteer)?,
        });
        entry.or_insert(opened.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.orgs.len() as f64);
        tracing::info!(org = %safe_name, "organization opened");
        Ok(opened)
    }

    fn open_book(&self, safe_name: &str, book: Book) -> std::io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{safe_name}.{}.wal", book.as_str()));
        let engine = Arc::new(Engine::new(
            wal_path,
            EngineOptions {
                policy: BookingPolicy::for_book(book),
                catalog: self.settings.catalog.catalog(book).clone(),
                public_url: self.settings.public_url.clone(),
                clock: self.settings.clock.clone(),
                dispatcher: self.settings.dispatcher.clone(),
            },
        )?);

        let sweeper_engine = engine.clone();
        tokio::spawn(async move {
            reaper::run_sweeper(sweeper_engine).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.settings.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });

        Ok(engine)
    }
}
