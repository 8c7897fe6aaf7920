//! Two-tier persistence of verification results
//!
//! The durable config store is authoritative. The distributed cache holds a JSON
//! copy of the same collection for fast status queries and may be empty or
//! evicted at any time.

use crate::diff::DifferenceReport;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Config namespace holding the stored results
pub const RESULTS_NAMESPACE: &str = "core";

/// Key of the stored results in both tiers
pub const RESULTS_KEY: &str = "integritycheck.checker.results";

/// Stored outcome per artifact identity; clean artifacts have no entry
pub type VerificationResults = BTreeMap<String, DifferenceReport>;

/// Fast, non-authoritative key/value cache
pub trait DistributedCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Durable namespaced key/value store
pub trait ConfigStore: Send + Sync {
    fn has_key(&self, namespace: &str, key: &str) -> Result<bool>;
    fn get_value(&self, namespace: &str, key: &str) -> Result<Option<String>>;
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<()>;
    fn delete_key(&self, namespace: &str, key: &str) -> Result<()>;

    /// Replace the value of `key` with `update(current)` as one atomic step
    ///
    /// The store's own lock is held from the read until the write completes,
    /// so every writer sharing the store sees the previous writer's value.
    /// `update` must not call back into the store.
    fn update_value(
        &self,
        namespace: &str,
        key: &str,
        update: &mut dyn FnMut(Option<String>) -> Result<String>,
    ) -> Result<()>;
}

pub struct ResultCache {
    cache: Arc<dyn DistributedCache>,
    store: Arc<dyn ConfigStore>,
}

impl ResultCache {
    pub fn new(cache: Arc<dyn DistributedCache>, store: Arc<dyn ConfigStore>) -> Self {
        ResultCache { cache, store }
    }

    /// All stored results, or `None` if no verification has ever run
    pub fn get_results(&self) -> Option<VerificationResults> {
        if let Some(cached) = self.cache.get(RESULTS_KEY) {
            match serde_json::from_str(&cached) {
                Ok(results) => return Some(results),
                Err(e) => warn!("Ignoring unreadable cached integrity results: {}", e),
            }
        }

        match self.load_durable() {
            Ok(results) => results,
            Err(e) => {
                warn!("Failed to read stored integrity results: {:#}", e);
                None
            }
        }
    }

    /// Result of one artifact
    ///
    /// `None` when nothing was ever verified. An artifact without an entry in
    /// an existing collection passed, so it yields an empty report.
    pub fn results_for(&self, identity: &str) -> Option<DifferenceReport> {
        self.get_results()
            .map(|mut results| results.remove(identity).unwrap_or_default())
    }

    /// Replace the stored result of `identity`; an empty report removes it
    ///
    /// The collection is rewritten inside [`ConfigStore::update_value`], so
    /// concurrent writers over one store never drop each other's entries. The
    /// cache is refreshed with the new snapshot even if the durable write fails.
    pub fn store_results(&self, identity: &str, report: &DifferenceReport) -> Result<()> {
        let mut refreshed = false;
        let stored = self
            .store
            .update_value(RESULTS_NAMESPACE, RESULTS_KEY, &mut |current| {
                let encoded = merge_report(current.as_deref(), identity, report)?;
                self.cache.set(RESULTS_KEY, &encoded);
                refreshed = true;
                Ok(encoded)
            })
            .context("Failed to persist integrity results");

        if !refreshed {
            // the store failed before handing out its value
            let encoded = merge_report(None, identity, report)?;
            self.cache.set(RESULTS_KEY, &encoded);
        }

        debug!("Stored integrity results for {}", identity);
        stored
    }

    /// Forget all results in both tiers
    pub fn clean_results(&self) -> Result<()> {
        self.cache.remove(RESULTS_KEY);
        self.store
            .delete_key(RESULTS_NAMESPACE, RESULTS_KEY)
            .context("Failed to delete stored integrity results")
    }

    /// `None` if never verified, otherwise whether every artifact passed
    pub fn has_passed(&self) -> Option<bool> {
        self.get_results().map(|results| results.is_empty())
    }

    fn load_durable(&self) -> Result<Option<VerificationResults>> {
        if !self.store.has_key(RESULTS_NAMESPACE, RESULTS_KEY)? {
            return Ok(None);
        }
        let Some(raw) = self.store.get_value(RESULTS_NAMESPACE, RESULTS_KEY)? else {
            return Ok(None);
        };
        let results = serde_json::from_str(&raw).context("Stored integrity results are not valid JSON")?;
        Ok(Some(results))
    }
}

/// Merge one artifact's report into an encoded collection
fn merge_report(current: Option<&str>, identity: &str, report: &DifferenceReport) -> Result<String> {
    let mut results = match current.map(|raw| serde_json::from_str::<VerificationResults>(raw)) {
        Some(Ok(results)) => results,
        Some(Err(e)) => {
            warn!("Stored integrity results unreadable, starting over: {}", e);
            VerificationResults::new()
        }
        None => VerificationResults::new(),
    };

    results.remove(identity);
    if !report.is_empty() {
        results.insert(identity.to_string(), report.clone());
    }
    serde_json::to_string(&results).context("Failed to encode integrity results")
}
