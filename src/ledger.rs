//! Resource ledger.
//!
//! Every resource the topology builder creates is recorded here so it can be
//! torn down afterwards. Teardown runs children before parents (servers,
//! then ports, then subnets, then networks) and newest first within a kind.
//! Entries marked for retention survive teardown on the provider side so a
//! failed build can be inspected, but they still leave the ledger.

use serde::{Deserialize, Serialize};

use crate::provider::{CloudProvider, ProviderError, ResourceKind};

/// One tracked resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub kind: ResourceKind,
    pub id: String,
    pub retain_on_failure: bool,
}

/// A resource whose deletion failed during teardown
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to release {kind} {id}: {source}")]
pub struct ReleaseError {
    pub kind: ResourceKind,
    pub id: String,
    #[source]
    pub source: ProviderError,
}

/// Created resources, in creation order
#[derive(Debug, Default, Clone)]
pub struct ResourceLedger {
    entries: Vec<LedgerEntry>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly created resource
    pub fn track(&mut self, kind: ResourceKind, id: &str) {
        log::debug!("Tracking {} {}", kind, id);
        self.entries.push(LedgerEntry {
            kind,
            id: id.to_string(),
            retain_on_failure: false,
        });
    }

    /// Keep the resource on teardown. Returns false if the id is unknown.
    pub fn mark_retain(&mut self, id: &str) -> bool {
        let mut found = false;
        for entry in self.entries.iter_mut().filter(|e| e.id == id) {
            entry.retain_on_failure = true;
            found = true;
        }
        found
    }

    /// Keep every tracked resource on teardown
    pub fn mark_all_retain(&mut self) {
        for entry in &mut self.entries {
            entry.retain_on_failure = true;
        }
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that teardown will leave in place
    pub fn retained(&self) -> Vec<&LedgerEntry> {
        self.entries.iter().filter(|e| e.retain_on_failure).collect()
    }

    /// Entries in the order teardown processes them
    pub fn release_order(&self) -> Vec<&LedgerEntry> {
        let mut ordered: Vec<(usize, &LedgerEntry)> = self.entries.iter().enumerate().collect();
        ordered.sort_by(|(ia, a), (ib, b)| {
            a.kind
                .release_rank()
                .cmp(&b.kind.release_rank())
                .then_with(|| ib.cmp(ia))
        });
        ordered.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Delete every non-retained resource and empty the ledger.
    ///
    /// Deletion failures do not stop the teardown; they are collected and
    /// returned.
    pub fn release_all(&mut self, provider: &dyn CloudProvider) -> Vec<ReleaseError> {
        let order: Vec<LedgerEntry> = self.release_order().into_iter().cloned().collect();
        self.entries.clear();

        let mut errors = Vec::new();
        for entry in order {
            if entry.retain_on_failure {
                log::info!("Retaining {} {} for inspection", entry.kind, entry.id);
                continue;
            }
            match provider.delete(entry.kind, &entry.id) {
                Ok(()) => log::info!("Deleted {} {}", entry.kind, entry.id),
                Err(source) => {
                    log::warn!("Failed to delete {} {}: {}", entry.kind, entry.id, source);
                    errors.push(ReleaseError {
                        kind: entry.kind,
                        id: entry.id,
                        source,
                    });
                }
            }
        }
        errors
    }
}
