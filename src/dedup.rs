use std::collections::HashSet;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::db::RecordStore;
use crate::document::RawDocument;
use crate::error::Result;

/// Whether a product's content has been seen before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    Fresh,
    /// Already persisted under this record id
    Duplicate(i64),
    /// Claimed by another item of the same run that has not persisted yet
    SeenThisRun,
}

/// Combined SHA-256 over every source document of a product.
///
/// Each document contributes its kind and its length before its bytes, so the
/// digest is stable across runs and unambiguous between document boundaries.
pub fn fingerprint(documents: &[&RawDocument]) -> String {
    let mut hasher = Sha256::new();
    for document in documents {
        hasher.update(document.kind().as_str().as_bytes());
        hasher.update((document.content().len() as u64).to_be_bytes());
        hasher.update(document.content());
    }
    hex::encode(hasher.finalize())
}

/// Content-hash gate in front of persistence, shared by all workers of a run
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: Mutex<HashSet<String>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a content hash against the store and against this run
    pub fn check(&self, content_hash: &str, store: &dyn RecordStore) -> Result<DedupDecision> {
        if let Some(id) = store.find_by_hash(content_hash)? {
            return Ok(DedupDecision::Duplicate(id));
        }

        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if seen.insert(content_hash.to_string()) {
            Ok(DedupDecision::Fresh)
        } else {
            Ok(DedupDecision::SeenThisRun)
        }
    }
}
