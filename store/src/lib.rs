// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A content-addressed blob store.
//!
//! Content is keyed by the SHA-256 fingerprint of its bytes: two writes of identical content
//! share one stored copy, and consumers hold reference counts rather than bytes. Placement is
//! tracked per blob as an advisory tier (hot/warm/cold) which never affects content identity.
//!
//! The backing storage is abstracted behind the [`Substrate`] capability trait so that the
//! store itself is polymorphic over placements: in-memory for tests and edge runtimes, or
//! anything else that can persist a fingerprint-to-bytes mapping.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hashing::{Digest, Fingerprint, EMPTY_DIGEST};
use log::{trace, warn};
use parking_lot::Mutex;
use serde::Serialize;

/// Content at or above this size defaults to the warm tier rather than hot.
pub const HOT_TIER_SIZE_LIMIT: usize = 512 * 1024;

/// An advisory placement label. Transitions between tiers preserve content byte-for-byte.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

///
/// The capability set a backing substrate must provide: an atomic fingerprint-to-bytes mapping.
///
/// Implementations are interchangeable; the store layers reference counting, tiering and
/// integrity checks on top, and never reaches around this interface.
///
#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    async fn store(&self, fingerprint: Fingerprint, bytes: Bytes) -> Result<(), String>;

    async fn load(&self, fingerprint: Fingerprint) -> Result<Option<Bytes>, String>;

    /// Returns true if the fingerprint was present.
    async fn remove(&self, fingerprint: Fingerprint) -> Result<bool, String>;

    async fn all_fingerprints(&self) -> Result<Vec<Fingerprint>, String>;
}

/// The in-memory substrate variant.
pub struct MemorySubstrate {
    contents: Mutex<HashMap<Fingerprint, Bytes>>,
}

impl MemorySubstrate {
    pub fn new() -> MemorySubstrate {
        MemorySubstrate {
            contents: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn store(&self, fingerprint: Fingerprint, bytes: Bytes) -> Result<(), String> {
        self.contents.lock().insert(fingerprint, bytes);
        Ok(())
    }

    async fn load(&self, fingerprint: Fingerprint) -> Result<Option<Bytes>, String> {
        Ok(self.contents.lock().get(&fingerprint).cloned())
    }

    async fn remove(&self, fingerprint: Fingerprint) -> Result<bool, String> {
        Ok(self.contents.lock().remove(&fingerprint).is_some())
    }

    async fn all_fingerprints(&self) -> Result<Vec<Fingerprint>, String> {
        Ok(self.contents.lock().keys().copied().collect())
    }
}

#[derive(Clone, Copy, Debug)]
struct BlobMeta {
    size: usize,
    ref_count: usize,
    tier: Tier,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TierStats {
    pub count: usize,
    pub size: usize,
}

/// Aggregate accounting for the store, including the deduplication ratio between the logical
/// bytes referenced by consumers and the physical bytes actually held.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StoreStats {
    pub hot: TierStats,
    pub warm: TierStats,
    pub cold: TierStats,
    pub logical_size: usize,
    pub physical_size: usize,
    pub dedup_ratio: f64,
    pub bytes_saved: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ReclaimSummary {
    pub count: usize,
    pub bytes_freed: usize,
}

///
/// A content-addressed store of blobs with reference counting and tier placement.
///
/// `put` deduplicates: storing byte-identical content twice yields the same digest with the
/// reference count incremented, and allocates no additional backing storage. A blob whose
/// reference count reaches zero is not deleted eagerly; it becomes orphan-eligible and is
/// released by `reclaim_orphans`.
///
#[derive(Clone)]
pub struct ByteStore {
    substrate: Arc<dyn Substrate>,
    meta: Arc<Mutex<HashMap<Fingerprint, BlobMeta>>>,
    hot_size_limit: usize,
}

impl ByteStore {
    pub fn new(substrate: Arc<dyn Substrate>) -> ByteStore {
        Self::with_hot_size_limit(substrate, HOT_TIER_SIZE_LIMIT)
    }

    pub fn with_hot_size_limit(substrate: Arc<dyn Substrate>, hot_size_limit: usize) -> ByteStore {
        let store = ByteStore {
            substrate,
            meta: Arc::new(Mutex::new(HashMap::new())),
            hot_size_limit,
        };
        // The empty content always has a canonical blob, orphaned until first referenced.
        store.meta.lock().insert(
            EMPTY_DIGEST.hash,
            BlobMeta {
                size: 0,
                ref_count: 0,
                tier: Tier::Hot,
            },
        );
        store
    }

    pub fn in_memory() -> ByteStore {
        Self::new(Arc::new(MemorySubstrate::new()))
    }

    fn default_tier(&self, size: usize) -> Tier {
        if size < self.hot_size_limit {
            Tier::Hot
        } else {
            Tier::Warm
        }
    }

    ///
    /// Store content, returning its stable digest. If the content is already present the
    /// reference count is incremented and no bytes are written.
    ///
    pub async fn put(&self, bytes: Bytes) -> Result<Digest, String> {
        self.put_with_tier(bytes, None).await
    }

    pub async fn put_with_tier(&self, bytes: Bytes, tier: Option<Tier>) -> Result<Digest, String> {
        let digest = Digest::of_bytes(&bytes);
        let needs_bytes = {
            let mut meta = self.meta.lock();
            match meta.get_mut(&digest.hash) {
                Some(existing) => {
                    existing.ref_count += 1;
                    trace!(
                        "deduplicated put of {} ({} refs)",
                        digest.hash,
                        existing.ref_count
                    );
                    false
                }
                None => {
                    meta.insert(
                        digest.hash,
                        BlobMeta {
                            size: digest.size_bytes,
                            ref_count: 1,
                            tier: tier.unwrap_or_else(|| self.default_tier(digest.size_bytes)),
                        },
                    );
                    true
                }
            }
        };
        if needs_bytes {
            self.substrate.store(digest.hash, bytes).await?;
        } else if let Some(tier) = tier {
            // An explicit tier on a deduplicated put still takes effect.
            if let Some(blob) = self.meta.lock().get_mut(&digest.hash) {
                blob.tier = tier;
            }
        }
        Ok(digest)
    }

    pub async fn load(&self, fingerprint: Fingerprint) -> Result<Option<Bytes>, String> {
        if !self.meta.lock().contains_key(&fingerprint) {
            return Ok(None);
        }
        if fingerprint == EMPTY_DIGEST.hash {
            // The canonical empty blob may never have hit the substrate.
            return Ok(Some(Bytes::new()));
        }
        self.substrate.load(fingerprint).await
    }

    pub async fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.meta.lock().contains_key(&fingerprint)
    }

    pub async fn add_ref(&self, fingerprint: Fingerprint) -> Result<usize, String> {
        let mut meta = self.meta.lock();
        let blob = meta
            .get_mut(&fingerprint)
            .ok_or_else(|| format!("Cannot add a reference to unknown blob {fingerprint}"))?;
        blob.ref_count += 1;
        Ok(blob.ref_count)
    }

    ///
    /// Drop one reference. At zero the blob becomes orphan-eligible but its content is retained
    /// until `reclaim_orphans` runs.
    ///
    pub async fn release_ref(&self, fingerprint: Fingerprint) -> Result<usize, String> {
        let mut meta = self.meta.lock();
        let blob = meta
            .get_mut(&fingerprint)
            .ok_or_else(|| format!("Cannot release a reference to unknown blob {fingerprint}"))?;
        if blob.ref_count == 0 {
            warn!("released blob {fingerprint} past zero references");
        } else {
            blob.ref_count -= 1;
        }
        Ok(blob.ref_count)
    }

    pub async fn ref_count(&self, fingerprint: Fingerprint) -> Option<usize> {
        self.meta.lock().get(&fingerprint).map(|m| m.ref_count)
    }

    pub async fn get_tier(&self, fingerprint: Fingerprint) -> Option<Tier> {
        self.meta.lock().get(&fingerprint).map(|m| m.tier)
    }

    ///
    /// Re-place a blob. Content is verified equal across the transition: a tier move that would
    /// alter bytes is an integrity failure, not a placement change.
    ///
    pub async fn set_tier(&self, fingerprint: Fingerprint, tier: Tier) -> Result<(), String> {
        let before = self
            .load(fingerprint)
            .await?
            .ok_or_else(|| format!("Cannot re-tier unknown blob {fingerprint}"))?;
        if Digest::of_bytes(&before).hash != fingerprint {
            return Err(format!(
                "Refusing to re-tier {fingerprint}: stored content does not match its checksum"
            ));
        }
        let mut meta = self.meta.lock();
        let blob = meta
            .get_mut(&fingerprint)
            .ok_or_else(|| format!("Cannot re-tier unknown blob {fingerprint}"))?;
        trace!("re-tiered {} {} -> {}", fingerprint, blob.tier, tier);
        blob.tier = tier;
        Ok(())
    }

    ///
    /// Recompute the digest of the stored bytes and compare it to the address. Mismatches are
    /// reported, never healed.
    ///
    pub async fn verify(&self, fingerprint: Fingerprint) -> Result<bool, String> {
        let bytes = self
            .load(fingerprint)
            .await?
            .ok_or_else(|| format!("Cannot verify unknown blob {fingerprint}"))?;
        Ok(Digest::of_bytes(&bytes).hash == fingerprint)
    }

    pub async fn list_orphans(&self) -> Vec<Digest> {
        self.meta
            .lock()
            .iter()
            .filter(|(_, m)| m.ref_count == 0)
            .map(|(fingerprint, m)| Digest::new(*fingerprint, m.size))
            .collect()
    }

    ///
    /// Release the storage of every blob with zero references. Never touches a blob that is
    /// still referenced.
    ///
    pub async fn reclaim_orphans(&self) -> Result<ReclaimSummary, String> {
        let orphans = {
            let mut meta = self.meta.lock();
            let orphans: Vec<(Fingerprint, usize)> = meta
                .iter()
                .filter(|(_, m)| m.ref_count == 0)
                .map(|(fingerprint, m)| (*fingerprint, m.size))
                .collect();
            for (fingerprint, _) in &orphans {
                meta.remove(fingerprint);
            }
            orphans
        };
        let mut summary = ReclaimSummary {
            count: 0,
            bytes_freed: 0,
        };
        for (fingerprint, size) in orphans {
            self.substrate.remove(fingerprint).await?;
            summary.count += 1;
            summary.bytes_freed += size;
        }
        if summary.count > 0 {
            trace!(
                "reclaimed {} orphaned blobs ({} bytes)",
                summary.count,
                summary.bytes_freed
            );
        }
        Ok(summary)
    }

    pub async fn stats(&self) -> StoreStats {
        let meta = self.meta.lock();
        let mut hot = TierStats::default();
        let mut warm = TierStats::default();
        let mut cold = TierStats::default();
        let mut logical_size = 0_usize;
        let mut physical_size = 0_usize;
        for blob in meta.values() {
            let tier_stats = match blob.tier {
                Tier::Hot => &mut hot,
                Tier::Warm => &mut warm,
                Tier::Cold => &mut cold,
            };
            tier_stats.count += 1;
            tier_stats.size += blob.size;
            logical_size += blob.size * blob.ref_count;
            physical_size += blob.size;
        }
        let dedup_ratio = if physical_size == 0 {
            1.0
        } else {
            logical_size as f64 / physical_size as f64
        };
        StoreStats {
            hot,
            warm,
            cold,
            logical_size,
            physical_size,
            dedup_ratio,
            bytes_saved: logical_size.saturating_sub(physical_size),
        }
    }
}
