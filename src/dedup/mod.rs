//! Deduplication oracle
//!
//! Decides whether a message group carries files that were already seen,
//! using exact SHA-256 matches plus optional perceptual/fuzzy near-duplicate
//! detection. The in-memory fingerprint set is strictly a cache of the
//! `file_hashes` table: it is rehydrated on startup and every write lands on
//! disk before the cache is updated.

pub mod hashing;

pub use hashing::{
    fuzzy_hash, fuzzy_similarity, hamming_distance, mime_from_name, perceptual_hash, sha256_file,
};

use crate::config::{DedupScope, DeduplicationConfig};
use crate::db::Archive;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A downloaded file awaiting a duplicate decision.
#[derive(Debug, Clone)]
pub struct LocalFile {
    /// Upstream file identity
    pub file_id: String,
    /// Message the file arrived in
    pub message_id: i64,
    /// Forum topic, when the source is a forum
    pub topic_id: Option<i64>,
    /// Scratch path holding the downloaded bytes
    pub path: PathBuf,
    /// MIME type as declared upstream (file-name guess as fallback)
    pub mime: Option<String>,
}

/// Hashes computed for one file during a duplicate check; memoized so
/// recording does not have to download again.
#[derive(Debug, Clone)]
pub struct FileDigest {
    pub file_id: String,
    pub message_id: i64,
    pub topic_id: Option<i64>,
    pub sha256: String,
    pub perceptual: Option<String>,
    pub fuzzy: Option<String>,
}

/// Outcome of a group check. A single duplicate file taints the whole group.
#[derive(Debug, Clone)]
pub struct GroupVerdict {
    pub duplicate: bool,
    pub digests: Vec<FileDigest>,
}

/// Exact and near-duplicate decision engine over the archive's hash tables.
pub struct DedupOracle {
    archive: Arc<Archive>,
    config: DeduplicationConfig,
    seen: Mutex<HashSet<String>>,
}

impl DedupOracle {
    /// Build the oracle and hydrate the fingerprint cache from disk.
    pub fn new(archive: Arc<Archive>, config: DeduplicationConfig) -> Result<Self> {
        let seen = archive.load_sha256_set()?;
        info!("Loaded {} file fingerprint(s) into memory", seen.len());
        Ok(DedupOracle {
            archive,
            config,
            seen: Mutex::new(seen),
        })
    }

    /// Channel scope to apply for a given origin, per configuration.
    pub fn scope_for(&self, origin_channel_id: i64) -> Option<i64> {
        match self.config.scope {
            DedupScope::Global => None,
            DedupScope::Channel => Some(origin_channel_id),
        }
    }

    /// Number of fingerprints currently cached.
    pub fn fingerprint_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Decide whether any file of a group is a duplicate.
    ///
    /// Files that failed to download or are empty are skipped: they are not
    /// duplicates and leave no trace in the fingerprint store. Hashes for
    /// clean files are kept in the verdict for later recording.
    pub fn check_group(&self, files: &[LocalFile], scope: Option<i64>) -> Result<GroupVerdict> {
        let mut digests = Vec::new();

        for file in files {
            let usable = std::fs::metadata(&file.path)
                .map(|m| m.len() > 0)
                .unwrap_or(false);
            if !usable {
                warn!(
                    "file for msg {} missing or empty, skipping duplicate check",
                    file.message_id
                );
                continue;
            }

            let sha256 = sha256_file(&file.path)?;
            debug!("msg {} sha256 {}", file.message_id, &sha256[..10.min(sha256.len())]);

            if self.seen.lock().contains(&sha256) {
                info!("duplicate file (msg {}) via fingerprint cache", file.message_id);
                return Ok(GroupVerdict { duplicate: true, digests });
            }
            if self.archive.sha256_exists(&sha256, scope)? {
                info!("duplicate file (msg {}) via archive", file.message_id);
                self.seen.lock().insert(sha256);
                return Ok(GroupVerdict { duplicate: true, digests });
            }

            let mut digest = FileDigest {
                file_id: file.file_id.clone(),
                message_id: file.message_id,
                topic_id: file.topic_id,
                sha256,
                perceptual: None,
                fuzzy: None,
            };

            if self.config.enable_near_duplicates {
                if self.near_duplicate(file, &mut digest, scope)? {
                    return Ok(GroupVerdict { duplicate: true, digests });
                }
            }

            digests.push(digest);
        }

        Ok(GroupVerdict { duplicate: false, digests })
    }

    /// Perceptual pass for images, fuzzy pass for everything else.
    fn near_duplicate(
        &self,
        file: &LocalFile,
        digest: &mut FileDigest,
        scope: Option<i64>,
    ) -> Result<bool> {
        let mime = file
            .mime
            .clone()
            .or_else(|| mime_from_name(&file.file_id).map(str::to_string));

        if mime.as_deref().is_some_and(|m| m.starts_with("image/")) {
            if let Some(phash) = perceptual_hash(&file.path) {
                let threshold = self.config.perceptual_hash_distance_threshold;
                for (other_id, other_phash) in self.archive.all_perceptual_hashes(scope)? {
                    match hamming_distance(&phash, &other_phash) {
                        Ok(distance) if distance <= threshold => {
                            info!(
                                "near-duplicate image (msg {}): distance {} <= {} vs file {}",
                                file.message_id, distance, threshold, other_id
                            );
                            return Ok(true);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("skipping malformed perceptual hash: {}", e),
                    }
                }
                digest.perceptual = Some(phash);
            }
            // Images still get a fuzzy sketch recorded for later lookups.
            digest.fuzzy = fuzzy_hash(&file.path);
            return Ok(false);
        }

        if let Some(fhash) = fuzzy_hash(&file.path) {
            let threshold = self.config.fuzzy_hash_similarity_threshold;
            for (other_id, other_fhash) in self.archive.all_fuzzy_hashes(scope)? {
                let similarity = fuzzy_similarity(&fhash, &other_fhash);
                if similarity >= threshold {
                    info!(
                        "near-duplicate file (msg {}): similarity {}% >= {}% vs file {}",
                        file.message_id, similarity, threshold, other_id
                    );
                    return Ok(true);
                }
            }
            digest.fuzzy = Some(fhash);
        }
        Ok(false)
    }

    /// Persist the digests of a forwarded group and update the cache.
    /// Disk first, memory second.
    pub fn record(&self, verdict: &GroupVerdict, origin_channel_id: i64) -> Result<()> {
        for digest in &verdict.digests {
            self.archive.add_file_hash(
                &digest.file_id,
                Some(&digest.sha256),
                digest.perceptual.as_deref(),
                digest.fuzzy.as_deref(),
            )?;
            self.archive.add_channel_file_inventory(
                origin_channel_id,
                &digest.file_id,
                digest.message_id,
                digest.topic_id,
            )?;
            self.seen.lock().insert(digest.sha256.clone());
            debug!(
                "recorded file {} (msg {}) for channel {}",
                digest.file_id, digest.message_id, origin_channel_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn oracle(config: DeduplicationConfig) -> (tempfile::TempDir, Arc<Archive>, DedupOracle) {
        let (dir, archive) = db::test_archive();
        let archive = Arc::new(archive);
        let oracle = DedupOracle::new(archive.clone(), config).unwrap();
        (dir, archive, oracle)
    }

    fn local_file(dir: &std::path::Path, name: &str, bytes: &[u8], msg: i64) -> LocalFile {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        LocalFile {
            file_id: name.to_string(),
            message_id: msg,
            topic_id: None,
            path,
            mime: None,
        }
    }

    #[test]
    fn test_exact_duplicate_detected_after_record() {
        let (dir, _archive, oracle) = oracle(DeduplicationConfig::default());

        let first = local_file(dir.path(), "a.bin", b"identical bytes", 1);
        let verdict = oracle.check_group(&[first], None).unwrap();
        assert!(!verdict.duplicate);
        assert_eq!(verdict.digests.len(), 1);
        oracle.record(&verdict, 42).unwrap();

        let second = local_file(dir.path(), "b.bin", b"identical bytes", 2);
        let verdict = oracle.check_group(&[second], None).unwrap();
        assert!(verdict.duplicate);
    }

    #[test]
    fn test_duplicate_requires_recorded_witness() {
        let (dir, _archive, oracle) = oracle(DeduplicationConfig::default());

        let file = local_file(dir.path(), "a.bin", b"fresh content", 1);
        let verdict = oracle.check_group(&[file], None).unwrap();
        assert!(!verdict.duplicate);
        // Never recorded: checking again in a fresh oracle still passes.
        let file = local_file(dir.path(), "b.bin", b"fresh content 2", 2);
        assert!(!oracle.check_group(&[file], None).unwrap().duplicate);
    }

    #[test]
    fn test_channel_scope_limits_matches() {
        let (dir, _archive, oracle) = oracle(DeduplicationConfig {
            scope: DedupScope::Channel,
            ..DeduplicationConfig::default()
        });

        let file = local_file(dir.path(), "a.bin", b"scoped payload", 1);
        let verdict = oracle.check_group(&[file], oracle.scope_for(100)).unwrap();
        oracle.record(&verdict, 100).unwrap();

        // Same bytes in another channel: DB lookup is scoped, but the
        // in-process fingerprint cache still catches the re-download.
        let file = local_file(dir.path(), "b.bin", b"scoped payload", 2);
        assert!(oracle.check_group(&[file], oracle.scope_for(200)).unwrap().duplicate);

        // A fresh process (fresh cache) only matches within the channel.
        let archive = oracle.archive.clone();
        let fresh = DedupOracle {
            archive: archive.clone(),
            config: DeduplicationConfig {
                scope: DedupScope::Channel,
                ..DeduplicationConfig::default()
            },
            seen: Mutex::new(HashSet::new()),
        };
        let file = local_file(dir.path(), "c.bin", b"scoped payload", 3);
        assert!(!fresh.check_group(&[file], fresh.scope_for(200)).unwrap().duplicate);
        let file = local_file(dir.path(), "d.bin", b"scoped payload", 4);
        assert!(fresh.check_group(&[file], fresh.scope_for(100)).unwrap().duplicate);
    }

    #[test]
    fn test_empty_file_not_treated_as_duplicate() {
        let (dir, _archive, oracle) = oracle(DeduplicationConfig::default());

        let empty = local_file(dir.path(), "empty.bin", b"", 1);
        let verdict = oracle.check_group(&[empty], None).unwrap();
        assert!(!verdict.duplicate);
        assert!(verdict.digests.is_empty());
        oracle.record(&verdict, 1).unwrap();
        assert_eq!(oracle.fingerprint_count(), 0);
    }

    #[test]
    fn test_missing_file_passes_through() {
        let (dir, _archive, oracle) = oracle(DeduplicationConfig::default());
        let ghost = LocalFile {
            file_id: "ghost".into(),
            message_id: 9,
            topic_id: None,
            path: dir.path().join("never-downloaded"),
            mime: None,
        };
        let verdict = oracle.check_group(&[ghost], None).unwrap();
        assert!(!verdict.duplicate);
        assert!(verdict.digests.is_empty());
    }

    #[test]
    fn test_duplicate_taints_whole_group() {
        let (dir, _archive, oracle) = oracle(DeduplicationConfig::default());

        let seed = local_file(dir.path(), "seed.bin", b"known bytes", 1);
        let verdict = oracle.check_group(&[seed], None).unwrap();
        oracle.record(&verdict, 1).unwrap();

        let fresh = local_file(dir.path(), "fresh.bin", b"never seen bytes", 2);
        let dup = local_file(dir.path(), "dup.bin", b"known bytes", 3);
        let verdict = oracle.check_group(&[fresh, dup], None).unwrap();
        assert!(verdict.duplicate);
    }

    #[test]
    fn test_near_duplicate_image_under_threshold() {
        use image::{ImageBuffer, Luma};
        let (dir, _archive, oracle) = oracle(DeduplicationConfig {
            enable_near_duplicates: true,
            perceptual_hash_distance_threshold: 5,
            ..DeduplicationConfig::default()
        });

        let save_png = |name: &str, tweak: bool| {
            let img = ImageBuffer::from_fn(128, 128, |x, y| {
                let mut v = ((x * 2 + y) % 256) as u8;
                if tweak && x == 10 && y == 10 {
                    v = v.wrapping_add(7);
                }
                Luma([v])
            });
            let path = dir.path().join(name);
            img.save(&path).unwrap();
            path
        };

        let original = LocalFile {
            file_id: "one.png".into(),
            message_id: 1,
            topic_id: None,
            path: save_png("one.png", false),
            mime: Some("image/png".into()),
        };
        let verdict = oracle.check_group(&[original], None).unwrap();
        assert!(!verdict.duplicate);
        assert!(verdict.digests[0].perceptual.is_some());
        oracle.record(&verdict, 7).unwrap();

        let tweaked = LocalFile {
            file_id: "two.png".into(),
            message_id: 2,
            topic_id: None,
            path: save_png("two.png", true),
            mime: Some("image/png".into()),
        };
        // Different bytes (different sha256) but visually the same image.
        let verdict = oracle.check_group(&[tweaked], None).unwrap();
        assert!(verdict.duplicate);
    }

    #[test]
    fn test_near_duplicates_disabled_only_runs_exact_pass() {
        let (dir, _archive, oracle) = oracle(DeduplicationConfig {
            enable_near_duplicates: false,
            ..DeduplicationConfig::default()
        });

        let file = local_file(dir.path(), "doc.txt", b"some document body", 1);
        let verdict = oracle.check_group(&[file], None).unwrap();
        assert!(verdict.digests[0].perceptual.is_none());
        assert!(verdict.digests[0].fuzzy.is_none());
    }

    #[test]
    fn test_record_updates_inventory_and_cache() {
        let (dir, archive, oracle) = oracle(DeduplicationConfig::default());

        let file = local_file(dir.path(), "inv.bin", b"inventory bytes", 5);
        let verdict = oracle.check_group(&[file], None).unwrap();
        oracle.record(&verdict, 314).unwrap();

        assert_eq!(archive.inventory_count(314).unwrap(), 1);
        assert_eq!(oracle.fingerprint_count(), 1);
        assert!(archive.file_hash("inv.bin").unwrap().is_some());
    }
}
