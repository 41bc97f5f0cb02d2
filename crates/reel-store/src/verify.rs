// SPDX-License-Identifier: MIT OR Apache-2.0
//! Blob-tree verification: recompute digests, compare sizes, find orphans.

use crate::StoreError;
use reel_core::Manifest;
use std::collections::BTreeSet;
use std::path::Path;

/// Result of verifying the blob tree.
#[derive(Debug, Clone, Default)]
pub struct BlobVerification {
    /// Number of blobs whose digest matches their path.
    pub valid_count: usize,
    /// Hashes whose bytes no longer match their recorded digest.
    pub corrupt: Vec<String>,
    /// Hashes on disk that the manifest no longer references. Never
    /// reclaimed automatically.
    pub unreferenced: Vec<String>,
}

impl BlobVerification {
    /// True when no blob is corrupt.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.corrupt.is_empty()
    }
}

pub(crate) fn verify_blob_tree(
    blobs_dir: &Path,
    manifest: Option<&Manifest>,
) -> Result<BlobVerification, StoreError> {
    let referenced: BTreeSet<String> = manifest
        .map(|m| {
            m.artifacts
                .values()
                .filter_map(|ev| ev.blob.as_ref())
                .map(|b| b.hash.clone())
                .collect()
        })
        .unwrap_or_default();

    let mut report = BlobVerification::default();
    for entry in walkdir::WalkDir::new(blobs_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let bytes = std::fs::read(path).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let digest = reel_core::sha256_hex(&bytes);
        if digest == stem {
            report.valid_count += 1;
        } else {
            report.corrupt.push(stem.to_string());
        }
        if manifest.is_some() && !referenced.contains(stem) {
            report.unreferenced.push(stem.to_string());
        }
    }
    report.corrupt.sort();
    report.unreferenced.sort();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use crate::FsArtifactStore;
    use tempfile::TempDir;

    #[test]
    fn verify_reports_valid_and_corrupt_blobs() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::open(dir.path(), "movies", "m-1").unwrap();
        let blob = store.put_blob(b"good bytes", "text/plain").unwrap();

        let report = store.verify_blobs(None).unwrap();
        assert_eq!(report.valid_count, 1);
        assert!(report.is_valid());

        // Corrupt the blob in place.
        let path = store
            .movie_root()
            .join("blobs")
            .join(&blob.hash[..2])
            .join(format!("{}.txt", blob.hash));
        std::fs::write(&path, b"tampered").unwrap();

        let report = store.verify_blobs(None).unwrap();
        assert_eq!(report.valid_count, 0);
        assert_eq!(report.corrupt, vec![blob.hash.clone()]);
    }

    #[test]
    fn verify_flags_unreferenced_blobs_against_a_manifest() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::open(dir.path(), "movies", "m-1").unwrap();
        let blob = store.put_blob(b"orphan", "text/plain").unwrap();

        let manifest = reel_core::Manifest::default();
        let report = store.verify_blobs(Some(&manifest)).unwrap();
        assert_eq!(report.unreferenced, vec![blob.hash]);
    }
}
