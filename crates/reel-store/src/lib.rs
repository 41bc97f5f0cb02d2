// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// JSONL event-log readers and writers.
pub mod events;
/// Per-run structured log files.
pub mod run_log;
/// Blob-tree verification.
pub mod verify;

use reel_core::{ArtifactEvent, BlobRef, BlobSource, InputEvent, Manifest, PromptOverride};
use reel_error::{ErrorCode, ForgeError};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub use events::EventStream;
pub use run_log::{RunLogRecord, RunLogger};
pub use verify::BlobVerification;

/// Errors from artifact-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A blob, manifest, or plan was not found.
    #[error("{what} not found: {id}")]
    NotFound {
        /// What kind of object was requested.
        what: &'static str,
        /// Identifier of the missing object.
        id: String,
    },

    /// The persisted manifest no longer matches the expected hash.
    #[error("manifest conflict: expected {expected:?}, found {found:?}")]
    Conflict {
        /// Hash the caller planned against.
        expected: Option<String>,
        /// Hash currently persisted.
        found: Option<String>,
    },

    /// An I/O operation failed. Reported as transient to the caller.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A persisted record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A prompt-override file could not be parsed.
    #[error("invalid prompt override {path}: {reason}")]
    InvalidPrompt {
        /// Path of the offending file.
        path: String,
        /// Parse error detail.
        reason: String,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<StoreError> for ForgeError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::NotFound { .. } => ErrorCode::StorageNotFound,
            StoreError::Conflict { .. } => ErrorCode::StorageConflict,
            StoreError::Io { .. } => ErrorCode::StorageIo,
            StoreError::Json(_) | StoreError::InvalidPrompt { .. } => ErrorCode::StorageIo,
        };
        ForgeError::new(code, err.to_string())
    }
}

/// File extension for a MIME type, used in blob paths.
#[must_use]
pub fn ext_for_mime(mime: &str) -> &'static str {
    match mime {
        "application/json" => "json",
        "text/plain" => "txt",
        "text/markdown" => "md",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/mpeg" => "mp3",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        _ => "bin",
    }
}

/// The file-system artifact store for one movie.
///
/// Owns all persisted state; planner and executor hold read-only snapshots.
#[derive(Debug)]
pub struct FsArtifactStore {
    movie_root: PathBuf,
    input_log: Mutex<()>,
    artifact_log: Mutex<()>,
    manifest_lock: Mutex<()>,
}

const MANIFEST_FILE: &str = "manifests/current.json";
const MANIFEST_HISTORY_DIR: &str = "manifests/history";
const INPUT_LOG_FILE: &str = "events/inputs.jsonl";
const ARTIFACT_LOG_FILE: &str = "events/artefacts.jsonl";

impl FsArtifactStore {
    /// Open (creating if necessary) the store for a movie under
    /// `<root>/<base_path>/<movie_id>/`.
    ///
    /// Abandoned temp files from interrupted writes are discarded here.
    ///
    /// # Errors
    ///
    /// Fails when the layout cannot be created.
    pub fn open(
        root: impl AsRef<Path>,
        base_path: &str,
        movie_id: &str,
    ) -> Result<Self, StoreError> {
        let movie_root = root.as_ref().join(base_path).join(movie_id);
        for dir in [
            "blobs",
            "manifests",
            MANIFEST_HISTORY_DIR,
            "events",
            "runs",
            "logs",
            "prompts",
        ] {
            let path = movie_root.join(dir);
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        let store = Self {
            movie_root,
            input_log: Mutex::new(()),
            artifact_log: Mutex::new(()),
            manifest_lock: Mutex::new(()),
        };
        store.discard_abandoned_temps();
        Ok(store)
    }

    /// Root directory of this movie's state.
    #[must_use]
    pub fn movie_root(&self) -> &Path {
        &self.movie_root
    }

    /// Path of the live manifest.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.movie_root.join(MANIFEST_FILE)
    }

    fn discard_abandoned_temps(&self) {
        for dir in [self.movie_root.join("manifests"), self.movie_root.join("blobs")] {
            for entry in walkdir::WalkDir::new(&dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
            {
                let name = entry.file_name().to_string_lossy();
                if name.contains(".tmp") {
                    warn!(target: "reel.store", path = %entry.path().display(), "discarding abandoned temp file");
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    // -- blobs ----------------------------------------------------------

    fn blob_path_for(&self, hash: &str, mime: &str) -> PathBuf {
        let shard = &hash[..2.min(hash.len())];
        self.movie_root
            .join("blobs")
            .join(shard)
            .join(format!("{hash}.{}", ext_for_mime(mime)))
    }

    /// Store bytes under their content hash. Idempotent: writing an existing
    /// hash is a no-op.
    ///
    /// # Errors
    ///
    /// Fails only on I/O problems.
    pub fn put_blob(&self, bytes: &[u8], mime_type: &str) -> Result<BlobRef, StoreError> {
        let hash = reel_core::sha256_hex(bytes);
        let path = self.blob_path_for(&hash, mime_type);
        let blob = BlobRef {
            hash: hash.clone(),
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
        };
        if path.exists() {
            debug!(target: "reel.store", %hash, "blob already present");
            return Ok(blob);
        }
        let dir = path.parent().expect("blob path has a parent");
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        // Concurrent writers of the same hash race harmlessly: both temps
        // hold identical bytes and rename is atomic.
        let tmp = dir.join(format!(".{hash}.{}.tmp", uuid::Uuid::new_v4()));
        {
            let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            file.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        debug!(target: "reel.store", %hash, size = bytes.len(), "blob written");
        Ok(blob)
    }

    /// Fetch the bytes behind a blob reference.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the blob is absent.
    pub fn get_blob(&self, blob: &BlobRef) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path_for(&blob.hash, &blob.mime_type);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                what: "blob",
                id: blob.hash.clone(),
            }),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    // -- event logs -----------------------------------------------------

    fn append_line(&self, rel: &str, line: &str) -> Result<(), StoreError> {
        let path = self.movie_root.join(rel);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .map_err(|e| StoreError::io(&path, e))
    }

    /// Append an input event to `events/inputs.jsonl`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or serialization problems.
    pub fn append_input_event(&self, event: &InputEvent) -> Result<(), StoreError> {
        let line = serde_json::to_string(event)?;
        let _guard = self.input_log.lock().expect("input log lock poisoned");
        self.append_line(INPUT_LOG_FILE, &line)
    }

    /// Append an artifact event to `events/artefacts.jsonl`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or serialization problems.
    pub fn append_artifact_event(&self, event: &ArtifactEvent) -> Result<(), StoreError> {
        let line = serde_json::to_string(event)?;
        let _guard = self.artifact_log.lock().expect("artifact log lock poisoned");
        self.append_line(ARTIFACT_LOG_FILE, &line)
    }

    /// Iterate input events, oldest first. Restartable: each call opens a
    /// fresh reader.
    ///
    /// # Errors
    ///
    /// Fails when the log exists but cannot be opened.
    pub fn stream_inputs(&self) -> Result<EventStream<InputEvent>, StoreError> {
        EventStream::open(self.movie_root.join(INPUT_LOG_FILE))
    }

    /// Iterate artifact events, oldest first. Restartable.
    ///
    /// # Errors
    ///
    /// Fails when the log exists but cannot be opened.
    pub fn stream_artifacts(&self) -> Result<EventStream<ArtifactEvent>, StoreError> {
        EventStream::open(self.movie_root.join(ARTIFACT_LOG_FILE))
    }

    // -- manifest -------------------------------------------------------

    /// Load the live manifest, or `None` when no run has completed yet.
    ///
    /// # Errors
    ///
    /// Fails on I/O or parse problems.
    pub fn load_manifest(&self) -> Result<Option<Manifest>, StoreError> {
        let path = self.manifest_path();
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Atomically replace the live manifest.
    ///
    /// Refuses with [`StoreError::Conflict`] unless `previous_hash` matches
    /// the hash of the currently persisted manifest (both `None` for a first
    /// save). The previous manifest is rotated into `manifests/history/`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] on a hash mismatch; I/O errors otherwise.
    pub fn save_manifest(
        &self,
        next: &Manifest,
        previous_hash: Option<&str>,
    ) -> Result<String, StoreError> {
        let _guard = self.manifest_lock.lock().expect("manifest lock poisoned");

        let current = self.load_manifest()?;
        let current_hash = current.as_ref().and_then(|m| m.manifest_hash.clone());
        if current_hash.as_deref() != previous_hash {
            return Err(StoreError::Conflict {
                expected: previous_hash.map(String::from),
                found: current_hash,
            });
        }

        let mut sealed = next.clone();
        sealed.previous_hash = previous_hash.map(String::from);
        sealed.manifest_hash = None;
        let sealed = sealed
            .with_hash()
            .map_err(|e| StoreError::Json(match e {
                reel_core::ContractError::Json(inner) => inner,
            }))?;
        let new_hash = sealed
            .manifest_hash
            .clone()
            .expect("with_hash always sets the hash");

        let path = self.manifest_path();
        let tmp = path.with_extension("json.tmp");
        {
            let text = serde_json::to_string_pretty(&sealed)?;
            let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            file.write_all(text.as_bytes())
                .map_err(|e| StoreError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }

        if current.is_some() {
            let history_dir = self.movie_root.join(MANIFEST_HISTORY_DIR);
            let n = fs::read_dir(&history_dir)
                .map_err(|e| StoreError::io(&history_dir, e))?
                .count();
            let slot = history_dir.join(format!("{n}.json"));
            fs::copy(&path, &slot).map_err(|e| StoreError::io(&slot, e))?;
        }

        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        debug!(target: "reel.store", hash = %new_hash, "manifest saved");
        Ok(new_hash)
    }

    // -- plans ----------------------------------------------------------

    /// Persist a plan under `runs/<label>/plan.json`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or serialization problems.
    pub fn save_plan(&self, plan: &reel_core::Plan, label: &str) -> Result<PathBuf, StoreError> {
        let dir = self.movie_root.join("runs").join(label);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join("plan.json");
        let text = serde_json::to_string_pretty(plan)?;
        fs::write(&path, text).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }

    /// Load a persisted plan by run label.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the run label has no plan.
    pub fn load_plan(&self, label: &str) -> Result<reel_core::Plan, StoreError> {
        let path = self.movie_root.join("runs").join(label).join("plan.json");
        match fs::read_to_string(&path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                what: "plan",
                id: label.to_string(),
            }),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    // -- run logs -------------------------------------------------------

    /// Create the structured log file for a run (`logs/<label>.jsonl`).
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be created.
    pub fn run_logger(&self, label: &str) -> Result<RunLogger, StoreError> {
        RunLogger::create(self.movie_root.join("logs").join(format!("{label}.jsonl")))
    }

    // -- prompt overrides -----------------------------------------------

    /// Load the prompt override for one producer, if present.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be parsed.
    pub fn prompt_override(&self, alias: &str) -> Result<Option<PromptOverride>, StoreError> {
        let path = self.movie_root.join("prompts").join(format!("{alias}.toml"));
        match fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text)
                .map(Some)
                .map_err(|e| StoreError::InvalidPrompt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Load every prompt override in `prompts/`, keyed by producer alias.
    ///
    /// # Errors
    ///
    /// Fails when a file exists but cannot be parsed.
    pub fn prompt_overrides(&self) -> Result<BTreeMap<String, PromptOverride>, StoreError> {
        let dir = self.movie_root.join("prompts");
        let mut out = BTreeMap::new();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let Some(alias) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(o) = self.prompt_override(alias)? {
                out.insert(alias.to_string(), o);
            }
        }
        Ok(out)
    }

    /// Verify every blob on disk: recompute digests, compare recorded sizes,
    /// and report hashes no longer referenced by the manifest.
    ///
    /// # Errors
    ///
    /// Fails when the blob tree cannot be walked.
    pub fn verify_blobs(
        &self,
        manifest: Option<&Manifest>,
    ) -> Result<BlobVerification, StoreError> {
        verify::verify_blob_tree(&self.movie_root.join("blobs"), manifest)
    }
}

impl BlobSource for FsArtifactStore {
    fn fetch(&self, blob: &BlobRef) -> Result<Vec<u8>, ForgeError> {
        self.get_blob(blob).map_err(ForgeError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use reel_core::ArtifactStatus;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsArtifactStore) {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::open(dir.path(), "movies", "m-1").unwrap();
        (dir, store)
    }

    fn artifact_event(id: &str) -> ArtifactEvent {
        ArtifactEvent {
            artifact_id: id.parse().unwrap(),
            revision: uuid::Uuid::nil(),
            inputs_hash: "h".into(),
            status: ArtifactStatus::Succeeded,
            produced_by: "Producer:Doc".into(),
            created_at: chrono::Utc::now(),
            blob: None,
            reason: None,
            diagnostics: None,
        }
    }

    #[test]
    fn put_blob_is_idempotent() {
        let (_dir, store) = store();
        let first = store.put_blob(b"same bytes", "text/plain").unwrap();
        let second = store.put_blob(b"same bytes", "text/plain").unwrap();
        assert_eq!(first, second);

        let path = store.blob_path_for(&first.hash, &first.mime_type);
        assert!(path.exists());
        // Exactly one file for the hash.
        let shard = path.parent().unwrap();
        assert_eq!(fs::read_dir(shard).unwrap().count(), 1);
    }

    #[test]
    fn get_blob_round_trips_and_reports_missing() {
        let (_dir, store) = store();
        let blob = store.put_blob(b"payload", "application/json").unwrap();
        assert_eq!(store.get_blob(&blob).unwrap(), b"payload");

        let missing = BlobRef {
            hash: "00".repeat(32),
            size: 0,
            mime_type: "text/plain".into(),
        };
        assert!(matches!(
            store.get_blob(&missing),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn blob_layout_uses_hash_prefix_shards() {
        let (_dir, store) = store();
        let blob = store.put_blob(b"x", "image/png").unwrap();
        let path = store.blob_path_for(&blob.hash, "image/png");
        let shard = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert_eq!(shard, &blob.hash[..2]);
        assert!(path.to_string_lossy().ends_with(".png"));
    }

    #[test]
    fn event_logs_append_and_stream_in_order() {
        let (_dir, store) = store();
        store.append_artifact_event(&artifact_event("Artifact:Doc.A")).unwrap();
        store.append_artifact_event(&artifact_event("Artifact:Doc.B")).unwrap();

        let ids: Vec<String> = store
            .stream_artifacts()
            .unwrap()
            .map(|r| r.unwrap().artifact_id.to_string())
            .collect();
        assert_eq!(ids, vec!["Artifact:Doc.A", "Artifact:Doc.B"]);

        // Restartable: a second stream sees the same records.
        let again: Vec<String> = store
            .stream_artifacts()
            .unwrap()
            .map(|r| r.unwrap().artifact_id.to_string())
            .collect();
        assert_eq!(again, ids);
    }

    #[test]
    fn empty_stream_when_no_events() {
        let (_dir, store) = store();
        assert_eq!(store.stream_inputs().unwrap().count(), 0);
    }

    #[test]
    fn manifest_save_requires_matching_previous_hash() {
        let (_dir, store) = store();
        assert!(store.load_manifest().unwrap().is_none());

        let first_hash = store.save_manifest(&Manifest::default(), None).unwrap();
        let loaded = store.load_manifest().unwrap().unwrap();
        assert_eq!(loaded.manifest_hash.as_deref(), Some(first_hash.as_str()));

        // Stale save (None again) conflicts.
        let err = store.save_manifest(&Manifest::default(), None).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // Chained save succeeds and rotates history.
        let second_hash = store
            .save_manifest(&Manifest::default(), Some(&first_hash))
            .unwrap();
        assert_ne!(first_hash, second_hash);
        let history = store.movie_root().join("manifests/history");
        assert_eq!(fs::read_dir(history).unwrap().count(), 1);

        let loaded = store.load_manifest().unwrap().unwrap();
        assert_eq!(loaded.previous_hash.as_deref(), Some(first_hash.as_str()));
    }

    #[test]
    fn abandoned_temps_are_discarded_on_open() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::open(dir.path(), "movies", "m-1").unwrap();
        let tmp = store.manifest_path().with_extension("json.tmp");
        fs::write(&tmp, "{").unwrap();
        drop(store);

        let _store = FsArtifactStore::open(dir.path(), "movies", "m-1").unwrap();
        assert!(!tmp.exists());
    }

    #[test]
    fn plans_round_trip() {
        let (_dir, store) = store();
        let plan = reel_core::Plan {
            version: reel_core::PLAN_FORMAT_VERSION.into(),
            target_revision: uuid::Uuid::nil(),
            layers: vec![],
        };
        store.save_plan(&plan, "20260801T000000").unwrap();
        let back = store.load_plan("20260801T000000").unwrap();
        assert_eq!(back, plan);
        assert!(matches!(
            store.load_plan("nope"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn prompt_overrides_parse_from_toml() {
        let (_dir, store) = store();
        fs::write(
            store.movie_root().join("prompts/DocProducer.toml"),
            "system = \"Write tersely.\"\n",
        )
        .unwrap();
        let o = store.prompt_override("DocProducer").unwrap().unwrap();
        assert_eq!(o.system.as_deref(), Some("Write tersely."));
        assert!(store.prompt_override("Other").unwrap().is_none());

        let all = store.prompt_overrides().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("DocProducer"));
    }

    proptest! {
        #[test]
        fn put_blob_agrees_with_recorded_size_and_hash(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let (_dir, store) = store();
            let blob = store.put_blob(&bytes, "application/octet-stream").unwrap();
            let read = store.get_blob(&blob).unwrap();
            prop_assert_eq!(blob.size as usize, read.len());
            prop_assert_eq!(blob.hash, reel_core::sha256_hex(&read));
        }
    }
}
