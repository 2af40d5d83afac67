//! Resumable parallel downloader (spec §4.D). Grounded on the teacher's
//! `commands::hf_download_file`/`hf_download_repo` (reqwest client
//! construction, `bytes_stream()` chunk loop, progress throttled by
//! wall-clock interval) generalized from "one whole file per Tauri
//! command" to "N concurrent shard fetches drained from a shared queue",
//! coordinated with a `tokio::task::JoinSet` rather than one `spawn` per
//! file.

pub mod retry;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_CONCURRENCY;
use crate::error::DownloadError;
use crate::manifest::{DownloadState, DownloadStatus, Manifest, Shard};
use crate::store::{self, ModelHandle};

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum DownloadEvent {
    ShardProgress {
        shard: u32,
        bytes_downloaded: u64,
        bytes_total: u64,
        speed_bytes_per_sec: f64,
    },
    ShardComplete {
        shard: u32,
    },
    Paused,
    Complete {
        model_id: String,
        total_size: u64,
    },
}

/// Tracks at most one active job per `model_id` (spec §5: "two concurrent
/// downloads of the same model_id are a bug").
#[derive(Debug, Default, Clone)]
pub struct JobRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, model_id: &str) -> Result<JobGuard<'_>, DownloadError> {
        let mut active = self.active.lock().unwrap();
        if !active.insert(model_id.to_string()) {
            return Err(DownloadError::AlreadyInProgress(model_id.to_string()));
        }
        Ok(JobGuard {
            registry: self,
            model_id: model_id.to_string(),
        })
    }
}

struct JobGuard<'a> {
    registry: &'a JobRegistry,
    model_id: String,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.registry.active.lock().unwrap().remove(&self.model_id);
    }
}

fn state_path(root: &Path, model_id: &str) -> PathBuf {
    root.join(".download_state").join(format!("{model_id}.json"))
}

fn load_state(root: &Path, model_id: &str) -> Option<DownloadState> {
    let bytes = std::fs::read(state_path(root, model_id)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn save_state(root: &Path, state: &DownloadState) -> Result<(), DownloadError> {
    let path = state_path(root, &state.model_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn delete_state(root: &Path, model_id: &str) {
    let _ = std::fs::remove_file(state_path(root, model_id));
}

async fn sleep_or_cancelled(delay: std::time::Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = cancel.cancelled() => true,
    }
}

/// Single GET, no retry — the chunk loop mirrors the teacher's
/// `hf_download_file` (`bytes_stream()` + accumulate + classify transport
/// errors as retryable).
async fn fetch_bytes_once(client: &Client, url: &str) -> Result<Vec<u8>, DownloadError> {
    let resp = client.get(url).send().await.map_err(|e| DownloadError::Network {
        retryable: !e.is_status(),
        message: e.to_string(),
    })?;

    if !resp.status().is_success() {
        return Err(DownloadError::Http {
            status: resp.status().as_u16(),
        });
    }

    let mut stream = resp.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DownloadError::Network {
            retryable: true,
            message: e.to_string(),
        })?;
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

async fn fetch_bytes_with_retry(
    client: &Client,
    url: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, DownloadError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        match fetch_bytes_once(client, url).await {
            Ok(buf) => return Ok(buf),
            Err(e) => match retry::decide(attempt, &e) {
                Some(delay) => {
                    if sleep_or_cancelled(delay, cancel).await {
                        return Err(DownloadError::Cancelled);
                    }
                }
                None => return Err(e),
            },
        }
    }
}

pub async fn fetch_manifest(
    client: &Client,
    base_url: &str,
    cancel: &CancellationToken,
) -> Result<Manifest, DownloadError> {
    let url = format!("{base_url}/manifest.json");
    let bytes = fetch_bytes_with_retry(client, &url, cancel).await?;
    let manifest: Manifest = serde_json::from_slice(&bytes)?;
    if let Err(reasons) = manifest.validate() {
        return Err(DownloadError::ManifestInvalid { reasons });
    }
    Ok(manifest)
}

/// Drop stale completed-shard entries back into the pending queue: verify
/// each previously completed shard still exists and still hashes
/// correctly (spec §4.D step 4, I4/I8).
fn reconcile_completed(handle: &ModelHandle, manifest: &Manifest, completed: &mut HashSet<u32>) {
    let stale: Vec<u32> = completed
        .iter()
        .copied()
        .filter(|&index| match manifest.shards.get(index as usize) {
            Some(shard) => {
                store::load_shard(handle, index, manifest.hash_algorithm, Some(&shard.hash_hex)).is_err()
            }
            // The remote manifest shrank since this index was marked complete; treat it as stale.
            None => true,
        })
        .collect();

    for index in stale {
        completed.remove(&index);
        let _ = store::delete_shard(handle, index);
    }
}

/// Fetch one shard and write it through the store, retrying the whole
/// fetch+verify cycle on transient failure (including `HashMismatch`, per
/// spec §4.D step 5 — "rely on retry at the fetch layer for transient
/// corruption"). Returns the shard index either way so the caller can
/// bucket it into `completed` or `failed` without re-deriving it from a
/// moved closure.
async fn fetch_one_shard(
    client: Client,
    base_url: String,
    handle: ModelHandle,
    hash_algorithm: crate::config::HashAlgorithm,
    shard: Shard,
    progress_tx: Option<mpsc::Sender<DownloadEvent>>,
    cancel: CancellationToken,
) -> Result<u32, u32> {
    let url = format!("{base_url}/{}", shard.filename);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(shard.index);
        }

        let started = Instant::now();
        let outcome = async {
            let bytes = fetch_bytes_once(&client, &url).await?;
            store::write_shard(&handle, shard.index, &bytes, hash_algorithm, Some(&shard.hash_hex))
                .map_err(DownloadError::Store)?;
            Ok::<u64, DownloadError>(bytes.len() as u64)
        }
        .await;

        match outcome {
            Ok(len) => {
                if let Some(tx) = &progress_tx {
                    let elapsed = started.elapsed().as_secs_f64().max(0.001);
                    let _ = tx
                        .send(DownloadEvent::ShardProgress {
                            shard: shard.index,
                            bytes_downloaded: len,
                            bytes_total: shard.size,
                            speed_bytes_per_sec: len as f64 / elapsed,
                        })
                        .await;
                    let _ = tx.send(DownloadEvent::ShardComplete { shard: shard.index }).await;
                }
                return Ok(shard.index);
            }
            Err(e) => match retry::decide(attempt, &e) {
                Some(delay) => {
                    if sleep_or_cancelled(delay, &cancel).await {
                        return Err(shard.index);
                    }
                }
                None => return Err(shard.index),
            },
        }
    }
}

pub struct DownloadOptions {
    pub root: PathBuf,
    pub concurrency: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Run the full download algorithm (spec §4.D steps 1-7) for one model.
pub async fn download(
    client: &Client,
    registry: &JobRegistry,
    base_url: &str,
    options: DownloadOptions,
    progress_tx: Option<mpsc::Sender<DownloadEvent>>,
    cancel: CancellationToken,
) -> Result<Manifest, DownloadError> {
    let manifest = fetch_manifest(client, base_url, &cancel).await?;
    let _guard = registry.acquire(&manifest.model_id)?;

    store::init_root(Some(options.root.clone())).map_err(DownloadError::Store)?;
    let preflight = crate::preflight::run(&options.root, manifest.total_size, None);
    if !preflight.storage.sufficient {
        return Err(DownloadError::Store(crate::error::StoreError::QuotaExceeded {
            required: manifest.total_size,
            available: preflight.storage.available_bytes,
        }));
    }

    let handle = store::open_model(&options.root, &manifest.model_id).map_err(DownloadError::Store)?;

    let mut completed: HashSet<u32> = load_state(&options.root, &manifest.model_id)
        .map(|s| s.completed_shards.into_iter().collect())
        .unwrap_or_default();
    reconcile_completed(&handle, &manifest, &mut completed);

    let mut queue: Vec<u32> = (0..manifest.shards.len() as u32)
        .filter(|i| !completed.contains(i))
        .collect();
    let mut failed: Vec<u32> = Vec::new();
    let concurrency = options.concurrency.max(1);
    let mut in_flight = JoinSet::new();

    'outer: loop {
        if !cancel.is_cancelled() {
            while in_flight.len() < concurrency && !queue.is_empty() {
                let index = queue.remove(0);
                let shard = manifest.shards[index as usize].clone();
                in_flight.spawn(fetch_one_shard(
                    client.clone(),
                    base_url.to_string(),
                    handle.clone(),
                    manifest.hash_algorithm,
                    shard,
                    progress_tx.clone(),
                    cancel.clone(),
                ));
            }
        }

        if in_flight.is_empty() {
            if cancel.is_cancelled() {
                let state = DownloadState {
                    model_id: manifest.model_id.clone(),
                    base_url: base_url.to_string(),
                    manifest: manifest.clone(),
                    completed_shards: completed.into_iter().collect(),
                    started_at: chrono::Utc::now(),
                    status: DownloadStatus::Paused,
                    error: None,
                };
                let _ = save_state(&options.root, &state);
                if let Some(tx) = &progress_tx {
                    let _ = tx.send(DownloadEvent::Paused).await;
                }
                return Err(DownloadError::Cancelled);
            }
            break 'outer;
        }

        match in_flight.join_next().await {
            Some(Ok(Ok(index))) => {
                completed.insert(index);
                let state = DownloadState {
                    model_id: manifest.model_id.clone(),
                    base_url: base_url.to_string(),
                    manifest: manifest.clone(),
                    completed_shards: completed.iter().copied().collect(),
                    started_at: chrono::Utc::now(),
                    status: DownloadStatus::Downloading,
                    error: None,
                };
                save_state(&options.root, &state)?;
            }
            Some(Ok(Err(index))) => failed.push(index),
            Some(Err(_join_error)) => {}
            None => break 'outer,
        }
    }

    if !failed.is_empty() || completed.len() != manifest.shards.len() {
        let missing: Vec<u32> = (0..manifest.shards.len() as u32)
            .filter(|i| !completed.contains(i))
            .collect();
        let state = DownloadState {
            model_id: manifest.model_id.clone(),
            base_url: base_url.to_string(),
            manifest: manifest.clone(),
            completed_shards: completed.into_iter().collect(),
            started_at: chrono::Utc::now(),
            status: DownloadStatus::Error,
            error: Some(format!("shards failed: {missing:?}")),
        };
        let _ = save_state(&options.root, &state);
        return Err(DownloadError::ShardFailed(missing));
    }

    let json = manifest
        .to_pretty_json()
        .map_err(|e| DownloadError::Store(crate::error::StoreError::Json(e)))?;
    store::save_manifest(&handle, &json).map_err(DownloadError::Store)?;

    if let Some(tokenizer) = &manifest.tokenizer {
        if let Some(file) = &tokenizer.file {
            let url = format!("{base_url}/{file}");
            if let Ok(bytes) = fetch_bytes_with_retry(client, &url, &cancel).await {
                if let Ok(text) = String::from_utf8(bytes) {
                    let _ = store::save_tokenizer(&handle, &text);
                }
            }
        }
    }

    delete_state(&options.root, &manifest.model_id);

    if let Some(tx) = &progress_tx {
        let _ = tx
            .send(DownloadEvent::Complete {
                model_id: manifest.model_id.clone(),
                total_size: manifest.total_size,
            })
            .await;
    }

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_duplicate_active_job() {
        let registry = JobRegistry::new();
        let _guard = registry.acquire("llama").unwrap();
        let err = registry.acquire("llama");
        assert!(matches!(err, Err(DownloadError::AlreadyInProgress(_))));
    }

    #[test]
    fn registry_releases_on_guard_drop() {
        let registry = JobRegistry::new();
        {
            let _guard = registry.acquire("llama").unwrap();
        }
        assert!(registry.acquire("llama").is_ok());
    }

    #[tokio::test]
    async fn fetch_manifest_rejects_arithmetic_that_fails_validation() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let bad_manifest = serde_json::json!({
            "version": 1,
            "modelId": "m",
            "modelType": "llama",
            "quantization": "F32",
            "hashAlgorithm": "blake3",
            "architecture": {},
            "shards": [{"index": 0, "filename": "shard_00000.bin", "size": 16, "hash": "a".repeat(64), "offset": 5}],
            "tensors": {},
            "totalSize": 16,
            "metadata": {}
        });

        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&bad_manifest))
            .mount(&server)
            .await;

        let client = Client::new();
        let result = fetch_manifest(&client, &server.uri(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(DownloadError::ManifestInvalid { .. })));
    }

    #[tokio::test]
    async fn fetch_manifest_does_not_retry_404() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new();
        let result = fetch_manifest(&client, &server.uri(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(DownloadError::Http { status: 404 })));
    }

    use std::collections::HashMap;

    use crate::manifest::Architecture;

    fn sample_shards(contents: &[&[u8]]) -> (Vec<Shard>, u64) {
        let mut shards = Vec::new();
        let mut offset = 0u64;
        for (i, content) in contents.iter().enumerate() {
            let hash_hex = crate::store::hash::digest(crate::config::HashAlgorithm::Blake3, content);
            shards.push(Shard {
                index: i as u32,
                filename: Shard::filename_for_index(i as u32),
                size: content.len() as u64,
                hash_hex,
                offset,
            });
            offset += content.len() as u64;
        }
        (shards, offset)
    }

    fn sample_manifest(model_id: &str, shards: Vec<Shard>, total_size: u64) -> Manifest {
        Manifest {
            version: 1,
            model_id: model_id.to_string(),
            model_type: "llama".into(),
            quantization: "F32".into(),
            hash_algorithm: crate::config::HashAlgorithm::Blake3,
            architecture: Architecture::default(),
            moe_config: None,
            shards,
            tensors: HashMap::new(),
            total_size,
            full_hash: None,
            metadata: HashMap::new(),
            tokenizer: None,
        }
    }

    #[tokio::test]
    async fn resume_after_shard_deletion_refetches_only_missing_shard() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let shard0: &[u8] = b"shard-zero-bytes";
        let shard1: &[u8] = b"shard-one-bytes-";
        let shard2: &[u8] = b"shard-two-bytes!";
        let (shards, total_size) = sample_shards(&[shard0, shard1, shard2]);
        let manifest = sample_manifest("resume-model", shards, total_size);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&manifest))
            .mount(&server)
            .await;
        // Only shard 1 is missing on disk; shards 0 and 2 must never be refetched.
        Mock::given(method("GET"))
            .and(path("/shard_00001.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(shard1.to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let handle = store::open_model(dir.path(), &manifest.model_id).unwrap();
        store::write_shard(&handle, 0, shard0, manifest.hash_algorithm, Some(&manifest.shards[0].hash_hex)).unwrap();
        store::write_shard(&handle, 2, shard2, manifest.hash_algorithm, Some(&manifest.shards[2].hash_hex)).unwrap();

        let state = DownloadState {
            model_id: manifest.model_id.clone(),
            base_url: server.uri(),
            manifest: manifest.clone(),
            completed_shards: vec![0, 2],
            started_at: chrono::Utc::now(),
            status: DownloadStatus::Downloading,
            error: None,
        };
        save_state(dir.path(), &state).unwrap();

        let client = Client::new();
        let registry = JobRegistry::new();
        let options = DownloadOptions {
            root: dir.path().to_path_buf(),
            concurrency: 3,
        };
        let result = download(&client, &registry, &server.uri(), options, None, CancellationToken::new()).await;
        assert!(result.is_ok(), "{result:?}");

        let refetched = store::load_shard(&handle, 1, manifest.hash_algorithm, Some(&manifest.shards[1].hash_hex));
        assert!(refetched.is_ok());
        assert!(!state_path(dir.path(), &manifest.model_id).exists());
    }

    #[tokio::test]
    async fn corrupt_completed_shard_is_healed_by_refetch() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let shard0: &[u8] = b"good-shard-zero-";
        let shard1: &[u8] = b"good-shard-one--";
        let (shards, total_size) = sample_shards(&[shard0, shard1]);
        let manifest = sample_manifest("heal-model", shards, total_size);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&manifest))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/shard_00001.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(shard1.to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let handle = store::open_model(dir.path(), &manifest.model_id).unwrap();
        store::write_shard(&handle, 0, shard0, manifest.hash_algorithm, Some(&manifest.shards[0].hash_hex)).unwrap();
        // Shard 1 is marked completed in the stale sidecar but its on-disk bytes are corrupt.
        std::fs::write(handle.dir.join(Shard::filename_for_index(1)), b"garbage-on-disk!").unwrap();

        let state = DownloadState {
            model_id: manifest.model_id.clone(),
            base_url: server.uri(),
            manifest: manifest.clone(),
            completed_shards: vec![0, 1],
            started_at: chrono::Utc::now(),
            status: DownloadStatus::Downloading,
            error: None,
        };
        save_state(dir.path(), &state).unwrap();

        let client = Client::new();
        let registry = JobRegistry::new();
        let options = DownloadOptions {
            root: dir.path().to_path_buf(),
            concurrency: 3,
        };
        let result = download(&client, &registry, &server.uri(), options, None, CancellationToken::new()).await;
        assert!(result.is_ok(), "{result:?}");

        let healed = store::load_shard(&handle, 1, manifest.hash_algorithm, Some(&manifest.shards[1].hash_hex));
        assert!(healed.is_ok());
    }

    #[tokio::test]
    async fn cancellation_persists_paused_state_and_resume_completes() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let shard0: &[u8] = b"slow-shard-zero-";
        let shard1: &[u8] = b"slow-shard-one--";
        let (shards, total_size) = sample_shards(&[shard0, shard1]);
        let manifest = sample_manifest("cancel-model", shards, total_size);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&manifest))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/shard_00000.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(shard0.to_vec())
                    .set_delay(std::time::Duration::from_millis(200)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/shard_00001.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(shard1.to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = Client::new();
        let registry = JobRegistry::new();
        let cancel = CancellationToken::new();

        let first_attempt = {
            let client = client.clone();
            let registry = registry.clone();
            let base_url = server.uri();
            let options = DownloadOptions {
                root: dir.path().to_path_buf(),
                concurrency: 1,
            };
            let cancel = cancel.clone();
            tokio::spawn(async move { download(&client, &registry, &base_url, options, None, cancel).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cancel.cancel();
        let outcome = first_attempt.await.unwrap();
        assert!(matches!(outcome, Err(DownloadError::Cancelled)));

        let state = load_state(dir.path(), &manifest.model_id).expect("paused state persisted");
        assert_eq!(state.status, DownloadStatus::Paused);

        let options = DownloadOptions {
            root: dir.path().to_path_buf(),
            concurrency: 1,
        };
        let resumed = download(&client, &registry, &server.uri(), options, None, CancellationToken::new()).await;
        assert!(resumed.is_ok(), "{resumed:?}");
        assert!(!state_path(dir.path(), &manifest.model_id).exists());
    }
}
