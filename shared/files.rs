use crate::pipeline::PipelineError;
use google_cloud_auth::credentials::{Credentials, anonymous::Builder as AnonymousCredentials};
use google_cloud_storage::client::Storage;
use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::Client;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::runtime::Runtime;

const FILE_SCHEME: &str = "file://";
const GCS_SCHEME: &str = "gs://";
const HTTP_USER_AGENT: &str = "kinship-http-client/1.0";

/// Whole-object access to sample containers, sample maps and result documents,
/// regardless of the underlying storage medium. Paths are opaque URL-like keys; no
/// directory semantics are assumed.
pub trait BlobStore: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>, PipelineError>;
    fn write(&self, path: &str, content: &[u8]) -> Result<(), PipelineError>;
}

#[derive(Debug, Default)]
pub struct ReadMetrics {
    bytes_read: AtomicU64,
    objects_read: AtomicU64,
}

impl ReadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: usize) {
        self.objects_read.fetch_add(1, Ordering::Relaxed);
        if bytes > 0 {
            self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    /// Returns `(objects, bytes)` fetched so far.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.objects_read.load(Ordering::Relaxed),
            self.bytes_read.load(Ordering::Relaxed),
        )
    }
}

/// Reads and writes objects on the local filesystem. Accepts bare paths and `file://`
/// URLs. Writes create missing parent directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBlobStore;

impl LocalBlobStore {
    fn resolve(path: &str) -> Result<PathBuf, PipelineError> {
        if let Some(stripped) = path.strip_prefix(FILE_SCHEME) {
            return Ok(PathBuf::from(stripped));
        }
        if let Some(scheme) = remote_scheme(path) {
            return Err(PipelineError::Io(format!(
                "No blob store client is available for the '{scheme}://' scheme (object '{path}')"
            )));
        }
        Ok(PathBuf::from(path))
    }
}

impl BlobStore for LocalBlobStore {
    fn read(&self, path: &str) -> Result<Vec<u8>, PipelineError> {
        let local = Self::resolve(path)?;
        fs::read(&local)
            .map_err(|e| PipelineError::Io(format!("Failed to read '{}': {e}", local.display())))
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<(), PipelineError> {
        let local = Self::resolve(path)?;
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                PipelineError::Io(format!(
                    "Failed to create directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }
        debug!("Writing {} bytes to {}", content.len(), local.display());
        fs::write(&local, content)
            .map_err(|e| PipelineError::Io(format!("Failed to write '{}': {e}", local.display())))
    }
}

/// An in-process object store keyed by path.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, content: Vec<u8>) {
        self.lock().insert(path.into(), content);
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self, path: &str) -> Result<Vec<u8>, PipelineError> {
        self.get(path)
            .ok_or_else(|| PipelineError::Io(format!("Object '{path}' does not exist")))
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<(), PipelineError> {
        self.insert(path, content.to_vec());
        Ok(())
    }
}

// ========================================================================================
//                          Remote stores: Cloud Storage and HTTP
// ========================================================================================

static RUNTIME_MANAGER: OnceLock<Arc<Runtime>> = OnceLock::new();

/// The process-wide Tokio runtime that drives the async Cloud Storage client from the
/// reader's plain worker threads.
pub fn get_shared_runtime() -> Result<Arc<Runtime>, PipelineError> {
    if let Some(runtime) = RUNTIME_MANAGER.get() {
        return Ok(Arc::clone(runtime));
    }
    let runtime = Arc::new(
        Runtime::new()
            .map_err(|e| PipelineError::Io(format!("Failed to initialize Tokio runtime: {e}")))?,
    );
    Ok(Arc::clone(RUNTIME_MANAGER.get_or_init(|| runtime)))
}

pub fn gcs_billing_project_from_env() -> Option<String> {
    ["GOOGLE_PROJECT", "GOOGLE_CLOUD_PROJECT", "CLOUDSDK_CORE_PROJECT"]
        .into_iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.trim().is_empty())
}

pub fn load_adc_credentials() -> Result<Credentials, PipelineError> {
    let mut builder = google_cloud_auth::credentials::Builder::default();
    if let Some(project) = gcs_billing_project_from_env() {
        builder = builder.with_quota_project_id(project);
    }

    let runtime = if tokio::runtime::Handle::try_current().is_err() {
        Some(get_shared_runtime()?)
    } else {
        None
    };
    let runtime_guard = runtime.as_ref().map(|rt| rt.enter());

    let credentials = builder
        .build()
        .map_err(|e| PipelineError::Io(format!("Failed to load ADC credentials: {e}")))?;

    drop(runtime_guard);

    Ok(credentials)
}

fn parse_gcs_uri(uri: &str) -> Result<(String, String), PipelineError> {
    let without_scheme = uri.trim_start_matches(GCS_SCHEME);
    let mut parts = without_scheme.splitn(2, '/');
    let bucket = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::Io(format!("Malformed GCS URI '{uri}': missing bucket")))?;
    let object = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::Io(format!("Malformed GCS URI '{uri}': missing object")))?;
    Ok((bucket.to_string(), object.to_string()))
}

fn is_http_path(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

fn should_attempt_http_fallback(err: &PipelineError) -> bool {
    match err {
        PipelineError::Io(msg) => {
            let lower = msg.to_lowercase();
            lower.contains("the service is currently unavailable")
                || lower.contains("tcp connect error")
                || lower.contains("dns error")
                || lower.contains("cannot create the authentication headers")
        }
        _ => false,
    }
}

fn gcs_http_fallback_url(bucket: &str, object: &str) -> Result<String, PipelineError> {
    let mut url = Url::parse("https://storage.googleapis.com/")
        .map_err(|e| PipelineError::Io(format!("Failed to construct GCS HTTP base URL: {e}")))?;
    url.set_path(&format!("{bucket}/{object}"));
    Ok(url.to_string())
}

fn describe_gcs_error(
    action: &str,
    location: &str,
    has_user_project: bool,
    err: google_cloud_storage::Error,
) -> PipelineError {
    let msg = err.to_string();
    if !has_user_project && msg.to_lowercase().contains("requester pays") {
        PipelineError::Io(format!(
            "Requester Pays bucket requires a billing project. Set GOOGLE_PROJECT (or run `gcloud config set project ...`) and re-run. Original error while accessing {location}: {msg}"
        ))
    } else {
        PipelineError::Io(format!("Failed to {action} {location}: {msg}"))
    }
}

/// Whole-object reads of public `http(s)://` locations. Writes are refused.
#[derive(Debug)]
pub struct HttpBlobStore {
    client: Client,
}

impl HttpBlobStore {
    pub fn new() -> Result<Self, PipelineError> {
        let client = Client::builder()
            .user_agent(HTTP_USER_AGENT)
            .build()
            .map_err(|e| PipelineError::Io(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl BlobStore for HttpBlobStore {
    fn read(&self, path: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self
            .client
            .get(path)
            .send()
            .map_err(|e| PipelineError::Io(format!("Failed to request {path}: {e}")))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PipelineError::Io(format!("Object {path} not found (HTTP 404)")));
        }
        if !status.is_success() {
            return Err(PipelineError::Io(format!("Failed to read {path}: HTTP {status}")));
        }
        let body = response
            .bytes()
            .map_err(|e| PipelineError::Io(format!("Error streaming data from {path}: {e}")))?;
        debug!("Fetched {} bytes from {path}", body.len());
        Ok(body.to_vec())
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<(), PipelineError> {
        Err(PipelineError::Io(format!(
            "Cannot write {} bytes to {path}: HTTP locations are read-only",
            content.len()
        )))
    }
}

/// Whole-object access to `gs://bucket/object` locations through the Cloud Storage
/// client. Credentials come from ADC, falling back to anonymous access for public
/// buckets. Reads that fail at the transport or authentication layer are retried once
/// over public HTTPS.
pub struct GcsBlobStore {
    runtime: Arc<Runtime>,
    storage: Storage,
    user_project: Option<String>,
    http: HttpBlobStore,
}

impl GcsBlobStore {
    pub fn new() -> Result<Self, PipelineError> {
        let runtime = get_shared_runtime()?;
        let credentials = match load_adc_credentials() {
            Ok(credentials) => credentials,
            Err(err) => {
                debug!("Using anonymous Cloud Storage credentials: {err}");
                AnonymousCredentials::new().build()
            }
        };
        let storage = runtime.block_on(async move {
            Storage::builder()
                .with_credentials(credentials)
                .build()
                .await
                .map_err(|e| {
                    PipelineError::Io(format!("Failed to create Cloud Storage client: {e}"))
                })
        })?;
        Ok(Self {
            runtime,
            storage,
            user_project: gcs_billing_project_from_env(),
            http: HttpBlobStore::new()?,
        })
    }

    fn read_object(&self, bucket: &str, object: &str) -> Result<Vec<u8>, PipelineError> {
        let storage = self.storage.clone();
        let bucket_path = format!("projects/_/buckets/{bucket}");
        let object = object.to_string();
        let location = format!("{GCS_SCHEME}{bucket}/{object}");
        let has_user_project = self.user_project.is_some();
        self.runtime.block_on(async move {
            let mut response = storage
                .read_object(bucket_path, object)
                .send()
                .await
                .map_err(|e| describe_gcs_error("read", &location, has_user_project, e))?;
            let mut buffer = Vec::new();
            while let Some(chunk) = response.next().await {
                let chunk = chunk.map_err(|e| {
                    PipelineError::Io(format!("Error streaming data from {location}: {e}"))
                })?;
                buffer.extend_from_slice(&chunk);
            }
            Ok::<Vec<u8>, PipelineError>(buffer)
        })
    }
}

impl BlobStore for GcsBlobStore {
    fn read(&self, path: &str) -> Result<Vec<u8>, PipelineError> {
        let (bucket, object) = parse_gcs_uri(path)?;
        match self.read_object(&bucket, &object) {
            Ok(bytes) => Ok(bytes),
            Err(err) if should_attempt_http_fallback(&err) => {
                let url = gcs_http_fallback_url(&bucket, &object)?;
                warn!("Falling back to HTTPS access for {path} after Cloud Storage error: {err}");
                self.http.read(&url).map_err(|http_err| {
                    PipelineError::Io(format!("{http_err} (after Cloud Storage error: {err})"))
                })
            }
            Err(err) => Err(err),
        }
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<(), PipelineError> {
        let (bucket, object) = parse_gcs_uri(path)?;
        let storage = self.storage.clone();
        let bucket_path = format!("projects/_/buckets/{bucket}");
        let location = path.to_string();
        let has_user_project = self.user_project.is_some();
        let payload = bytes::Bytes::from(content.to_vec());
        debug!("Writing {} bytes to {location}", content.len());
        self.runtime.block_on(async move {
            storage
                .write_object(bucket_path, object, payload)
                .send_buffered()
                .await
                .map(|_| ())
                .map_err(|e| describe_gcs_error("write", &location, has_user_project, e))
        })
    }
}

/// Dispatches each path to the store for its scheme: `gs://` to Cloud Storage,
/// `http(s)://` to HTTP, everything else to the local filesystem. Remote clients are
/// created on first use, so purely local runs never touch credentials.
#[derive(Default)]
pub struct RoutingBlobStore {
    local: LocalBlobStore,
    gcs: OnceLock<Result<GcsBlobStore, PipelineError>>,
    http: OnceLock<Result<HttpBlobStore, PipelineError>>,
}

impl RoutingBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(&self, path: &str) -> Result<&dyn BlobStore, PipelineError> {
        if path.starts_with(GCS_SCHEME) {
            match self.gcs.get_or_init(GcsBlobStore::new) {
                Ok(store) => Ok(store as &dyn BlobStore),
                Err(err) => Err(err.clone()),
            }
        } else if is_http_path(path) {
            match self.http.get_or_init(HttpBlobStore::new) {
                Ok(store) => Ok(store as &dyn BlobStore),
                Err(err) => Err(err.clone()),
            }
        } else {
            Ok(&self.local)
        }
    }
}

impl BlobStore for RoutingBlobStore {
    fn read(&self, path: &str) -> Result<Vec<u8>, PipelineError> {
        self.route(path)?.read(path)
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<(), PipelineError> {
        self.route(path)?.write(path, content)
    }
}

/// Joins an object key onto a directory-like prefix, for bare paths and URLs alike.
pub fn join_object_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        return name.to_string();
    }
    if remote_scheme(prefix).is_some() || prefix.starts_with(FILE_SCHEME) {
        format!("{}/{}", prefix.trim_end_matches('/'), name)
    } else {
        Path::new(prefix).join(name).to_string_lossy().into_owned()
    }
}

fn remote_scheme(path: &str) -> Option<&str> {
    let (scheme, _) = path.split_once("://")?;
    if scheme == "file" || scheme.is_empty() {
        return None;
    }
    scheme
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        .then_some(scheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn local_store_round_trips_bare_paths_and_file_urls() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/object.bin");
        let bare = nested.to_string_lossy().into_owned();
        let url = format!("file://{bare}");

        LocalBlobStore.write(&bare, b"payload").unwrap();
        assert_eq!(LocalBlobStore.read(&url).unwrap(), b"payload");
    }

    #[test]
    fn local_store_rejects_remote_schemes_with_io_error() {
        let err = LocalBlobStore.read("gs://bucket/sample.king").unwrap_err();
        assert!(matches!(err, PipelineError::Io(ref m) if m.contains("gs://")));
    }

    #[test]
    fn memory_store_reports_missing_objects() {
        let store = MemoryBlobStore::new();
        store.write("x", b"1").unwrap();
        assert_eq!(store.read("x").unwrap(), b"1");
        assert!(matches!(store.read("y"), Err(PipelineError::Io(_))));
    }

    #[test]
    fn join_object_path_handles_urls_and_local_dirs() {
        assert_eq!(join_object_path("gs://b/dir/", "s.king"), "gs://b/dir/s.king");
        assert_eq!(join_object_path("", "s.king"), "s.king");
        assert!(join_object_path("/tmp/out", "s.king").ends_with("out/s.king"));
    }

    #[test]
    fn gcs_uris_split_into_bucket_and_object() {
        let (bucket, object) = parse_gcs_uri("gs://cohort/samples/a.king").unwrap();
        assert_eq!(bucket, "cohort");
        assert_eq!(object, "samples/a.king");
        assert!(parse_gcs_uri("gs://cohort").is_err());
        assert!(parse_gcs_uri("gs:///a.king").is_err());
    }

    #[test]
    fn gcs_fallback_url_points_at_public_endpoint() {
        assert_eq!(
            gcs_http_fallback_url("cohort", "samples/a.king").unwrap(),
            "https://storage.googleapis.com/cohort/samples/a.king"
        );
        assert!(should_attempt_http_fallback(&PipelineError::Io(
            "dns error: failed to lookup".to_string()
        )));
        assert!(!should_attempt_http_fallback(&PipelineError::Io(
            "No such object: cohort/a.king".to_string()
        )));
    }

    #[test]
    fn routing_store_serves_local_paths_without_remote_clients() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/doc.json").to_string_lossy().into_owned();
        let store = RoutingBlobStore::new();
        store.write(&path, b"{}").unwrap();
        assert_eq!(store.read(&format!("file://{path}")).unwrap(), b"{}");
        assert!(store.gcs.get().is_none());
        assert!(store.http.get().is_none());
    }

    #[test]
    fn routing_store_rejects_unsupported_schemes() {
        let err = RoutingBlobStore::new().read("s3://bucket/a.king").unwrap_err();
        assert!(matches!(err, PipelineError::Io(ref m) if m.contains("s3://")));
    }

    #[test]
    fn http_locations_are_read_only() {
        let store = HttpBlobStore::new().unwrap();
        assert!(matches!(
            store.write("https://example.org/out.json", b"{}"),
            Err(PipelineError::Io(_))
        ));
    }

    #[test]
    fn read_metrics_counts_objects_and_bytes() {
        let metrics = ReadMetrics::new();
        metrics.record(10);
        metrics.record(0);
        assert_eq!(metrics.snapshot(), (2, 10));
    }
}
