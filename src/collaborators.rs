//! Collaborator interfaces (§6): things the core consumes but does not own
//! the implementation of. The spec treats these as external; this crate
//! backs them with the same HTTP/archive/auth crates the rest of the
//! workspace already depends on, rather than inventing new abstractions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::Utf8Path;
use futures::{Stream, StreamExt};

use crate::error::{RequesterError, RequesterErrorKind};
use crate::request::{Region, ServiceRequest};

/// Synchronous token fetch, per §6.
pub trait AuthTokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

pub struct NoAuth;
impl AuthTokenProvider for NoAuth {
    fn token(&self) -> Option<String> {
        None
    }
}

/// Subscribe to connectivity up/down, per §6. Only a point-in-time read is
/// needed by the retry loop; a full subscribe/unsubscribe push model is
/// left to a richer implementation behind this trait.
pub trait ReachabilityMonitor: Send + Sync {
    fn is_reachable(&self) -> bool;
}

pub struct AlwaysReachable;
impl ReachabilityMonitor for AlwaysReachable {
    fn is_reachable(&self) -> bool {
        true
    }
}

/// Download throttle wired from `AssetManager::on_idle_changed` (§4.3): a
/// no-op while the device is active, a leaky-bucket rate limit while idle.
/// Shared (via `Arc`) between the Asset Manager and the `HttpClient` it hands
/// to every Requester, so one `set_idle` call affects every in-flight stream.
pub struct ThrottleGate {
    idle: AtomicBool,
    limiter: leaky_bucket::RateLimiter,
}

const IDLE_THROTTLE_BYTES_PER_SEC: usize = 256 * 1024;

impl ThrottleGate {
    pub fn new() -> Self {
        Self {
            idle: AtomicBool::new(false),
            limiter: leaky_bucket::RateLimiter::builder()
                .initial(IDLE_THROTTLE_BYTES_PER_SEC)
                .refill(IDLE_THROTTLE_BYTES_PER_SEC)
                .max(IDLE_THROTTLE_BYTES_PER_SEC)
                .interval(Duration::from_secs(1))
                .build(),
        }
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    async fn gate(&self, n_bytes: usize) {
        if n_bytes == 0 || !self.is_idle() {
            return;
        }
        self.limiter.acquire(n_bytes.min(IDLE_THROTTLE_BYTES_PER_SEC)).await;
    }
}

impl Default for ThrottleGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Produce a service URL from (segment id, locale, request), per §6.
pub trait EndpointUrlBuilder: Send + Sync {
    fn build(&self, request: &ServiceRequest) -> String;
}

/// Default builder: `<base>/<type>/<key>?region=<region>&<filter>=<v>,<v>`.
pub struct DefaultEndpointUrlBuilder {
    pub base_url: String,
}

impl EndpointUrlBuilder for DefaultEndpointUrlBuilder {
    fn build(&self, request: &ServiceRequest) -> String {
        let region = match request.region {
            Region::Na => "NA",
            Region::Eu => "EU",
            Region::Fe => "FE",
        };
        let mut url = format!(
            "{}/{}/{}?region={}",
            self.base_url.trim_end_matches('/'),
            request.artifact_type,
            request.artifact_key,
            region
        );
        for (key, values) in &request.filters {
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.push_str(&values.iter().cloned().collect::<Vec<_>>().join(","));
        }
        url
    }
}

/// The service metadata-check response, per §6.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServiceCheckResponse {
    #[serde(rename = "artifactIdentifier")]
    pub artifact_identifier: String,
    #[serde(rename = "artifactSize")]
    pub artifact_size: u64,
    #[serde(rename = "downloadUrl")]
    pub download_url: Option<String>,
}

/// Result of a service metadata check: either a pointer to a signed URL
/// still to be downloaded, or (in the multipart case) the artifact bytes
/// already in hand.
pub enum ServiceCheckOutcome {
    NeedsDownload {
        identifier: String,
        size: u64,
        download_url: String,
    },
    AlreadyDownloaded {
        identifier: String,
        body: Bytes,
    },
}

pub type ByteStream = std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Thin wrapper over `reqwest::Client`, standing in for the spec's "HTTP
/// client" collaborator: GET (stream to sink), HEAD (headers only), and a
/// multipart-aware service check.
pub struct HttpClient {
    client: reqwest::Client,
    auth: Arc<dyn AuthTokenProvider>,
    throttle: Arc<ThrottleGate>,
}

impl HttpClient {
    pub fn new(auth: Arc<dyn AuthTokenProvider>, throttle: Arc<ThrottleGate>) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            auth,
            throttle,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// HEAD a URL and return its advertised `Content-Length`, or `None`.
    pub async fn head_content_length(&self, url: &str) -> Result<Option<u64>, RequesterError> {
        let response = self
            .authorized(self.client.head(url))
            .send()
            .await
            .map_err(connection_error)?;
        classify_status(response.status())?;
        Ok(response
            .content_length()
            .filter(|len| *len > 0))
    }

    /// GET a URL as a byte stream, for the streaming download path. Each
    /// chunk passes through the shared [`ThrottleGate`] before being handed
    /// to the caller, so `on_idle_changed` takes effect mid-transfer.
    pub async fn get_stream(&self, url: &str) -> Result<ByteStream, RequesterError> {
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(connection_error)?;
        classify_status(response.status())?;
        let throttle = self.throttle.clone();
        let stream = response.bytes_stream().then(move |chunk| {
            let throttle = throttle.clone();
            async move {
                if let Ok(bytes) = &chunk {
                    throttle.gate(bytes.len()).await;
                }
                chunk
            }
        });
        Ok(Box::pin(stream))
    }

    /// Issue the service metadata check. The original allows a multipart
    /// response whose second part *is* the artifact; `content-type`
    /// sniffing stands in for a full multipart parser here.
    pub async fn service_check(&self, url: &str) -> Result<ServiceCheckOutcome, RequesterError> {
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(connection_error)?;
        classify_status(response.status())?;

        let is_multipart = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("multipart/"))
            .unwrap_or(false);

        if is_multipart {
            let body = response.bytes().await.map_err(connection_error)?;
            // A full multipart parser is out of scope; the identifier is
            // carried by convention in the body's own metadata sidecar in
            // richer deployments. Callers that rely on this path should
            // supply a pre-parsed identifier out of band.
            return Ok(ServiceCheckOutcome::AlreadyDownloaded {
                identifier: format!("multipart-{:x}", simple_checksum(&body)),
                body,
            });
        }

        let parsed: ServiceCheckResponse = response.json().await.map_err(|_| {
            RequesterError::new(RequesterErrorKind::CheckFailed, "malformed check response")
        })?;
        let download_url = parsed.download_url.ok_or_else(|| {
            RequesterError::new(
                RequesterErrorKind::CheckFailed,
                "non-multipart response missing downloadUrl",
            )
        })?;
        Ok(ServiceCheckOutcome::NeedsDownload {
            identifier: parsed.artifact_identifier,
            size: parsed.artifact_size,
            download_url,
        })
    }
}

fn simple_checksum(bytes: &Bytes) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

fn connection_error(err: reqwest::Error) -> RequesterError {
    RequesterError::new(RequesterErrorKind::ConnectionFailed, err.to_string())
}

fn classify_status(status: reqwest::StatusCode) -> Result<(), RequesterError> {
    match status.as_u16() {
        200..=299 => Ok(()),
        404 => Err(RequesterError::new(RequesterErrorKind::NotFound, "not found")),
        401 => Err(RequesterError::new(RequesterErrorKind::Unauthorized, "unauthorized")),
        403 => Err(RequesterError::new(RequesterErrorKind::Forbidden, "forbidden")),
        other => Err(RequesterError::new(
            RequesterErrorKind::CheckFailed,
            format!("unexpected status {other}"),
        )),
    }
}

/// Consume a byte stream, writing either a single file or (when `unpack` is
/// set) an unpacked tar/gzip tree into `destination`, standing in for the
/// spec's "archive unpacker" collaborator.
pub struct ArchiveUnpacker;

impl ArchiveUnpacker {
    /// Write `stream` to a single regular file at `destination`.
    pub async fn write_file(
        mut stream: ByteStream,
        destination: &Utf8Path,
    ) -> Result<u64, RequesterError> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(io_error)?;
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(connection_error)?;
            total += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(io_error)?;
        }
        file.flush().await.map_err(io_error)?;
        Ok(total)
    }

    /// Decompress + unpack a gzip'd tar stream into `destination`, capped at
    /// `max_uncompressed_bytes` (default 64 MiB per caller convention).
    pub async fn unpack_tar_gz(
        stream: ByteStream,
        destination: &Utf8Path,
        max_uncompressed_bytes: u64,
    ) -> Result<u64, RequesterError> {
        use async_compression::tokio::bufread::GzipDecoder;
        use tokio_util::io::StreamReader;

        tokio::fs::create_dir_all(destination).await.map_err(io_error)?;

        let mapped = stream.map(|r| r.map_err(std::io::Error::other));
        let reader = StreamReader::new(mapped);
        let decoder = GzipDecoder::new(reader);
        let mut archive = tokio_tar::Archive::new(decoder);

        let mut total = 0u64;
        let mut entries = archive.entries().map_err(io_error)?;
        while let Some(entry) = entries.next().await {
            let mut entry = entry.map_err(io_error)?;
            total += entry.size();
            if total > max_uncompressed_bytes {
                return Err(RequesterError::new(
                    RequesterErrorKind::UnpackFailure,
                    "uncompressed size exceeds cap",
                ));
            }
            entry
                .unpack_in(destination)
                .await
                .map_err(io_error)?;
        }
        Ok(total)
    }
}

fn io_error(err: std::io::Error) -> RequesterError {
    RequesterError::new(RequesterErrorKind::UnpackFailure, err.to_string())
}
