//! Requester Metadata (C3): the persistent sidecar for a single Requester.
//!
//! Grounded in `RequesterMetadata.cpp`: every write lands in `<summary>.tmp`
//! first and is renamed over `<summary>` only once it succeeds, so a crash
//! mid-write never corrupts the live sidecar; `.tmp` files are never loaded.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::request::{Request, RequestJson, ServiceRequestJson, UrlRequestJson};
use crate::request_factory::RequestFactory;

const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RequesterMetadataFile {
    #[serde(flatten)]
    request: RequestJson,
    #[serde(default, rename = "resourceId")]
    resource_id: String,
    #[serde(default, rename = "usedTimestamp")]
    used_timestamp_ms: u64,
}

pub struct RequesterMetadata {
    pub request: Request,
    pub resource_id: String,
    pub last_used_epoch_ms: u64,
    path: Utf8PathBuf,
}

impl RequesterMetadata {
    pub fn new(path: Utf8PathBuf, request: Request) -> Self {
        Self {
            request,
            resource_id: String::new(),
            last_used_epoch_ms: 0,
            path,
        }
    }

    /// `RequesterMetadata::createFromFile`: refuses to load a `.tmp` file,
    /// requires `request` to parse and `resourceId` to be present.
    pub fn load(path: &Utf8Path) -> Option<Self> {
        if path.as_str().ends_with(TMP_SUFFIX) {
            return None;
        }
        let contents = std::fs::read_to_string(path).ok()?;
        let as_json: RequesterMetadataFile = serde_json::from_str(&contents).ok()?;
        if as_json.resource_id.is_empty() {
            return None;
        }
        let request = RequestFactory::from_value(&as_json.request).ok()?;
        Some(Self {
            request,
            resource_id: as_json.resource_id,
            last_used_epoch_ms: as_json.used_timestamp_ms,
            path: path.to_path_buf(),
        })
    }

    /// `RequesterMetadata::saveToFile`: write-then-rename.
    pub fn save(&self) -> std::io::Result<()> {
        let request_json = match &self.request {
            Request::Service(r) => RequestJson::Service(ServiceRequestJson {
                artifact_type: r.artifact_type.clone(),
                artifact_key: r.artifact_key.clone(),
                filters: r
                    .filters
                    .iter()
                    .map(|(k, v)| (k.clone(), crate::request::FilterValue::Many(v.iter().cloned().collect())))
                    .collect(),
                endpoint: r.region as i32,
                unpack: r.unpack,
            }),
            Request::Url(r) => RequestJson::Url(UrlRequestJson {
                url: r.url.clone(),
                filename: r.filename.clone(),
                unpack: r.unpack,
                cert_path: r.cert_path.clone(),
            }),
        };
        let file = RequesterMetadataFile {
            request: request_json,
            resource_id: self.resource_id.clone(),
            used_timestamp_ms: self.last_used_epoch_ms,
        };
        let contents = serde_json::to_string(&file)?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, &self.path)
    }

    pub fn erase(&self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_file(self.path.with_extension("tmp"));
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FilterMap, Region, ServiceRequest};

    fn sample_request() -> Request {
        Request::Service(
            ServiceRequest::new(
                "wakeword".into(),
                "alexa".into(),
                FilterMap::new(),
                Region::Na,
                false,
            )
            .unwrap(),
        )
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("wakeword_alexa");
        let mut meta = RequesterMetadata::new(path.clone(), sample_request());
        meta.resource_id = "R1".into();
        meta.last_used_epoch_ms = 12345;
        meta.save().unwrap();
        assert!(!path.with_extension("tmp").exists());

        let reloaded = RequesterMetadata::load(&path).unwrap();
        assert_eq!(reloaded.resource_id, "R1");
        assert_eq!(reloaded.last_used_epoch_ms, 12345);
    }

    #[test]
    fn load_rejects_tmp_files() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("foo.tmp");
        std::fs::write(&path, "{}").unwrap();
        assert!(RequesterMetadata::load(&path).is_none());
    }

    #[test]
    fn load_rejects_missing_resource_id() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("wakeword_alexa");
        std::fs::write(&path, r#"{"artifactType":"wakeword","artifactKey":"alexa"}"#).unwrap();
        assert!(RequesterMetadata::load(&path).is_none());
    }
}
