//! Request value types (C5 data model half; parsing lives in [`crate::request_factory`]).
//!
//! Grounded in `DavsRequest.{h,cpp}` and `UrlRequest.{h,cpp}`: a request is a
//! small immutable value whose `summary` is both the filesystem name of its
//! metadata sidecar and the prefix of its bus properties.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::RequestParseError;

pub type FilterMap = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Region {
    Na = 0,
    Eu = 1,
    Fe = 2,
}

impl Default for Region {
    fn default() -> Self {
        Self::Na
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub artifact_type: String,
    pub artifact_key: String,
    pub filters: FilterMap,
    pub region: Region,
    pub unpack: bool,
    summary: String,
}

impl ServiceRequest {
    pub fn new(
        artifact_type: String,
        artifact_key: String,
        filters: FilterMap,
        region: Region,
        unpack: bool,
    ) -> Result<Self, RequestParseError> {
        if artifact_type.is_empty() {
            return Err(RequestParseError::EmptyField("artifactType"));
        }
        if artifact_key.is_empty() {
            return Err(RequestParseError::EmptyField("artifactKey"));
        }
        for (key, values) in &filters {
            if values.is_empty() {
                return Err(RequestParseError::EmptyFilterValue(key.clone()));
            }
        }

        let summary = compute_service_summary(&artifact_type, &artifact_key, &filters, region, unpack);
        Ok(Self {
            artifact_type,
            artifact_key,
            filters,
            region,
            unpack,
            summary,
        })
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }
}

/// Mirrors `DavsRequest::DavsRequest`'s summary construction exactly:
/// `type_key(_filterValue)*(_EU|_FE)?(_unpacked)?`, with non-alphanumeric,
/// non-underscore characters stripped.
fn compute_service_summary(
    artifact_type: &str,
    artifact_key: &str,
    filters: &FilterMap,
    region: Region,
    unpack: bool,
) -> String {
    let mut summary = format!("{artifact_type}_{artifact_key}");
    for values in filters.values() {
        for value in values {
            summary.push('_');
            summary.push_str(value);
        }
    }
    match region {
        Region::Eu => summary.push_str("_EU"),
        Region::Fe => summary.push_str("_FE"),
        Region::Na => {}
    }
    if unpack {
        summary.push_str("_unpacked");
    }
    sanitize_summary(&summary)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRequest {
    pub url: String,
    pub filename: String,
    pub unpack: bool,
    pub cert_path: String,
    summary: String,
}

impl UrlRequest {
    pub fn new(
        url: String,
        filename: String,
        unpack: bool,
        cert_path: String,
    ) -> Result<Self, RequestParseError> {
        if url.is_empty() {
            return Err(RequestParseError::EmptyField("url"));
        }
        if filename.is_empty() {
            return Err(RequestParseError::EmptyField("filename"));
        }
        if filename.contains("..") {
            return Err(RequestParseError::PathTraversal);
        }

        let summary = compute_url_summary(&url, &filename, unpack, &cert_path);
        Ok(Self {
            url,
            filename,
            unpack,
            cert_path,
            summary,
        })
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }
}

/// `std::hash<std::string>` in the original is process-stable but not
/// spec'd further than "hash-stable string derived from fields"; a fixed
/// hasher (not `RandomState`) is used here so the summary is also stable
/// across runs, which the on-disk sidecar naming needs in practice (see
/// DESIGN.md).
fn stable_hash(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Mirrors `UrlRequest::UrlRequest`'s summary construction:
/// `url_<hash(url)>_<filename><hash(certPath) or ''>(_unpacked)?`.
fn compute_url_summary(url: &str, filename: &str, unpack: bool, cert_path: &str) -> String {
    let mut summary = format!("url_{}_{}", stable_hash(url), filename);
    if !cert_path.is_empty() {
        summary.push_str(&stable_hash(cert_path).to_string());
    }
    if unpack {
        summary.push_str("_unpacked");
    }
    sanitize_summary(&summary)
}

fn sanitize_summary(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c == '_' || c.is_ascii_alphanumeric())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Service(ServiceRequest),
    Url(UrlRequest),
}

impl Request {
    pub fn summary(&self) -> &str {
        match self {
            Self::Service(r) => r.summary(),
            Self::Url(r) => r.summary(),
        }
    }

    pub fn unpack(&self) -> bool {
        match self {
            Self::Service(r) => r.unpack,
            Self::Url(r) => r.unpack,
        }
    }
}

/// On-wire / on-disk JSON shape, a tagged union distinguished by field
/// presence (not an explicit tag), matching `RequestFactory.cpp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestJson {
    Service(ServiceRequestJson),
    Url(UrlRequestJson),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequestJson {
    #[serde(rename = "artifactType")]
    pub artifact_type: String,
    #[serde(rename = "artifactKey")]
    pub artifact_key: String,
    #[serde(default, rename = "filters")]
    pub filters: BTreeMap<String, FilterValue>,
    #[serde(default, rename = "endpoint")]
    pub endpoint: i32,
    #[serde(default, rename = "unpack")]
    pub unpack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRequestJson {
    pub url: String,
    pub filename: String,
    #[serde(default, rename = "unpack")]
    pub unpack: bool,
    #[serde(default, rename = "certPath")]
    pub cert_path: String,
}

/// A filter value may be persisted as a bare string or as an array of
/// strings; both normalize to a set, matching `RequestFactory.cpp`'s
/// tolerant parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(String),
    Many(Vec<String>),
}

impl FilterValue {
    pub fn into_set(self) -> BTreeSet<String> {
        match self {
            Self::One(s) => BTreeSet::from([s]),
            Self::Many(items) => items.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_summary_matches_expected_shape() {
        let mut filters = FilterMap::new();
        filters.insert("filter1".into(), BTreeSet::from(["value1".into()]));
        let req = ServiceRequest::new(
            "test".into(),
            "tar".into(),
            filters,
            Region::Na,
            true,
        )
        .unwrap();
        assert_eq!(req.summary(), "test_tar_value1_unpacked");
    }

    #[test]
    fn service_summary_includes_region_suffix() {
        let req = ServiceRequest::new(
            "wakeword".into(),
            "alexa".into(),
            FilterMap::new(),
            Region::Eu,
            false,
        )
        .unwrap();
        assert_eq!(req.summary(), "wakeword_alexa_EU");
    }

    #[test]
    fn empty_type_is_rejected() {
        let err = ServiceRequest::new("".into(), "k".into(), FilterMap::new(), Region::Na, false)
            .unwrap_err();
        assert!(matches!(err, RequestParseError::EmptyField("artifactType")));
    }

    #[test]
    fn url_filename_traversal_is_rejected() {
        let err = UrlRequest::new(
            "https://example.com/a".into(),
            "../etc/passwd".into(),
            false,
            String::new(),
        )
        .unwrap_err();
        assert!(matches!(err, RequestParseError::PathTraversal));
    }

    #[test]
    fn equal_fields_produce_equal_summaries() {
        let a = UrlRequest::new("https://x/a".into(), "f".into(), false, String::new()).unwrap();
        let b = UrlRequest::new("https://x/a".into(), "f".into(), false, String::new()).unwrap();
        assert_eq!(a.summary(), b.summary());
    }

    #[test]
    fn filter_value_scalar_and_array_normalize_the_same() {
        let one: FilterValue = serde_json::from_str("\"v\"").unwrap();
        let many: FilterValue = serde_json::from_str("[\"v\"]").unwrap();
        assert_eq!(one.into_set(), many.into_set());
    }
}
