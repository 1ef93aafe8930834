//! Request Factory (C5): parse a JSON request descriptor into a typed [`Request`].
//!
//! Grounded in `RequestFactory.cpp::create`: try a service request first,
//! fall back to a URL request, matching the original's try/fallback chain.

use serde::de::Error as _;

use crate::error::RequestParseError;
use crate::request::{
    FilterMap, Region, Request, RequestJson, ServiceRequest, ServiceRequestJson, UrlRequest,
    UrlRequestJson,
};

pub struct RequestFactory;

impl RequestFactory {
    /// Parse a request descriptor (as persisted in `requests/<summary>`, or
    /// as submitted by a consumer) into a [`Request`].
    pub fn from_json_str(json: &str) -> Result<Request, RequestParseError> {
        match serde_json::from_str::<ServiceRequestJson>(json) {
            Ok(service_json) => Self::from_service_json(service_json),
            Err(_) => {
                let url_json: UrlRequestJson = serde_json::from_str(json).map_err(|_| {
                    RequestParseError::UnrecognizedShape
                })?;
                Self::from_url_json(url_json)
            }
        }
    }

    pub fn from_value(value: &RequestJson) -> Result<Request, RequestParseError> {
        match value {
            RequestJson::Service(s) => Self::from_service_json(s.clone()),
            RequestJson::Url(u) => Self::from_url_json(u.clone()),
        }
    }

    fn from_service_json(json: ServiceRequestJson) -> Result<Request, RequestParseError> {
        if json.artifact_type.is_empty() {
            return Err(RequestParseError::MissingRequiredField("artifactType"));
        }
        if json.artifact_key.is_empty() {
            return Err(RequestParseError::MissingRequiredField("artifactKey"));
        }
        let region = match json.endpoint {
            0 => Region::Na,
            1 => Region::Eu,
            2 => Region::Fe,
            other => return Err(RequestParseError::Json(serde::de::Error::custom(format!(
                "invalid endpoint value {other}"
            )))),
        };
        let filters: FilterMap = json
            .filters
            .into_iter()
            .map(|(k, v)| (k, v.into_set()))
            .collect();
        let req = ServiceRequest::new(json.artifact_type, json.artifact_key, filters, region, json.unpack)?;
        Ok(Request::Service(req))
    }

    fn from_url_json(json: UrlRequestJson) -> Result<Request, RequestParseError> {
        let req = UrlRequest::new(json.url, json.filename, json.unpack, json.cert_path)?;
        Ok(Request::Url(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_request_with_array_filters() {
        let json = r#"{"artifactType":"wakeword","artifactKey":"alexa","filters":{"locale":["en-US","en-GB"]},"endpoint":1,"unpack":false}"#;
        let req = RequestFactory::from_json_str(json).unwrap();
        assert!(matches!(req, Request::Service(_)));
        assert!(req.summary().ends_with("_EU"));
    }

    #[test]
    fn parses_service_request_with_scalar_filter() {
        let json = r#"{"artifactType":"tts","artifactKey":"voice","filters":{"gender":"female"}}"#;
        let req = RequestFactory::from_json_str(json).unwrap();
        assert!(matches!(req, Request::Service(_)));
    }

    #[test]
    fn falls_back_to_url_request_when_not_service_shaped() {
        let json = r#"{"url":"https://example.com/a.tar","filename":"a.tar","unpack":true}"#;
        let req = RequestFactory::from_json_str(json).unwrap();
        assert!(matches!(req, Request::Url(_)));
    }

    #[test]
    fn rejects_garbage_json() {
        let err = RequestFactory::from_json_str("not json at all").unwrap_err();
        assert!(matches!(err, RequestParseError::UnrecognizedShape));
    }
}
