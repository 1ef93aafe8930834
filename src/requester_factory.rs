//! Requester Factory (C6): builds the right [`Requester`] variant for a
//! [`Request`], wiring in the shared collaborators every Requester needs.
//!
//! Grounded in `RequesterFactory.cpp`: one factory method dispatches on the
//! request's concrete type and hands back a fully wired, not-yet-started
//! Requester; loading a persisted sidecar at startup goes through the same
//! path after reparsing its metadata.

use std::sync::Arc;

use camino::Utf8Path;

use crate::allow_list::UrlAllowList;
use crate::bus::NotificationBus;
use crate::collaborators::{EndpointUrlBuilder, HttpClient};
use crate::config::AssetManagerConf;
use crate::request::Request;
use crate::requester::{self, Requester, RequesterContext};
use crate::requester_metadata::RequesterMetadata;
use crate::resource::Resource;
use crate::storage_manager::StorageManager;

pub struct RequesterFactory {
    bus: Arc<NotificationBus>,
    storage: Arc<StorageManager>,
    http: Arc<HttpClient>,
    conf: Arc<AssetManagerConf>,
    endpoint_builder: Arc<dyn EndpointUrlBuilder>,
    allow_list: Arc<UrlAllowList>,
}

impl RequesterFactory {
    pub fn new(
        bus: Arc<NotificationBus>,
        storage: Arc<StorageManager>,
        http: Arc<HttpClient>,
        conf: Arc<AssetManagerConf>,
        endpoint_builder: Arc<dyn EndpointUrlBuilder>,
        allow_list: Arc<UrlAllowList>,
    ) -> Self {
        Self {
            bus,
            storage,
            http,
            conf,
            endpoint_builder,
            allow_list,
        }
    }

    fn context(&self) -> RequesterContext {
        RequesterContext {
            bus: self.bus.clone(),
            storage: self.storage.clone(),
            http: self.http.clone(),
            conf: self.conf.clone(),
        }
    }

    /// `createRequester`: a fresh Requester for a request with no sidecar yet.
    pub fn create(&self, request: Request, sidecar_path: &Utf8Path) -> Arc<Requester> {
        let metadata = RequesterMetadata::new(sidecar_path.to_path_buf(), request.clone());
        self.build(request, metadata, None)
    }

    /// `createRequesterFromMetadata`: reconstruct a Requester at startup from
    /// a loaded sidecar, reacquiring its resource from the bank if still present.
    pub fn create_from_metadata(&self, metadata: RequesterMetadata) -> Arc<Requester> {
        let request = metadata.request.clone();
        let resource = if metadata.resource_id.is_empty() {
            None
        } else {
            self.storage.acquire_resource(&metadata.resource_id)
        };
        self.build(request, metadata, resource)
    }

    fn build(
        &self,
        request: Request,
        metadata: RequesterMetadata,
        resource: Option<Arc<Resource>>,
    ) -> Arc<Requester> {
        let variant = match &request {
            Request::Service(_) => requester::new_service_variant(self.endpoint_builder.clone()),
            Request::Url(_) => requester::new_url_variant(self.allow_list.clone()),
        };
        Requester::new(metadata, variant, self.context(), resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FilterMap, Region, ServiceRequest};

    fn factory(dir: &camino_tempfile::Utf8TempDir) -> RequesterFactory {
        let bus = Arc::new(NotificationBus::new());
        let storage = StorageManager::create(dir.path().join("resources")).unwrap();
        let http = Arc::new(
            HttpClient::new(
                Arc::new(crate::collaborators::NoAuth),
                Arc::new(crate::collaborators::ThrottleGate::new()),
            )
            .unwrap(),
        );
        let conf = Arc::new(AssetManagerConf::default());
        let endpoint_builder = Arc::new(crate::collaborators::DefaultEndpointUrlBuilder {
            base_url: "https://example.com".into(),
        });
        let allow_list = Arc::new(UrlAllowList::new(vec!["https://cdn.example.com/".into()], false));
        RequesterFactory::new(bus, storage, http, conf, endpoint_builder, allow_list)
    }

    #[test]
    fn create_builds_an_init_state_requester() {
        let dir = camino_tempfile::tempdir().unwrap();
        let factory = factory(&dir);
        let request = Request::Service(
            ServiceRequest::new("wakeword".into(), "alexa".into(), FilterMap::new(), Region::Na, false).unwrap(),
        );
        let sidecar = dir.path().join("requests").join(request.summary());
        let requester = factory.create(request, &sidecar);
        assert_eq!(requester.state(), crate::requester::State::Init);
    }

    #[test]
    fn create_from_metadata_with_missing_resource_starts_init() {
        let dir = camino_tempfile::tempdir().unwrap();
        let factory = factory(&dir);
        let request = Request::Service(
            ServiceRequest::new("wakeword".into(), "alexa".into(), FilterMap::new(), Region::Na, false).unwrap(),
        );
        let sidecar = dir.path().join("requests").join(request.summary());
        let mut metadata = RequesterMetadata::new(sidecar, request);
        metadata.resource_id = "missing-resource".into();
        let requester = factory.create_from_metadata(metadata);
        assert_eq!(requester.state(), crate::requester::State::Init);
    }
}
