//! Asset cache and download engine for a voice-assistant device: registers
//! remote artifact descriptors, fetches them from a content service or a
//! signed URL, persists them under a content-addressed resource store with
//! reference counting, enforces a byte budget by evicting the
//! least-valuable artifacts, and keeps them fresh through scheduled update
//! checks with accept/reject hand-off to the consumer.
//!
//! Module layout mirrors the component table: [`resource`] and
//! [`storage_manager`] are the content-addressed bank (C1/C2);
//! [`requester_metadata`], [`requester`], [`request`]/[`request_factory`],
//! and [`requester_factory`] are the per-artifact lifecycle (C3-C6);
//! [`asset_manager`] is the top-level coordinator (C7); [`allow_list`] and
//! [`bus`] are the remaining named components (C8/C9).

pub mod allow_list;
pub mod asset_manager;
pub mod bus;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod request;
pub mod request_factory;
pub mod requester;
pub mod requester_factory;
pub mod requester_metadata;
pub mod resource;
pub mod storage_manager;

pub use asset_manager::AssetManager;
pub use config::AssetManagerConf;
