//! trackflow - time-decayed behavioral analytics for an e-commerce catalog
//!
//! Ingests user interaction events from a message broker and HTTP beacons,
//! maintains rolling decayed popularity over items, facet fields, facet
//! values and search queries, groups activity per session and persona, and
//! periodically publishes sort overrides to downstream consumers while
//! mirroring every event into a columnar analytics store.

pub mod broker;
pub mod config;
pub mod decay;
pub mod engine;
pub mod events;
pub mod funnel;
pub mod groups;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod session;
pub mod sink;
pub mod snapshot;
pub mod suggest;
