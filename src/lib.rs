//! Differential testing of content-gateway layers.
//!
//! A run replays logged content requests against every configured layer,
//! records one [`store::LayerResult`] per layer and path, and judges each
//! candidate layer against its reference on status and, after archive
//! normalization, on exact content bytes. Disagreements are written to
//! per-round JSON reports and optionally pushed as Prometheus counters.
//!
//! The entry points are [`config::HarnessConfig`] and [`runner::Harness`];
//! [`dispatch::Dispatcher`], [`store::ResultStore`] and
//! [`consistency::ConsistencyEngine`] can be driven directly for finer control.

pub mod config;
pub mod consistency;
pub mod dispatch;
pub mod errors;
pub mod layer;
pub mod metrics;
pub mod normalizer;
pub mod providers;
pub mod report;
pub mod request;
pub mod runner;
pub mod store;
pub mod summary;
