pub mod advertiser;
pub mod api;
pub mod chain;
pub mod config;
pub mod downloader;
pub mod error;
pub mod sync;
pub mod telemetry;

mod service;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use service::{NodeHandle, NodeService};
