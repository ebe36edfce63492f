pub mod api;
pub mod config;
pub mod forecast;
pub mod metrics_server;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod sensors;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use pipeline::{Envelope, Pipeline};
