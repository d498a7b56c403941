pub mod aggregate;
pub mod config;
pub mod detector;
pub mod driver;
pub mod forecast;
pub mod metrics_server;
pub mod normalize;
pub mod observability;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod sinks;
pub mod solar;
pub mod sources;

pub use pipeline::{Envelope, Pipeline};
