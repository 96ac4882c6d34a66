//! Crowd monitoring pipeline: acquire frames, count people, maintain an
//! occupancy heatmap, raise threshold alerts and fan annotated JPEGs out to
//! any number of HTTP viewers.
//!
//! Submodules:
//! - `config`: CLI parsing into validated settings.
//! - `control`: run state and the shared counters.
//! - `pipeline`: the per-tick worker and the streaming-mode supervisor.
//! - `processing`: detector worker and per-frame analysis.
//! - `hub`: single-producer, many-consumer artifact fan-out.
//! - `server`: Actix Web routes.
//! - `process`: offline file annotation.

pub use config::{CrowdConfig, ProcessArgs, ProcessConfig, ServeArgs};
pub use pipeline::serve;
pub use process::process;

mod alert;
mod annotation;
mod config;
mod control;
mod data;
mod encoding;
mod health;
mod heatmap;
mod hub;
mod notify;
mod pipeline;
mod process;
mod processing;
mod server;
mod telemetry;
