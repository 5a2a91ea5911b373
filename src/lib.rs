#![deny(
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! An on-device telemetry agent: collects system metrics on a schedule,
//! queues them durably in a local SQLite WAL, and uploads them to a
//! remote endpoint in gzip-compressed chunks with retry and backoff.
//!
//! The crate is organized as a small workspace, one member per concern:
//! [`sample`] (the value model and content fingerprinting), [`store`]
//! (the durable queue), [`collectors`] (metric producers), [`chunking`]
//! and [`uploader`] (the upload path), [`clockskew`] (device clock drift
//! detection), [`health`] (the HTTP health surface), [`lock`]
//! (single-instance enforcement), [`config`] (the YAML schema), and
//! [`signal`]/[`task`] (cancellation and supervised task bookkeeping).
//! [`supervisor`] wires all of them into one running agent.

pub use chunking;
pub use clockskew;
pub use collectors;
pub use config;
pub use health;
pub use lock;
pub use sample;
pub use signal;
pub use store;
pub use supervisor;
pub use task;
pub use uploader;
