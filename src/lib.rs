pub mod api;
pub mod archive;
pub mod config;
pub mod error;
pub mod evidence;
pub mod fingerprint;
pub mod ingest;
pub mod report;
pub mod store;
pub mod task;
