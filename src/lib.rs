//! SCORM runtime tracking: the in-page CMI adapter, the progress sync
//! endpoint, enrollment aggregation and package resolution.

pub mod cmi;
pub mod completion;
pub mod config;
pub mod db;
pub mod error;
pub mod manifest;
pub mod models;
pub mod package;
pub mod player;
pub mod routes;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod sync;
