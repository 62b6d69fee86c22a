//! Storage adapter and process plumbing.

pub mod db;
pub mod schema;
pub mod telemetry;
