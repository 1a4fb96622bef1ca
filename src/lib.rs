pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod features;
pub mod ingest;
pub mod logger;
pub mod model;
pub mod predict;
pub mod source;
pub mod time;
