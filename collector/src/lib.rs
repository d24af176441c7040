pub mod api;
pub mod axis;
pub mod config;
pub mod credentials;
pub mod db;
pub mod devices;
pub mod display;
pub mod errors;
pub mod export;
pub mod ingest;
pub mod measurements;
pub mod metrics;
pub mod model;
pub mod pagination;
pub mod plot;
pub mod rest;
pub mod runs;
pub mod tz;
pub mod users;
