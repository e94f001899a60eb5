pub mod api;
pub mod config;
pub mod db;
pub mod extract;
pub mod guard;
pub mod models;
pub mod nim;
pub mod schema;
pub mod service;
pub mod translate;

pub use config::AppConfig;
pub use db::{create_pool, PgRecordStore};
pub use service::{IngestService, QueryService};
