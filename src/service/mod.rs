pub mod ask;
pub mod ingest;
pub mod retry;

pub use ask::{export_to_csv, AskError, QueryService};
pub use ingest::{IngestError, IngestOutcome, IngestService};
pub use retry::RetryPolicy;
