pub mod query;
pub mod raw;
pub mod record;

pub use query::{
    CandidateQuery, ColumnDescription, GuardedQuery, QueryResult, SchemaDescription, SqlValue,
};
pub use raw::RawExtraction;
pub use record::{InvoiceRecord, LineItem, StoredDocument, StoredLineItem};
