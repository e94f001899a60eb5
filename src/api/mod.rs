pub mod handlers;

use crate::db::PgRecordStore;
use crate::extract::NimVisionExtractor;
use crate::service::{IngestService, QueryService};
use crate::translate::NimSqlGenerator;

/// 生产环境下两条编排服务的具体类型
pub type AppIngestService = IngestService<NimVisionExtractor, PgRecordStore>;
pub type AppQueryService = QueryService<NimSqlGenerator, PgRecordStore>;

pub use handlers::{
    ask_question, export_query_csv, get_document, get_schema, health_check, ingest_invoice,
};
