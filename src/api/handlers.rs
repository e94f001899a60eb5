use crate::api::{AppIngestService, AppQueryService};
use crate::db::{ExecutionError, StoreError};
use crate::models::{QueryResult, SchemaDescription, StoredDocument, StoredLineItem};
use crate::nim::CapabilityError;
use crate::service::{export_to_csv, AskError, IngestError};
use crate::translate::TranslationError;
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 请求体: base64 图片 + 格式名
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub image_base64: String,
    pub format: String,
}

/// 响应体
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub message: String,
    pub document_id: Option<i64>,
    pub needs_review: Option<bool>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    pub message: String,
    pub result: Option<QueryResult>,
}

#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub success: bool,
    pub message: String,
    pub document: Option<StoredDocument>,
    pub items: Vec<StoredLineItem>,
}

#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub success: bool,
    pub message: String,
    pub schema: Option<SchemaDescription>,
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 发票摄取接口
pub async fn ingest_invoice(
    State(service): State<Arc<AppIngestService>>,
    Json(req): Json<IngestRequest>,
) -> Response {
    let image = match BASE64.decode(req.image_base64.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            let response = IngestResponse {
                success: false,
                message: format!("invalid base64 image: {e}"),
                document_id: None,
                needs_review: None,
                warnings: Vec::new(),
            };
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    match service.ingest(&image, &req.format).await {
        Ok(outcome) => {
            let response = IngestResponse {
                success: true,
                message: format!("document {} persisted", outcome.document_id),
                document_id: Some(outcome.document_id),
                needs_review: Some(outcome.needs_review),
                warnings: outcome.warnings,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            let response = IngestResponse {
                success: false,
                message: ingest_error_message(&e),
                document_id: None,
                needs_review: None,
                warnings: Vec::new(),
            };
            (ingest_error_status(&e), Json(response)).into_response()
        }
    }
}

/// 自然语言查询接口
pub async fn ask_question(
    State(service): State<Arc<AppQueryService>>,
    Json(req): Json<QueryRequest>,
) -> Response {
    match service.ask(&req.question).await {
        Ok(result) => {
            let success = result.rejection_reason.is_none();
            let message = result
                .rejection_reason
                .clone()
                .unwrap_or_else(|| format!("{} rows returned", result.rows.len()));
            let response = QueryResponse {
                success,
                message,
                result: Some(result),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            let response = QueryResponse {
                success: false,
                message: ask_error_message(&e),
                result: None,
            };
            (ask_error_status(&e), Json(response)).into_response()
        }
    }
}

/// 查询结果 CSV 导出接口
pub async fn export_query_csv(
    State(service): State<Arc<AppQueryService>>,
    Json(req): Json<QueryRequest>,
) -> Response {
    let result = match service.ask(&req.question).await {
        Ok(result) => result,
        Err(e) => {
            let response = QueryResponse {
                success: false,
                message: ask_error_message(&e),
                result: None,
            };
            return (ask_error_status(&e), Json(response)).into_response();
        }
    };

    if let Some(reason) = &result.rejection_reason {
        let response = QueryResponse {
            success: false,
            message: reason.clone(),
            result: Some(result.clone()),
        };
        return (StatusCode::OK, Json(response)).into_response();
    }

    match export_to_csv(&result) {
        Ok(csv) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            csv,
        )
            .into_response(),
        Err(e) => {
            let response = QueryResponse {
                success: false,
                message: ask_error_message(&e),
                result: None,
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
        }
    }
}

/// 按 id 回读单据
pub async fn get_document(
    State(service): State<Arc<AppIngestService>>,
    Path(id): Path<i64>,
) -> Response {
    match service.document(id).await {
        Ok(Some((document, items))) => {
            let response = DocumentResponse {
                success: true,
                message: format!("document {id}"),
                document: Some(document),
                items,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(None) => {
            let response = DocumentResponse {
                success: false,
                message: format!("document {id} not found"),
                document: None,
                items: Vec::new(),
            };
            (StatusCode::NOT_FOUND, Json(response)).into_response()
        }
        Err(e) => {
            let response = DocumentResponse {
                success: false,
                message: store_error_message(&e),
                document: None,
                items: Vec::new(),
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(response)).into_response()
        }
    }
}

/// 当前可查询 Schema
pub async fn get_schema(State(service): State<Arc<AppQueryService>>) -> Response {
    match service.schema().await {
        Ok(schema) => {
            let response = SchemaResponse {
                success: true,
                message: format!("{} queryable tables", schema.tables.len()),
                schema: Some(schema),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            let response = SchemaResponse {
                success: false,
                message: store_error_message(&e),
                schema: None,
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(response)).into_response()
        }
    }
}

/// 瞬时类失败与"输入被拒绝"必须给用户不同的话术; 原始错误只进日志
fn ingest_error_message(e: &IngestError) -> String {
    match e {
        IngestError::UnsupportedFormat(name) => format!("unsupported image format: {name}"),
        IngestError::Capability(CapabilityError::Transient(_)) => {
            "extraction service temporarily unavailable, please retry".to_string()
        }
        IngestError::Capability(CapabilityError::Permanent(_)) => {
            "the image could not be processed by the extraction service".to_string()
        }
        IngestError::Extraction(_) => {
            "extraction output could not be parsed into an invoice".to_string()
        }
        IngestError::Store(_) => "storage temporarily unavailable, please retry".to_string(),
    }
}

fn ingest_error_status(e: &IngestError) -> StatusCode {
    match e {
        IngestError::UnsupportedFormat(_)
        | IngestError::Capability(CapabilityError::Permanent(_))
        | IngestError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
        IngestError::Capability(CapabilityError::Transient(_)) | IngestError::Store(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn ask_error_message(e: &AskError) -> String {
    match e {
        AskError::Translation(TranslationError::Ambiguous { .. }) => {
            "the question is too ambiguous to answer, please rephrase".to_string()
        }
        AskError::Translation(TranslationError::Ungrounded(_)) => {
            "the question references data not present in the records".to_string()
        }
        AskError::Translation(TranslationError::Capability(CapabilityError::Transient(_))) => {
            "translation service temporarily unavailable, please retry".to_string()
        }
        AskError::Translation(TranslationError::Capability(CapabilityError::Permanent(_))) => {
            "the question could not be translated".to_string()
        }
        AskError::Execution(ExecutionError::Timeout(secs)) => {
            format!("query timed out after {secs} seconds")
        }
        AskError::Execution(ExecutionError::Unavailable) | AskError::Store(_) => {
            "storage temporarily unavailable, please retry".to_string()
        }
        AskError::Execution(_) => "query execution failed".to_string(),
        AskError::Export(_) => "csv export failed".to_string(),
    }
}

fn ask_error_status(e: &AskError) -> StatusCode {
    match e {
        AskError::Translation(TranslationError::Capability(CapabilityError::Transient(_))) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AskError::Translation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AskError::Execution(ExecutionError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        AskError::Execution(ExecutionError::Unavailable) | AskError::Store(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AskError::Execution(_) | AskError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_error_message(e: &StoreError) -> String {
    match e {
        StoreError::Unavailable(_) => "storage temporarily unavailable, please retry".to_string(),
        StoreError::Query(_) => "storage query failed".to_string(),
    }
}
