use std::time::Duration;

use crate::config::QueryConfig;
use crate::db::{ExecutionError, RecordStore, StoreError};
use crate::guard::{self, GuardError};
use crate::models::{QueryResult, SchemaDescription, SqlValue};
#[cfg(test)]
use crate::nim::CapabilityError;
use crate::service::retry::RetryPolicy;
use crate::translate::{SqlGenerator, TranslationError, Translator};

/// 查询链路错误 (守卫否决不算错误, 以 QueryResult.rejection_reason 返回)
#[derive(Debug, thiserror::Error)]
pub enum AskError {
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("csv export failed: {0}")]
    Export(String),
}

/// 查询编排: Received -> Translated -> Guarded -> Executed -> Returned
/// 守卫拒绝是确定性的, 绝不重试; 翻译能力瞬时失败只重试一次
pub struct QueryService<G: SqlGenerator, S> {
    translator: Translator<G>,
    store: S,
    query: QueryConfig,
    retry: RetryPolicy,
}

impl<G: SqlGenerator, S: RecordStore> QueryService<G, S> {
    pub fn new(generator: G, store: S, query: QueryConfig, retry: RetryPolicy) -> Self {
        let translator = Translator::new(generator, query.min_translation_confidence);
        Self {
            translator,
            store,
            query,
            retry: retry.single_retry(),
        }
    }

    pub async fn ask(&self, question: &str) -> Result<QueryResult, AskError> {
        tracing::info!("query received: {question}");

        // 接地用的 Schema 每次实时取, 不缓存过期结构
        let schema = self.store.describe_schema().await?;

        // 1. 翻译 (瞬时失败重试一次)
        let candidate = self
            .retry
            .run(
                "sql translation",
                || self.translator.translate(question, &schema),
                |e: &TranslationError| {
                    matches!(e, TranslationError::Capability(c) if c.is_transient())
                },
            )
            .await?;
        tracing::info!("query translated: {}", candidate.sql);

        // 2. 守卫 (否决即终态, 原因进日志, 用户只见分类)
        let guarded = match guard::check(&candidate, &schema, self.query.max_rows) {
            Ok(guarded) => guarded,
            Err(e) => {
                // 未接地标识符由守卫发现, 但按翻译层错误记录
                if let GuardError::UnknownIdentifier(name) = &e {
                    let cause = TranslationError::Ungrounded(name.clone());
                    tracing::warn!("query rejected: {cause}; attempted sql: {}", candidate.sql);
                } else {
                    tracing::warn!("query rejected by guard: {e}; attempted sql: {}", candidate.sql);
                }
                return Ok(QueryResult::rejected(
                    candidate.sql,
                    candidate.confidence,
                    classify_rejection(&e),
                ));
            }
        };
        if guarded.was_modified {
            tracing::info!("row bound injected: {}", guarded.sql);
        }

        // 3. 执行 (只读快照 + 超时, 超时不自动重试)
        let timeout = Duration::from_secs(self.query.timeout_secs);
        let (columns, rows) = self.store.run_read_only(&guarded.sql, timeout).await?;
        tracing::info!("query returned {} rows", rows.len());

        Ok(QueryResult {
            generated_sql: guarded.sql,
            columns,
            rows,
            translation_confidence: candidate.confidence,
            rejection_reason: None,
            was_modified: guarded.was_modified,
        })
    }

    /// 当前可查询 Schema (前端展示用)
    pub async fn schema(&self) -> Result<SchemaDescription, StoreError> {
        self.store.describe_schema().await
    }
}

/// 守卫错误 -> 面向用户的拒绝分类 (不透出具体标识符/函数名)
fn classify_rejection(error: &GuardError) -> String {
    match error {
        GuardError::DisallowedStatementKind => {
            "could not safely answer: only read-only queries are allowed".to_string()
        }
        GuardError::MultiStatementRejected => {
            "could not safely answer: multiple statements are not allowed".to_string()
        }
        // 未接地标识符以翻译层分类回报调用方
        GuardError::UnknownIdentifier(_) => {
            "could not safely answer: the question references data not present in the records"
                .to_string()
        }
        GuardError::DisallowedFunction(_) => {
            "could not safely answer: the generated query uses a disallowed function".to_string()
        }
    }
}

/// 查询结果导出为 CSV (表头 + 行)
pub fn export_to_csv(result: &QueryResult) -> Result<String, AskError> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    writer
        .write_record(result.columns.iter().map(|c| c.name.as_str()))
        .map_err(|e| AskError::Export(e.to_string()))?;

    for row in &result.rows {
        writer
            .write_record(row.iter().map(csv_cell))
            .map_err(|e| AskError::Export(e.to_string()))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AskError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| AskError::Export(e.to_string()))
}

fn csv_cell(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Bool(v) => v.to_string(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::Float(v) => v.to_string(),
        SqlValue::Numeric(v) => v.to_string(),
        SqlValue::Text(v) => v.clone(),
        SqlValue::Date(v) => v.format("%Y-%m-%d").to_string(),
        SqlValue::Timestamp(v) => v.to_rfc3339(),
        SqlValue::Json(v) => v.to_string(),
    }
}
