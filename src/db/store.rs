use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};
use std::time::Duration;

use crate::models::{
    ColumnDescription, InvoiceRecord, SchemaDescription, SqlValue, StoredDocument, StoredLineItem,
};
use crate::schema::SchemaRegistry;

/// 持久化/元数据访问错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Tls(_) => StoreError::Unavailable(e.to_string()),
            _ => StoreError::Query(e.to_string()),
        }
    }
}

/// 查询执行错误: 只携带分类与安全消息, 原始库错误进日志不出边界
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("query timed out after {0} seconds")]
    Timeout(u64),
    #[error("schema drift detected while executing query")]
    SchemaDrift,
    #[error("result type mismatch")]
    TypeMismatch,
    #[error("store temporarily unavailable")]
    Unavailable,
    #[error("query execution failed")]
    Internal,
}

/// 记录存储适配器 (外部关系库的窄接口)
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 单事务写入单据 + 明细, 全有或全无
    async fn persist(&self, record: &InvoiceRecord) -> Result<i64, StoreError>;

    /// 留痕失败的摄取 (绝不静默丢弃)
    async fn record_failure(
        &self,
        stage: &str,
        reason: &str,
        raw: Option<&Value>,
    ) -> Result<(), StoreError>;

    /// 实时 Schema 描述, 经注册表过滤后供翻译/守卫接地
    async fn describe_schema(&self) -> Result<SchemaDescription, StoreError>;

    /// 只读事务内执行已过守卫的语句
    async fn run_read_only(
        &self,
        sql: &str,
        timeout: Duration,
    ) -> Result<(Vec<ColumnDescription>, Vec<Vec<SqlValue>>), ExecutionError>;

    async fn fetch_document(
        &self,
        id: i64,
    ) -> Result<Option<(StoredDocument, Vec<StoredLineItem>)>, StoreError>;
}

/// PostgreSQL 实现
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 启动时建表 (IF NOT EXISTS, 与原始后端 init_db 对应)
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for ddl in SchemaRegistry::ddl() {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        tracing::info!("database schema ready");
        Ok(())
    }

    async fn execute_read_only(
        &self,
        sql: &str,
        timeout: Duration,
    ) -> Result<(Vec<ColumnDescription>, Vec<Vec<SqlValue>>), ExecutionError> {
        let timeout_secs = timeout.as_secs().max(1);
        let mut tx = self.pool.begin().await.map_err(|e| {
            tracing::warn!("read-only tx begin failed: {e}");
            ExecutionError::Unavailable
        })?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_pg_error(e, timeout_secs))?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| classify_pg_error(e, timeout_secs))?;

        let rows = sqlx::query(sql)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| classify_pg_error(e, timeout_secs))?;

        // 只读事务无写入, commit 仅结束快照
        tx.commit().await.map_err(|e| {
            tracing::warn!("read-only tx commit failed: {e}");
            ExecutionError::Unavailable
        })?;

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| ColumnDescription {
                        name: c.name().to_string(),
                        sql_type: c.type_info().name().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            decoded.push(decode_row(row)?);
        }
        Ok((columns, decoded))
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn persist(&self, record: &InvoiceRecord) -> Result<i64, StoreError> {
        let field_confidence = serde_json::to_value(&record.field_confidence)
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        let document_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO documents (
                vendor_name, vendor_address, vendor_phone, vendor_email,
                invoice_number, invoice_date, due_date, po_number,
                subtotal_amount, tax_amount, total_amount, currency,
                needs_review, field_confidence, raw_source
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id
            "#,
        )
        .bind(record.vendor_name.clone())
        .bind(record.vendor_address.clone())
        .bind(record.vendor_phone.clone())
        .bind(record.vendor_email.clone())
        .bind(record.invoice_number.clone())
        .bind(record.invoice_date)
        .bind(record.due_date)
        .bind(record.po_number.clone())
        .bind(record.subtotal_amount)
        .bind(record.tax_amount)
        .bind(record.total_amount)
        .bind(record.currency.clone())
        .bind(record.needs_review)
        .bind(field_confidence)
        .bind(record.raw_source.clone())
        .fetch_one(&mut *tx)
        .await?;

        if !record.line_items.is_empty() {
            // 批量插入明细 (QueryBuilder 拼一条语句)
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO items (document_id, line_no, description, quantity, unit_price, line_total) ",
            );
            query_builder.push_values(
                record.line_items.iter().enumerate(),
                |mut b, (idx, item)| {
                    b.push_bind(document_id)
                        .push_bind((idx + 1) as i32)
                        .push_bind(item.description.clone())
                        .push_bind(item.quantity.clone())
                        .push_bind(item.unit_price)
                        .push_bind(item.line_total);
                },
            );

            // 添加超时控制: 30秒
            let execute_result = tokio::time::timeout(
                Duration::from_secs(30),
                query_builder.build().execute(&mut *tx),
            )
            .await;

            match execute_result {
                Ok(Ok(result)) => {
                    tracing::debug!("inserted {} line items", result.rows_affected());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    tracing::error!("✗ line item INSERT 超时 (>30秒)!");
                    return Err(StoreError::Unavailable("line item insert timed out".into()));
                }
            }
        }

        tx.commit().await?;
        tracing::info!(
            "✓ document {} persisted, {} line items, needs_review={}",
            document_id,
            record.line_items.len(),
            record.needs_review
        );
        Ok(document_id)
    }

    async fn record_failure(
        &self,
        stage: &str,
        reason: &str,
        raw: Option<&Value>,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO ingest_failures (stage, reason, raw_output) VALUES ($1, $2, $3)")
            .bind(stage)
            .bind(reason)
            .bind(raw.cloned())
            .execute(&self.pool)
            .await?;
        tracing::warn!("ingest failure recorded at stage {stage}: {reason}");
        Ok(())
    }

    async fn describe_schema(&self) -> Result<SchemaDescription, StoreError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT table_name, column_name, data_type
            FROM information_schema.columns
            WHERE table_schema = 'public'
            ORDER BY table_name, ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // 注册表过滤: 审计列与内部表不进入可查询 Schema
        let mut tables = IndexMap::new();
        for table in SchemaRegistry::queryable_tables() {
            let Some(allowed) = SchemaRegistry::queryable_columns(table) else {
                continue;
            };
            let columns: Vec<ColumnDescription> = rows
                .iter()
                .filter(|(t, c, _)| t == table && allowed.contains(&c.as_str()))
                .map(|(_, c, ty)| ColumnDescription {
                    name: c.clone(),
                    sql_type: ty.to_ascii_uppercase(),
                })
                .collect();
            if !columns.is_empty() {
                tables.insert((*table).to_string(), columns);
            }
        }
        Ok(SchemaDescription { tables })
    }

    async fn run_read_only(
        &self,
        sql: &str,
        timeout: Duration,
    ) -> Result<(Vec<ColumnDescription>, Vec<Vec<SqlValue>>), ExecutionError> {
        let timeout_secs = timeout.as_secs().max(1);
        // 库级 statement_timeout 之外再包一层兜底超时
        match tokio::time::timeout(timeout + Duration::from_secs(2), self.execute_read_only(sql, timeout)).await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("✗ query exceeded outer timeout ({timeout_secs}s): {sql}");
                Err(ExecutionError::Timeout(timeout_secs))
            }
        }
    }

    async fn fetch_document(
        &self,
        id: i64,
    ) -> Result<Option<(StoredDocument, Vec<StoredLineItem>)>, StoreError> {
        let document: Option<StoredDocument> = sqlx::query_as(
            r#"
            SELECT id, vendor_name, vendor_address, vendor_phone, vendor_email,
                   invoice_number, invoice_date, due_date, po_number,
                   subtotal_amount, tax_amount, total_amount, currency,
                   needs_review, field_confidence, raw_source, created_at
            FROM documents
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(document) = document else {
            return Ok(None);
        };

        let items: Vec<StoredLineItem> = sqlx::query_as(
            r#"
            SELECT id, document_id, line_no, description, quantity, unit_price, line_total
            FROM items
            WHERE document_id = $1
            ORDER BY line_no
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some((document, items)))
    }
}

/// SQLSTATE 分类; 原始错误文本只进日志
fn classify_pg_error(e: sqlx::Error, timeout_secs: u64) -> ExecutionError {
    if let sqlx::Error::Database(db_err) = &e {
        let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
        tracing::warn!("query failed with SQLSTATE {code}: {db_err}");
        return match code.as_str() {
            // query_canceled: statement_timeout 触发
            "57014" => ExecutionError::Timeout(timeout_secs),
            // undefined_column / undefined_table: 接地后才漂移的 schema 竞态
            "42703" | "42P01" => ExecutionError::SchemaDrift,
            // 类型不匹配 / 非法文本表示
            "42804" | "22P02" | "42883" => ExecutionError::TypeMismatch,
            _ => ExecutionError::Internal,
        };
    }
    tracing::warn!("query failed: {e}");
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ExecutionError::Unavailable
        }
        _ => ExecutionError::Internal,
    }
}

/// 按列类型逐格解码成 SqlValue
fn decode_row(row: &PgRow) -> Result<Vec<SqlValue>, ExecutionError> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => row.try_get::<Option<bool>, _>(i).map(opt(SqlValue::Bool)),
            "INT2" => row
                .try_get::<Option<i16>, _>(i)
                .map(opt(|v: i16| SqlValue::Int(v as i64))),
            "INT4" => row
                .try_get::<Option<i32>, _>(i)
                .map(opt(|v: i32| SqlValue::Int(v as i64))),
            "INT8" => row.try_get::<Option<i64>, _>(i).map(opt(SqlValue::Int)),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)
                .map(opt(|v: f32| SqlValue::Float(v as f64))),
            "FLOAT8" => row.try_get::<Option<f64>, _>(i).map(opt(SqlValue::Float)),
            "NUMERIC" => row
                .try_get::<Option<BigDecimal>, _>(i)
                .map(opt(SqlValue::Numeric)),
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(i)
                .map(opt(SqlValue::Date)),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(i)
                .map(opt(SqlValue::Timestamp)),
            "TIMESTAMP" => row.try_get::<Option<NaiveDateTime>, _>(i).map(opt(|v| {
                SqlValue::Timestamp(DateTime::from_naive_utc_and_offset(v, Utc))
            })),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(i)
                .map(opt(SqlValue::Json)),
            _ => row.try_get::<Option<String>, _>(i).map(opt(SqlValue::Text)),
        };

        match value {
            Ok(v) => values.push(v),
            Err(e) => {
                tracing::warn!("column {} decode failed: {e}", column.name());
                return Err(ExecutionError::TypeMismatch);
            }
        }
    }
    Ok(values)
}

fn opt<T>(wrap: impl Fn(T) -> SqlValue) -> impl Fn(Option<T>) -> SqlValue {
    move |v| v.map(&wrap).unwrap_or(SqlValue::Null)
}
