/// Schema 注册表: 规范表结构与必填字段的唯一事实来源
/// 只提供查表, 不含行为; 守卫与翻译接地用的实时 Schema 由 Store 按此过滤
pub struct SchemaRegistry;

pub const TABLE_DOCUMENTS: &str = "documents";
pub const TABLE_ITEMS: &str = "items";
pub const TABLE_INGEST_FAILURES: &str = "ingest_failures";

/// 必填字段: 缺失或低置信度时置 needs_review (不阻断入库)
/// 只有 total_amount 是报表查询绕不开的字段; 其余字段缺失走置信度/诊断路径
pub const REQUIRED_FIELDS: &[&str] = &["total_amount"];

/// documents 表可查询列 (raw_source/field_confidence 仅审计, 不暴露给生成 SQL)
const DOCUMENT_COLUMNS: &[&str] = &[
    "id",
    "vendor_name",
    "vendor_address",
    "vendor_phone",
    "vendor_email",
    "invoice_number",
    "invoice_date",
    "due_date",
    "po_number",
    "subtotal_amount",
    "tax_amount",
    "total_amount",
    "currency",
    "needs_review",
    "created_at",
];

const ITEM_COLUMNS: &[&str] = &[
    "id",
    "document_id",
    "line_no",
    "description",
    "quantity",
    "unit_price",
    "line_total",
];

impl SchemaRegistry {
    /// 可查询表清单 (按固定顺序)
    pub fn queryable_tables() -> &'static [&'static str] {
        &[TABLE_DOCUMENTS, TABLE_ITEMS]
    }

    /// 某表的可查询列; 不可查询的表返回 None
    pub fn queryable_columns(table: &str) -> Option<&'static [&'static str]> {
        match table {
            TABLE_DOCUMENTS => Some(DOCUMENT_COLUMNS),
            TABLE_ITEMS => Some(ITEM_COLUMNS),
            _ => None,
        }
    }

    /// 建表 DDL (与原始后端 documents/items 结构对应, 金额用 BIGINT 最小货币单位)
    pub fn ddl() -> &'static [&'static str] {
        &[
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id BIGSERIAL PRIMARY KEY,
                vendor_name TEXT,
                vendor_address TEXT,
                vendor_phone TEXT,
                vendor_email TEXT,
                invoice_number TEXT,
                invoice_date DATE,
                due_date DATE,
                po_number TEXT,
                subtotal_amount BIGINT,
                tax_amount BIGINT,
                total_amount BIGINT,
                currency TEXT NOT NULL DEFAULT 'USD',
                needs_review BOOLEAN NOT NULL DEFAULT FALSE,
                field_confidence JSONB NOT NULL DEFAULT '{}'::jsonb,
                raw_source JSONB NOT NULL DEFAULT 'null'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id BIGSERIAL PRIMARY KEY,
                document_id BIGINT NOT NULL REFERENCES documents(id),
                line_no INT NOT NULL,
                description TEXT,
                quantity NUMERIC,
                unit_price BIGINT,
                line_total BIGINT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ingest_failures (
                id BIGSERIAL PRIMARY KEY,
                stage TEXT NOT NULL,
                reason TEXT NOT NULL,
                raw_output JSONB,
                failed_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_fields_are_queryable_document_columns() {
        let cols = SchemaRegistry::queryable_columns(TABLE_DOCUMENTS).unwrap();
        for field in REQUIRED_FIELDS {
            assert!(cols.contains(field), "{field} 不在可查询列中");
        }
    }

    #[test]
    fn audit_columns_are_not_queryable() {
        let cols = SchemaRegistry::queryable_columns(TABLE_DOCUMENTS).unwrap();
        assert!(!cols.contains(&"raw_source"));
        assert!(!cols.contains(&"field_confidence"));
    }

    #[test]
    fn failures_table_is_internal() {
        assert!(SchemaRegistry::queryable_columns(TABLE_INGEST_FAILURES).is_none());
        assert!(!SchemaRegistry::queryable_tables().contains(&TABLE_INGEST_FAILURES));
    }

    #[test]
    fn ddl_covers_all_tables() {
        let ddl = SchemaRegistry::ddl().join("\n");
        assert!(ddl.contains("documents"));
        assert!(ddl.contains("items"));
        assert!(ddl.contains("ingest_failures"));
    }
}
