use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// 可查询 Schema 描述 (由 Store 实时提供, 供翻译与守卫接地)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    /// 表名 -> 列描述, 保持声明顺序
    pub tables: IndexMap<String, Vec<ColumnDescription>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub sql_type: String,
}

impl SchemaDescription {
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(&name.to_ascii_lowercase())
    }

    pub fn has_column(&self, column: &str) -> bool {
        let column = column.to_ascii_lowercase();
        self.tables
            .values()
            .any(|cols| cols.iter().any(|c| c.name == column))
    }

    pub fn table_has_column(&self, table: &str, column: &str) -> bool {
        let column = column.to_ascii_lowercase();
        self.tables
            .get(&table.to_ascii_lowercase())
            .is_some_and(|cols| cols.iter().any(|c| c.name == column))
    }

    /// 渲染成提示词里的 schema 文本: table(col TYPE, ...)
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (table, cols) in &self.tables {
            out.push_str(table);
            out.push('(');
            for (i, col) in cols.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&col.name);
                out.push(' ');
                out.push_str(&col.sql_type);
            }
            out.push_str(")\n");
        }
        out
    }
}

/// 翻译产物: 单条候选 SQL + 能力侧置信度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub sql: String,
    pub confidence: f64,
}

/// 守卫通过后的语句 (可能被注入行数上限)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardedQuery {
    pub sql: String,
    pub was_modified: bool,
}

/// 单元格值 (按列类型解码, 不做字符串化糊弄)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Numeric(BigDecimal),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

/// 单次自然语言查询的结果 (请求级临时对象, 不落库)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// 实际执行 (或被拒绝时尝试执行) 的语句
    pub generated_sql: String,
    pub columns: Vec<ColumnDescription>,
    pub rows: Vec<Vec<SqlValue>>,
    pub translation_confidence: f64,
    /// 守卫否决原因, 存在时 rows 必为空
    pub rejection_reason: Option<String>,
    pub was_modified: bool,
}

impl QueryResult {
    /// 守卫否决时的诊断结果: 保留被拒语句, 行集为空
    pub fn rejected(sql: String, confidence: f64, reason: String) -> Self {
        Self {
            generated_sql: sql,
            columns: Vec::new(),
            rows: Vec::new(),
            translation_confidence: confidence,
            rejection_reason: Some(reason),
            was_modified: false,
        }
    }
}
