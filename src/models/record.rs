use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// 规范化发票记录 (每张单据一条, 入库时分配 id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: Option<i64>,
    pub vendor_name: Option<String>,
    pub vendor_address: Option<String>,
    pub vendor_phone: Option<String>,
    pub vendor_email: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub po_number: Option<String>,
    pub subtotal_amount: Option<i64>, // 最小货币单位 (分), 避免浮点聚合误差
    pub tax_amount: Option<i64>,
    pub total_amount: Option<i64>,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    /// 字段级置信度 [0,1], 保持抽取顺序
    pub field_confidence: IndexMap<String, f64>,
    pub needs_review: bool,
    /// 字段级解析诊断 (不中断入库)
    pub warnings: Vec<String>,
    /// 模型原始输出, 仅留存审计, 不参与查询
    pub raw_source: serde_json::Value,
}

/// 发票明细行 (顺序即抽取顺序)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: Option<String>,
    pub quantity: Option<BigDecimal>,
    pub unit_price: Option<i64>, // 最小货币单位
    pub line_total: Option<i64>,
}

/// 入库后回读用的单据行 (documents 表)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredDocument {
    pub id: i64,
    pub vendor_name: Option<String>,
    pub vendor_address: Option<String>,
    pub vendor_phone: Option<String>,
    pub vendor_email: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub po_number: Option<String>,
    pub subtotal_amount: Option<i64>,
    pub tax_amount: Option<i64>,
    pub total_amount: Option<i64>,
    pub currency: String,
    pub needs_review: bool,
    pub field_confidence: serde_json::Value,
    pub raw_source: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// 明细行回读 (items 表)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredLineItem {
    pub id: i64,
    pub document_id: i64,
    pub line_no: i32,
    pub description: Option<String>,
    pub quantity: Option<BigDecimal>,
    pub unit_price: Option<i64>,
    pub line_total: Option<i64>,
}

impl InvoiceRecord {
    /// 明细行合计 + 税额, 用于与 total_amount 对账
    /// 任一参与值缺失时返回 None (无法对账, 不强行判定)
    pub fn reconciled_sum(&self) -> Option<i64> {
        if self.line_items.is_empty() {
            return None;
        }
        let mut sum: i64 = 0;
        for item in &self.line_items {
            sum = sum.checked_add(item.line_total?)?;
        }
        sum.checked_add(self.tax_amount.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(total: Option<i64>) -> LineItem {
        LineItem {
            description: Some("A".to_string()),
            quantity: Some(BigDecimal::from(1)),
            unit_price: total,
            line_total: total,
        }
    }

    fn base_record() -> InvoiceRecord {
        InvoiceRecord {
            id: None,
            vendor_name: Some("ACME".to_string()),
            vendor_address: None,
            vendor_phone: None,
            vendor_email: None,
            invoice_number: Some("INV-1".to_string()),
            invoice_date: None,
            due_date: None,
            po_number: None,
            subtotal_amount: None,
            tax_amount: Some(100),
            total_amount: Some(12445),
            currency: "USD".to_string(),
            line_items: vec![item(Some(12345))],
            field_confidence: IndexMap::new(),
            needs_review: false,
            warnings: Vec::new(),
            raw_source: serde_json::Value::Null,
        }
    }

    #[test]
    fn reconciled_sum_adds_tax() {
        let rec = base_record();
        assert_eq!(rec.reconciled_sum(), Some(12445));
    }

    #[test]
    fn reconciled_sum_none_when_item_total_missing() {
        let mut rec = base_record();
        rec.line_items.push(item(None));
        assert_eq!(rec.reconciled_sum(), None);
    }

    #[test]
    fn reconciled_sum_none_without_items() {
        let mut rec = base_record();
        rec.line_items.clear();
        assert_eq!(rec.reconciled_sum(), None);
    }
}
