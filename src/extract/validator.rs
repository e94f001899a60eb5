use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde_json::Value;
use std::str::FromStr;

use crate::config::ExtractionConfig;
use crate::models::{InvoiceRecord, LineItem, RawExtraction};
use crate::schema::REQUIRED_FIELDS;

use super::ExtractionError;

/// 日期格式按序尝试, 首个命中生效 (不猜测, 解析失败即置空)
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%b %d, %Y",
    "%d %b %Y",
];

/// 记录级置信度覆盖的字段 (与 documents 可查询列对应)
const CONFIDENCE_FIELDS: &[&str] = &[
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
];

/// 把模型原始输出校验为规范记录
/// 纯函数: 同一输入两次调用产出逐字节相同的记录 (无时钟/随机依赖)
/// 字段级失败只置空该字段并记 warning, 不使整次调用失败;
/// 仅信封整体不可解析时返回 Malformed
pub fn validate(raw: &Value, cfg: &ExtractionConfig) -> Result<InvoiceRecord, ExtractionError> {
    let envelope: RawExtraction = serde_json::from_value(raw.clone())
        .map_err(|e| ExtractionError::Malformed(e.to_string()))?;

    let mut warnings: Vec<String> = Vec::new();

    // 1. 文本字段: 去空白, 空串视为缺失
    let vendor_name = clean_text(envelope.vendor.name);
    let vendor_address = clean_text(envelope.vendor.address);
    let vendor_phone = clean_text(envelope.vendor.phone);
    let vendor_email = clean_text(envelope.vendor.email);
    let invoice_number = clean_text(envelope.order_details.invoice_number);
    let po_number = clean_text(envelope.order_details.po_number);

    // 2. 日期: 按格式表顺序解析, 失败置空 + 诊断
    let invoice_date = parse_date(
        "invoice_date",
        envelope.order_details.invoice_date.as_deref(),
        &mut warnings,
    );
    let due_date = parse_date(
        "due_date",
        envelope.order_details.due_date.as_deref(),
        &mut warnings,
    );

    // 3. 金额: 容忍货币符号/千分位, 定点化为最小货币单位
    let subtotal_amount = parse_money(
        "subtotal_amount",
        envelope.payment_details.subtotal.as_ref(),
        &mut warnings,
    );
    let tax_amount = parse_money(
        "tax_amount",
        envelope.payment_details.tax.as_ref(),
        &mut warnings,
    );
    let total_amount = parse_money(
        "total_amount",
        envelope.payment_details.total.as_ref(),
        &mut warnings,
    );
    let currency = clean_text(envelope.payment_details.currency)
        .unwrap_or_else(|| "USD".to_string());

    // 4. 明细行: 保持抽取顺序, 全空行跳过
    let mut line_items = Vec::with_capacity(envelope.items.len());
    for (idx, item) in envelope.items.iter().enumerate() {
        let line_no = idx + 1;
        let description = clean_text(item.description.clone());
        let quantity = parse_quantity(
            &format!("items[{line_no}].quantity"),
            item.quantity.as_ref(),
            &mut warnings,
        );
        let unit_price = parse_money(
            &format!("items[{line_no}].unit_price"),
            item.unit_price.as_ref(),
            &mut warnings,
        );
        let line_total = parse_money(
            &format!("items[{line_no}].line_total"),
            item.line_total.as_ref(),
            &mut warnings,
        );

        if description.is_none() && quantity.is_none() && unit_price.is_none() && line_total.is_none()
        {
            warnings.push(format!("items[{line_no}]: empty line skipped"));
            continue;
        }

        line_items.push(LineItem {
            description,
            quantity,
            unit_price,
            line_total,
        });
    }

    // 5. 置信度: 模型未给出的字段取中性默认值, 越界值截断到 [0,1]
    let mut field_confidence = IndexMap::with_capacity(CONFIDENCE_FIELDS.len());
    for field in CONFIDENCE_FIELDS {
        let score = envelope
            .confidence
            .get(*field)
            .copied()
            .unwrap_or(cfg.neutral_confidence)
            .clamp(0.0, 1.0);
        field_confidence.insert((*field).to_string(), score);
    }

    let mut record = InvoiceRecord {
        id: None,
        vendor_name,
        vendor_address,
        vendor_phone,
        vendor_email,
        invoice_number,
        invoice_date,
        due_date,
        po_number,
        subtotal_amount,
        tax_amount,
        total_amount,
        currency,
        line_items,
        field_confidence,
        needs_review: false,
        warnings,
        raw_source: raw.clone(),
    };

    // 6. 对账不变式: total 与 明细合计+税额 偏差超容差只标记, 不丢数据
    if let (Some(total), Some(sum)) = (record.total_amount, record.reconciled_sum()) {
        if (total - sum).abs() > cfg.reconcile_tolerance_minor {
            record.warnings.push(format!(
                "total_amount {total} differs from line items + tax {sum} beyond tolerance {}",
                cfg.reconcile_tolerance_minor
            ));
        }
    }

    record.needs_review = derive_needs_review(&record, cfg);
    Ok(record)
}

/// needs_review 推导: 必填字段缺失/低置信度, 或存在任何字段级诊断
fn derive_needs_review(record: &InvoiceRecord, cfg: &ExtractionConfig) -> bool {
    for field in REQUIRED_FIELDS {
        if required_field_missing(record, field) {
            return true;
        }
        let confidence = record.field_confidence.get(*field).copied().unwrap_or(0.0);
        if confidence < cfg.review_threshold {
            return true;
        }
    }
    !record.warnings.is_empty()
}

fn required_field_missing(record: &InvoiceRecord, field: &str) -> bool {
    match field {
        "vendor_name" => record.vendor_name.is_none(),
        "invoice_number" => record.invoice_number.is_none(),
        "invoice_date" => record.invoice_date.is_none(),
        "total_amount" => record.total_amount.is_none(),
        _ => false,
    }
}

fn clean_text(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_date(field: &str, value: Option<&str>, warnings: &mut Vec<String>) -> Option<NaiveDate> {
    let text = value?.trim();
    if text.is_empty() {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }
    warnings.push(format!("{field}: unparseable date '{text}'"));
    None
}

/// 金额值 -> 最小货币单位; 数字与字符串两种形态都接受
fn parse_money(field: &str, value: Option<&Value>, warnings: &mut Vec<String>) -> Option<i64> {
    match value? {
        Value::Null => None,
        Value::Number(n) => match decimal_to_minor(&n.to_string()) {
            Some(minor) => Some(minor),
            None => {
                warnings.push(format!("{field}: unparseable amount '{n}'"));
                None
            }
        },
        Value::String(s) => {
            if s.trim().is_empty() {
                return None;
            }
            match parse_money_text(s) {
                Some(minor) => Some(minor),
                None => {
                    warnings.push(format!("{field}: unparseable amount '{s}'"));
                    None
                }
            }
        }
        other => {
            warnings.push(format!("{field}: unexpected amount value {other}"));
            None
        }
    }
}

/// 剥离货币符号/千分位/币种字母后按十进制解析
fn parse_money_text(text: &str) -> Option<i64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    decimal_to_minor(&cleaned)
}

/// 十进制文本 -> 分 (四舍五入到两位小数, 避免浮点累计误差)
fn decimal_to_minor(text: &str) -> Option<i64> {
    let dec = BigDecimal::from_str(text).ok()?;
    (dec * BigDecimal::from(100))
        .round(0)
        .to_i64()
}

fn parse_quantity(
    field: &str,
    value: Option<&Value>,
    warnings: &mut Vec<String>,
) -> Option<BigDecimal> {
    match value? {
        Value::Null => None,
        Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        Value::String(s) => {
            if s.trim().is_empty() {
                return None;
            }
            match BigDecimal::from_str(s.trim()) {
                Ok(q) => Some(q),
                Err(_) => {
                    warnings.push(format!("{field}: unparseable quantity '{s}'"));
                    None
                }
            }
        }
        other => {
            warnings.push(format!("{field}: unexpected quantity value {other}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg() -> ExtractionConfig {
        ExtractionConfig {
            review_threshold: 0.5,
            neutral_confidence: 0.5,
            reconcile_tolerance_minor: 1,
        }
    }

    #[test]
    fn balanced_invoice_in_minor_units() {
        // 规范场景: $123.45 = 12345 分, 明细+税额与总额对平
        let raw = json!({
            "payment_details": {"total": "$123.45", "tax": "0.00"},
            "items": [{"description": "A", "quantity": 1, "unit_price": "123.45", "amount": "123.45"}]
        });
        let rec = validate(&raw, &cfg()).unwrap();
        assert_eq!(rec.total_amount, Some(12345));
        assert_eq!(rec.tax_amount, Some(0));
        assert_eq!(rec.line_items.len(), 1);
        assert_eq!(rec.line_items[0].line_total, Some(12345));
        assert!(!rec.needs_review, "warnings: {:?}", rec.warnings);
    }

    #[test]
    fn missing_required_field_flags_review_without_failing() {
        let rec = validate(&json!({}), &cfg()).unwrap();
        assert_eq!(rec.total_amount, None);
        assert!(rec.needs_review);
    }

    #[test]
    fn unparseable_amount_fails_field_only() {
        let raw = json!({"payment_details": {"total": "N/A", "tax": "1.00"}});
        let rec = validate(&raw, &cfg()).unwrap();
        assert_eq!(rec.total_amount, None);
        assert_eq!(rec.tax_amount, Some(100));
        assert!(rec.needs_review);
        assert!(rec.warnings.iter().any(|w| w.contains("total_amount")));
    }

    #[test]
    fn thousands_separator_and_symbol_tolerated() {
        let raw = json!({"payment_details": {"total": "$1,234.56"}});
        let rec = validate(&raw, &cfg()).unwrap();
        assert_eq!(rec.total_amount, Some(123456));
    }

    #[test]
    fn numeric_amounts_do_not_drift() {
        let raw = json!({"payment_details": {"total": 123.45, "tax": 0.1}});
        let rec = validate(&raw, &cfg()).unwrap();
        assert_eq!(rec.total_amount, Some(12345));
        assert_eq!(rec.tax_amount, Some(10));
    }

    #[test]
    fn date_formats_first_match_wins() {
        let raw = json!({"order_details": {"invoice_date": "03/04/2025"}});
        let rec = validate(&raw, &cfg()).unwrap();
        // 月/日/年 排在 日/月/年 之前
        assert_eq!(rec.invoice_date, NaiveDate::from_ymd_opt(2025, 3, 4));
    }

    #[test]
    fn unparseable_date_is_null_plus_diagnostic() {
        let raw = json!({"order_details": {"invoice_date": "sometime in March"}});
        let rec = validate(&raw, &cfg()).unwrap();
        assert_eq!(rec.invoice_date, None);
        assert!(rec.warnings.iter().any(|w| w.contains("invoice_date")));
        assert!(rec.needs_review);
    }

    #[test]
    fn reconciliation_mismatch_flags_but_keeps_data() {
        let raw = json!({
            "payment_details": {"total": "100.00", "tax": "0.00"},
            "items": [{"description": "A", "quantity": 1, "amount": "123.45"}]
        });
        let rec = validate(&raw, &cfg()).unwrap();
        assert_eq!(rec.total_amount, Some(10000));
        assert_eq!(rec.line_items[0].line_total, Some(12345));
        assert!(rec.needs_review);
        assert!(rec.warnings.iter().any(|w| w.contains("tolerance")));
    }

    #[test]
    fn model_confidence_overrides_neutral_default() {
        let raw = json!({
            "payment_details": {"total": "50.00"},
            "confidence": {"total_amount": 0.2}
        });
        let rec = validate(&raw, &cfg()).unwrap();
        assert_eq!(rec.field_confidence["total_amount"], 0.2);
        assert!(rec.needs_review); // 必填字段低置信度
        assert_eq!(rec.field_confidence["vendor_name"], 0.5); // 中性默认
    }

    #[test]
    fn malformed_envelope_fails_the_call() {
        let err = validate(&json!("unreadable response"), &cfg()).unwrap_err();
        assert!(matches!(err, ExtractionError::Malformed(_)));
    }

    #[test]
    fn validate_is_idempotent() {
        let raw = json!({
            "vendor": {"name": "ACME Corp"},
            "order_details": {"invoice_number": "INV-7", "invoice_date": "2025-06-01"},
            "payment_details": {"total": "99.99", "tax": "8.25"},
            "items": [{"description": "Widget", "quantity": "2.5", "unit_price": "36.70", "amount": "91.74"}]
        });
        let first = validate(&raw, &cfg()).unwrap();
        let second = validate(&raw, &cfg()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn empty_line_items_are_skipped_with_diagnostic() {
        let raw = json!({
            "payment_details": {"total": "10.00"},
            "items": [{}, {"description": "real", "amount": "10.00"}]
        });
        let rec = validate(&raw, &cfg()).unwrap();
        assert_eq!(rec.line_items.len(), 1);
        assert!(rec.warnings.iter().any(|w| w.contains("empty line")));
    }

    #[test]
    fn currency_defaults_to_usd() {
        let rec = validate(&json!({"payment_details": {"total": "1.00"}}), &cfg()).unwrap();
        assert_eq!(rec.currency, "USD");
    }
}
