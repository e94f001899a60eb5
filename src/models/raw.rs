use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

/// 视觉模型原始输出信封 (宽松解析: 缺失字段取默认, 金额/数量可为数字或字符串)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawExtraction {
    #[serde(default)]
    pub vendor: RawVendor,
    #[serde(default)]
    pub order_details: RawOrderDetails,
    #[serde(default)]
    pub items: Vec<RawLineItem>,
    #[serde(default)]
    pub payment_details: RawPaymentDetails,
    /// 字段级置信度, 模型可能不返回
    #[serde(default)]
    pub confidence: IndexMap<String, f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVendor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawOrderDetails {
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub po_number: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLineItem {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub quantity: Option<Value>,
    #[serde(default)]
    pub unit_price: Option<Value>,
    #[serde(default, alias = "amount")]
    pub line_total: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPaymentDetails {
    #[serde(default)]
    pub subtotal: Option<Value>,
    #[serde(default)]
    pub tax: Option<Value>,
    #[serde(default)]
    pub total: Option<Value>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_envelope() {
        let raw: RawExtraction = serde_json::from_value(json!({})).unwrap();
        assert!(raw.vendor.name.is_none());
        assert!(raw.items.is_empty());
    }

    #[test]
    fn amount_alias_maps_to_line_total() {
        let raw: RawExtraction = serde_json::from_value(json!({
            "items": [{"description": "A", "quantity": 1, "amount": "123.45"}]
        }))
        .unwrap();
        assert_eq!(raw.items[0].line_total, Some(json!("123.45")));
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(serde_json::from_value::<RawExtraction>(json!("text")).is_err());
    }
}
