use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::nim::{CapabilityError, ChatMessage, NimClient};

/// 发票抽取提示词: 要求模型返回固定结构 JSON, 并附字段置信度
const EXTRACTION_PROMPT: &str = r#"Extract all invoice details from this image and return as JSON with this exact structure:
{
    "vendor": {
        "name": "",
        "address": "",
        "phone": "",
        "email": ""
    },
    "order_details": {
        "invoice_number": "",
        "invoice_date": "",
        "due_date": "",
        "po_number": ""
    },
    "items": [
        {
            "description": "",
            "quantity": 0,
            "unit_price": 0.0,
            "amount": 0.0
        }
    ],
    "payment_details": {
        "subtotal": 0.0,
        "tax": 0.0,
        "total": 0.0,
        "currency": ""
    },
    "confidence": {
        "vendor_name": 0.0,
        "invoice_number": 0.0,
        "invoice_date": 0.0,
        "total_amount": 0.0
    }
}
Confidence values are your own certainty in [0,1] for each field.
Return only valid JSON. Extract all visible information accurately."#;

/// 支持的图片格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// 按扩展名/声明解析; 不支持的格式属永久失败
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }
}

/// 视觉抽取能力 (外部协作方, 以 trait 隔离便于测试替身)
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    async fn extract(&self, image: &[u8], format: ImageFormat)
        -> Result<Value, CapabilityError>;
}

/// NVIDIA NIM 视觉模型实现
pub struct NimVisionExtractor {
    client: NimClient,
    model: String,
}

impl NimVisionExtractor {
    pub fn new(client: NimClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl VisionExtractor for NimVisionExtractor {
    async fn extract(
        &self,
        image: &[u8],
        format: ImageFormat,
    ) -> Result<Value, CapabilityError> {
        let data_url = format!("data:{};base64,{}", format.mime(), BASE64.encode(image));
        let messages = [ChatMessage::user_with_image(EXTRACTION_PROMPT, &data_url)];

        let text = self.client.chat(&self.model, 0.2, None, &messages).await?;

        // 模型输出不是 JSON 时原样透传字符串, 交由校验器判定 Malformed 并留痕
        Ok(parse_model_json(&text).unwrap_or(Value::String(text)))
    }
}

/// 清洗模型响应并提取最外层 JSON 对象 (容忍 markdown 代码块/前后缀废话)
pub fn parse_model_json(response: &str) -> Option<Value> {
    let mut text = response.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped.trim_end_matches("```").trim();
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped.trim_end_matches("```").trim();
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
