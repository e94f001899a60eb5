use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// 外部模型能力错误: 调用方必须能区分瞬时与永久失败
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    /// 网络/限流/服务端抖动, 可按策略重试
    #[error("transient capability failure: {0}")]
    Transient(String),
    /// 确定性失败 (非法请求/内容不支持), 重试无意义
    #[error("permanent capability failure: {0}")]
    Permanent(String),
}

impl CapabilityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transient(_))
    }
}

/// chat 消息 (content 允许多模态 part 数组)
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: Value,
}

impl ChatMessage {
    pub fn system(text: &str) -> Self {
        Self {
            role: "system",
            content: Value::String(text.to_string()),
        }
    }

    pub fn user(text: &str) -> Self {
        Self {
            role: "user",
            content: Value::String(text.to_string()),
        }
    }

    /// 图文混合消息 (data URL 形式内联图片)
    pub fn user_with_image(text: &str, image_data_url: &str) -> Self {
        Self {
            role: "user",
            content: json!([
                {"type": "text", "text": text},
                {"type": "image_url", "image_url": {"url": image_data_url}},
            ]),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// NVIDIA NIM chat-completions 客户端 (OpenAI 兼容端点)
#[derive(Debug, Clone)]
pub struct NimClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl NimClient {
    pub fn new(base_url: &str, api_key: &str, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// 单轮 chat 调用, 返回首个 choice 的文本
    pub async fn chat(
        &self,
        model: &str,
        temperature: f64,
        max_tokens: Option<u32>,
        messages: &[ChatMessage],
    ) -> Result<String, CapabilityError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": model,
            "temperature": temperature,
            "messages": messages,
        });
        if let Some(max) = max_tokens {
            body["max_tokens"] = json!(max);
        }

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CapabilityError::Transient(format!("request to {url} failed: {e}"))
                } else {
                    CapabilityError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("NIM returned {status}: {body}");
            // 429/5xx/408 视为瞬时, 其余 4xx 为确定性失败
            return if status.as_u16() == 429 || status.as_u16() == 408 || status.is_server_error()
            {
                Err(CapabilityError::Transient(msg))
            } else {
                Err(CapabilityError::Permanent(msg))
            };
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Permanent(format!("response parsing failed: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CapabilityError::Permanent("empty choices in NIM response".to_string()))
    }
}
