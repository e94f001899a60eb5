use async_trait::async_trait;

use crate::models::{CandidateQuery, SchemaDescription};
use crate::nim::{CapabilityError, ChatMessage, NimClient};

/// 翻译错误 (对调用方可见的分类)
#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    /// 能力侧置信度低于阈值, 问题本身含混
    #[error("question too ambiguous to translate (confidence {confidence:.2})")]
    Ambiguous { confidence: f64 },
    /// 守卫发现未接地标识符后, 以翻译层错误回报调用方
    #[error("generated SQL references unknown identifier: {0}")]
    Ungrounded(String),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// NL2SQL 生成能力 (外部协作方)
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// 每次调用恰好产出一条候选语句
    async fn generate_sql(
        &self,
        question: &str,
        schema_text: &str,
    ) -> Result<CandidateQuery, CapabilityError>;
}

/// 查询翻译器: 用 Store 提供的实时 Schema 接地, 绝不硬编码表结构
pub struct Translator<G: SqlGenerator> {
    generator: G,
    min_confidence: f64,
}

impl<G: SqlGenerator> Translator<G> {
    pub fn new(generator: G, min_confidence: f64) -> Self {
        Self {
            generator,
            min_confidence,
        }
    }

    pub async fn translate(
        &self,
        question: &str,
        schema: &SchemaDescription,
    ) -> Result<CandidateQuery, TranslationError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(TranslationError::Ambiguous { confidence: 0.0 });
        }

        let candidate = self
            .generator
            .generate_sql(question, &schema.render())
            .await?;

        if candidate.confidence < self.min_confidence {
            return Err(TranslationError::Ambiguous {
                confidence: candidate.confidence,
            });
        }
        Ok(candidate)
    }
}

/// 系统提示词: 实时 schema 文本 + 生成规则 (单条 SELECT, 禁解释/禁 markdown)
fn build_system_prompt(schema_text: &str) -> String {
    format!(
        r#"You are an expert PostgreSQL query generator.

Database schema:

{schema_text}
IMPORTANT RELATIONSHIPS:
- items.document_id references documents.id
- To get items for an invoice, use: JOIN items ON documents.id = items.document_id
- Monetary columns (subtotal_amount, tax_amount, total_amount, unit_price, line_total) hold integer minor units (cents)

Rules:
- Generate ONLY one valid PostgreSQL SELECT query
- Do NOT explain or add commentary
- Do NOT use markdown code blocks
- Use proper JOINs when accessing both tables
- For "the invoice" or "given invoice", query the most recent: ORDER BY created_at DESC LIMIT 1
- Return raw SQL query only"#
    )
}

/// 清洗模型响应并给出启发式置信度:
/// 干净的 SELECT -> 0.9; 需要从废话里捞出来的 -> 0.4; 捞不出 SELECT -> None
pub(crate) fn sanitize_sql_response(response: &str) -> Option<CandidateQuery> {
    let text = response
        .trim()
        .trim_start_matches("```sql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let upper = text.to_ascii_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
        return Some(CandidateQuery {
            sql: text.to_string(),
            confidence: 0.9,
        });
    }

    let start = upper.find("SELECT")?;
    Some(CandidateQuery {
        sql: text[start..].trim().to_string(),
        confidence: 0.4,
    })
}

/// NVIDIA NIM 实现
pub struct NimSqlGenerator {
    client: NimClient,
    model: String,
}

impl NimSqlGenerator {
    pub fn new(client: NimClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl SqlGenerator for NimSqlGenerator {
    async fn generate_sql(
        &self,
        question: &str,
        schema_text: &str,
    ) -> Result<CandidateQuery, CapabilityError> {
        let messages = [
            ChatMessage::system(&build_system_prompt(schema_text)),
            ChatMessage::user(question),
        ];

        let response = self.client.chat(&self.model, 0.0, Some(200), &messages).await?;

        sanitize_sql_response(&response).ok_or_else(|| {
            CapabilityError::Permanent(format!(
                "model response contains no SELECT statement: {}",
                response.chars().take(200).collect::<String>()
            ))
        })
    }
}
