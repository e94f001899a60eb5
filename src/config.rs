use serde::{Deserialize, Serialize};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub nim: NimConfig,
    pub extraction: ExtractionConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// NVIDIA NIM 模型服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NimConfig {
    pub api_key: String,
    pub base_url: String,
    pub vision_model: String,    // 发票图片识别模型
    pub sql_model: String,       // NL2SQL 生成模型
    pub vision_timeout_secs: u64,
    pub sql_timeout_secs: u64,
    pub max_attempts: usize,     // 瞬时失败重试上限
    pub base_backoff_ms: u64,
}

/// 抽取校验配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub review_threshold: f64,          // 必填字段置信度低于该值时置 needs_review
    pub neutral_confidence: f64,        // 模型未给出置信度时的默认值
    pub reconcile_tolerance_minor: i64, // 总额对账容差 (最小货币单位)
}

/// 查询链路配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub max_rows: u64,                   // 无 LIMIT 时注入的行数上限
    pub timeout_secs: u64,               // 单条查询执行超时
    pub min_translation_confidence: f64, // 低于该值判定 AmbiguousQuestion
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: std::env::var("SERVER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/invoice_insight".to_string()),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 20),
            },
            nim: NimConfig {
                api_key: std::env::var("NVIDIA_API_KEY").unwrap_or_default(),
                base_url: std::env::var("NIM_BASE_URL")
                    .unwrap_or_else(|_| "https://integrate.api.nvidia.com/v1".to_string()),
                vision_model: std::env::var("NIM_VISION_MODEL")
                    .unwrap_or_else(|_| "meta/llama-3.2-90b-vision-instruct".to_string()),
                sql_model: std::env::var("NIM_SQL_MODEL")
                    .unwrap_or_else(|_| "meta/llama-3.1-70b-instruct".to_string()),
                vision_timeout_secs: env_parse("NIM_VISION_TIMEOUT_SECS", 120),
                sql_timeout_secs: env_parse("NIM_SQL_TIMEOUT_SECS", 30),
                max_attempts: env_parse("NIM_MAX_ATTEMPTS", 3),
                base_backoff_ms: env_parse("NIM_BASE_BACKOFF_MS", 500),
            },
            extraction: ExtractionConfig {
                review_threshold: env_parse("INGEST_REVIEW_THRESHOLD", 0.5),
                neutral_confidence: env_parse("INGEST_NEUTRAL_CONFIDENCE", 0.5),
                reconcile_tolerance_minor: env_parse("INGEST_RECONCILE_TOLERANCE_MINOR", 1),
            },
            query: QueryConfig {
                max_rows: env_parse("QUERY_MAX_ROWS", 500),
                timeout_secs: env_parse("QUERY_TIMEOUT_SECS", 10),
                min_translation_confidence: env_parse("QUERY_MIN_TRANSLATION_CONFIDENCE", 0.5),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
