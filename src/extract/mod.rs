pub mod validator;
pub mod vision;

pub use validator::validate;
pub use vision::{ImageFormat, NimVisionExtractor, VisionExtractor};

/// 抽取错误: 仅信封整体不可解析时返回; 字段级失败吸收为 warning + needs_review
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("malformed extraction payload: {0}")]
    Malformed(String),
}
