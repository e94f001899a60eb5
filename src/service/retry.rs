use std::future::Future;
use std::time::Duration;

/// 显式重试策略: 上限 + 指数退避 + 可重试谓词
/// 确定性失败 (守卫拒绝/畸形输出) 永远不该走到这里
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// 仅允许一次重试的变体 (翻译能力用)
    pub fn single_retry(&self) -> Self {
        Self {
            max_attempts: 2,
            base_backoff_ms: self.base_backoff_ms,
        }
    }

    /// 第 attempt 次失败后的退避时长 (0 起算, 指数翻倍)
    pub fn backoff(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(1u64 << attempt.min(10)))
    }

    /// 执行 op, 谓词判定可重试时按策略退避重来, 否则原样返回错误
    pub async fn run<T, E, F, Fut, P>(&self, op_name: &str, mut op: F, retryable: P) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        "{op_name} 瞬时失败 (第 {}/{} 次), {:?} 后重试: {e}",
                        attempt + 1,
                        self.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
