use serde::Serialize;

use crate::config::ExtractionConfig;
use crate::db::{RecordStore, StoreError};
use crate::extract::{validate, ExtractionError, ImageFormat, VisionExtractor};
use crate::models::{StoredDocument, StoredLineItem};
use crate::nim::CapabilityError;
use crate::service::retry::RetryPolicy;

/// 摄取错误 (状态机终态 Failed 的原因分类)
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 摄取结果 (终态 Persisted)
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document_id: i64,
    pub needs_review: bool,
    pub warnings: Vec<String>,
}

/// 摄取编排: Received -> Extracted -> Validated -> Persisted | Failed
/// 只有瞬时能力失败才重试; 畸形输出是确定性的, 重试纯属浪费
pub struct IngestService<V, S> {
    vision: V,
    store: S,
    extraction: ExtractionConfig,
    retry: RetryPolicy,
}

impl<V: VisionExtractor, S: RecordStore> IngestService<V, S> {
    pub fn new(vision: V, store: S, extraction: ExtractionConfig, retry: RetryPolicy) -> Self {
        Self {
            vision,
            store,
            extraction,
            retry,
        }
    }

    pub async fn ingest(&self, image: &[u8], format_name: &str) -> Result<IngestOutcome, IngestError> {
        // Received
        let format = ImageFormat::from_name(format_name)
            .ok_or_else(|| IngestError::UnsupportedFormat(format_name.to_string()))?;
        tracing::info!("ingest received: {} bytes, format {:?}", image.len(), format);

        // 1. 抽取 (瞬时失败按策略重试, 耗尽后留痕)
        let raw = match self
            .retry
            .run(
                "vision extraction",
                || self.vision.extract(image, format),
                CapabilityError::is_transient,
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                self.store
                    .record_failure("extraction", &e.to_string(), None)
                    .await?;
                return Err(e.into());
            }
        };
        tracing::info!("ingest extracted: raw payload received");

        // 2. 校验 (失败为确定性 Malformed, 不重试, 原始输出留痕)
        let record = match validate(&raw, &self.extraction) {
            Ok(record) => record,
            Err(e) => {
                self.store
                    .record_failure("validation", &e.to_string(), Some(&raw))
                    .await?;
                return Err(e.into());
            }
        };
        tracing::info!(
            "ingest validated: needs_review={}, {} warnings",
            record.needs_review,
            record.warnings.len()
        );

        // 3. 入库 (单事务, 全有或全无)
        let document_id = self.store.persist(&record).await?;
        tracing::info!("ingest persisted: document {document_id}");

        Ok(IngestOutcome {
            document_id,
            needs_review: record.needs_review,
            warnings: record.warnings,
        })
    }

    /// 按 id 回读单据 (审阅界面用)
    pub async fn document(
        &self,
        id: i64,
    ) -> Result<Option<(StoredDocument, Vec<StoredLineItem>)>, StoreError> {
        self.store.fetch_document(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::fake::FakeStore;
    use crate::models::SchemaDescription;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn extraction_cfg() -> ExtractionConfig {
        ExtractionConfig {
            review_threshold: 0.5,
            neutral_confidence: 0.5,
            reconcile_tolerance_minor: 1,
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 10,
        }
    }

    fn good_payload() -> Value {
        json!({
            "vendor": {"name": "ACME Corp"},
            "order_details": {"invoice_number": "INV-1", "invoice_date": "2025-06-01"},
            "payment_details": {"total": "$123.45", "tax": "0.00"},
            "items": [{"description": "A", "quantity": 1, "unit_price": "123.45", "amount": "123.45"}]
        })
    }

    /// 前 fail_times 次返回瞬时错误, 之后成功
    struct FlakyVision {
        payload: Value,
        fail_times: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl VisionExtractor for FlakyVision {
        async fn extract(
            &self,
            _image: &[u8],
            _format: ImageFormat,
        ) -> Result<Value, CapabilityError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(CapabilityError::Transient("rate limited".into()))
            } else {
                Ok(self.payload.clone())
            }
        }
    }

    struct PermanentVision {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl VisionExtractor for PermanentVision {
        async fn extract(
            &self,
            _image: &[u8],
            _format: ImageFormat,
        ) -> Result<Value, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::Permanent("unsupported content".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_reaches_persisted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = IngestService::new(
            FlakyVision {
                payload: good_payload(),
                fail_times: 0,
                calls: calls.clone(),
            },
            FakeStore::new(SchemaDescription::default()),
            extraction_cfg(),
            retry(),
        );

        let outcome = service.ingest(b"imagebytes", "png").await.unwrap();
        assert_eq!(outcome.document_id, 1);
        assert!(!outcome.needs_review);

        let persisted = service.store.persisted.lock().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].total_amount, Some(12345));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_extraction_failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = IngestService::new(
            FlakyVision {
                payload: good_payload(),
                fail_times: 2,
                calls: calls.clone(),
            },
            FakeStore::new(SchemaDescription::default()),
            extraction_cfg(),
            retry(),
        );

        let outcome = service.ingest(b"img", "jpg").await.unwrap();
        assert_eq!(outcome.document_id, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_record_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = IngestService::new(
            FlakyVision {
                payload: good_payload(),
                fail_times: 10,
                calls: calls.clone(),
            },
            FakeStore::new(SchemaDescription::default()),
            extraction_cfg(),
            retry(),
        );

        let err = service.ingest(b"img", "jpg").await.unwrap_err();
        assert!(matches!(err, IngestError::Capability(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let failures = service.store.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "extraction");
        assert!(service.store.persisted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = IngestService::new(
            PermanentVision {
                calls: calls.clone(),
            },
            FakeStore::new(SchemaDescription::default()),
            extraction_cfg(),
            retry(),
        );

        let err = service.ingest(b"img", "png").await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Capability(CapabilityError::Permanent(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_output_records_failure_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = IngestService::new(
            FlakyVision {
                payload: Value::String("I could not read the image".into()),
                fail_times: 0,
                calls: calls.clone(),
            },
            FakeStore::new(SchemaDescription::default()),
            extraction_cfg(),
            retry(),
        );

        let err = service.ingest(b"img", "png").await.unwrap_err();
        assert!(matches!(err, IngestError::Extraction(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let failures = service.store.failures.lock().unwrap();
        assert_eq!(failures[0].0, "validation");
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_format_fails_before_extraction() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = IngestService::new(
            FlakyVision {
                payload: good_payload(),
                fail_times: 0,
                calls: calls.clone(),
            },
            FakeStore::new(SchemaDescription::default()),
            extraction_cfg(),
            retry(),
        );

        let err = service.ingest(b"img", "gif").await.unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_document_round_trips() {
        let service = IngestService::new(
            FlakyVision {
                payload: good_payload(),
                fail_times: 0,
                calls: Arc::new(AtomicUsize::new(0)),
            },
            FakeStore::new(SchemaDescription::default()),
            extraction_cfg(),
            retry(),
        );

        let outcome = service.ingest(b"img", "png").await.unwrap();
        let (document, items) = service
            .document(outcome.document_id)
            .await
            .unwrap()
            .expect("document should exist");

        assert_eq!(document.vendor_name.as_deref(), Some("ACME Corp"));
        assert_eq!(document.invoice_number.as_deref(), Some("INV-1"));
        assert_eq!(document.total_amount, Some(12345));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].line_total, Some(12345));
    }
}
