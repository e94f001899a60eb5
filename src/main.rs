use axum::{
    routing::{get, post},
    Router,
};
use invoice_insight_rust::api::{self, AppIngestService, AppQueryService};
use invoice_insight_rust::extract::NimVisionExtractor;
use invoice_insight_rust::nim::NimClient;
use invoice_insight_rust::service::RetryPolicy;
use invoice_insight_rust::translate::NimSqlGenerator;
use invoice_insight_rust::{create_pool, AppConfig, IngestService, PgRecordStore, QueryService};
use std::sync::Arc;
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 使用本地时间格式
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::from_env();
    info!("Starting server on {}:{}", config.server.host, config.server.port);

    // 创建数据库连接池并准备表结构
    let pool = create_pool(&config.database.url, config.database.max_connections).await?;
    info!("Database pool created");

    let store = PgRecordStore::new(pool.clone());
    store.init_schema().await?;

    // 模型能力客户端 (视觉抽取 / NL2SQL 各一个超时档)
    let vision_client = NimClient::new(
        &config.nim.base_url,
        &config.nim.api_key,
        config.nim.vision_timeout_secs,
    );
    let sql_client = NimClient::new(
        &config.nim.base_url,
        &config.nim.api_key,
        config.nim.sql_timeout_secs,
    );
    let retry = RetryPolicy {
        max_attempts: config.nim.max_attempts,
        base_backoff_ms: config.nim.base_backoff_ms,
    };

    // 两条编排服务
    let ingest_service: Arc<AppIngestService> = Arc::new(IngestService::new(
        NimVisionExtractor::new(vision_client, &config.nim.vision_model),
        PgRecordStore::new(pool.clone()),
        config.extraction.clone(),
        retry.clone(),
    ));
    let query_service: Arc<AppQueryService> = Arc::new(QueryService::new(
        NimSqlGenerator::new(sql_client, &config.nim.sql_model),
        PgRecordStore::new(pool),
        config.query.clone(),
        retry,
    ));

    // 构建路由
    let ingest_routes = Router::new()
        .route("/api/invoices", post(api::ingest_invoice))
        .route("/api/invoices/:id", get(api::get_document))
        .with_state(ingest_service);

    let query_routes = Router::new()
        .route("/api/query", post(api::ask_question))
        .route("/api/query/export", post(api::export_query_csv))
        .route("/api/schema", get(api::get_schema))
        .with_state(query_service);

    // 合并路由
    let app = Router::new()
        .route("/health", get(api::health_check))
        .merge(ingest_routes)
        .merge(query_routes)
        .layer(ServiceBuilder::new());

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/invoices      - Ingest an invoice image");
    info!("  GET  /api/invoices/:id  - Fetch a stored document");
    info!("  POST /api/query         - Ask a natural-language question");
    info!("  POST /api/query/export  - Export query result as CSV");
    info!("  GET  /api/schema        - Show queryable schema");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
