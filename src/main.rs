use std::sync::Arc;

use anyhow::Context;
use tanjing_core::{
    api,
    config::Config,
    store::{EvidenceStore, SledEvidenceStore},
    task::{TaskRunner, WorkerPool},
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ----------------------------------------------------------------
    // 0. 加载配置
    // ----------------------------------------------------------------
    let config = Config::from_env()?;
    tracing::info!(
        "⚙️  配置加载完成: Host={}:{}, DB={}, Output={}",
        config.host,
        config.port,
        config.db_path,
        config.output_dir.display()
    );

    // ----------------------------------------------------------------
    // 1. 存储 & 任务槽位
    // ----------------------------------------------------------------
    tracing::info!("🔎 [探镜 Tanjing] 证据入库与分析服务启动中...");

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("cannot create {}", config.output_dir.display()))?;
    let store: Arc<dyn EvidenceStore> = Arc::new(
        SledEvidenceStore::open(&config.db_path)
            .with_context(|| format!("cannot open evidence db at {}", config.db_path))?,
    );
    tracing::info!("📚 证据库初始化完成");

    let runner = TaskRunner::new(config.output_dir.join("tasks"))
        .with_chunk_size(config.chunk_size)
        .with_store(Arc::clone(&store));
    let workers = WorkerPool::new(config.task_workers, runner);
    tracing::info!("🧵 任务槽位: {}", config.task_workers);

    // ----------------------------------------------------------------
    // 2. 状态共享容器
    // ----------------------------------------------------------------
    let addr = format!("{}:{}", config.host, config.port);
    let shared_state = Arc::new(api::AppState {
        config: Arc::new(config),
        store,
        workers,
    });

    // ----------------------------------------------------------------
    // 3. 启动 HTTP 服务
    // ----------------------------------------------------------------
    let app = api::app(shared_state);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("🚀 API 服务已运行在: http://{}", addr);
    tracing::info!("   - POST /evidence/upload              : 上传证据文件");
    tracing::info!("   - POST /evidence/{{id}}/attach         : 本地证据预处理");
    tracing::info!("   - POST /evidence/{{id}}/tasks/{{name}}   : 对证据运行任务");
    tracing::info!("   - GET  /task/{{task_id}}               : 查询任务结果");

    axum::serve(listener, app).await?;

    Ok(())
}
