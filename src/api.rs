use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::io::StreamReader;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::error::{StoreError, TaskError};
use crate::evidence::{Evidence, EvidenceAttributes, EvidenceId, EvidenceType};
use crate::ingest::{self, FileOutcome, Upload};
use crate::store::EvidenceStore;
use crate::task::{self, TaskFilter, TaskResult, TaskStatistics, WorkerPool};

// ==========================================
// 1. 应用状态 (Shared State)
// ==========================================
// 显式传给每个入口的上下文，没有全局单例。
// 仓库自身保证并发安全，这里不再加锁。
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn EvidenceStore>,
    pub workers: WorkerPool,
}

type ApiError = (StatusCode, String);

// ==========================================
// 2. 请求参数
// ==========================================

#[derive(Deserialize)]
pub struct UploadQuery {
    pub ticket_id: String,
    #[serde(default)]
    pub calculate_hash: bool,
    pub evidence_type: String,
}

// ==========================================
// 3. API 路由构建
// ==========================================
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // 大小上限由入库流水线按块检查
        .route(
            "/evidence/upload",
            post(upload_evidence).layer(DefaultBodyLimit::disable()),
        )
        .route("/evidence/summary", get(evidence_summary))
        .route("/evidence/id/{id}", get(get_evidence))
        .route("/evidence/hash/{hash}", get(get_evidence_by_hash))
        .route("/evidence/types", get(evidence_types))
        .route("/evidence/types/{evidence_type}", get(evidence_type_attributes))
        .route("/evidence/{id}/attach", post(attach))
        .route("/evidence/{id}/tasks/{task_name}", post(run_task))
        .route("/task/statistics", get(get_task_statistics))
        .route("/task/{task_id}", get(get_task))
        .layer(CorsLayer::permissive()) // ⚠️ 开发模式：允许所有跨域
        .with_state(state)
}

// ==========================================
// 4. 处理函数 (Handlers)
// ==========================================

/// 接口：上传证据文件
///
/// 非文件字段按证据属性处理 (`project`、`source` 等)，只对其后的文件生效。
async fn upload_evidence(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<Vec<FileOutcome>>, ApiError> {
    let evidence_type: EvidenceType = query
        .evidence_type
        .parse()
        .map_err(|e: String| (StatusCode::BAD_REQUEST, e))?;
    tracing::info!(ticket_id = %query.ticket_id, %evidence_type, "📥 Upload request");

    let mut declared = Map::new();
    let mut outcomes = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            let key = field.name().unwrap_or_default().to_string();
            if !EvidenceAttributes::KEYS.contains(&key.as_str()) {
                return Err((StatusCode::BAD_REQUEST, format!("unknown field {}", key)));
            }
            let value = field.text().await.map_err(bad_request)?;
            declared.insert(key, Value::String(value));
            continue;
        };
        let attributes: EvidenceAttributes =
            serde_json::from_value(Value::Object(declared.clone())).map_err(bad_request)?;

        let reader = StreamReader::new(
            field.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string())),
        );
        let result = ingest::ingest_file(
            state.store.as_ref(),
            &state.config,
            &query.ticket_id,
            Upload::new(file_name.clone(), reader),
            evidence_type,
            &attributes,
            query.calculate_hash,
        )
        .await;
        if let Err(e) = &result {
            tracing::error!(file = %file_name, "Upload failed: {}", e);
        }
        outcomes.push(FileOutcome::from_result(file_name, result));
    }

    Ok(Json(outcomes))
}

/// 接口：按类型分组的全部证据
async fn evidence_summary(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BTreeMap<String, Vec<Evidence>>>, ApiError> {
    let store = Arc::clone(&state.store);
    // 全表扫描，放到阻塞线程
    let summary = tokio::task::spawn_blocking(move || store.summary())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task join error: {}", e)))?
        .map_err(store_error)?;
    if summary.is_empty() {
        return Err(not_found("No evidences found."));
    }
    Ok(Json(summary))
}

async fn get_evidence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Evidence>, ApiError> {
    let id = EvidenceId(id);
    state
        .store
        .get(&id)
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("Evidence {} not found", id)))
}

async fn get_evidence_by_hash(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Json<Evidence>, ApiError> {
    let id = state
        .store
        .find_by_hash(&hash)
        .map_err(store_error)?
        .ok_or_else(|| not_found(format!("No evidence with hash {}", hash)))?;
    state
        .store
        .get(&id)
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("Evidence {} not found", id)))
}

async fn evidence_types() -> Json<BTreeMap<&'static str, &'static [&'static str]>> {
    Json(
        EvidenceType::ALL
            .iter()
            .map(|t| (t.as_str(), t.attributes()))
            .collect(),
    )
}

async fn evidence_type_attributes(
    Path(evidence_type): Path<String>,
) -> Result<Json<&'static [&'static str]>, ApiError> {
    let evidence_type: EvidenceType = evidence_type.parse().map_err(not_found)?;
    Ok(Json(evidence_type.attributes()))
}

/// 接口：本地证据预处理 (New -> Attached)
async fn attach(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Evidence>, ApiError> {
    let id = EvidenceId(id);
    let evidence = task::attach_evidence(state.store.as_ref(), &id).map_err(task_error)?;
    tracing::info!(evidence_id = %id, state = %evidence.state, "📎 Evidence attached");
    Ok(Json(evidence))
}

/// 接口：对证据运行任务，等待结果关闭后返回
async fn run_task(
    State(state): State<Arc<AppState>>,
    Path((id, task_name)): Path<(String, String)>,
    Json(request): Json<Map<String, Value>>,
) -> Result<Json<TaskResult>, ApiError> {
    let (task, attributes) = task::build_task(&task_name, &request).map_err(task_error)?;
    let id = EvidenceId(id);
    let evidence = state
        .store
        .get(&id)
        .map_err(store_error)?
        .ok_or_else(|| not_found(format!("Evidence {} not found", id)))?;

    tracing::info!(evidence_id = %id, task = task.name(), "🔧 Task submitted");
    let result = state.workers.submit_with(task, evidence, attributes).await;
    if result.successful() {
        tracing::info!(task_id = result.task_id(), "✅ {}", result.status());
    } else {
        tracing::warn!(task_id = result.task_id(), "❌ {}", result.status());
    }
    Ok(Json(result))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResult>, ApiError> {
    state
        .store
        .get_task(&task_id)
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("Task {} not found", task_id)))
}

/// 接口：任务统计，可按最近天数 (`days`) 或单个 `task_id` 过滤
async fn get_task_statistics(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<TaskFilter>,
) -> Result<Json<TaskStatistics>, ApiError> {
    let store = Arc::clone(&state.store);
    let stats = tokio::task::spawn_blocking(move || task::task_statistics(store.as_ref(), &filter))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task join error: {}", e)))?
        .map_err(store_error)?;
    stats.map(Json).ok_or_else(|| not_found("No tasks found."))
}

// ==========================================
// 5. 错误映射
// ==========================================

fn bad_request(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn not_found(message: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, message.into())
}

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn task_error(e: TaskError) -> ApiError {
    match e {
        TaskError::Store(e) => store_error(e),
        TaskError::Config(_) | TaskError::Io { .. } => bad_request(e),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceState;
    use crate::store::{MemEvidenceStore, PutOutcome};
    use crate::task::TaskRunner;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    const BOUNDARY: &str = "tanjing-test-boundary";

    enum Part<'a> {
        File(&'a str, &'a [u8]),
        Text(&'a str, &'a str),
    }

    fn test_state(dir: &std::path::Path) -> (Arc<AppState>, Arc<MemEvidenceStore>) {
        let store = Arc::new(MemEvidenceStore::new());
        let config = Config {
            output_dir: dir.join("uploads"),
            chunk_size: 8,
            max_upload_size: 1024,
            ..Config::default()
        };
        let runner = TaskRunner::new(dir.join("tasks")).with_store(store.clone());
        let state = Arc::new(AppState {
            config: Arc::new(config),
            store: store.clone(),
            workers: WorkerPool::new(1, runner),
        });
        (state, store)
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::File(name, data) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n",
                            name
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(data);
                }
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}", name, value).as_bytes(),
                    );
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload_request(parts: &[Part<'_>]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/evidence/upload?ticket_id=T-1&calculate_hash=true&evidence_type=RawDisk")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, json: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn json(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn upload_applies_attribute_fields_to_following_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = test_state(dir.path());

        let request = upload_request(&[
            Part::File("before.dd", b"first image"),
            Part::Text("project", "case-9"),
            Part::File("after.dd", b"second image"),
        ]);
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);

        let outcomes = json(&body);
        assert_eq!(outcomes.as_array().unwrap().len(), 2);
        assert_eq!(outcomes[0]["status"], "created");
        assert_eq!(outcomes[1]["status"], "created");

        let before = EvidenceId(outcomes[0]["evidence_id"].as_str().unwrap().to_string());
        let after = EvidenceId(outcomes[1]["evidence_id"].as_str().unwrap().to_string());
        let before = store.get(&before).unwrap().unwrap();
        let after = store.get(&after).unwrap().unwrap();
        assert_eq!(before.attributes.project, None);
        assert_eq!(before.attributes.name.as_deref(), Some("before.dd"));
        assert_eq!(after.attributes.project.as_deref(), Some("case-9"));
    }

    #[tokio::test]
    async fn upload_reports_duplicates_and_oversized_files_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = test_state(dir.path());
        let big = vec![1u8; 2048];

        let request = upload_request(&[
            Part::File("a.dd", b"same"),
            Part::File("huge.dd", &big),
            Part::File("b.dd", b"same"),
        ]);
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);

        let outcomes = json(&body);
        assert_eq!(outcomes[0]["status"], "created");
        assert_eq!(outcomes[1]["status"], "failed");
        assert_eq!(outcomes[2]["status"], "duplicate");
        assert_eq!(outcomes[2]["existing_id"], outcomes[0]["evidence_id"]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn upload_rejects_unknown_fields_and_types() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = test_state(dir.path());

        let (status, body) = send(&state, upload_request(&[Part::Text("jobs", "4")])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("unknown field jobs"));

        let request = Request::builder()
            .method("POST")
            .uri("/evidence/upload?ticket_id=T-1&evidence_type=FloppyDisk")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(multipart_body(&[Part::File("a.dd", b"x")])))
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn evidence_type_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path());

        let (status, body) = send(&state, get_request("/evidence/types")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body).as_object().unwrap().len(), EvidenceType::ALL.len());

        let (status, body) = send(&state, get_request("/evidence/types/RawDisk")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json(&body).as_array().unwrap().contains(&Value::from("project")));

        let (status, body) = send(&state, get_request("/evidence/types/FloppyDisk")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(String::from_utf8_lossy(&body), "FloppyDisk is not an evidence type.");
    }

    #[tokio::test]
    async fn lookups_return_not_found_for_missing_records() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path());

        for uri in ["/evidence/summary", "/evidence/id/nope", "/evidence/hash/abc", "/task/nope", "/task/statistics"] {
            let (status, _) = send(&state, get_request(uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        }
        let (status, body) = send(&state, get_request("/evidence/summary")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(String::from_utf8_lossy(&body), "No evidences found.");

        let (status, _) = send(&state, Request::builder().method("POST").uri("/evidence/nope/attach").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn task_requests_are_validated_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = test_state(dir.path());
        let PutOutcome::Inserted(id) = store
            .put(Evidence::new(EvidenceType::RawDisk, dir.path().join("disk.dd")))
            .unwrap()
        else {
            panic!("expected insert");
        };

        let uri = format!("/evidence/{}/tasks/bulk_extractor", id);
        let (status, body) = send(&state, post_json(&uri, r#"{"tool_arguments": "-x"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("unknown key tool_arguments"));

        let uri = format!("/evidence/{}/tasks/PlasoTask", id);
        let (status, _) = send(&state, post_json(&uri, "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, post_json("/evidence/missing/tasks/grep", "{}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(store.tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn task_run_is_recorded_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = test_state(dir.path());
        let path = dir.path().join("auth.log");
        std::fs::write(&path, b"nothing to see\n").unwrap();
        let PutOutcome::Inserted(id) = store.put(Evidence::new(EvidenceType::FilteredTextFile, &path)).unwrap() else {
            panic!("expected insert");
        };

        let (status, body) = send(&state, Request::builder().method("POST").uri(format!("/evidence/{}/attach", id)).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["state"], "Attached");
        assert_eq!(store.get(&id).unwrap().unwrap().state, EvidenceState::Attached);

        let uri = format!("/evidence/{}/tasks/grep", id);
        let (status, body) = send(&state, post_json(&uri, r#"{"filter_patterns": []}"#)).await;
        assert_eq!(status, StatusCode::OK);
        let result = json(&body);
        assert_eq!(result["successful"], true);
        assert_eq!(result["status"], "No patterns supplied, exit task");

        let task_id = result["task_id"].as_str().unwrap();
        let (status, _) = send(&state, get_request(&format!("/task/{}", task_id))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&state, get_request("/task/statistics")).await;
        assert_eq!(status, StatusCode::OK);
        let stats = json(&body);
        assert_eq!(stats["all_tasks"]["count"], 1);
        assert_eq!(stats["tasks_per_type"]["GrepTask"]["count"], 1);

        let (status, _) = send(&state, get_request("/task/statistics?task_id=other")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&state, get_request(&format!("/task/statistics?days=1&task_id={}", task_id))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn errors_map_to_status_codes() {
        let not_found = TaskError::Store(StoreError::NotFound("x".into()));
        assert_eq!(task_error(not_found).0, StatusCode::NOT_FOUND);
        assert_eq!(task_error(TaskError::Config("bad".into())).0, StatusCode::BAD_REQUEST);
        assert_eq!(task_error(TaskError::Archive("tar".into())).0, StatusCode::INTERNAL_SERVER_ERROR);

        let codec = serde_json::from_str::<u8>("x").unwrap_err();
        assert_eq!(store_error(StoreError::Codec(codec)).0, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(store_error(StoreError::NotFound("x".into())).0, StatusCode::NOT_FOUND);
    }
}
