//! 任务执行：状态门、外部命令、结果收口。
//!
//! 一个任务只在证据处于 `required_states` 之一时运行；运行期间通过
//! `PendingResult` 记录日志与产出，结束时由 `TaskRunner` 统一 `close` 一次。

pub mod bulk_extractor;
pub mod grep;
pub mod statistics;
pub mod worker;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;
use crate::evidence::{Evidence, EvidenceAttributes, EvidenceId, EvidenceState};
use crate::store::{EvidenceStore, PutOutcome};

pub use bulk_extractor::{BulkExtractorConfig, BulkExtractorTask};
pub use grep::{GrepConfig, GrepTask};
pub use statistics::{task_statistics, TaskFilter, TaskStatistics};
pub use worker::WorkerPool;

/// 单个任务运行时能看到的环境
pub struct TaskContext {
    pub task_id: String,
    /// 该任务私有的输出目录，按证据划分，避免并发任务互相覆盖
    pub output_dir: PathBuf,
    /// 计算产出哈希时的块大小
    pub chunk_size: usize,
}

pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;

    /// 空列表表示不限制状态
    fn required_states(&self) -> &[EvidenceState] {
        &[]
    }

    /// 成功时返回状态摘要字符串
    fn run(
        &self,
        ctx: &TaskContext,
        evidence: &Evidence,
        result: &mut PendingResult,
    ) -> Result<String, TaskError>;
}

// ==========================================
// 任务结果
// ==========================================

/// 已关闭的任务结果，之后不可再修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    task_id: String,
    task_name: String,
    input_evidence: Vec<EvidenceId>,
    evidence: Vec<Evidence>,
    report_data: Option<String>,
    status: String,
    successful: bool,
    log: Vec<String>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn input_evidence(&self) -> &[EvidenceId] {
        &self.input_evidence
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn report_data(&self) -> Option<&str> {
        self.report_data.as_deref()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn successful(&self) -> bool {
        self.successful
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn run_time(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// 运行中的任务结果。`close` 消耗自身，所以一个结果只能关闭一次。
#[derive(Debug)]
pub struct PendingResult {
    task_id: String,
    task_name: String,
    input_evidence: Vec<EvidenceId>,
    evidence: Vec<Evidence>,
    report_data: Option<String>,
    log: Vec<String>,
    started_at: DateTime<Utc>,
}

impl PendingResult {
    pub fn new(task_id: impl Into<String>, task_name: &str, input: &Evidence) -> Self {
        Self {
            task_id: task_id.into(),
            task_name: task_name.to_string(),
            input_evidence: input.id.iter().cloned().collect(),
            evidence: Vec::new(),
            report_data: None,
            log: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(task_id = %self.task_id, task = %self.task_name, "{}", line);
        self.log.push(line);
    }

    pub fn add_evidence(&mut self, evidence: Evidence) {
        self.evidence.push(evidence);
    }

    pub fn set_report(&mut self, report: impl Into<String>) {
        self.report_data = Some(report.into());
    }

    pub fn close(self, success: bool, status: impl Into<String>) -> TaskResult {
        let status = status.into();
        if success {
            tracing::info!(task_id = %self.task_id, task = %self.task_name, %status, "✅ Task succeeded");
        } else {
            tracing::error!(task_id = %self.task_id, task = %self.task_name, %status, "❌ Task failed");
        }
        TaskResult {
            task_id: self.task_id,
            task_name: self.task_name,
            input_evidence: self.input_evidence,
            evidence: self.evidence,
            report_data: self.report_data,
            status,
            successful: success,
            log: self.log,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

// ==========================================
// 运行器
// ==========================================

pub struct TaskRunner {
    output_root: PathBuf,
    chunk_size: usize,
    store: Option<Arc<dyn EvidenceStore>>,
}

impl TaskRunner {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            chunk_size: 1024 * 1024,
            store: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// 设置后，新产出的证据会在关闭结果之前写入仓库，结果本身也会被记录
    pub fn with_store(mut self, store: Arc<dyn EvidenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 运行一个任务。无论成功失败，总是返回一个已关闭的结果。
    pub fn run(&self, task: &dyn Task, evidence: &Evidence) -> TaskResult {
        self.run_with(task, evidence, &EvidenceAttributes::default())
    }

    /// 同 [`run`](Self::run)，`overrides` 里给出的属性覆盖到每个产出证据上
    pub fn run_with(
        &self,
        task: &dyn Task,
        evidence: &Evidence,
        overrides: &EvidenceAttributes,
    ) -> TaskResult {
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        let mut result = PendingResult::new(&task_id, task.name(), evidence);

        if let Err(e) = check_state(task.required_states(), evidence.state) {
            return self.finish(result.close(false, e.to_string()));
        }

        let output_dir = self
            .output_root
            .join(evidence.id_str())
            .join(format!("{}-{}", task_id, task.name()));
        if let Err(e) = std::fs::create_dir_all(&output_dir) {
            let err = TaskError::io(&output_dir, e);
            return self.finish(result.close(false, err.to_string()));
        }

        let ctx = TaskContext {
            task_id,
            output_dir,
            chunk_size: self.chunk_size,
        };
        result.log(format!("Running {} against evidence {}", task.name(), evidence.id_str()));

        let closed = match task.run(&ctx, evidence, &mut result) {
            Ok(status) => match self.register_outputs(&mut result, overrides) {
                Ok(()) => result.close(true, status),
                Err(e) => result.close(false, e.to_string()),
            },
            Err(e) => result.close(false, e.to_string()),
        };
        self.finish(closed)
    }

    /// 把产出的证据写入仓库；哈希重复时引用已有记录
    fn register_outputs(
        &self,
        result: &mut PendingResult,
        overrides: &EvidenceAttributes,
    ) -> Result<(), TaskError> {
        for evidence in result.evidence.iter_mut() {
            evidence.attributes.apply(overrides.clone());
        }
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut notes = Vec::new();
        for evidence in result.evidence.iter_mut() {
            match store.put(evidence.clone())? {
                PutOutcome::Inserted(id) => evidence.id = Some(id),
                PutOutcome::Duplicate(existing) => {
                    notes.push(format!(
                        "Output {} was stored before, check {}",
                        evidence.local_path.display(),
                        existing
                    ));
                    evidence.id = Some(existing);
                }
            }
        }
        for note in notes {
            result.log(note);
        }
        Ok(())
    }

    /// 记录已关闭的结果 (配置了仓库时)，原样返回
    pub(crate) fn finish(&self, result: TaskResult) -> TaskResult {
        if let Some(store) = &self.store {
            if let Err(e) = store.record_task(&result) {
                tracing::error!(task_id = %result.task_id(), "Failed to record task result: {}", e);
            }
        }
        result
    }
}

pub fn check_state(required: &[EvidenceState], actual: EvidenceState) -> Result<(), TaskError> {
    if required.is_empty() || required.contains(&actual) {
        Ok(())
    } else {
        Err(TaskError::PreconditionFailed {
            required: required.to_vec(),
            actual,
        })
    }
}

// ==========================================
// 外部命令
// ==========================================

/// 运行外部命令，stdout/stderr 落盘到任务输出目录。
///
/// `stdout_to` 给定时 stdout 直接写入该文件 (相当于 shell 的 `>`)。
/// 退出码不在 `success_codes` 里视为失败。返回实际退出码。
pub fn execute(
    cmd: &[String],
    ctx: &TaskContext,
    result: &mut PendingResult,
    success_codes: &[i32],
    stdout_to: Option<&Path>,
) -> Result<i32, TaskError> {
    // 1. 拆出程序名与参数；空命令属于配置错误
    let (program, args) = cmd
        .split_first()
        .ok_or_else(|| TaskError::Config("empty command".to_string()))?;
    let command_line = cmd.join(" ");
    let failed = |reason: String| TaskError::ToolExecutionFailed {
        command: command_line.clone(),
        reason,
    };

    // 2. 日志文件以程序名命名，放在任务私有目录里
    let stem = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "command".to_string());
    let stdout_path = stdout_to
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ctx.output_dir.join(format!("{}.stdout.log", stem)));
    let stderr_path = ctx.output_dir.join(format!("{}.stderr.log", stem));

    let stdout = File::create(&stdout_path).map_err(|e| TaskError::io(&stdout_path, e))?;
    let stderr = File::create(&stderr_path).map_err(|e| TaskError::io(&stderr_path, e))?;

    // 3. 启动并等待；stdin 关闭，工具不能等交互输入
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()
        .map_err(|e| failed(e.to_string()))?;

    // 4. 被信号杀掉没有退出码
    let Some(code) = status.code() else {
        return Err(failed("terminated by signal".to_string()));
    };
    result.log(format!("Execution of [{}] returned {}", command_line, code));

    // 5. 退出码不在白名单里：取 stderr 最后一行作为原因
    if !success_codes.contains(&code) {
        let stderr_tail = std::fs::read_to_string(&stderr_path)
            .map(|s| s.lines().last().unwrap_or_default().to_string())
            .unwrap_or_default();
        let reason = if stderr_tail.is_empty() {
            format!("exit code {}", code)
        } else {
            format!("exit code {}: {}", code, stderr_tail)
        };
        return Err(failed(reason));
    }
    Ok(code)
}

// ==========================================
// 请求映射 -> 任务
// ==========================================

/// 把请求映射拆成 (证据属性, 任务选项)。
/// 每个键必须恰好属于其中一类，否则在构造时就报错。
pub fn partition_request(
    request: &Map<String, Value>,
    option_keys: &[&str],
) -> Result<(EvidenceAttributes, Map<String, Value>), TaskError> {
    let mut attributes = Map::new();
    let mut options = Map::new();
    for (key, value) in request {
        let is_attribute = EvidenceAttributes::KEYS.contains(&key.as_str());
        let is_option = option_keys.contains(&key.as_str());
        match (is_attribute, is_option) {
            (true, false) => {
                attributes.insert(key.clone(), value.clone());
            }
            (false, true) => {
                options.insert(key.clone(), value.clone());
            }
            (true, true) => {
                return Err(TaskError::Config(format!("key {} is ambiguous", key)));
            }
            (false, false) => {
                return Err(TaskError::Config(format!("unknown key {}", key)));
            }
        }
    }
    let attributes = serde_json::from_value(Value::Object(attributes))
        .map_err(|e| TaskError::Config(e.to_string()))?;
    Ok((attributes, options))
}

/// 按名字构造任务。返回任务和请求里附带的证据属性。
pub fn build_task(
    name: &str,
    request: &Map<String, Value>,
) -> Result<(Arc<dyn Task>, EvidenceAttributes), TaskError> {
    match name {
        "BulkExtractorTask" | "bulk_extractor" => {
            let (attributes, options) = partition_request(request, &BulkExtractorConfig::KEYS)?;
            let config = BulkExtractorConfig::from_options(options)?;
            Ok((Arc::new(BulkExtractorTask::new(config)), attributes))
        }
        "GrepTask" | "grep" => {
            let (attributes, options) = partition_request(request, &GrepConfig::KEYS)?;
            let config = GrepConfig::from_options(options)?;
            Ok((Arc::new(GrepTask::new(config)), attributes))
        }
        other => Err(TaskError::Config(format!("unknown task {}", other))),
    }
}

/// 本地文件预处理：`New` 且路径存在的证据进入 `Attached`
pub fn attach_evidence(store: &dyn EvidenceStore, id: &EvidenceId) -> Result<Evidence, TaskError> {
    let evidence = store
        .get(id)?
        .ok_or_else(|| crate::error::StoreError::NotFound(id.to_string()))?;
    if evidence.state != EvidenceState::New {
        return Ok(evidence);
    }
    if !evidence.local_path.exists() {
        return Err(TaskError::io(
            &evidence.local_path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "evidence path does not exist"),
        ));
    }
    Ok(store.update_state(id, EvidenceState::Attached)?)
}
