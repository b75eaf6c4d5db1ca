use std::sync::Arc;

use tokio::sync::Semaphore;

use super::{PendingResult, Task, TaskResult, TaskRunner};
use crate::evidence::{Evidence, EvidenceAttributes};

/// 外部工具的工作槽位
///
/// 每个任务在整个运行期间占用一个槽位，并在 `spawn_blocking` 线程上跑，
/// 不会占住处理上传的 runtime 线程。
#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    runner: Arc<TaskRunner>,
}

impl WorkerPool {
    pub fn new(workers: usize, runner: TaskRunner) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(workers.max(1))),
            runner: Arc::new(runner),
        }
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// 提交任务并等待结果。总是返回已关闭的结果。
    pub async fn submit(&self, task: Arc<dyn Task>, evidence: Evidence) -> TaskResult {
        self.submit_with(task, evidence, EvidenceAttributes::default()).await
    }

    /// 产出证据带上请求里声明的属性
    pub async fn submit_with(
        &self,
        task: Arc<dyn Task>,
        evidence: Evidence,
        overrides: EvidenceAttributes,
    ) -> TaskResult {
        let task_name = task.name();
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => return self.failed(task_name, &evidence, format!("No task worker available: {}", e)),
        };

        let runner = Arc::clone(&self.runner);
        let input = evidence.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            runner.run_with(task.as_ref(), &evidence, &overrides)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => self.failed(task_name, &input, format!("Task worker crashed: {}", e)),
        }
    }

    /// 任务没能正常跑完时补一个失败结果，同样经由 runner 记录，之后可以按 task_id 查询
    fn failed(&self, task_name: &str, input: &Evidence, status: String) -> TaskResult {
        tracing::error!(task = task_name, "{}", status);
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        self.runner
            .finish(PendingResult::new(task_id, task_name, input).close(false, status))
    }
}
