//! 任务执行统计：总体、成功、失败，以及按任务类型的数量与运行时长。

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::TaskResult;
use crate::error::StoreError;
use crate::store::EvidenceStore;

/// 统计范围。`days` 为 0 或缺省表示不限时间。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub days: Option<u32>,
    #[serde(default)]
    pub task_id: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &TaskResult, now: DateTime<Utc>) -> bool {
        if let Some(days) = self.days.filter(|d| *d > 0) {
            if task.finished_at() <= now - Duration::days(i64::from(days)) {
                return false;
            }
        }
        match &self.task_id {
            Some(id) => task.task_id() == id,
            None => true,
        }
    }
}

/// 一组任务的运行时长统计 (秒)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunTimeStats {
    pub description: String,
    pub count: usize,
    pub min: Option<f64>,
    pub mean: Option<f64>,
    pub max: Option<f64>,
    #[serde(skip)]
    total: f64,
}

impl RunTimeStats {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            count: 0,
            min: None,
            mean: None,
            max: None,
            total: 0.0,
        }
    }

    pub fn add(&mut self, seconds: f64) {
        self.count += 1;
        self.total += seconds;
        self.min = Some(self.min.map_or(seconds, |m| m.min(seconds)));
        self.max = Some(self.max.map_or(seconds, |m| m.max(seconds)));
        self.mean = Some(self.total / self.count as f64);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatistics {
    pub all_tasks: RunTimeStats,
    pub successful_tasks: RunTimeStats,
    pub failed_tasks: RunTimeStats,
    /// 以任务名为键
    pub tasks_per_type: BTreeMap<String, RunTimeStats>,
}

impl TaskStatistics {
    /// 没有任务时返回 None
    pub fn collect<'a>(tasks: impl IntoIterator<Item = &'a TaskResult>) -> Option<Self> {
        let mut stats = Self {
            all_tasks: RunTimeStats::new("All Tasks"),
            successful_tasks: RunTimeStats::new("Successful Tasks"),
            failed_tasks: RunTimeStats::new("Failed Tasks"),
            tasks_per_type: BTreeMap::new(),
        };
        for task in tasks {
            let seconds = task.run_time().num_milliseconds() as f64 / 1000.0;
            stats.all_tasks.add(seconds);
            if task.successful() {
                stats.successful_tasks.add(seconds);
            } else {
                stats.failed_tasks.add(seconds);
            }
            stats
                .tasks_per_type
                .entry(task.task_name().to_string())
                .or_insert_with(|| RunTimeStats::new(format!("Task type {}", task.task_name())))
                .add(seconds);
        }
        (stats.all_tasks.count > 0).then_some(stats)
    }
}

/// 从仓库读取任务结果并统计
pub fn task_statistics(
    store: &dyn EvidenceStore,
    filter: &TaskFilter,
) -> Result<Option<TaskStatistics>, StoreError> {
    let now = Utc::now();
    let tasks = store.tasks()?;
    Ok(TaskStatistics::collect(
        tasks.iter().filter(|t| filter.matches(t, now)),
    ))
}
