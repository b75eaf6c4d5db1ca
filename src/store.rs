use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::evidence::{Evidence, EvidenceId, EvidenceState};
use crate::task::TaskResult;

/// 模块：证据仓库 (Evidence Store)
///
/// **职责**: 负责"档案管理"。按标识查证据、按内容哈希查标识、写入新证据。
/// 不含任何业务逻辑，只是一份契约。
///
/// **唯一的正确性要求 (前置条件)**:
/// `put` 对哈希索引的写入必须是原子的"检查并插入"。
/// 两个并发上传拿着同一个哈希调用 `put`，只能有一个得到 `Inserted`，
/// 另一个必须得到指向前者的 `Duplicate`。`find_by_hash` 只是快速路径，
/// 真正的裁决发生在 `put` 里。
pub trait EvidenceStore: Send + Sync {
    fn get(&self, id: &EvidenceId) -> Result<Option<Evidence>, StoreError>;

    fn find_by_hash(&self, hash: &str) -> Result<Option<EvidenceId>, StoreError>;

    /// 写入新证据。记录没有 id 时由 store 分配。
    fn put(&self, evidence: Evidence) -> Result<PutOutcome, StoreError>;

    fn update_state(&self, id: &EvidenceId, state: EvidenceState) -> Result<Evidence, StoreError>;

    /// 全部证据按类型分组
    fn summary(&self) -> Result<BTreeMap<String, Vec<Evidence>>, StoreError>;

    fn record_task(&self, result: &TaskResult) -> Result<(), StoreError>;

    fn get_task(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError>;

    /// 全部已记录的任务结果 (统计用)
    fn tasks(&self) -> Result<Vec<TaskResult>, StoreError>;
}

/// `put` 的结果：新插入，或者哈希已被占用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted(EvidenceId),
    Duplicate(EvidenceId),
}

fn group_by_type(items: impl Iterator<Item = Evidence>) -> BTreeMap<String, Vec<Evidence>> {
    let mut summary: BTreeMap<String, Vec<Evidence>> = BTreeMap::new();
    for ev in items {
        summary.entry(ev.evidence_type.to_string()).or_default().push(ev);
    }
    summary
}

// ==========================================
// sled 后端 (生产)
// ==========================================

/// 基于 sled 的持久化仓库
///
/// 三棵树：
/// - `evidence`: id -> Evidence (JSON)
/// - `evidence_hashes`: hash -> id，哈希索引
/// - `tasks`: task_id -> TaskResult (JSON)
pub struct SledEvidenceStore {
    evidence: sled::Tree,
    hashes: sled::Tree,
    tasks: sled::Tree,
}

impl SledEvidenceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// 进程退出即删除的临时库，测试用
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    /// 撤销 `put` 里抢占的哈希索引。失败只记日志：
    /// 索引会指向不存在的记录，后续同内容上传都会被判重复，需要人工清理。
    fn release_hash(&self, hash: &str, id: &EvidenceId) -> bool {
        match self.hashes.remove(hash.as_bytes()) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(evidence_id = %id, %hash, "Could not roll back hash index: {}", e);
                false
            }
        }
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            evidence: db.open_tree("evidence")?,
            hashes: db.open_tree("evidence_hashes")?,
            tasks: db.open_tree("tasks")?,
        })
    }
}

impl EvidenceStore for SledEvidenceStore {
    fn get(&self, id: &EvidenceId) -> Result<Option<Evidence>, StoreError> {
        match self.evidence.get(id.as_str())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_by_hash(&self, hash: &str) -> Result<Option<EvidenceId>, StoreError> {
        Ok(self
            .hashes
            .get(hash)?
            .map(|v| EvidenceId(String::from_utf8_lossy(&v).into_owned())))
    }

    fn put(&self, mut evidence: Evidence) -> Result<PutOutcome, StoreError> {
        let id = evidence.id.clone().unwrap_or_else(EvidenceId::generate);
        evidence.id = Some(id.clone());
        // 先序列化，保证哈希索引写入之后不会因为编码失败留下悬空索引
        let payload = serde_json::to_vec(&evidence)?;

        if let Some(hash) = &evidence.hash {
            // compare_and_swap(None -> id) 就是原子的"检查并插入"
            let cas = self.hashes.compare_and_swap(
                hash.as_bytes(),
                None as Option<&[u8]>,
                Some(id.as_str().as_bytes()),
            )?;
            if let Err(conflict) = cas {
                let existing = conflict
                    .current
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .unwrap_or_default();
                return Ok(PutOutcome::Duplicate(EvidenceId(existing)));
            }
        }

        if let Err(e) = self.evidence.insert(id.as_str(), payload) {
            if let Some(hash) = &evidence.hash {
                self.release_hash(hash, &id);
            }
            return Err(e.into());
        }
        tracing::info!(evidence_id = %id, "Writing new evidence into store");
        Ok(PutOutcome::Inserted(id))
    }

    fn update_state(&self, id: &EvidenceId, state: EvidenceState) -> Result<Evidence, StoreError> {
        let mut evidence = self
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        evidence.state = state;
        self.evidence.insert(id.as_str(), serde_json::to_vec(&evidence)?)?;
        tracing::info!(evidence_id = %id, %state, "Updating evidence state");
        Ok(evidence)
    }

    fn summary(&self) -> Result<BTreeMap<String, Vec<Evidence>>, StoreError> {
        let mut items = Vec::new();
        for entry in self.evidence.iter() {
            let (_, bytes) = entry?;
            items.push(serde_json::from_slice::<Evidence>(&bytes)?);
        }
        Ok(group_by_type(items.into_iter()))
    }

    fn record_task(&self, result: &TaskResult) -> Result<(), StoreError> {
        self.tasks.insert(result.task_id(), serde_json::to_vec(result)?)?;
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        match self.tasks.get(task_id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn tasks(&self) -> Result<Vec<TaskResult>, StoreError> {
        let mut results = Vec::new();
        for entry in self.tasks.iter() {
            let (_, bytes) = entry?;
            results.push(serde_json::from_slice::<TaskResult>(&bytes)?);
        }
        Ok(results)
    }
}

// ==========================================
// 内存后端 (测试)
// ==========================================

/// 纯内存实现。程序一关数据就没了，只用于测试和本地实验。
#[derive(Default)]
pub struct MemEvidenceStore {
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    evidence: HashMap<String, Evidence>,
    hashes: HashMap<String, EvidenceId>,
    tasks: HashMap<String, TaskResult>,
}

impl MemEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().evidence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EvidenceStore for MemEvidenceStore {
    fn get(&self, id: &EvidenceId) -> Result<Option<Evidence>, StoreError> {
        Ok(self.lock().evidence.get(id.as_str()).cloned())
    }

    fn find_by_hash(&self, hash: &str) -> Result<Option<EvidenceId>, StoreError> {
        Ok(self.lock().hashes.get(hash).cloned())
    }

    fn put(&self, mut evidence: Evidence) -> Result<PutOutcome, StoreError> {
        // 一把锁覆盖检查和插入
        let mut inner = self.lock();
        if let Some(existing) = evidence.hash.as_ref().and_then(|h| inner.hashes.get(h)) {
            return Ok(PutOutcome::Duplicate(existing.clone()));
        }
        let id = evidence.id.clone().unwrap_or_else(EvidenceId::generate);
        evidence.id = Some(id.clone());
        if let Some(hash) = &evidence.hash {
            inner.hashes.insert(hash.clone(), id.clone());
        }
        inner.evidence.insert(id.0.clone(), evidence);
        Ok(PutOutcome::Inserted(id))
    }

    fn update_state(&self, id: &EvidenceId, state: EvidenceState) -> Result<Evidence, StoreError> {
        let mut inner = self.lock();
        let evidence = inner
            .evidence
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        evidence.state = state;
        Ok(evidence.clone())
    }

    fn summary(&self) -> Result<BTreeMap<String, Vec<Evidence>>, StoreError> {
        let inner = self.lock();
        Ok(group_by_type(inner.evidence.values().cloned()))
    }

    fn record_task(&self, result: &TaskResult) -> Result<(), StoreError> {
        self.lock()
            .tasks
            .insert(result.task_id().to_string(), result.clone());
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        Ok(self.lock().tasks.get(task_id).cloned())
    }

    fn tasks(&self) -> Result<Vec<TaskResult>, StoreError> {
        Ok(self.lock().tasks.values().cloned().collect())
    }
}
