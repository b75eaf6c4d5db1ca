use thiserror::Error;

use crate::evidence::EvidenceState;

/// 存储后端错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("evidence {0} not found")]
    NotFound(String),
}

/// 单个文件入库的致命错误。重复内容不在这里，见 `IngestOutcome::Duplicate`。
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Unable to upload file {name} of {size} bytes, the maximum upload size is {limit} bytes")]
    SizeExceeded { name: String, size: u64, limit: u64 },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid timestamp format {0:?}")]
    InvalidTimestampFormat(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// 任务执行错误，最终都会被转换成 TaskResult 的失败状态
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Evidence state {actual} does not match any required state [{}]", join_states(.required))]
    PreconditionFailed {
        required: Vec<EvidenceState>,
        actual: EvidenceState,
    },

    #[error("Execution of [{command}] failed: {reason}")]
    ToolExecutionFailed { command: String, reason: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("archive failed: {0}")]
    Archive(String),

    #[error("invalid task config: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn join_states(states: &[EvidenceState]) -> String {
    states
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl TaskError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        TaskError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
