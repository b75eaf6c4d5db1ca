//! 证据入库流水线
//!
//! 上传流按块写盘，同时计算 SHA3-224；超过上限立即失败并删除残留文件；
//! 写完后按哈希去重，重复内容不算错误，而是告诉调用方已有证据的标识。

use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::config::Config;
use crate::error::IngestError;
use crate::evidence::{Evidence, EvidenceAttributes, EvidenceId, EvidenceType};
use crate::fingerprint::ContentHasher;
use crate::store::{EvidenceStore, PutOutcome};

/// 落盘后的文件元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub original_name: String,
    pub saved_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub hash: Option<String>,
}

/// 一个待上传的文件：文件名 + 字节流
pub struct Upload<R> {
    pub file_name: String,
    pub reader: R,
}

impl<R> Upload<R> {
    pub fn new(file_name: impl Into<String>, reader: R) -> Self {
        Self {
            file_name: file_name.into(),
            reader,
        }
    }
}

/// 一次上传请求，可以包含多个文件
pub struct UploadRequest<R> {
    pub ticket_id: String,
    pub calculate_hash: bool,
    pub evidence_type: EvidenceType,
    pub attributes: EvidenceAttributes,
    pub files: Vec<Upload<R>>,
}

/// 单个文件入库的正常结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Created { evidence_id: EvidenceId, file: FileInfo },
    /// 内容已经存在，新写的文件已删除
    Duplicate { existing_id: EvidenceId, file: FileInfo },
}

/// 批量请求里每个文件的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Created {
        file_name: String,
        evidence_id: EvidenceId,
        file: FileInfo,
    },
    Duplicate {
        file_name: String,
        existing_id: EvidenceId,
        message: String,
    },
    Failed {
        file_name: String,
        message: String,
    },
}

impl FileOutcome {
    pub fn file_name(&self) -> &str {
        match self {
            FileOutcome::Created { file_name, .. }
            | FileOutcome::Duplicate { file_name, .. }
            | FileOutcome::Failed { file_name, .. } => file_name,
        }
    }

    pub fn from_result(file_name: String, result: Result<IngestOutcome, IngestError>) -> Self {
        match result {
            Ok(IngestOutcome::Created { evidence_id, file }) => FileOutcome::Created {
                file_name,
                evidence_id,
                file,
            },
            Ok(IngestOutcome::Duplicate { existing_id, .. }) => FileOutcome::Duplicate {
                message: format!("File {} was uploaded before, check {}", file_name, existing_id),
                file_name,
                existing_id,
            },
            Err(e) => FileOutcome::Failed {
                file_name,
                message: e.to_string(),
            },
        }
    }
}

/// 按块把流写入 `destination`。
///
/// 目标文件用 `create_new` 打开，同一路径只会有一个写入者。
/// 累计字节数达到 `max_size` 时返回 `SizeExceeded`；残留文件由调用方删除。
pub async fn ingest_stream<R: AsyncRead>(
    reader: R,
    original_name: &str,
    destination: &Path,
    max_size: u64,
    chunk_size: usize,
    compute_hash: bool,
) -> Result<FileInfo, IngestError> {
    tokio::pin!(reader);
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| IngestError::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .await
        .map_err(|e| IngestError::io(destination, e))?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut hasher = compute_hash.then(ContentHasher::new);
    let mut size: u64 = 0;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| IngestError::io(destination, e))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .await
            .map_err(|e| IngestError::io(destination, e))?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        size += n as u64;
        if size >= max_size {
            tracing::error!(file = original_name, size, limit = max_size, "Upload exceeds maximum size");
            return Err(IngestError::SizeExceeded {
                name: original_name.to_string(),
                size,
                limit: max_size,
            });
        }
    }
    file.flush().await.map_err(|e| IngestError::io(destination, e))?;

    Ok(FileInfo {
        original_name: original_name.to_string(),
        saved_name: destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: destination.to_path_buf(),
        size,
        hash: hasher.map(ContentHasher::finish),
    })
}

/// `<output_dir>/<ticket_id>/<stem>_<timestamp><.ext>`
///
/// 客户端给的文件名只取最后一段，避免写出目录之外。
/// 时间戳格式非法时返回 `InvalidTimestampFormat`，不会 panic。
pub fn saved_path(
    output_dir: &Path,
    ticket_id: &str,
    file_name: &str,
    datetime_format: &str,
) -> Result<PathBuf, IngestError> {
    let name = Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| "upload".to_string());
    let name_path = Path::new(&name);
    let stem = name_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    let extension = name_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    // DelayedFormat 遇到非法格式项时 Display 返回 fmt::Error，to_string() 会直接 panic
    let mut timestamp = String::new();
    write!(timestamp, "{}", Utc::now().format(datetime_format))
        .map_err(|_| IngestError::InvalidTimestampFormat(datetime_format.to_string()))?;
    let timestamp = timestamp.replace(['/', ':'], "-");
    let ticket = sanitize_component(ticket_id);
    Ok(output_dir
        .join(ticket)
        .join(format!("{}_{}{}", stem, timestamp, extension)))
}

fn sanitize_component(s: &str) -> String {
    let cleaned = s.replace(['/', '\\'], "_");
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

async fn remove_file_logged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::error!("Could not remove file {}: {}", path.display(), e);
        }
    }
}

/// 单个文件：写盘、去重、写入仓库
pub async fn ingest_file<R: AsyncRead>(
    store: &dyn EvidenceStore,
    config: &Config,
    ticket_id: &str,
    upload: Upload<R>,
    evidence_type: EvidenceType,
    attributes: &EvidenceAttributes,
    calculate_hash: bool,
) -> Result<IngestOutcome, IngestError> {
    let destination = saved_path(&config.output_dir, ticket_id, &upload.file_name, &config.datetime_format)?;
    let info = match ingest_stream(
        upload.reader,
        &upload.file_name,
        &destination,
        config.max_upload_size,
        config.chunk_size,
        calculate_hash,
    )
    .await
    {
        Ok(info) => info,
        Err(e) => {
            // 目标已存在说明文件属于别的上传，不能删
            let foreign = matches!(&e, IngestError::Io { source, .. } if source.kind() == ErrorKind::AlreadyExists);
            if !foreign {
                remove_file_logged(&destination).await;
            }
            return Err(e);
        }
    };

    if let Some(hash) = &info.hash {
        let existing = match store.find_by_hash(hash) {
            Ok(existing) => existing,
            Err(e) => {
                remove_file_logged(&info.path).await;
                return Err(e.into());
            }
        };
        if let Some(existing_id) = existing {
            tracing::warn!("File {} was uploaded before, check {}", info.original_name, existing_id);
            remove_file_logged(&info.path).await;
            return Ok(IngestOutcome::Duplicate { existing_id, file: info });
        }
    }

    let mut evidence = Evidence::new(evidence_type, &info.path);
    evidence.hash = info.hash.clone();
    evidence.size = info.size;
    evidence.attributes = attributes.clone();
    if evidence.attributes.name.is_none() {
        evidence.attributes.name = Some(info.original_name.clone());
    }

    match store.put(evidence) {
        Ok(PutOutcome::Inserted(evidence_id)) => {
            tracing::info!(evidence_id = %evidence_id, file = %info.original_name, size = info.size, "📥 Evidence uploaded");
            Ok(IngestOutcome::Created { evidence_id, file: info })
        }
        // find_by_hash 与 put 之间被别的上传抢先
        Ok(PutOutcome::Duplicate(existing_id)) => {
            tracing::warn!("File {} was uploaded before, check {}", info.original_name, existing_id);
            remove_file_logged(&info.path).await;
            Ok(IngestOutcome::Duplicate { existing_id, file: info })
        }
        Err(e) => {
            remove_file_logged(&info.path).await;
            Err(e.into())
        }
    }
}

/// 批量入库：每个文件独立处理，最多 `upload_concurrency` 个同时进行，
/// 结果顺序与提交顺序一致，每个文件恰好一条结果。
pub async fn ingest_batch<R: AsyncRead>(
    store: &dyn EvidenceStore,
    config: &Config,
    request: UploadRequest<R>,
) -> Vec<FileOutcome> {
    let UploadRequest {
        ticket_id,
        calculate_hash,
        evidence_type,
        attributes,
        files,
    } = request;
    let ticket_id = ticket_id.as_str();
    let attributes = &attributes;

    stream::iter(files)
        .map(move |upload| async move {
            let file_name = upload.file_name.clone();
            let result = ingest_file(
                store,
                config,
                ticket_id,
                upload,
                evidence_type,
                attributes,
                calculate_hash,
            )
            .await;
            if let Err(e) = &result {
                tracing::error!(file = %file_name, "Upload failed: {}", e);
            }
            FileOutcome::from_result(file_name, result)
        })
        .buffered(config.upload_concurrency.max(1))
        .collect()
        .await
}
