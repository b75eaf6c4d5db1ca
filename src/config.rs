use std::env;
use std::path::PathBuf;

use anyhow::Context;
use chrono::format::{Item, StrftimeItems};

const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    /// 上传文件与任务产出的根目录
    pub output_dir: PathBuf,
    /// 上传时每次读取/写入的块大小
    pub chunk_size: usize,
    /// 单个文件的字节上限，达到即拒绝
    pub max_upload_size: u64,
    /// 同一批次内同时写盘的文件数
    pub upload_concurrency: usize,
    /// 外部工具的工作槽位数
    pub task_workers: usize,
    /// 保存文件名里的时间戳格式 (chrono strftime)
    pub datetime_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            db_path: "data/db/evidence_db".to_string(),
            output_dir: PathBuf::from("data/output"),
            chunk_size: 10 * 1024 * 1024,
            max_upload_size: 10 * 1024 * 1024 * 1024,
            upload_concurrency: 4,
            task_workers: 2,
            datetime_format: "%Y-%m-%dT%H:%M:%S%.6fZ".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_var("PORT", defaults.port)?,
            db_path: env::var("DB_PATH").unwrap_or(defaults.db_path),
            output_dir: env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            chunk_size: parse_var("CHUNK_SIZE", defaults.chunk_size)?.max(1),
            max_upload_size: parse_var("MAX_UPLOAD_SIZE", defaults.max_upload_size)?,
            upload_concurrency: parse_var("UPLOAD_CONCURRENCY", defaults.upload_concurrency)?
                .clamp(1, MAX_CONCURRENCY),
            task_workers: parse_var("TASK_WORKERS", defaults.task_workers)?
                .clamp(1, MAX_CONCURRENCY),
            datetime_format: validate_datetime_format(
                env::var("DATETIME_FORMAT").unwrap_or(defaults.datetime_format),
            )?,
        })
    }
}

/// 启动时就拒绝非法的 strftime 格式，否则每次上传都会失败
fn validate_datetime_format(format: String) -> anyhow::Result<String> {
    if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
        anyhow::bail!("DATETIME_FORMAT {:?} is not a valid strftime format", format);
    }
    Ok(format)
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", name, raw)),
        _ => Ok(default),
    }
}
