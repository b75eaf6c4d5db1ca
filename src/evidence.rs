use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize}; // 引入序列化库，让结构体能转成JSON存入 KV 库

/// 证据标识 (store 分配，调用方视为不透明字符串)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvidenceId(pub String);

impl EvidenceId {
    /// 生成新的标识：uuid v4 的 32 位十六进制形式
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EvidenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 证据类型 (封闭集合)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvidenceType {
    /// 原始磁盘镜像
    RawDisk,
    /// 本地目录
    Directory,
    /// 压缩目录 (tar.gz)
    CompressedDirectory,
    /// bulk_extractor 的输出目录
    BulkExtractorOutput,
    /// grep 过滤后的文本
    FilteredTextFile,
}

impl EvidenceType {
    pub const ALL: [EvidenceType; 5] = [
        EvidenceType::RawDisk,
        EvidenceType::Directory,
        EvidenceType::CompressedDirectory,
        EvidenceType::BulkExtractorOutput,
        EvidenceType::FilteredTextFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceType::RawDisk => "RawDisk",
            EvidenceType::Directory => "Directory",
            EvidenceType::CompressedDirectory => "CompressedDirectory",
            EvidenceType::BulkExtractorOutput => "BulkExtractorOutput",
            EvidenceType::FilteredTextFile => "FilteredTextFile",
        }
    }

    /// 目录类证据：外部工具需要以递归模式处理
    pub fn is_directory(&self) -> bool {
        matches!(self, EvidenceType::Directory | EvidenceType::CompressedDirectory)
    }

    /// 该类型可以声明的属性 (对外提供 /evidence/types 查询)
    pub fn attributes(&self) -> &'static [&'static str] {
        match self {
            EvidenceType::RawDisk => &["name", "source", "mount_partition", "project", "zone"],
            EvidenceType::Directory => &["name", "source", "browser_type", "profile"],
            EvidenceType::CompressedDirectory => &["name", "source", "browser_type", "profile"],
            EvidenceType::BulkExtractorOutput => &["name", "source"],
            EvidenceType::FilteredTextFile => &["name", "source"],
        }
    }
}

impl fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvidenceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EvidenceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("{} is not an evidence type.", s))
    }
}

/// 证据处理状态
///
/// 典型路径：`New → Attached → (Mounted / Decompressed) → Processed`，
/// 任意阶段出错进入终态 `Failed`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvidenceState {
    New,
    Attached,
    Mounted,
    Decompressed,
    Processed,
    Failed,
}

impl fmt::Display for EvidenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvidenceState::New => "NEW",
            EvidenceState::Attached => "ATTACHED",
            EvidenceState::Mounted => "MOUNTED",
            EvidenceState::Decompressed => "DECOMPRESSED",
            EvidenceState::Processed => "PROCESSED",
            EvidenceState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// 上传时声明的属性，全部可选，是否有意义取决于证据类型
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvidenceAttributes {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub browser_type: Option<String>,
    #[serde(default)]
    pub disk_name: Option<String>,
    #[serde(default)]
    pub embedded_path: Option<String>,
    #[serde(default)]
    pub mount_partition: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
}

impl EvidenceAttributes {
    /// 请求映射中属于"证据属性"这一类的键
    pub const KEYS: [&'static str; 9] = [
        "name",
        "source",
        "browser_type",
        "disk_name",
        "embedded_path",
        "mount_partition",
        "profile",
        "project",
        "zone",
    ];

    /// 用另一组属性覆盖：只覆盖对方给了值的字段
    pub fn apply(&mut self, overrides: EvidenceAttributes) {
        let EvidenceAttributes {
            name,
            source,
            browser_type,
            disk_name,
            embedded_path,
            mount_partition,
            profile,
            project,
            zone,
        } = overrides;
        for (slot, value) in [
            (&mut self.name, name),
            (&mut self.source, source),
            (&mut self.browser_type, browser_type),
            (&mut self.disk_name, disk_name),
            (&mut self.embedded_path, embedded_path),
            (&mut self.mount_partition, mount_partition),
            (&mut self.profile, profile),
            (&mut self.project, project),
            (&mut self.zone, zone),
        ] {
            if value.is_some() {
                *slot = value;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    // === 身份 ===

    /// 入库前为 None，由 store 在 put 时分配
    pub id: Option<EvidenceId>,
    pub evidence_type: EvidenceType,

    /// SHA3-224 的小写十六进制摘要。
    /// 全库唯一：同一哈希只允许第一条记录存在。
    pub hash: Option<String>,

    // === 位置与大小 ===
    pub local_path: PathBuf,
    pub size: u64,

    // === 声明属性 ===
    #[serde(default)]
    pub attributes: EvidenceAttributes,

    // === 处理状态 ===
    pub state: EvidenceState,

    /// 任务附加的文本 (例如 bulk_extractor 的报告)
    #[serde(default)]
    pub text_data: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Evidence {
    pub fn new(evidence_type: EvidenceType, local_path: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            evidence_type,
            hash: None,
            local_path: local_path.into(),
            size: 0,
            attributes: EvidenceAttributes::default(),
            state: EvidenceState::New,
            text_data: None,
            created_at: Utc::now(),
        }
    }

    /// 用于日志与路径：未入库的证据用 "unsaved" 占位
    pub fn id_str(&self) -> &str {
        self.id.as_ref().map(|id| id.as_str()).unwrap_or("unsaved")
    }

    pub fn display_name(&self) -> String {
        self.attributes.name.clone().unwrap_or_else(|| {
            self.local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.local_path.display().to_string())
        })
    }
}
