use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{execute, PendingResult, Task, TaskContext};
use crate::archive;
use crate::error::TaskError;
use crate::evidence::{Evidence, EvidenceState, EvidenceType};
use crate::fingerprint;
use crate::report;

pub const REPORT_FILENAME: &str = "report.md";

/// bulk_extractor 任务配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkExtractorConfig {
    /// 额外参数，`:` 分隔。上游配置编码里不能出现 `=`，用 `~` 代替。
    #[serde(default)]
    pub tool_args: Option<String>,
    /// 正则模式文件 (`-F`)，不存在的路径会被跳过
    #[serde(default)]
    pub auxiliary_pattern_files: Vec<PathBuf>,
}

impl BulkExtractorConfig {
    pub const KEYS: [&'static str; 2] = ["tool_args", "auxiliary_pattern_files"];

    pub fn from_options(options: Map<String, Value>) -> Result<Self, TaskError> {
        serde_json::from_value(Value::Object(options)).map_err(|e| TaskError::Config(e.to_string()))
    }

    /// `~` 先换成 `=` 再按 `:` 切分，保持顺序，丢弃空段
    pub fn extra_args(&self) -> Vec<String> {
        self.tool_args
            .as_deref()
            .map(|raw| {
                raw.replace('~', "=")
                    .split(':')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn existing_pattern_files(&self) -> Vec<PathBuf> {
        self.auxiliary_pattern_files
            .iter()
            .filter(|p| p.exists())
            .cloned()
            .collect()
    }
}

pub struct BulkExtractorTask {
    config: BulkExtractorConfig,
    executable: String,
}

impl BulkExtractorTask {
    pub fn new(config: BulkExtractorConfig) -> Self {
        Self {
            config,
            executable: "bulk_extractor".to_string(),
        }
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    /// 命令行：可执行文件, [-R], -o 输出, 额外参数, -F 模式文件..., 证据路径
    pub fn build_command(&self, evidence: &Evidence, output_path: &Path, pattern_files: &[PathBuf]) -> Vec<String> {
        let mut cmd = vec![self.executable.clone()];
        if evidence.evidence_type.is_directory() {
            cmd.push("-R".to_string());
        }
        cmd.push("-o".to_string());
        cmd.push(output_path.display().to_string());
        cmd.extend(self.config.extra_args());
        for pattern_file in pattern_files {
            cmd.push("-F".to_string());
            cmd.push(pattern_file.display().to_string());
        }
        cmd.push(evidence.local_path.display().to_string());
        cmd
    }
}

impl Task for BulkExtractorTask {
    fn name(&self) -> &'static str {
        "BulkExtractorTask"
    }

    fn required_states(&self) -> &[EvidenceState] {
        &[EvidenceState::Attached]
    }

    fn run(
        &self,
        ctx: &TaskContext,
        evidence: &Evidence,
        result: &mut PendingResult,
    ) -> Result<String, TaskError> {
        // 1. 输出路径：任务目录下以证据文件名命名，bulk_extractor 要求它事先不存在
        let base_name = evidence
            .local_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "bulk_extractor_output".into());
        let output_path = ctx.output_dir.join(base_name);
        let report_path = ctx.output_dir.join(REPORT_FILENAME);

        // 2. 模式文件：只保留磁盘上真实存在的 (-F)
        let pattern_files = self.config.existing_pattern_files();
        if !pattern_files.is_empty() {
            result.log(format!("{} valid Pattern Files detected.", pattern_files.len()));
        }
        // 目录类证据走递归模式 (-R)
        if evidence.evidence_type.is_directory() {
            result.log(format!(
                "Running Bulk Extractor against {} by using -R Flag.",
                evidence.evidence_type
            ));
        }

        // 3. 拼命令并执行，非 0 退出码直接以 ToolExecutionFailed 结束任务
        let cmd = self.build_command(evidence, &output_path, &pattern_files);
        result.log(format!("Running Bulk Extractor as [{}]", cmd.join(" ")));
        execute(&cmd, ctx, result, &[0], None)?;

        // 4. 产出证据：来源指向输入证据
        let mut output_evidence = Evidence::new(EvidenceType::BulkExtractorOutput, &output_path);
        output_evidence.attributes.source = Some(evidence.id_str().to_string());

        // 5. 报告：report.xml -> Markdown。解析失败只会降级，不会让任务失败
        let (text, summary) = report::generate_report(&output_path);
        std::fs::write(&report_path, text.as_bytes()).map_err(|e| TaskError::io(&report_path, e))?;
        result.set_report(text.clone());
        output_evidence.text_data = Some(text);

        // 6. 打包输出目录，证据改指向归档，并以归档内容计算指纹 (用于去重)
        let archive_path = archive::compress(&output_path)?;
        output_evidence.hash = Some(
            fingerprint::hash_file(&archive_path, ctx.chunk_size)
                .map_err(|e| TaskError::io(&archive_path, e))?,
        );
        output_evidence.size = std::fs::metadata(&archive_path)
            .map_err(|e| TaskError::io(&archive_path, e))?
            .len();
        output_evidence.local_path = archive_path;
        result.add_evidence(output_evidence);

        // 7. 摘要作为任务状态；结果由 runner 统一关闭
        Ok(summary)
    }
}
