use serde::Deserialize;
use serde_json::{Map, Value};

use super::{execute, PendingResult, Task, TaskContext};
use crate::error::TaskError;
use crate::evidence::{Evidence, EvidenceType};
use crate::fingerprint;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrepConfig {
    /// 扩展正则，每条一行写入模式文件
    #[serde(default)]
    pub filter_patterns: Vec<String>,
}

impl GrepConfig {
    pub const KEYS: [&'static str; 1] = ["filter_patterns"];

    pub fn from_options(options: Map<String, Value>) -> Result<Self, TaskError> {
        serde_json::from_value(Value::Object(options)).map_err(|e| TaskError::Config(e.to_string()))
    }
}

/// 用扩展正则过滤文本证据
pub struct GrepTask {
    config: GrepConfig,
    executable: String,
}

impl GrepTask {
    pub fn new(config: GrepConfig) -> Self {
        Self {
            config,
            executable: "grep".to_string(),
        }
    }
}

impl Task for GrepTask {
    fn name(&self) -> &'static str {
        "GrepTask"
    }

    fn run(
        &self,
        ctx: &TaskContext,
        evidence: &Evidence,
        result: &mut PendingResult,
    ) -> Result<String, TaskError> {
        if self.config.filter_patterns.is_empty() {
            return Ok("No patterns supplied, exit task".to_string());
        }

        // 模式逐行写入文件，交给 grep -f，避免命令行转义问题
        let patterns_path = ctx.output_dir.join("filter_patterns.txt");
        let mut patterns = self.config.filter_patterns.join("\n");
        patterns.push('\n');
        std::fs::write(&patterns_path, patterns).map_err(|e| TaskError::io(&patterns_path, e))?;

        let base_name = evidence
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "evidence".to_string());
        let output_path = ctx.output_dir.join(format!("{}.filtered", base_name));

        let cmd = vec![
            self.executable.clone(),
            "-E".to_string(),
            "-b".to_string(),
            "-n".to_string(),
            "-f".to_string(),
            patterns_path.display().to_string(),
            evidence.local_path.display().to_string(),
        ];
        result.log(format!("Running [{} > {}]", cmd.join(" "), output_path.display()));
        // grep: 0 有结果，1 无结果，其余是错误
        let code = execute(&cmd, ctx, result, &[0, 1], Some(&output_path))?;

        // 没有命中时也会留下一个空文件，同样作为产出登记
        let mut output_evidence = Evidence::new(EvidenceType::FilteredTextFile, &output_path);
        output_evidence.attributes.source = Some(evidence.id_str().to_string());
        output_evidence.size = std::fs::metadata(&output_path)
            .map_err(|e| TaskError::io(&output_path, e))?
            .len();
        output_evidence.hash = Some(
            fingerprint::hash_file(&output_path, ctx.chunk_size)
                .map_err(|e| TaskError::io(&output_path, e))?,
        );
        result.add_evidence(output_evidence);

        let name = evidence.display_name();
        Ok(if code == 0 {
            format!("Grep Task found results in {}", name)
        } else {
            format!("Grep Task did not find any results in {}", name)
        })
    }
}
