//! bulk_extractor 报告解析
//!
//! 工具在输出目录下写一个 `report.xml`。这里把它宽容地解析成 Markdown 报告
//! 和一句话摘要。缺字段给 "N/A"，缺列表给零计数，坏文件降级成说明文字，
//! 都不会让任务失败。

use std::path::Path;

use serde::Serialize;

pub const XML_REPORT_FILENAME: &str = "report.xml";
pub const NOT_AVAILABLE: &str = "N/A";
pub const NO_REPORT_AVAILABLE: &str = "Execution successful, but the report is not available.";

pub fn heading4(text: &str) -> String {
    format!("#### {}", text)
}

pub fn heading5(text: &str) -> String {
    format!("##### {}", text)
}

pub fn bullet(text: &str) -> String {
    format!("* {}", text)
}

/// 单个 scanner 的命中数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannerCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    /// 按命中数降序 (稳定排序)
    pub findings: Vec<ScannerCount>,
    pub total: u64,
    pub text: String,
    pub summary: String,
}

impl Report {
    fn degraded(text: String, total: u64) -> Self {
        Self {
            findings: Vec::new(),
            total,
            summary: summary_line(total),
            text,
        }
    }

    pub fn into_parts(self) -> (String, String) {
        (self.text, self.summary)
    }
}

pub fn summary_line(total: u64) -> String {
    format!("{} artifacts have been extracted.", total)
}

/// `(report_text, summary)`，见 [`build_report`]
pub fn generate_report(output_path: &Path) -> (String, String) {
    build_report(output_path).into_parts()
}

pub fn build_report(output_path: &Path) -> Report {
    let report_path = output_path.join(XML_REPORT_FILENAME);
    if !report_path.exists() {
        return Report {
            findings: Vec::new(),
            total: 0,
            text: NO_REPORT_AVAILABLE.to_string(),
            summary: NO_REPORT_AVAILABLE.to_string(),
        };
    }

    let xml = match std::fs::read_to_string(&report_path) {
        Ok(xml) => xml,
        Err(e) => {
            tracing::warn!("Could not read {}: {}", report_path.display(), e);
            return Report::degraded(
                format!("Execution successful, but the report could not be read: {}", e),
                0,
            );
        }
    };
    match XmlReport::parse(&xml) {
        Ok(doc) => render(&doc),
        Err(e) => {
            tracing::warn!("Error parsing Bulk Extractor report: {}", e);
            Report::degraded(
                format!("Execution successful, but the report could not be parsed: {}", e),
                0,
            )
        }
    }
}

/// 对 XML 树按路径取值，找不到就是 None，从不报错
pub struct XmlReport<'a> {
    doc: roxmltree::Document<'a>,
}

impl<'a> XmlReport<'a> {
    pub fn parse(xml: &'a str) -> Result<Self, roxmltree::Error> {
        Ok(Self {
            doc: roxmltree::Document::parse(xml)?,
        })
    }

    /// 相对根元素的路径，例如 `creator/execution_environment/start_time`
    pub fn find_text(&self, path: &str) -> Option<String> {
        let mut node = self.doc.root_element();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node
                .children()
                .find(|child| child.is_element() && child.has_tag_name(segment))?;
        }
        node.text().map(|t| t.trim().to_string())
    }

    fn find_or_placeholder(&self, path: &str) -> String {
        self.find_text(path)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string())
    }

    /// `feature_files` 容器；不存在时返回 None
    pub fn feature_counts(&self) -> Option<Vec<ScannerCount>> {
        let container = self
            .doc
            .descendants()
            .find(|n| n.is_element() && n.has_tag_name("feature_files"))?;

        let mut counts = Vec::new();
        for file in container
            .descendants()
            .filter(|n| n.is_element() && n.has_tag_name("feature_file"))
        {
            let child_text = |tag: &str| {
                file.children()
                    .find(|c| c.is_element() && c.has_tag_name(tag))
                    .and_then(|c| c.text())
                    .map(|t| t.trim().to_string())
            };
            let Some(name) = child_text("name") else {
                tracing::warn!("Error parsing feature from Bulk Extractor report: feature_file without name");
                continue;
            };
            let count = match child_text("count").map(|c| c.parse::<u64>()) {
                Some(Ok(count)) => count,
                Some(Err(e)) => {
                    tracing::warn!("Error parsing feature from Bulk Extractor report: {}: {}", name, e);
                    continue;
                }
                None => {
                    tracing::warn!("Error parsing feature from Bulk Extractor report: {} has no count", name);
                    continue;
                }
            };
            counts.push(ScannerCount { name, count });
        }
        Some(counts)
    }
}

fn render(xml: &XmlReport<'_>) -> Report {
    let mut lines = vec![
        heading4("Bulk Extractor Results"),
        heading5("Run Summary"),
        bullet(&format!(
            "Program: {} - {}",
            xml.find_or_placeholder("creator/program"),
            xml.find_or_placeholder("creator/version")
        )),
        bullet(&format!(
            "Command Line: {}",
            xml.find_or_placeholder("creator/execution_environment/command_line")
        )),
        bullet(&format!(
            "Start Time: {}",
            xml.find_or_placeholder("creator/execution_environment/start_time")
        )),
        bullet(&format!(
            "Elapsed Time: {}",
            xml.find_or_placeholder("report/elapsed_seconds")
        )),
    ];

    let (findings, total) = match xml.feature_counts() {
        Some(mut findings) => {
            let total = findings.iter().map(|f| f.count).sum();
            // sort_by 是稳定排序，同数量保持出现顺序
            findings.sort_by(|a, b| b.count.cmp(&a.count));
            lines.push(heading5("Scanner Results\n"));
            lines.extend(render_table(&findings));
            (findings, total)
        }
        None => {
            lines.push(heading5("There are no findings to report."));
            (Vec::new(), 0)
        }
    };

    Report {
        findings,
        total,
        text: lines.join("\n"),
        summary: summary_line(total),
    }
}

fn render_table(findings: &[ScannerCount]) -> Vec<String> {
    const COLUMNS: [&str; 2] = ["Name", "Count"];
    let mut rows = vec![
        COLUMNS.join(" | "),
        vec!["---"; COLUMNS.len()].join(" | "),
    ];
    rows.extend(
        findings
            .iter()
            .map(|f| format!("{} | {}", f.name, f.count)),
    );
    rows
}
