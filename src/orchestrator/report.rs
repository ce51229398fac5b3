//! 汇总报告
//!
//! 从全部结果（与完成顺序无关）生成按目录分组的报告。

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::models::work_item::directory_of;
use crate::models::ProcessedResult;

/// 报告评论中的隐藏标记，用来找到并更新上一次的评论
pub const REPORT_MARKER: &str = "<!-- docs-translator-report -->";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Translated,
    AlreadyTranslated,
    Failed,
}

impl EntryStatus {
    fn icon(&self) -> &'static str {
        match self {
            EntryStatus::Translated => "✅",
            EntryStatus::AlreadyTranslated => "⏭️",
            EntryStatus::Failed => "❌",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub path: String,
    pub status: EntryStatus,
    /// PR 链接或错误信息
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub translated: usize,
    pub already_translated: usize,
    pub failed: usize,
    /// 目录 → 该目录下的文件（按路径排序）
    pub directories: BTreeMap<String, Vec<ReportEntry>>,
}

impl BatchReport {
    pub fn from_results(results: &[ProcessedResult]) -> Self {
        let mut report = BatchReport {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            let (status, detail) = match result.error() {
                Some(error) => (EntryStatus::Failed, Some(error.to_string())),
                None if result.already_translated => (EntryStatus::AlreadyTranslated, None),
                None => (
                    EntryStatus::Translated,
                    result.pull_request.as_ref().map(|pr| {
                        pr.url
                            .clone()
                            .unwrap_or_else(|| format!("#{}", pr.number))
                    }),
                ),
            };
            match status {
                EntryStatus::Translated => report.translated += 1,
                EntryStatus::AlreadyTranslated => report.already_translated += 1,
                EntryStatus::Failed => report.failed += 1,
            }
            report
                .directories
                .entry(directory_of(&result.filename))
                .or_default()
                .push(ReportEntry {
                    path: result.filename.clone(),
                    status,
                    detail,
                });
        }
        for entries in report.directories.values_mut() {
            entries.sort_by(|a, b| a.path.cmp(&b.path));
        }
        report
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.directories
            .values()
            .flatten()
            .filter(|entry| entry.status == EntryStatus::Failed)
    }

    /// issue 评论用的 Markdown，首行是隐藏标记
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(REPORT_MARKER);
        out.push_str("\n## Translation report\n\n");
        out.push_str(&format!(
            "| total | translated | already translated | failed |\n|---|---|---|---|\n| {} | {} | {} | {} |\n",
            self.total, self.translated, self.already_translated, self.failed
        ));
        for (directory, entries) in &self.directories {
            out.push_str(&format!("\n### `{}`\n\n", directory));
            for entry in entries {
                match &entry.detail {
                    Some(detail) => out.push_str(&format!(
                        "- {} `{}` {}\n",
                        entry.status.icon(),
                        entry.path,
                        detail.replace('\n', " ")
                    )),
                    None => out.push_str(&format!("- {} `{}`\n", entry.status.icon(), entry.path)),
                }
            }
        }
        out
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "共 {} 个文件：翻译 {}，已是目标语言 {}，失败 {}",
            self.total, self.translated, self.already_translated, self.failed
        )?;
        for (directory, entries) in &self.directories {
            writeln!(f, "{}/", directory)?;
            for entry in entries {
                write!(f, "  {} {}", entry.status.icon(), entry.path)?;
                if let Some(detail) = &entry.detail {
                    write!(f, " - {}", detail)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorRecord;
    use crate::models::{BranchRef, MergeableState, PrState, PullRequestRecord};

    fn translated(path: &str, number: u64) -> ProcessedResult {
        ProcessedResult::translated(
            path,
            "text".into(),
            BranchRef {
                name: format!("t/{}", number),
                sha: "c".into(),
                created: true,
            },
            PullRequestRecord {
                number,
                head_branch: format!("t/{}", number),
                state: PrState::Open,
                mergeable_state: MergeableState::Clean,
                url: None,
            },
        )
    }

    #[test]
    fn test_grouping_is_order_independent() {
        let failed = ProcessedResult::failed(
            "docs/guide/b.md",
            ErrorRecord {
                kind: "completion_api.server_error".into(),
                operation: Some("complete".into()),
                status: Some(500),
                request_id: None,
                message: "boom".into(),
            },
        );
        let results = vec![
            translated("docs/guide/c.md", 3),
            failed,
            ProcessedResult::already_translated("README.md", "x"),
            translated("docs/guide/a.md", 1),
        ];
        let mut reversed = results.clone();
        reversed.reverse();

        let report = BatchReport::from_results(&results);
        assert_eq!(report, BatchReport::from_results(&reversed));
        assert_eq!((report.translated, report.already_translated, report.failed), (2, 1, 1));

        let dirs: Vec<_> = report.directories.keys().cloned().collect();
        assert_eq!(dirs, vec![".".to_string(), "docs/guide".to_string()]);
        let paths: Vec<_> = report.directories["docs/guide"].iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["docs/guide/a.md", "docs/guide/b.md", "docs/guide/c.md"]);
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn test_markdown_starts_with_marker() {
        let report = BatchReport::from_results(&[translated("docs/a.md", 7)]);
        let markdown = report.to_markdown();
        assert!(markdown.starts_with(REPORT_MARKER));
        assert!(markdown.contains("- ✅ `docs/a.md` #7"));
    }
}
