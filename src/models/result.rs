//! 单个文件的处理结果

use serde::{Deserialize, Serialize};

use crate::error::ErrorRecord;
use crate::models::lifecycle::{MergeableState, PrState};

/// 远端分支引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    /// 分支名（不含 `refs/heads/` 前缀）
    pub name: String,
    /// 分支当前指向的 sha
    pub sha: String,
    /// 是否由本次调用新建（失败回滚时只删除新建的分支）
    #[serde(default)]
    pub created: bool,
}

/// 远端 PR 记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub number: u64,
    pub head_branch: String,
    pub state: PrState,
    pub mergeable_state: MergeableState,
    pub url: Option<String>,
}

/// 处理结果：译文与错误恰好其一
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Translation(String),
    Error(ErrorRecord),
}

/// 单个文件的最终处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedResult {
    /// 文件路径
    pub filename: String,
    pub outcome: Outcome,
    pub branch: Option<BranchRef>,
    pub pull_request: Option<PullRequestRecord>,
    /// 内容本身已是目标语言，没有产生任何远端副作用
    #[serde(default)]
    pub already_translated: bool,
}

impl ProcessedResult {
    pub fn translated(
        filename: impl Into<String>,
        translation: String,
        branch: BranchRef,
        pull_request: PullRequestRecord,
    ) -> Self {
        Self {
            filename: filename.into(),
            outcome: Outcome::Translation(translation),
            branch: Some(branch),
            pull_request: Some(pull_request),
            already_translated: false,
        }
    }

    /// 已是目标语言：原文即"译文"
    pub fn already_translated(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            outcome: Outcome::Translation(content.into()),
            branch: None,
            pull_request: None,
            already_translated: true,
        }
    }

    pub fn failed(filename: impl Into<String>, error: ErrorRecord) -> Self {
        Self {
            filename: filename.into(),
            outcome: Outcome::Error(error),
            branch: None,
            pull_request: None,
            already_translated: false,
        }
    }

    pub fn translation(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Translation(text) => Some(text),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        match &self.outcome {
            Outcome::Error(err) => Some(err),
            Outcome::Translation(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Translation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_outcome() {
        let ok = ProcessedResult::already_translated("a.md", "text");
        assert!(ok.translation().is_some() && ok.error().is_none());

        let record = ErrorRecord {
            kind: "unknown".into(),
            operation: None,
            status: None,
            request_id: None,
            message: "boom".into(),
        };
        let failed = ProcessedResult::failed("b.md", record);
        assert!(failed.translation().is_none() && failed.error().is_some());
        assert!(!failed.is_success());
    }
}
