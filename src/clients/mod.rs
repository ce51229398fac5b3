//! 外部协作方
//!
//! 每个协作方只有一个适配器，在边界处把第三方错误归一化为 [`AppError`]，
//! 内部代码不再接触第三方的错误形状。
//!
//! [`AppError`]: crate::error::AppError

pub mod detector;
pub mod github_client;
pub mod llm_client;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::AppResult;
use crate::models::{PrState, PullRequestRecord, TreeEntry};

pub use detector::WhatlangDetector;
pub use github_client::GithubClient;
pub use llm_client::OpenAiCompletion;

/// 提交一个文件（新建或更新）
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: String,
    pub content: String,
    pub branch: String,
    pub message: String,
    /// 远端当前版本的 sha，`None` 表示新建
    pub sha: Option<String>,
}

/// 新建 PR
#[derive(Debug, Clone)]
pub struct NewPullRequest {
    pub branch: String,
    pub title: String,
    pub body: String,
}

/// 更新 PR
#[derive(Debug, Clone, Default)]
pub struct PullRequestUpdate {
    pub title: Option<String>,
    pub body: Option<String>,
    pub state: Option<PrState>,
}

/// Issue 评论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    pub body: String,
}

/// 代码托管服务
///
/// 分支和文件操作作用于 fork，PR 与评论作用于上游仓库。
#[async_trait]
pub trait VersionControlHost: Send + Sync {
    async fn get_tree(&self, reference: &str) -> AppResult<Vec<TreeEntry>>;
    async fn get_blob(&self, sha: &str) -> AppResult<Vec<u8>>;

    /// 上游仓库分支指向的 sha
    async fn get_base_ref(&self, branch: &str) -> AppResult<Option<String>>;
    /// fork 分支指向的 sha，不存在时返回 `None`
    async fn get_ref(&self, branch: &str) -> AppResult<Option<String>>;
    async fn create_ref(&self, branch: &str, sha: &str) -> AppResult<String>;
    async fn delete_ref(&self, branch: &str) -> AppResult<()>;

    /// 分支上文件的当前 blob sha
    async fn get_file_sha(&self, path: &str, branch: &str) -> AppResult<Option<String>>;
    /// 返回新提交的 sha
    async fn create_or_update_file(&self, change: FileChange) -> AppResult<String>;

    /// 以 `branch` 为 head 的打开状态 PR
    async fn list_open_prs(&self, branch: &str) -> AppResult<Vec<PullRequestRecord>>;
    async fn create_pr(&self, request: NewPullRequest) -> AppResult<PullRequestRecord>;
    async fn update_pr(&self, number: u64, update: PullRequestUpdate) -> AppResult<PullRequestRecord>;
    async fn get_pr(&self, number: u64) -> AppResult<PullRequestRecord>;

    async fn create_issue_comment(&self, issue: u64, body: &str) -> AppResult<IssueComment>;
    async fn update_issue_comment(&self, comment_id: u64, body: &str) -> AppResult<IssueComment>;
    async fn list_issue_comments(&self, issue: u64) -> AppResult<Vec<IssueComment>>;
}

/// 语言模型补全服务
#[async_trait]
pub trait LanguageModelCompletion: Send + Sync {
    async fn complete(&self, instructions: &str, content: &str) -> AppResult<String>;
}

/// 语言检测结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Detection {
    /// ISO 639-3 语言代码，无法判断时为 `und`
    pub language: String,
    pub confidences: HashMap<String, f64>,
}

impl Detection {
    pub fn undetermined() -> Self {
        Self {
            language: "und".to_string(),
            confidences: HashMap::new(),
        }
    }

    pub fn single(language: impl Into<String>, confidence: f64) -> Self {
        let language = language.into();
        let mut confidences = HashMap::new();
        confidences.insert(language.clone(), confidence);
        Self { language, confidences }
    }

    /// 检测出的主语言的置信度
    pub fn confidence(&self) -> f64 {
        self.confidence_of(&self.language)
    }

    pub fn confidence_of(&self, language: &str) -> f64 {
        self.confidences.get(language).copied().unwrap_or(0.0)
    }
}

/// 语言检测
pub trait LanguageDetector: Send + Sync {
    fn detect(&self, text: &str) -> Detection;
}
