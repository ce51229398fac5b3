//! 内存中的协作方实现，供测试和演练使用
//!
//! 托管方的状态放在 `Mutex` 里，所有方法都只需要 `&self`；
//! 可以按操作名注入失败，并统计每个操作被调用的次数。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::clients::{
    Detection, FileChange, IssueComment, LanguageDetector, LanguageModelCompletion, NewPullRequest,
    PullRequestUpdate, VersionControlHost,
};
use crate::error::{AppResult, CompletionApiError, RemoteApiError};
use crate::models::{EntryType, MergeableState, PrState, PullRequestRecord, TreeEntry};

/// 内容的伪 sha
pub fn content_sha(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().as_str()[..16].to_string()
}

struct FailureRule {
    operation: String,
    /// 只有主体（路径、分支名等）包含该子串时才失败
    subject: Option<String>,
    status: u16,
    message: String,
}

#[derive(Debug, Clone)]
pub struct MockPullRequest {
    pub record: PullRequestRecord,
    pub title: String,
    pub body: String,
}

#[derive(Default)]
struct HostState {
    base_branch: String,
    base_sha: String,
    /// 上游文件：path -> (sha, content)
    upstream: HashMap<String, (String, String)>,
    /// fork 分支：branch -> sha
    refs: HashMap<String, String>,
    /// fork 分支上被改写的文件：(branch, path) -> (sha, content)
    files: HashMap<(String, String), (String, String)>,
    prs: Vec<MockPullRequest>,
    comments: Vec<(u64, IssueComment)>,
    next_id: u64,
    failures: Vec<FailureRule>,
    calls: HashMap<String, usize>,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// 内存中的代码托管方
pub struct MockHost {
    state: Mutex<HostState>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new("main")
    }
}

impl MockHost {
    pub fn new(base_branch: impl Into<String>) -> Self {
        let state = HostState {
            base_branch: base_branch.into(),
            base_sha: "base-0000".to_string(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// 预置上游文件
    pub fn with_files<P, C>(files: impl IntoIterator<Item = (P, C)>) -> Self
    where
        P: Into<String>,
        C: Into<String>,
    {
        let host = Self::default();
        for (path, content) in files {
            host.set_upstream_file(path, content);
        }
        host
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 新增或修改上游文件，返回新的 sha
    pub fn set_upstream_file(&self, path: impl Into<String>, content: impl Into<String>) -> String {
        let content = content.into();
        let sha = content_sha(&content);
        let mut state = self.lock();
        state.upstream.insert(path.into(), (sha.clone(), content));
        state.base_sha = format!("base-{:04}", state.upstream.len());
        sha
    }

    /// 预置一个 fork 分支
    pub fn seed_branch(&self, branch: impl Into<String>) {
        let mut state = self.lock();
        let sha = state.base_sha.clone();
        state.refs.insert(branch.into(), sha);
    }

    /// 预置一个打开状态的 PR（连同它的分支），返回 PR 编号
    pub fn seed_open_pr(&self, branch: impl Into<String>, mergeable_state: MergeableState) -> u64 {
        let branch = branch.into();
        self.seed_branch(branch.clone());
        let mut state = self.lock();
        let number = state.next_id();
        state.prs.push(MockPullRequest {
            record: PullRequestRecord {
                number,
                head_branch: branch.clone(),
                state: PrState::Open,
                mergeable_state,
                url: Some(format!("https://example.test/pull/{}", number)),
            },
            title: format!("translate {}", branch),
            body: String::new(),
        });
        number
    }

    pub fn set_mergeable_state(&self, number: u64, mergeable_state: MergeableState) {
        let mut state = self.lock();
        if let Some(pr) = state.prs.iter_mut().find(|pr| pr.record.number == number) {
            pr.record.mergeable_state = mergeable_state;
        }
    }

    /// 让 `operation` 在主体包含 `subject` 时返回指定状态码
    pub fn fail(&self, operation: &str, subject: Option<&str>, status: u16, message: &str) {
        self.lock().failures.push(FailureRule {
            operation: operation.to_string(),
            subject: subject.map(str::to_string),
            status,
            message: message.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.lock().refs.contains_key(branch)
    }

    pub fn branches(&self) -> Vec<String> {
        let mut branches: Vec<String> = self.lock().refs.keys().cloned().collect();
        branches.sort();
        branches
    }

    pub fn file_on_branch(&self, branch: &str, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(&(branch.to_string(), path.to_string()))
            .map(|(_, content)| content.clone())
    }

    pub fn pull_requests(&self) -> Vec<MockPullRequest> {
        self.lock().prs.clone()
    }

    pub fn comments(&self, issue: u64) -> Vec<IssueComment> {
        self.lock()
            .comments
            .iter()
            .filter(|(n, _)| *n == issue)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// 记录调用并检查注入的失败
    fn enter(&self, operation: &str, subject: &str) -> AppResult<MutexGuard<'_, HostState>> {
        let mut state = self.lock();
        *state.calls.entry(operation.to_string()).or_default() += 1;
        let failure = state.failures.iter().find(|rule| {
            rule.operation == operation
                && rule
                    .subject
                    .as_deref()
                    .map(|s| subject.contains(s))
                    .unwrap_or(true)
        });
        if let Some(rule) = failure {
            let request_id = Some(format!("mock-{}", operation));
            return Err(RemoteApiError::classify(operation, Some(rule.status), request_id, rule.message.clone()).into());
        }
        Ok(state)
    }
}

fn not_found(operation: &str, what: &str) -> RemoteApiError {
    RemoteApiError::classify(operation, Some(404), None, format!("{} Not Found", what))
}

#[async_trait]
impl VersionControlHost for MockHost {
    async fn get_tree(&self, reference: &str) -> AppResult<Vec<TreeEntry>> {
        let state = self.enter("get_tree", reference)?;
        if reference != state.base_branch && reference != state.base_sha {
            return Err(not_found("get_tree", reference).into());
        }
        let mut entries: Vec<TreeEntry> = state
            .upstream
            .iter()
            .map(|(path, (sha, _))| TreeEntry {
                path: path.clone(),
                sha: sha.clone(),
                entry_type: EntryType::Blob,
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn get_blob(&self, sha: &str) -> AppResult<Vec<u8>> {
        let state = self.enter("get_blob", sha)?;
        state
            .upstream
            .values()
            .find(|(blob_sha, _)| blob_sha == sha)
            .map(|(_, content)| content.clone().into_bytes())
            .ok_or_else(|| not_found("get_blob", sha).into())
    }

    async fn get_base_ref(&self, branch: &str) -> AppResult<Option<String>> {
        let state = self.enter("get_base_ref", branch)?;
        Ok((branch == state.base_branch).then(|| state.base_sha.clone()))
    }

    async fn get_ref(&self, branch: &str) -> AppResult<Option<String>> {
        let state = self.enter("get_ref", branch)?;
        Ok(state.refs.get(branch).cloned())
    }

    async fn create_ref(&self, branch: &str, sha: &str) -> AppResult<String> {
        let mut state = self.enter("create_ref", branch)?;
        if state.refs.contains_key(branch) {
            return Err(RemoteApiError::classify("create_ref", Some(422), None, "Reference already exists").into());
        }
        state.refs.insert(branch.to_string(), sha.to_string());
        Ok(sha.to_string())
    }

    async fn delete_ref(&self, branch: &str) -> AppResult<()> {
        let mut state = self.enter("delete_ref", branch)?;
        if state.refs.remove(branch).is_none() {
            return Err(RemoteApiError::classify("delete_ref", Some(422), None, "Reference does not exist").into());
        }
        state.files.retain(|(b, _), _| b != branch);
        Ok(())
    }

    async fn get_file_sha(&self, path: &str, branch: &str) -> AppResult<Option<String>> {
        let state = self.enter("get_file", path)?;
        if !state.refs.contains_key(branch) {
            return Err(not_found("get_file", branch).into());
        }
        let on_branch = state.files.get(&(branch.to_string(), path.to_string()));
        Ok(on_branch
            .or_else(|| state.upstream.get(path))
            .map(|(sha, _)| sha.clone()))
    }

    async fn create_or_update_file(&self, change: FileChange) -> AppResult<String> {
        let mut state = self.enter("create_or_update_file", &change.path)?;
        if !state.refs.contains_key(&change.branch) {
            return Err(not_found("create_or_update_file", &change.branch).into());
        }
        let key = (change.branch.clone(), change.path.clone());
        let current = state
            .files
            .get(&key)
            .or_else(|| state.upstream.get(&change.path))
            .map(|(sha, _)| sha.clone());
        if current != change.sha {
            return Err(RemoteApiError::classify(
                "create_or_update_file",
                Some(409),
                None,
                format!("{} does not match {:?}", change.path, current),
            )
            .into());
        }
        let sha = content_sha(&change.content);
        state.files.insert(key, (sha, change.content));
        let commit = format!("commit-{}", state.next_id());
        state.refs.insert(change.branch, commit.clone());
        Ok(commit)
    }

    async fn list_open_prs(&self, branch: &str) -> AppResult<Vec<PullRequestRecord>> {
        let state = self.enter("list_open_prs", branch)?;
        Ok(state
            .prs
            .iter()
            .filter(|pr| pr.record.head_branch == branch && pr.record.state == PrState::Open)
            .map(|pr| pr.record.clone())
            .collect())
    }

    async fn create_pr(&self, request: NewPullRequest) -> AppResult<PullRequestRecord> {
        let mut state = self.enter("create_pr", &request.branch)?;
        if !state.refs.contains_key(&request.branch) {
            return Err(RemoteApiError::classify("create_pr", Some(422), None, "head branch missing").into());
        }
        let number = state.next_id();
        let record = PullRequestRecord {
            number,
            head_branch: request.branch,
            state: PrState::Open,
            mergeable_state: MergeableState::Clean,
            url: Some(format!("https://example.test/pull/{}", number)),
        };
        state.prs.push(MockPullRequest {
            record: record.clone(),
            title: request.title,
            body: request.body,
        });
        Ok(record)
    }

    async fn update_pr(&self, number: u64, update: PullRequestUpdate) -> AppResult<PullRequestRecord> {
        let mut state = self.enter("update_pr", &number.to_string())?;
        let pr = state
            .prs
            .iter_mut()
            .find(|pr| pr.record.number == number)
            .ok_or_else(|| not_found("update_pr", &number.to_string()))?;
        if let Some(title) = update.title {
            pr.title = title;
        }
        if let Some(body) = update.body {
            pr.body = body;
        }
        if let Some(pr_state) = update.state {
            pr.record.state = pr_state;
        }
        Ok(pr.record.clone())
    }

    async fn get_pr(&self, number: u64) -> AppResult<PullRequestRecord> {
        let state = self.enter("get_pr", &number.to_string())?;
        state
            .prs
            .iter()
            .find(|pr| pr.record.number == number)
            .map(|pr| pr.record.clone())
            .ok_or_else(|| not_found("get_pr", &number.to_string()).into())
    }

    async fn create_issue_comment(&self, issue: u64, body: &str) -> AppResult<IssueComment> {
        let mut state = self.enter("create_issue_comment", &issue.to_string())?;
        let comment = IssueComment {
            id: state.next_id(),
            body: body.to_string(),
        };
        state.comments.push((issue, comment.clone()));
        Ok(comment)
    }

    async fn update_issue_comment(&self, comment_id: u64, body: &str) -> AppResult<IssueComment> {
        let mut state = self.enter("update_issue_comment", &comment_id.to_string())?;
        let (_, comment) = state
            .comments
            .iter_mut()
            .find(|(_, c)| c.id == comment_id)
            .ok_or_else(|| not_found("update_issue_comment", &comment_id.to_string()))?;
        comment.body = body.to_string();
        Ok(comment.clone())
    }

    async fn list_issue_comments(&self, issue: u64) -> AppResult<Vec<IssueComment>> {
        let state = self.enter("list_issue_comments", &issue.to_string())?;
        Ok(state
            .comments
            .iter()
            .filter(|(n, _)| *n == issue)
            .map(|(_, c)| c.clone())
            .collect())
    }
}

/// 可控的补全服务
///
/// 默认在内容前加上 `[译]` 前缀后原样返回，占位符因此得以保留。
pub struct MockCompletion {
    fail_markers: Mutex<Vec<String>>,
    rate_limited: AtomicUsize,
    transform: Box<dyn Fn(&str) -> String + Send + Sync>,
    calls: AtomicUsize,
}

impl Default for MockCompletion {
    fn default() -> Self {
        Self {
            fail_markers: Mutex::new(Vec::new()),
            rate_limited: AtomicUsize::new(0),
            transform: Box::new(|content| format!("[译] {}", content)),
            calls: AtomicUsize::new(0),
        }
    }
}

impl MockCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// 自定义译文
    pub fn with_transform(mut self, transform: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.transform = Box::new(transform);
        self
    }

    /// 内容包含 `marker` 时返回 5xx
    pub fn fail_when_contains(self, marker: impl Into<String>) -> Self {
        self.fail_markers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(marker.into());
        self
    }

    /// 前 `times` 次调用返回限流错误
    pub fn rate_limit_first(self, times: usize) -> Self {
        self.rate_limited.store(times, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModelCompletion for MockCompletion {
    async fn complete(&self, _instructions: &str, content: &str) -> AppResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let limited = self
            .rate_limited
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(CompletionApiError::classify("complete", Some(429), "Rate limit reached").into());
        }
        let failing = self
            .fail_markers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|marker| content.contains(marker.as_str()));
        if failing {
            return Err(CompletionApiError::classify("complete", Some(500), "The server had an error").into());
        }
        Ok((self.transform)(content))
    }
}

/// 固定结果的语言检测
///
/// 文本包含某个子串时返回对应结果，否则返回默认结果。
pub struct FixedDetector {
    default: Detection,
    overrides: Vec<(String, Detection)>,
    calls: AtomicUsize,
}

impl FixedDetector {
    pub fn new(language: &str, confidence: f64) -> Self {
        Self {
            default: Detection::single(language, confidence),
            overrides: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn when_contains(mut self, needle: impl Into<String>, language: &str, confidence: f64) -> Self {
        self.overrides
            .push((needle.into(), Detection::single(language, confidence)));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LanguageDetector for FixedDetector {
    fn detect(&self, text: &str) -> Detection {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.overrides
            .iter()
            .find(|(needle, _)| text.contains(needle.as_str()))
            .map(|(_, detection)| detection.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_host_branch_and_file() {
        let host = MockHost::with_files([("docs/a.md", "# Hello")]);
        let base = host.get_base_ref("main").await.unwrap().unwrap();
        host.create_ref("t/a", &base).await.unwrap();

        let current = host.get_file_sha("docs/a.md", "t/a").await.unwrap();
        assert_eq!(current, Some(content_sha("# Hello")));
        host.create_or_update_file(FileChange {
            path: "docs/a.md".into(),
            content: "# Привет".into(),
            branch: "t/a".into(),
            message: "translate".into(),
            sha: current,
        })
        .await
        .unwrap();
        assert_eq!(host.file_on_branch("t/a", "docs/a.md").as_deref(), Some("# Привет"));

        host.delete_ref("t/a").await.unwrap();
        assert!(!host.has_branch("t/a"));
        assert_eq!(host.calls("create_ref"), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_matches_subject() {
        let host = MockHost::with_files([("docs/a.md", "a"), ("docs/b.md", "b")]);
        host.fail("get_blob", Some(&content_sha("b")), 502, "Bad Gateway");
        assert!(host.get_blob(&content_sha("a")).await.is_ok());
        let err = host.get_blob(&content_sha("b")).await.unwrap_err();
        assert_eq!(err.kind(), "remote_api.server_error");
    }

    #[tokio::test]
    async fn test_mock_completion_rate_limits_then_succeeds() {
        let completion = MockCompletion::new().rate_limit_first(1);
        let first = completion.complete("", "text").await.unwrap_err();
        assert_eq!(first.kind(), "completion_api.rate_limited");
        assert_eq!(completion.complete("", "text").await.unwrap(), "[译] text");
        assert_eq!(completion.calls(), 2);
    }
}
