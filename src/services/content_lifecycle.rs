//! 分支 / PR 生命周期服务 - 业务能力层
//!
//! 单个文件在远端产生的全部副作用都经过这里：建分支、提交、开 PR、检查 PR 状态、
//! 关闭 PR 以及退出前的清理。每个远端调用都通过托管服务的限流器调度。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::clients::{FileChange, NewPullRequest, PullRequestUpdate, VersionControlHost};
use crate::error::{AppError, AppResult, RemoteApiError};
use crate::infrastructure::{RateLimiter, HOSTING_SERVICE};
use crate::models::{BranchRef, LifecycleState, PrState, PrStatus, PullRequestRecord, WorkItem};

/// PR 的标题和正文
#[derive(Debug, Clone)]
pub struct PrText {
    pub title: String,
    pub body: String,
}

/// 发布结果
#[derive(Debug, Clone)]
pub struct Publication {
    pub branch: BranchRef,
    pub pull_request: PullRequestRecord,
    pub commit_sha: String,
}

/// 清理统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub preserved: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
struct Tracked {
    state: LifecycleState,
    /// 分支是否由本进程创建；只有这些分支会被清理
    created_here: bool,
    pr_number: Option<u64>,
}

/// 由文件路径生成分支名：`{prefix}/docs-guide-intro-md-1a2b3c4d`
///
/// slug 只是为了可读，会把 `a_b` 与 `a-b`、`API` 与 `api` 合并成同一个；
/// 末尾的路径哈希保证不同路径得到不同分支，且跨运行保持不变。
pub fn branch_name(prefix: &str, path: &str) -> String {
    let mut slug = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let hash = blake3::hash(path.as_bytes()).to_hex();
    let slug = format!("{}-{}", slug.trim_matches('-'), &hash.as_str()[..8]);
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        slug
    } else {
        format!("{}/{}", prefix, slug)
    }
}

/// 分支 / PR 生命周期管理
///
/// 职责：
/// - 幂等地创建分支，失败时删除本次新建的分支
/// - 复用已有 PR，避免重复创建
/// - 记录每个分支的状态，退出前清理没有有效 PR 的分支
pub struct ContentLifecycleManager {
    host: Arc<dyn VersionControlHost>,
    limiter: Arc<RateLimiter>,
    base_branch: String,
    tracked: Mutex<HashMap<String, Tracked>>,
}

impl ContentLifecycleManager {
    pub fn new(host: Arc<dyn VersionControlHost>, limiter: Arc<RateLimiter>, base_branch: impl Into<String>) -> Self {
        Self {
            host,
            limiter,
            base_branch: base_branch.into(),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    fn tracked(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, branch: &str, state: LifecycleState) {
        let mut tracked = self.tracked();
        let entry = tracked.entry(branch.to_string()).or_insert(Tracked {
            state,
            created_here: false,
            pr_number: None,
        });
        entry.state = state;
    }

    fn set_pr(&self, branch: &str, number: u64, state: LifecycleState) {
        let mut tracked = self.tracked();
        let entry = tracked.entry(branch.to_string()).or_insert(Tracked {
            state,
            created_here: false,
            pr_number: None,
        });
        entry.state = state;
        entry.pr_number = Some(number);
    }

    fn set_pr_state(&self, number: u64, state: LifecycleState) {
        let mut tracked = self.tracked();
        if let Some(entry) = tracked.values_mut().find(|t| t.pr_number == Some(number)) {
            entry.state = state;
        }
    }

    /// 分支在本进程内的当前状态
    pub fn state_of(&self, branch: &str) -> LifecycleState {
        self.tracked()
            .get(branch)
            .map(|t| t.state)
            .unwrap_or(LifecycleState::NoBranch)
    }

    /// 所有跟踪中的分支及其状态（按名称排序）
    pub fn tracked_branches(&self) -> Vec<(String, LifecycleState)> {
        let mut branches: Vec<_> = self
            .tracked()
            .iter()
            .map(|(name, t)| (name.clone(), t.state))
            .collect();
        branches.sort_by(|a, b| a.0.cmp(&b.0));
        branches
    }

    async fn hosted<T, F, Fut>(&self, task: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.limiter.schedule(HOSTING_SERVICE, task).await
    }

    /// 创建分支；分支已存在时直接返回现有引用
    ///
    /// `base` 为起点 sha，缺省时使用上游基线分支的最新提交。
    pub async fn create_branch(&self, name: &str, base: Option<&str>) -> AppResult<BranchRef> {
        if let Some(sha) = self.hosted(|| self.host.get_ref(name)).await? {
            debug!("分支已存在，直接复用: {}", name);
            if self.state_of(name) == LifecycleState::NoBranch {
                self.set_state(name, LifecycleState::BranchCreated);
            }
            return Ok(BranchRef {
                name: name.to_string(),
                sha,
                created: false,
            });
        }

        let base_sha = match base {
            Some(sha) => sha.to_string(),
            None => self
                .hosted(|| self.host.get_base_ref(&self.base_branch))
                .await?
                .ok_or_else(|| {
                    RemoteApiError::classify(
                        "get_base_ref",
                        Some(404),
                        None,
                        format!("基线分支 {} 不存在", self.base_branch),
                    )
                })?,
        };

        let sha = self.hosted(|| self.host.create_ref(name, &base_sha)).await?;
        self.tracked().insert(
            name.to_string(),
            Tracked {
                state: LifecycleState::BranchCreated,
                created_here: true,
                pr_number: None,
            },
        );
        info!("🌿 创建分支 {} ({})", name, sha);
        Ok(BranchRef {
            name: name.to_string(),
            sha,
            created: true,
        })
    }

    /// 删除分支并停止跟踪
    pub async fn delete_branch(&self, name: &str) -> AppResult<()> {
        self.hosted(|| self.host.delete_ref(name)).await?;
        self.tracked().remove(name);
        debug!("删除分支 {}", name);
        Ok(())
    }

    /// 失败回滚：只删除本次新建的分支，删除失败只记日志
    async fn rollback(&self, branch: &BranchRef, cause: &AppError) {
        if !branch.created {
            return;
        }
        warn!("↩️ {} 失败，删除本次新建的分支 {}: {}", cause.operation().unwrap_or("操作"), branch.name, cause);
        if let Err(e) = self.delete_branch(&branch.name).await {
            error!(branch = %branch.name, kind = %e.kind(), "回滚删除分支失败: {}", e);
        }
    }

    /// 提交译文；文件已存在时更新，否则新建
    ///
    /// 失败时若分支是本次新建的，先删除分支再返回错误。
    pub async fn commit(&self, branch: &BranchRef, item: &WorkItem, content: &str, message: &str) -> AppResult<String> {
        let result: AppResult<String> = async {
            let current = self
                .hosted(|| self.host.get_file_sha(&item.path, &branch.name))
                .await?;
            let change = FileChange {
                path: item.path.clone(),
                content: content.to_string(),
                branch: branch.name.clone(),
                message: message.to_string(),
                sha: current,
            };
            self.hosted(|| self.host.create_or_update_file(change)).await
        }
        .await;

        match result {
            Ok(commit_sha) => {
                self.set_state(&branch.name, LifecycleState::Committed);
                debug!("提交 {} 到 {} ({})", item.path, branch.name, commit_sha);
                Ok(commit_sha)
            }
            Err(e) => {
                self.rollback(branch, &e).await;
                Err(e)
            }
        }
    }

    /// 以 `branch` 为 head 的打开状态 PR
    pub async fn find_pr_by_branch(&self, branch: &str) -> AppResult<Option<PullRequestRecord>> {
        let prs = self.hosted(|| self.host.list_open_prs(branch)).await?;
        let found = prs
            .into_iter()
            .find(|pr| pr.head_branch == branch && pr.state == PrState::Open);
        if let Some(pr) = &found {
            let state = match self.state_of(branch) {
                LifecycleState::NoBranch => LifecycleState::PrOpen,
                known => known,
            };
            self.set_pr(branch, pr.number, state);
        }
        Ok(found)
    }

    /// 已有打开的 PR 时直接复用，否则新建
    pub async fn ensure_pr(&self, branch: &str, text: &PrText) -> AppResult<PullRequestRecord> {
        if let Some(existing) = self.find_pr_by_branch(branch).await? {
            debug!("复用已有 PR #{} ({})", existing.number, branch);
            self.set_pr(branch, existing.number, LifecycleState::PrOpen);
            return Ok(existing);
        }
        self.open_pr(branch, text).await
    }

    /// 直接新建 PR，调用方负责确认该分支没有打开的 PR
    async fn open_pr(&self, branch: &str, text: &PrText) -> AppResult<PullRequestRecord> {
        let request = NewPullRequest {
            branch: branch.to_string(),
            title: text.title.clone(),
            body: text.body.clone(),
        };
        let pr = self.hosted(|| self.host.create_pr(request)).await?;
        self.set_pr(branch, pr.number, LifecycleState::PrOpen);
        info!("📬 创建 PR #{} ({})", pr.number, branch);
        Ok(pr)
    }

    /// 检查 PR 的可合并状态
    pub async fn check_pr_status(&self, number: u64) -> AppResult<PrStatus> {
        let pr = self.hosted(|| self.host.get_pr(number)).await?;
        let status = PrStatus::from_mergeable_state(pr.mergeable_state.clone());
        let state = match pr.state {
            PrState::Merged => LifecycleState::MergedExternally,
            PrState::Closed => LifecycleState::Closed,
            PrState::Open => status.lifecycle_state(),
        };
        self.set_pr(&pr.head_branch, number, state);
        debug!("PR #{} 状态: {:?} -> {:?}", number, pr.mergeable_state, state);
        Ok(status)
    }

    pub async fn close_pr(&self, number: u64) -> AppResult<()> {
        let update = PullRequestUpdate {
            state: Some(PrState::Closed),
            ..Default::default()
        };
        self.hosted(|| self.host.update_pr(number, update)).await?;
        self.set_pr_state(number, LifecycleState::Closed);
        info!("🚫 关闭 PR #{}", number);
        Ok(())
    }

    /// 建分支、提交、开 PR；分支上已有打开的 PR 时复用它
    ///
    /// 任何一步失败都会删除本次新建的分支，不留下孤立分支。
    pub async fn publish(&self, branch_name: &str, item: &WorkItem, content: &str, text: &PrText) -> AppResult<Publication> {
        self.publish_with(branch_name, item, content, text, true).await
    }

    /// 与 [`publish`](Self::publish) 相同，但跳过 PR 查询
    ///
    /// 只用于刚确认过该分支没有打开 PR 的场景。
    pub async fn publish_new(&self, branch_name: &str, item: &WorkItem, content: &str, text: &PrText) -> AppResult<Publication> {
        self.publish_with(branch_name, item, content, text, false).await
    }

    async fn publish_with(
        &self,
        branch_name: &str,
        item: &WorkItem,
        content: &str,
        text: &PrText,
        reuse_open_pr: bool,
    ) -> AppResult<Publication> {
        let branch = self.create_branch(branch_name, None).await?;
        let commit_sha = self.commit(&branch, item, content, &text.title).await?;
        let pull_request = if reuse_open_pr {
            self.ensure_pr(&branch.name, text).await
        } else {
            self.open_pr(&branch.name, text).await
        };
        match pull_request {
            Ok(pull_request) => Ok(Publication {
                branch: BranchRef {
                    sha: commit_sha.clone(),
                    ..branch
                },
                pull_request,
                commit_sha,
            }),
            Err(e) => {
                self.rollback(&branch, &e).await;
                Err(e)
            }
        }
    }

    /// 在已有 PR 的分支上追加一次提交；`update_body` 时同步刷新 PR 正文
    pub async fn refresh(
        &self,
        pr: &PullRequestRecord,
        item: &WorkItem,
        content: &str,
        text: &PrText,
        update_body: bool,
    ) -> AppResult<Publication> {
        let sha = self
            .hosted(|| self.host.get_ref(&pr.head_branch))
            .await?
            .ok_or_else(|| {
                RemoteApiError::classify("get_ref", Some(404), None, format!("PR #{} 的分支已不存在", pr.number))
            })?;
        let branch = BranchRef {
            name: pr.head_branch.clone(),
            sha,
            created: false,
        };
        let commit_sha = self.commit(&branch, item, content, &text.title).await?;
        let pull_request = if update_body {
            let update = PullRequestUpdate {
                body: Some(text.body.clone()),
                ..Default::default()
            };
            self.hosted(|| self.host.update_pr(pr.number, update)).await?
        } else {
            pr.clone()
        };
        self.set_pr(&branch.name, pr.number, LifecycleState::PrOpen);
        Ok(Publication {
            branch: BranchRef {
                sha: commit_sha.clone(),
                ..branch
            },
            pull_request,
            commit_sha,
        })
    }

    /// 关闭冲突的 PR，删除其分支，基于最新的上游内容重新发布
    pub async fn recreate(&self, pr: &PullRequestRecord, item: &WorkItem, content: &str, text: &PrText) -> AppResult<Publication> {
        self.close_pr(pr.number).await?;
        match self.delete_branch(&pr.head_branch).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.publish_new(&pr.head_branch, item, content, text).await
    }

    /// 在 issue 上发布评论；已有带 `marker` 的评论时更新它
    pub async fn publish_comment(&self, issue: u64, marker: &str, body: &str) -> AppResult<u64> {
        let comments = self.hosted(|| self.host.list_issue_comments(issue)).await?;
        let comment = match comments.into_iter().find(|c| c.body.contains(marker)) {
            Some(existing) => {
                self.hosted(|| self.host.update_issue_comment(existing.id, body))
                    .await?
            }
            None => self.hosted(|| self.host.create_issue_comment(issue, body)).await?,
        };
        Ok(comment.id)
    }

    /// 删除本进程创建的、没有有效 PR 的分支
    ///
    /// 单个分支删除失败只记录日志，不影响其余分支。
    pub async fn cleanup(&self) -> CleanupReport {
        let candidates: Vec<(String, Tracked)> = self
            .tracked()
            .iter()
            .filter(|(_, t)| t.created_here)
            .map(|(name, t)| (name.clone(), t.clone()))
            .collect();

        let mut report = CleanupReport::default();
        for (name, tracked) in candidates {
            if !tracked.state.is_disposable() {
                report.preserved.push(name);
                continue;
            }
            match self.delete_branch(&name).await {
                Ok(()) => {
                    info!("🧹 清理分支 {} ({:?})", name, tracked.state);
                    report.deleted.push(name);
                }
                Err(e) => {
                    error!(branch = %name, kind = %e.kind(), status = ?e.status_code(), "清理分支失败: {}", e);
                    report.failed.push(name);
                }
            }
        }
        report.deleted.sort();
        report.preserved.sort();
        report.failed.sort();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::MockHost;
    use crate::infrastructure::RateLimiterConfig;
    use crate::models::MergeableState;

    fn manager(host: Arc<MockHost>) -> ContentLifecycleManager {
        let limiter = Arc::new(RateLimiter::new());
        limiter
            .register(
                HOSTING_SERVICE,
                RateLimiterConfig {
                    max_concurrent: 4,
                    ..Default::default()
                },
            )
            .unwrap();
        ContentLifecycleManager::new(host, limiter, "main")
    }

    fn text() -> PrText {
        PrText {
            title: "Translate a.md".into(),
            body: "body".into(),
        }
    }

    #[test]
    fn test_branch_name() {
        let name = branch_name("translate", "docs/guide/Intro.md");
        assert!(name.starts_with("translate/docs-guide-intro-md-"), "{}", name);
        assert_eq!(name.len(), "translate/docs-guide-intro-md-".len() + 8);
        assert_eq!(name, branch_name("translate/", "docs/guide/Intro.md"));
        assert!(branch_name("", "a.md").starts_with("a-md-"));
    }

    #[test]
    fn test_branch_name_distinguishes_paths_with_same_slug() {
        let pairs = [
            ("docs/a_b.md", "docs/a-b.md"),
            ("docs/API.md", "docs/api.md"),
            ("docs//a b.md", "docs/a b.md"),
        ];
        for (left, right) in pairs {
            assert_ne!(branch_name("translate", left), branch_name("translate", right));
        }
    }

    #[tokio::test]
    async fn test_create_branch_is_idempotent() {
        let host = Arc::new(MockHost::with_files([("docs/a.md", "# A")]));
        let manager = manager(host.clone());

        let first = manager.create_branch("t/a", None).await.unwrap();
        let second = manager.create_branch("t/a", None).await.unwrap();
        assert_eq!(first.name, second.name);
        assert_eq!(first.sha, second.sha);
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(host.calls("create_ref"), 1);
        assert_eq!(manager.state_of("t/a"), LifecycleState::BranchCreated);
    }

    #[tokio::test]
    async fn test_commit_failure_deletes_new_branch() {
        let host = Arc::new(MockHost::with_files([("docs/a.md", "# A")]));
        host.fail("create_or_update_file", Some("docs/a.md"), 502, "Bad Gateway");
        let manager = manager(host.clone());
        let item = WorkItem::new("docs/a.md", "# A", "s");

        let branch = manager.create_branch("t/a", None).await.unwrap();
        let err = manager.commit(&branch, &item, "# А", "msg").await.unwrap_err();
        assert_eq!(err.operation(), Some("create_or_update_file"));
        assert_eq!(err.status_code(), Some(502));
        assert!(!host.has_branch("t/a"));
        assert_eq!(manager.state_of("t/a"), LifecycleState::NoBranch);
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_existing_branch() {
        let host = Arc::new(MockHost::with_files([("docs/a.md", "# A")]));
        host.seed_branch("t/a");
        host.fail("create_or_update_file", None, 500, "boom");
        let manager = manager(host.clone());
        let item = WorkItem::new("docs/a.md", "# A", "s");

        let branch = manager.create_branch("t/a", None).await.unwrap();
        assert!(manager.commit(&branch, &item, "# А", "msg").await.is_err());
        assert!(host.has_branch("t/a"));
    }

    #[tokio::test]
    async fn test_publish_reuses_existing_pr() {
        let host = Arc::new(MockHost::with_files([("docs/a.md", "# A")]));
        let number = host.seed_open_pr("t/a", MergeableState::Clean);
        let manager = manager(host.clone());
        let item = WorkItem::new("docs/a.md", "# A", "s");

        let publication = manager.publish("t/a", &item, "# А", &text()).await.unwrap();
        assert_eq!(publication.pull_request.number, number);
        assert_eq!(host.calls("create_pr"), 0);
        assert_eq!(host.file_on_branch("t/a", "docs/a.md").as_deref(), Some("# А"));
    }

    #[tokio::test]
    async fn test_publish_new_skips_pr_lookup() {
        let host = Arc::new(MockHost::with_files([("docs/a.md", "# A")]));
        let manager = manager(host.clone());
        let item = WorkItem::new("docs/a.md", "# A", "s");

        let publication = manager.publish_new("t/a", &item, "# А", &text()).await.unwrap();
        assert_eq!(host.calls("list_open_prs"), 0);
        assert_eq!(host.calls("create_pr"), 1);
        assert_eq!(manager.state_of("t/a"), LifecycleState::PrOpen);
        assert_eq!(publication.branch.name, "t/a");
    }

    #[tokio::test]
    async fn test_publish_pr_failure_rolls_back() {
        let host = Arc::new(MockHost::with_files([("docs/a.md", "# A")]));
        host.fail("create_pr", None, 422, "Validation Failed");
        let manager = manager(host.clone());
        let item = WorkItem::new("docs/a.md", "# A", "s");

        let err = manager.publish("t/a", &item, "# А", &text()).await.unwrap_err();
        assert_eq!(err.kind(), "remote_api.rejected");
        assert!(host.branches().is_empty());
    }

    #[tokio::test]
    async fn test_check_pr_status_table() {
        let host = Arc::new(MockHost::default());
        let manager = manager(host.clone());
        let cases = [
            (MergeableState::Clean, false, false, LifecycleState::PrClean),
            (MergeableState::Dirty, true, true, LifecycleState::PrConflicted),
            (MergeableState::Behind, false, false, LifecycleState::PrOpen),
        ];
        for (i, (mergeable, needs_update, has_conflicts, lifecycle)) in cases.into_iter().enumerate() {
            let branch = format!("t/{}", i);
            let number = host.seed_open_pr(&branch, mergeable.clone());
            let status = manager.check_pr_status(number).await.unwrap();
            assert_eq!(status.needs_update, needs_update, "{:?}", mergeable);
            assert_eq!(status.has_conflicts, has_conflicts, "{:?}", mergeable);
            assert_eq!(status.is_behind(), mergeable == MergeableState::Behind);
            assert_eq!(manager.state_of(&branch), lifecycle);
        }
    }

    #[tokio::test]
    async fn test_recreate_closes_and_publishes_fresh() {
        let host = Arc::new(MockHost::with_files([("docs/a.md", "# A")]));
        let old = host.seed_open_pr("t/a", MergeableState::Dirty);
        let manager = manager(host.clone());
        let item = WorkItem::new("docs/a.md", "# A", "s");

        let pr = manager.find_pr_by_branch("t/a").await.unwrap().unwrap();
        let publication = manager.recreate(&pr, &item, "# А", &text()).await.unwrap();
        assert_ne!(publication.pull_request.number, old);
        assert!(publication.branch.created);

        let prs = host.pull_requests();
        let closed = prs.iter().find(|p| p.record.number == old).unwrap();
        assert_eq!(closed.record.state, PrState::Closed);
        assert_eq!(host.calls("create_pr"), 1);
        assert_eq!(manager.state_of("t/a"), LifecycleState::PrOpen);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_clean_prs_and_survives_failures() {
        let host = Arc::new(MockHost::with_files([("docs/a.md", "# A"), ("docs/b.md", "# B")]));
        let manager = manager(host.clone());
        let a = WorkItem::new("docs/a.md", "# A", "s");

        // 有 PR 且干净：保留
        let published = manager.publish("t/a", &a, "# А", &text()).await.unwrap();
        manager.check_pr_status(published.pull_request.number).await.unwrap();
        // 没有 PR：删除
        manager.create_branch("t/b", None).await.unwrap();
        // 删除失败：记录但不中断
        manager.create_branch("t/c", None).await.unwrap();
        host.fail("delete_ref", Some("t/c"), 500, "boom");
        // 不是本进程创建的：不动
        host.seed_branch("t/d");
        manager.create_branch("t/d", None).await.unwrap();

        let report = manager.cleanup().await;
        assert_eq!(report.deleted, vec!["t/b".to_string()]);
        assert_eq!(report.preserved, vec!["t/a".to_string()]);
        assert_eq!(report.failed, vec!["t/c".to_string()]);
        assert!(host.has_branch("t/a"));
        assert!(host.has_branch("t/d"));
    }

    #[tokio::test]
    async fn test_publish_comment_updates_marked_comment() {
        let host = Arc::new(MockHost::default());
        let manager = manager(host.clone());
        let first = manager.publish_comment(9, "<!-- report -->", "<!-- report -->\nv1").await.unwrap();
        let second = manager.publish_comment(9, "<!-- report -->", "<!-- report -->\nv2").await.unwrap();
        assert_eq!(first, second);
        let comments = host.comments(9);
        assert_eq!(comments.len(), 1);
        assert!(comments[0].body.ends_with("v2"));
    }
}
