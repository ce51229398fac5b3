//! 文件处理流程 - 流程层
//!
//! 核心职责：定义"一个文件"的完整处理流程
//!
//! 流程顺序：
//! 1. 查语言缓存，内容已确认是目标语言则跳过
//! 2. 语言检测（结果写回缓存）
//! 3. 已是目标语言 → 记为"已翻译"，不产生任何远端副作用
//! 4. 翻译
//! 5. 建分支 → 提交 → 开 PR（已有 PR 时检查状态）
//! 6. 已有 PR 冲突 → 关闭并基于最新上游内容整体重写
//! 7. 无论成败都产出一条 ProcessedResult

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clients::LanguageDetector;
use crate::error::{AppError, AppResult};
use crate::models::{ProcessedResult, WorkItem};
use crate::services::content_lifecycle::{ContentLifecycleManager, PrText, Publication};
use crate::services::{CacheStore, Translator};
use crate::utils::logging::truncate_text;
use crate::workflow::item_ctx::ItemCtx;

/// 文件处理流程
///
/// - 编排单个文件的全部步骤
/// - 决定何时跳过、何时翻译、何时重写 PR
/// - 只依赖业务能力（services）与协作方接口
pub struct ItemFlow {
    cache: Arc<CacheStore>,
    lifecycle: Arc<ContentLifecycleManager>,
    translator: Arc<Translator>,
    detector: Arc<dyn LanguageDetector>,
    confidence_threshold: f64,
}

impl ItemFlow {
    pub fn new(
        cache: Arc<CacheStore>,
        lifecycle: Arc<ContentLifecycleManager>,
        translator: Arc<Translator>,
        detector: Arc<dyn LanguageDetector>,
        confidence_threshold: f64,
    ) -> Self {
        Self {
            cache,
            lifecycle,
            translator,
            detector,
            confidence_threshold,
        }
    }

    /// 处理一个文件，失败也会转换为结果，不会返回错误
    pub async fn run(&self, item: &WorkItem, ctx: &ItemCtx) -> ProcessedResult {
        info!("{} 📄 {}", ctx, item.path);
        match self.execute(item, ctx).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    kind = %e.kind(),
                    operation = e.operation().unwrap_or("-"),
                    status = ?e.status_code(),
                    "{} ❌ {} 处理失败: {}",
                    ctx,
                    item.path,
                    e
                );
                ProcessedResult::failed(&item.path, e.to_record())
            }
        }
    }

    fn checkpoint(&self, ctx: &ItemCtx, next_step: &str) -> AppResult<()> {
        if ctx.is_cancelled() {
            warn!("{} ⏹️ 收到终止信号，跳过{}", ctx, next_step);
            return Err(AppError::Cancelled(format!("在{}之前终止", next_step)));
        }
        Ok(())
    }

    async fn execute(&self, item: &WorkItem, ctx: &ItemCtx) -> AppResult<ProcessedResult> {
        let target = self.translator.target_language();

        // ========== 1: 语言缓存 ==========
        match self.cache.get_language_cache(&item.path, &item.sha).await {
            Ok(Some(entry)) if entry.language == target && entry.confidence >= self.confidence_threshold => {
                info!("{} ✓ 缓存显示已是目标语言 ({:.2})，跳过", ctx, entry.confidence);
                return Ok(ProcessedResult::already_translated(&item.path, &item.content));
            }
            Ok(_) => {}
            Err(e) => warn!("{} ⚠️ 读取语言缓存失败，按未命中处理: {}", ctx, e),
        }

        // ========== 2: 语言检测 ==========
        let prose = self.translator.prose(&item.content);
        let detection = self.detector.detect(&prose);
        debug!(
            "{} 检测语言: {} ({:.2}) 正文: {}",
            ctx,
            detection.language,
            detection.confidence(),
            truncate_text(prose.trim(), 60)
        );
        if let Err(e) = self
            .cache
            .set_language_cache(&item.path, &item.sha, &detection.language, detection.confidence())
            .await
        {
            warn!("{} ⚠️ 写入语言缓存失败: {}", ctx, e);
        }

        // ========== 3: 已是目标语言 ==========
        let target_confidence = detection.confidence_of(target);
        if detection.language == target && target_confidence >= self.confidence_threshold {
            info!("{} ✓ 已是目标语言 ({:.2})，无需翻译", ctx, target_confidence);
            return Ok(ProcessedResult::already_translated(&item.path, &item.content));
        }

        // ========== 4: 翻译 ==========
        self.checkpoint(ctx, "翻译")?;
        info!("{} 🌐 翻译中 ({} → {})", ctx, detection.language, target);
        let translation = self.translator.translate(&item.content).await?;

        // ========== 5 / 6: 分支与 PR ==========
        self.checkpoint(ctx, "发布")?;
        let text = pr_text(item, target, &detection.language);
        let publication = self.publish(item, &translation, &text, ctx).await?;
        info!(
            "{} ✅ PR #{} ({})",
            ctx,
            publication.pull_request.number,
            publication.pull_request.url.as_deref().unwrap_or(&publication.branch.name)
        );

        // ========== 7: 结果 ==========
        Ok(ProcessedResult::translated(
            &item.path,
            translation,
            publication.branch,
            publication.pull_request,
        ))
    }

    async fn publish(&self, item: &WorkItem, translation: &str, text: &PrText, ctx: &ItemCtx) -> AppResult<Publication> {
        let Some(existing) = self.lifecycle.find_pr_by_branch(&ctx.branch).await? else {
            return self.lifecycle.publish_new(&ctx.branch, item, translation, text).await;
        };

        let status = self.lifecycle.check_pr_status(existing.number).await?;
        self.checkpoint(ctx, "更新 PR")?;
        if status.has_conflicts {
            warn!("{} ⚠️ PR #{} 存在冲突，关闭后重新翻译发布", ctx, existing.number);
            self.lifecycle.recreate(&existing, item, translation, text).await
        } else if status.is_behind() {
            info!("{} 🔄 PR #{} 落后于基线，追加提交并刷新说明", ctx, existing.number);
            self.lifecycle.refresh(&existing, item, translation, text, true).await
        } else {
            debug!("{} PR #{} 状态 {:?}，更新译文", ctx, existing.number, status.mergeable_state);
            self.lifecycle.refresh(&existing, item, translation, text, false).await
        }
    }
}

fn pr_text(item: &WorkItem, target: &str, source_language: &str) -> PrText {
    let language = whatlang::Lang::from_code(target)
        .map(|lang| lang.eng_name().to_string())
        .unwrap_or_else(|| target.to_string());
    PrText {
        title: format!("Translate {} into {}", item.filename, language),
        body: format!(
            "Automated translation of `{}` into {}.\n\n- source blob: `{}`\n- detected source language: `{}`\n",
            item.path, language, item.sha, source_language
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{FixedDetector, MockCompletion, MockHost};
    use crate::infrastructure::{RateLimiter, RateLimiterConfig, COMPLETION_SERVICE, HOSTING_SERVICE};
    use crate::models::{LifecycleState, MergeableState, PrState};
    use crate::services::content_lifecycle::branch_name;
    use tokio::sync::watch;

    struct Fixture {
        host: Arc<MockHost>,
        completion: Arc<MockCompletion>,
        detector: Arc<FixedDetector>,
        cache: Arc<CacheStore>,
        lifecycle: Arc<ContentLifecycleManager>,
        flow: ItemFlow,
    }

    async fn fixture(host: MockHost, detector: FixedDetector) -> Fixture {
        let host = Arc::new(host);
        let completion = Arc::new(MockCompletion::new());
        let detector = Arc::new(detector);
        let limiter = Arc::new(RateLimiter::new());
        limiter.register(HOSTING_SERVICE, RateLimiterConfig::default()).unwrap();
        limiter.register(COMPLETION_SERVICE, RateLimiterConfig::default()).unwrap();
        let cache = Arc::new(CacheStore::connect_in_memory().await.unwrap());
        let lifecycle = Arc::new(ContentLifecycleManager::new(host.clone(), limiter.clone(), "main"));
        let translator = Arc::new(Translator::new(completion.clone(), limiter, "rus", 0).unwrap());
        let flow = ItemFlow::new(cache.clone(), lifecycle.clone(), translator, detector.clone(), 0.8);
        Fixture {
            host,
            completion,
            detector,
            cache,
            lifecycle,
            flow,
        }
    }

    fn ctx(item: &WorkItem) -> (ItemCtx, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (ItemCtx::new(1, 1, branch_name("translate", &item.path), rx), tx)
    }

    #[tokio::test]
    async fn test_translates_and_opens_pr() {
        let f = fixture(MockHost::with_files([("docs/a.md", "Hello")]), FixedDetector::new("eng", 0.99)).await;
        let item = WorkItem::new("docs/a.md", "Hello", "sha-a");
        let (ctx, _tx) = ctx(&item);

        let result = f.flow.run(&item, &ctx).await;
        assert_eq!(result.translation(), Some("[译] Hello"));
        assert_eq!(result.pull_request.as_ref().unwrap().state, PrState::Open);
        assert_eq!(f.host.calls("create_pr"), 1);
        // 新文件只查询一次已有 PR
        assert_eq!(f.host.calls("list_open_prs"), 1);
        assert_eq!(
            f.host.file_on_branch(&branch_name("translate", "docs/a.md"), "docs/a.md").as_deref(),
            Some("[译] Hello")
        );

        let cached = f.cache.get_language_cache("docs/a.md", "sha-a").await.unwrap().unwrap();
        assert_eq!(cached.language, "eng");
    }

    #[tokio::test]
    async fn test_cached_target_language_skips_everything() {
        let f = fixture(MockHost::default(), FixedDetector::new("eng", 0.99)).await;
        let item = WorkItem::new("docs/a.md", "Привет", "sha-a");
        f.cache.set_language_cache("docs/a.md", "sha-a", "rus", 0.95).await.unwrap();
        let (ctx, _tx) = ctx(&item);

        let result = f.flow.run(&item, &ctx).await;
        assert!(result.already_translated);
        assert_eq!(f.detector.calls(), 0);
        assert_eq!(f.completion.calls(), 0);
        assert_eq!(f.host.calls("get_ref"), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_entry_is_ignored() {
        let f = fixture(MockHost::with_files([("docs/a.md", "Hello")]), FixedDetector::new("eng", 0.99)).await;
        let item = WorkItem::new("docs/a.md", "Hello", "sha-new");
        f.cache.set_language_cache("docs/a.md", "sha-old", "rus", 0.95).await.unwrap();
        let (ctx, _tx) = ctx(&item);

        let result = f.flow.run(&item, &ctx).await;
        assert!(!result.already_translated);
        assert_eq!(f.detector.calls(), 1);
        assert_eq!(f.completion.calls(), 1);
    }

    #[tokio::test]
    async fn test_detected_target_language_has_no_side_effects() {
        let f = fixture(MockHost::default(), FixedDetector::new("rus", 0.9)).await;
        let item = WorkItem::new("docs/a.md", "Привет, мир", "sha-a");
        let (ctx, _tx) = ctx(&item);

        let result = f.flow.run(&item, &ctx).await;
        assert!(result.already_translated);
        assert_eq!(result.translation(), Some("Привет, мир"));
        assert_eq!(f.completion.calls(), 0);
        assert_eq!(f.host.calls("create_ref"), 0);
    }

    #[tokio::test]
    async fn test_low_confidence_target_is_translated() {
        let f = fixture(MockHost::with_files([("docs/a.md", "mixed")]), FixedDetector::new("rus", 0.5)).await;
        let item = WorkItem::new("docs/a.md", "mixed", "sha-a");
        let (ctx, _tx) = ctx(&item);

        let result = f.flow.run(&item, &ctx).await;
        assert!(result.is_success());
        assert!(!result.already_translated);
        assert_eq!(f.completion.calls(), 1);
    }

    #[tokio::test]
    async fn test_conflicted_pr_is_rewritten() {
        let host = MockHost::with_files([("docs/a.md", "Hello")]);
        let old = host.seed_open_pr(branch_name("translate", "docs/a.md"), MergeableState::Dirty);
        let f = fixture(host, FixedDetector::new("eng", 0.99)).await;
        let item = WorkItem::new("docs/a.md", "Hello", "sha-a");
        let (ctx, _tx) = ctx(&item);

        let result = f.flow.run(&item, &ctx).await;
        let pr = result.pull_request.clone().unwrap();
        assert_ne!(pr.number, old);
        assert_eq!(f.host.calls("create_pr"), 1);
        assert_eq!(f.host.calls("list_open_prs"), 1);
        let closed = f.host.pull_requests().into_iter().find(|p| p.record.number == old).unwrap();
        assert_eq!(closed.record.state, PrState::Closed);
    }

    #[tokio::test]
    async fn test_behind_pr_is_refreshed() {
        let host = MockHost::with_files([("docs/a.md", "Hello")]);
        let number = host.seed_open_pr(branch_name("translate", "docs/a.md"), MergeableState::Behind);
        let f = fixture(host, FixedDetector::new("eng", 0.99)).await;
        let item = WorkItem::new("docs/a.md", "Hello", "sha-a");
        let (ctx, _tx) = ctx(&item);

        let result = f.flow.run(&item, &ctx).await;
        assert_eq!(result.pull_request.as_ref().unwrap().number, number);
        assert_eq!(f.host.calls("create_pr"), 0);
        assert_eq!(f.host.calls("update_pr"), 1);
        let pr = f.host.pull_requests().into_iter().find(|p| p.record.number == number).unwrap();
        assert!(pr.body.contains("sha-a"));
        assert_eq!(f.lifecycle.state_of(&branch_name("translate", "docs/a.md")), LifecycleState::PrOpen);
    }

    #[tokio::test]
    async fn test_failure_becomes_result() {
        let host = MockHost::with_files([("docs/a.md", "Hello")]);
        host.fail("create_pr", None, 502, "Bad Gateway");
        let f = fixture(host, FixedDetector::new("eng", 0.99)).await;
        let item = WorkItem::new("docs/a.md", "Hello", "sha-a");
        let (ctx, _tx) = ctx(&item);

        let result = f.flow.run(&item, &ctx).await;
        let error = result.error().unwrap();
        assert_eq!(error.kind, "remote_api.server_error");
        assert_eq!(error.operation.as_deref(), Some("create_pr"));
        assert_eq!(error.status, Some(502));
        assert!(f.host.branches().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_translation() {
        let f = fixture(MockHost::default(), FixedDetector::new("eng", 0.99)).await;
        let item = WorkItem::new("docs/a.md", "Hello", "sha-a");
        let (ctx, tx) = ctx(&item);
        tx.send(true).unwrap();

        let result = f.flow.run(&item, &ctx).await;
        assert_eq!(result.error().unwrap().kind, "cancelled");
        assert_eq!(f.completion.calls(), 0);
    }
}
