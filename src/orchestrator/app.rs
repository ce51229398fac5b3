//! 应用入口 - 编排层
//!
//! 组装各层组件，加载待翻译文件，驱动一次批处理并在结束前清理资源。

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::clients::{
    GithubClient, LanguageDetector, LanguageModelCompletion, OpenAiCompletion, VersionControlHost, WhatlangDetector,
};
use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::{RateLimiter, COMPLETION_SERVICE, HOSTING_SERVICE};
use crate::models::{EntryType, TreeEntry, WorkItem};
use crate::orchestrator::batch_processor::{BatchOptions, BatchOrchestrator, BatchOutcome};
use crate::orchestrator::report::REPORT_MARKER;
use crate::services::{CacheStore, ContentLifecycleManager, Translator};
use crate::utils::logging;
use crate::workflow::ItemFlow;

/// 应用主结构
pub struct App {
    config: Config,
    host: Arc<dyn VersionControlHost>,
    limiter: Arc<RateLimiter>,
    cache: Arc<CacheStore>,
    lifecycle: Arc<ContentLifecycleManager>,
    orchestrator: BatchOrchestrator,
    shutdown_tx: watch::Sender<bool>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> AppResult<Self> {
        logging::log_startup(&config);

        let limiter = Arc::new(RateLimiter::new());
        limiter.register(HOSTING_SERVICE, config.hosting_limits.to_limiter_config())?;
        limiter.register(COMPLETION_SERVICE, config.completion_limits.to_limiter_config())?;

        let host: Arc<dyn VersionControlHost> = Arc::new(GithubClient::new(&config)?);
        let completion: Arc<dyn LanguageModelCompletion> = Arc::new(OpenAiCompletion::new(&config));
        let cache = Arc::new(CacheStore::connect(&config.database_path).await?);
        info!("✓ 数据库已打开: {}", config.database_path);

        Self::assemble(config, host, completion, Arc::new(WhatlangDetector::new()), cache, limiter)
    }

    /// 用给定的外部服务组装应用
    pub fn assemble(
        config: Config,
        host: Arc<dyn VersionControlHost>,
        completion: Arc<dyn LanguageModelCompletion>,
        detector: Arc<dyn LanguageDetector>,
        cache: Arc<CacheStore>,
        limiter: Arc<RateLimiter>,
    ) -> AppResult<Self> {
        let lifecycle = Arc::new(ContentLifecycleManager::new(
            Arc::clone(&host),
            Arc::clone(&limiter),
            config.base_branch.clone(),
        ));
        let translator = Arc::new(Translator::new(
            completion,
            Arc::clone(&limiter),
            config.target_language.clone(),
            config.llm_max_retries,
        )?);
        let flow = Arc::new(ItemFlow::new(
            Arc::clone(&cache),
            Arc::clone(&lifecycle),
            translator,
            detector,
            config.confidence_threshold,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = BatchOrchestrator::new(
            flow,
            Arc::clone(&cache),
            Arc::clone(&lifecycle),
            Arc::clone(&limiter),
        )
        .with_shutdown(shutdown_rx);

        Ok(Self {
            config,
            host,
            limiter,
            cache,
            lifecycle,
            orchestrator,
            shutdown_tx,
        })
    }

    /// 发送终止信号：不再派发新文件，已派发的文件在当前步骤后停止
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> AppResult<BatchOutcome> {
        let signals = {
            let tx = self.shutdown_tx.clone();
            tokio::spawn(async move {
                if let Some(signal) = termination_signal().await {
                    warn!("🛑 收到 {}，等待进行中的文件结束当前步骤...", signal);
                    let _ = tx.send(true);
                }
            })
        };

        let result = self.run_inner().await;
        signals.abort();

        let cleanup = self.orchestrator.cleanup().await;
        if !cleanup.deleted.is_empty() || !cleanup.failed.is_empty() {
            info!(
                "🧹 清理分支：删除 {} 个，保留 {} 个，失败 {} 个",
                cleanup.deleted.len(),
                cleanup.preserved.len(),
                cleanup.failed.len()
            );
        }

        for service in [HOSTING_SERVICE, COMPLETION_SERVICE] {
            if let Ok(metrics) = self.orchestrator.metrics(service) {
                logging::log_limiter_metrics(service, &metrics);
            }
        }
        self.limiter.shutdown().await;
        self.cache.close().await;

        let outcome = result?;
        logging::print_final_stats(&outcome.report, outcome.snapshot_id);
        Ok(outcome)
    }

    async fn run_inner(&self) -> AppResult<BatchOutcome> {
        let (tree, items) = self.load_work_items().await?;

        let resume_from = if self.config.resume {
            self.cache.get_latest_snapshot().await?
        } else {
            None
        };
        let skipped = resume_from
            .as_ref()
            .map(|snapshot| items.iter().filter(|item| snapshot.is_done(item)).count())
            .unwrap_or(0);

        if items.is_empty() {
            warn!("⚠️ 没有找到待翻译的文件");
        }
        logging::log_items_loaded(items.len(), skipped, self.config.batch_concurrency);

        let options = BatchOptions {
            concurrency: self.config.batch_concurrency,
            branch_prefix: self.config.branch_prefix.clone(),
            repository_tree: tree,
            resume_from,
        };
        let outcome = self.orchestrator.run_batch(items, &options).await?;

        if let Some(issue) = self.config.tracking_issue {
            match self
                .lifecycle
                .publish_comment(issue, REPORT_MARKER, &outcome.report.to_markdown())
                .await
            {
                Ok(comment_id) => info!("📝 报告已发布到 issue #{} (评论 {})", issue, comment_id),
                Err(e) => error!(kind = %e.kind(), "❌ 报告发布失败: {}", e),
            }
        }

        Ok(outcome)
    }

    /// 读取上游仓库树并下载所有待翻译文件
    ///
    /// 任何一个文件读取失败都会终止本次运行。
    async fn load_work_items(&self) -> AppResult<(Vec<TreeEntry>, Vec<WorkItem>)> {
        info!("\n📁 正在读取仓库树...");
        let tree = self.hosted(|| self.host.get_tree(&self.config.base_branch)).await?;

        let mut items = Vec::new();
        for entry in tree
            .iter()
            .filter(|entry| entry.entry_type == EntryType::Blob && self.config.is_translatable(&entry.path))
        {
            let bytes = self
                .hosted(|| self.host.get_blob(&entry.sha))
                .await
                .map_err(|e| {
                    error!("❌ 无法读取文件 {}: {}", entry.path, e);
                    e
                })?;
            let content = String::from_utf8_lossy(&bytes).into_owned();
            items.push(WorkItem::new(entry.path.clone(), content, entry.sha.clone()));
        }
        Ok((tree, items))
    }

    async fn hosted<T, F, Fut>(&self, task: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.limiter.schedule(HOSTING_SERVICE, task).await
    }
}

/// 等待 Ctrl-C 或 SIGTERM，返回信号名；无法监听时返回 `None`
#[cfg(unix)]
async fn termination_signal() -> Option<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("⚠️ 无法监听 SIGTERM: {}", e);
            return tokio::signal::ctrl_c().await.ok().map(|_| "SIGINT");
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.ok().map(|_| "SIGINT"),
        received = terminate.recv() => received.map(|_| "SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> Option<&'static str> {
    tokio::signal::ctrl_c().await.ok().map(|_| "Ctrl-C")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_is_a_termination_signal() {
        let waiting = tokio::spawn(termination_signal());
        // 等监听注册完成后再发送信号
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let received = tokio::time::timeout(Duration::from_secs(2), waiting).await;
        assert_eq!(received.unwrap().unwrap(), Some("SIGTERM"));
    }
}
