//! 批量处理器 - 编排层
//!
//! ## 职责
//!
//! 驱动一批文件走完整的处理流程，并把结果汇总成一份报告。
//!
//! ## 核心功能
//!
//! 1. **快照**：运行开始时创建快照，写入仓库树与待处理文件；每个文件完成时追加其结果
//! 2. **并发控制**：Semaphore 限制同时处理的文件数；每个远端调用另由限流器按服务节流
//! 3. **失败隔离**：单个文件的失败只体现在它自己的结果里，不影响其他文件
//! 4. **终止**：收到终止信号后不再派发新文件，已派发的文件在当前步骤结束后停止
//! 5. **汇总**：全部结果收集完毕后按输入顺序排序，再生成报告

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};
use crate::infrastructure::{RateLimiter, RateLimiterMetrics};
use crate::models::{ProcessedResult, Snapshot, TreeEntry, WorkItem};
use crate::orchestrator::report::BatchReport;
use crate::services::content_lifecycle::{branch_name, CleanupReport};
use crate::services::{CacheStore, ContentLifecycleManager};
use crate::workflow::{ItemCtx, ItemFlow};

/// 批处理参数
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// 同时处理的文件数量
    pub concurrency: usize,
    pub branch_prefix: String,
    /// 写入快照的仓库树
    pub repository_tree: Vec<TreeEntry>,
    /// 续跑：上一次快照中已成功且源文件未变的文件直接复用结果
    pub resume_from: Option<Snapshot>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            branch_prefix: "translate".to_string(),
            repository_tree: Vec::new(),
            resume_from: None,
        }
    }
}

/// 批处理结果：每个输入文件恰好一条结果，顺序与输入一致
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<ProcessedResult>,
    pub snapshot_id: i64,
    pub report: BatchReport,
}

/// 批处理编排器
pub struct BatchOrchestrator {
    flow: Arc<ItemFlow>,
    cache: Arc<CacheStore>,
    lifecycle: Arc<ContentLifecycleManager>,
    limiter: Arc<RateLimiter>,
    shutdown: watch::Receiver<bool>,
}

impl BatchOrchestrator {
    pub fn new(
        flow: Arc<ItemFlow>,
        cache: Arc<CacheStore>,
        lifecycle: Arc<ContentLifecycleManager>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        // 没有外部终止信号时，发送端随即被丢弃，接收端始终为 false
        let (_tx, shutdown) = watch::channel(false);
        Self {
            flow,
            cache,
            lifecycle,
            limiter,
            shutdown,
        }
    }

    /// 接入终止信号
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn metrics(&self, service_id: &str) -> AppResult<RateLimiterMetrics> {
        Ok(self.limiter.metrics(service_id)?)
    }

    /// 清理本次运行中创建、但没有有效 PR 的分支
    pub async fn cleanup(&self) -> CleanupReport {
        self.lifecycle.cleanup().await
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// 处理一批文件
    ///
    /// 只有快照的创建与初始写入失败会返回错误；单个文件的失败都记录在结果中。
    pub async fn run_batch(&self, items: Vec<WorkItem>, options: &BatchOptions) -> AppResult<BatchOutcome> {
        let snapshot_id = self.cache.create_snapshot(Utc::now()).await?;
        self.cache
            .save_repository_tree(snapshot_id, &options.repository_tree)
            .await?;
        self.cache.save_work_items(snapshot_id, &items).await?;

        let total = items.len();
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut collected: Vec<(usize, ProcessedResult)> = Vec::with_capacity(total);
        let mut running = FuturesUnordered::new();

        for (idx, item) in items.into_iter().enumerate() {
            // 续跑时复用上一次的结果
            if let Some(previous) = options
                .resume_from
                .as_ref()
                .filter(|snapshot| snapshot.is_done(&item))
                .and_then(|snapshot| snapshot.results.iter().find(|r| r.filename == item.path && r.is_success()))
            {
                info!("[文件 {}/{}] ⏭️ 上次已完成，复用结果: {}", idx + 1, total, item.path);
                let result = previous.clone();
                self.persist(snapshot_id, &result).await;
                collected.push((idx, result));
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(AppError::unknown)?;

            if self.is_cancelled() {
                let result = ProcessedResult::failed(
                    &item.path,
                    AppError::Cancelled("收到终止信号，未开始处理".into()).to_record(),
                );
                self.persist(snapshot_id, &result).await;
                collected.push((idx, result));
                continue;
            }

            let ctx = ItemCtx::new(
                idx + 1,
                total,
                branch_name(&options.branch_prefix, &item.path),
                self.shutdown.clone(),
            );
            let flow = Arc::clone(&self.flow);
            let cache = Arc::clone(&self.cache);
            let path = item.path.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = flow.run(&item, &ctx).await;
                if let Err(e) = cache.save_processed_results(snapshot_id, std::slice::from_ref(&result)).await {
                    warn!("{} ⚠️ 结果写入快照失败: {}", ctx, e);
                }
                result
            });
            running.push(async move { (idx, path, handle.await) });
        }

        while let Some((idx, path, joined)) = running.next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("[文件 {}/{}] 任务执行失败: {}", idx + 1, total, e);
                    let result = ProcessedResult::failed(&path, AppError::unknown(e).to_record());
                    self.persist(snapshot_id, &result).await;
                    result
                }
            };
            collected.push((idx, result));
        }

        // 完成顺序任意，收集完再排序
        collected.sort_by_key(|(idx, _)| *idx);
        let results: Vec<ProcessedResult> = collected.into_iter().map(|(_, result)| result).collect();
        let report = BatchReport::from_results(&results);

        Ok(BatchOutcome {
            results,
            snapshot_id,
            report,
        })
    }

    async fn persist(&self, snapshot_id: i64, result: &ProcessedResult) {
        if let Err(e) = self
            .cache
            .save_processed_results(snapshot_id, std::slice::from_ref(result))
            .await
        {
            warn!("⚠️ {} 的结果写入快照失败: {}", result.filename, e);
        }
    }
}
