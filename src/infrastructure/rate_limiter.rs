//! 限流器 - 基础设施层
//!
//! 每个外部服务注册一个独立的令牌桶调度器，同时满足三种约束：
//!
//! 1. **并发上限** `max_concurrent`：同时执行的任务数
//! 2. **令牌桶** `reservoir`：窗口内可用的调用额度，按 `refill_interval` 补充
//! 3. **最小间隔** `min_interval`：相邻两次派发之间的硬下限，即使仍有额度
//!
//! 等待中的任务按优先级派发，同优先级先进先出。任务自身的错误原样返回给调用方，
//! 限流器只在指标中记录。

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::RateLimiterError;

/// 单个服务的限流配置，注册后不可修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// 同时执行的任务上限
    pub max_concurrent: usize,
    /// 相邻两次派发的最小间隔
    pub min_interval: Duration,
    /// 令牌桶容量，`None` 表示不限额
    pub reservoir: Option<u32>,
    /// 每次补充的令牌数
    pub refill_amount: u32,
    /// 补充周期
    pub refill_interval: Option<Duration>,
    /// 排队上限，超过后新任务直接被拒绝
    pub high_water: Option<usize>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            min_interval: Duration::ZERO,
            reservoir: None,
            refill_amount: 0,
            refill_interval: None,
            high_water: None,
        }
    }
}

impl RateLimiterConfig {
    fn validate(&self, service: &str) -> Result<(), RateLimiterError> {
        let invalid = |reason: &str| RateLimiterError::InvalidConfig {
            service: service.to_string(),
            reason: reason.to_string(),
        };
        if self.max_concurrent == 0 {
            return Err(invalid("max_concurrent 必须大于 0"));
        }
        if self.refill_interval.is_some() && self.reservoir.is_none() {
            return Err(invalid("设置了 refill_interval 但没有 reservoir"));
        }
        if self.refill_interval == Some(Duration::ZERO) {
            return Err(invalid("refill_interval 不能为 0"));
        }
        // 额度一旦耗尽且永不补充，排队任务将永远等待
        if self.reservoir.is_some() && (self.refill_interval.is_none() || self.refill_amount == 0) {
            return Err(invalid("设置了 reservoir 但没有补充：需要 refill_interval 且 refill_amount 大于 0"));
        }
        Ok(())
    }
}

/// 单个服务的运行指标，所有计数都不会小于 0
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimiterMetrics {
    pub total_requests: u64,
    pub queued_requests: u64,
    pub running_requests: u64,
    pub failed_requests: u64,
    pub last_error: Option<String>,
    pub last_request_time: Option<DateTime<Utc>>,
    /// 额度耗尽的次数，每个补充周期最多记一次
    pub depletion_events: u64,
}

/// 任务优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

struct Waiter {
    priority: Priority,
    seq: u64,
    go: oneshot::Sender<RunningGuard>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // BinaryHeap 是大顶堆：优先级高者在前，同优先级 seq 小者在前
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ServiceState {
    queue: BinaryHeap<Waiter>,
    running: usize,
    reservoir: Option<u32>,
    last_dispatch: Option<Instant>,
    timer_armed: bool,
    depletion_warned: bool,
    next_seq: u64,
    metrics: RateLimiterMetrics,
}

impl ServiceState {
    fn sync_gauges(&mut self) {
        self.metrics.queued_requests = self.queue.len() as u64;
        self.metrics.running_requests = self.running as u64;
    }
}

struct Service {
    id: String,
    config: RateLimiterConfig,
    state: Mutex<ServiceState>,
    idle: Notify,
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    fn new(id: String, config: RateLimiterConfig) -> Self {
        let state = ServiceState {
            queue: BinaryHeap::new(),
            running: 0,
            reservoir: config.reservoir,
            last_dispatch: None,
            timer_armed: false,
            depletion_warned: false,
            next_seq: 0,
            metrics: RateLimiterMetrics::default(),
        };
        Self {
            id,
            config,
            state: Mutex::new(state),
            idle: Notify::new(),
            refill_task: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, priority: Priority) -> Result<oneshot::Receiver<RunningGuard>, RateLimiterError> {
        let mut state = self.lock();
        if let Some(high_water) = self.config.high_water {
            if state.queue.len() >= high_water {
                return Err(RateLimiterError::QueueFull {
                    service: self.id.clone(),
                    high_water,
                });
            }
        }
        let (go, rx) = oneshot::channel();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Waiter { priority, seq, go });
        state.metrics.total_requests += 1;
        state.sync_gauges();
        Ok(rx)
    }

    /// 在约束允许的范围内尽可能多地派发排队任务
    fn pump(self: &Arc<Self>) {
        let mut state = self.lock();
        while !state.queue.is_empty() {
            if state.running >= self.config.max_concurrent {
                break;
            }
            if state.reservoir == Some(0) {
                if !state.depletion_warned {
                    state.depletion_warned = true;
                    state.metrics.depletion_events += 1;
                    warn!(
                        service = %self.id,
                        queued = state.queue.len(),
                        "⚠️ 调用额度已耗尽，排队任务将在下一次补充后派发"
                    );
                }
                break;
            }
            if let Some(last) = state.last_dispatch {
                let ready_at = last + self.config.min_interval;
                if Instant::now() < ready_at {
                    if !state.timer_armed {
                        state.timer_armed = true;
                        let service = Arc::clone(self);
                        tokio::spawn(async move {
                            tokio::time::sleep_until(ready_at).await;
                            service.lock().timer_armed = false;
                            service.pump();
                        });
                    }
                    break;
                }
            }

            let Some(waiter) = state.queue.pop() else {
                break;
            };
            // 名额随 guard 一起交给调用方；调用方即使在收到之前被取消，
            // guard 也会随通道一起被丢弃并归还名额
            let guard = RunningGuard {
                service: Arc::clone(self),
                finished: false,
            };
            if let Err(mut guard) = waiter.go.send(guard) {
                // 调用方在排队期间已放弃，名额尚未占用；此时持有锁，不能走 release
                guard.finished = true;
                state.sync_gauges();
                continue;
            }
            state.running += 1;
            if let Some(tokens) = state.reservoir.as_mut() {
                *tokens -= 1;
            }
            state.last_dispatch = Some(Instant::now());
            state.metrics.last_request_time = Some(Utc::now());
            state.sync_gauges();
        }
    }

    /// 任务结束（成功、失败或被取消）
    fn release(self: &Arc<Self>, error: Option<String>) {
        {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
            if let Some(message) = error {
                state.metrics.failed_requests += 1;
                state.metrics.last_error = Some(message);
            }
            state.sync_gauges();
            if state.running == 0 {
                self.idle.notify_waiters();
            }
        }
        self.pump();
    }

    fn refill(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            let capacity = self.config.reservoir.unwrap_or(u32::MAX);
            if let Some(tokens) = state.reservoir.as_mut() {
                *tokens = tokens.saturating_add(self.config.refill_amount).min(capacity);
            }
            state.depletion_warned = false;
        }
        self.pump();
    }

    fn clear_queue(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.queue.len();
        // 丢弃 Sender，等待中的调用方会收到 Dropped 错误
        state.queue.clear();
        state.sync_gauges();
        dropped
    }

    fn stop_refill(&self) {
        let handle = self
            .refill_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().running == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// 已派发任务的占位，保证被取消的任务也会归还并发名额
struct RunningGuard {
    service: Arc<Service>,
    finished: bool,
}

impl RunningGuard {
    fn finish(mut self, error: Option<String>) {
        self.finished = true;
        self.service.release(error);
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.service.release(None);
        }
    }
}

/// 多服务限流器
///
/// 由组合根显式创建并通过 `Arc` 注入，不存在全局实例。
#[derive(Default)]
pub struct RateLimiter {
    services: Mutex<HashMap<String, Arc<Service>>>,
    shut_down: AtomicBool,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn services(&self) -> MutexGuard<'_, HashMap<String, Arc<Service>>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn service(&self, service_id: &str) -> Result<Arc<Service>, RateLimiterError> {
        self.services()
            .get(service_id)
            .cloned()
            .ok_or_else(|| RateLimiterError::UnknownService(service_id.to_string()))
    }

    /// 注册一个服务
    ///
    /// 配置了 `refill_interval` 时会启动补充任务，因此必须在 tokio 运行时内调用。
    pub fn register(&self, service_id: impl Into<String>, config: RateLimiterConfig) -> Result<(), RateLimiterError> {
        let service_id = service_id.into();
        config.validate(&service_id)?;

        let mut services = self.services();
        if services.contains_key(&service_id) {
            return Err(RateLimiterError::AlreadyRegistered(service_id));
        }

        let service = Arc::new(Service::new(service_id.clone(), config));
        if let Some(interval) = service.config.refill_interval {
            let weak = Arc::downgrade(&service);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // 第一次 tick 立即返回
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(service) = weak.upgrade() else {
                        break;
                    };
                    service.refill();
                }
            });
            *service
                .refill_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        debug!(service = %service_id, config = ?service.config, "注册限流服务");
        services.insert(service_id, service);
        Ok(())
    }

    /// 以默认优先级调度任务
    pub async fn schedule<T, E, F, Fut>(&self, service_id: &str, task: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RateLimiterError> + Display,
    {
        self.schedule_with_priority(service_id, Priority::Normal, task)
            .await
    }

    /// 调度任务，满足全部限流约束后才执行
    ///
    /// 任务返回的错误原样返回；只有限流器本身的失败（未注册、已关闭、
    /// 队列被清空、队列已满）才会转换为 `E`。
    pub async fn schedule_with_priority<T, E, F, Fut>(
        &self,
        service_id: &str,
        priority: Priority,
        task: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RateLimiterError> + Display,
    {
        if self.is_shut_down() {
            return Err(RateLimiterError::ShutDown.into());
        }
        let service = self.service(service_id)?;
        let go = service.enqueue(priority)?;
        service.pump();

        let Ok(guard) = go.await else {
            return Err(RateLimiterError::Dropped(service_id.to_string()).into());
        };
        let result = task().await;
        guard.finish(result.as_ref().err().map(|e| e.to_string()));
        result
    }

    /// 获取服务指标快照
    pub fn metrics(&self, service_id: &str) -> Result<RateLimiterMetrics, RateLimiterError> {
        Ok(self.service(service_id)?.lock().metrics.clone())
    }

    /// 丢弃尚未开始的任务，已在执行的任务不受影响
    pub fn clear_queue(&self, service_id: &str) -> Result<usize, RateLimiterError> {
        let dropped = self.service(service_id)?.clear_queue();
        if dropped > 0 {
            warn!(service = %service_id, dropped, "已清空排队任务");
        }
        Ok(dropped)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(AtomicOrdering::SeqCst)
    }

    /// 停止接收新任务，丢弃排队任务，等待执行中的任务结束
    ///
    /// 可重复调用。
    pub async fn shutdown(&self) {
        let first = !self.shut_down.swap(true, AtomicOrdering::SeqCst);
        let services: Vec<Arc<Service>> = self.services().values().cloned().collect();
        for service in &services {
            service.stop_refill();
            let dropped = service.clear_queue();
            if first && dropped > 0 {
                warn!(service = %service.id, dropped, "关闭限流器，丢弃排队任务");
            }
        }
        for service in &services {
            service.wait_idle().await;
        }
        if first {
            info!("限流器已关闭");
        }
    }
}
