//! # Docs Translator
//!
//! 把仓库中的文档批量翻译成目标语言，并以 PR 的形式提交回上游
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（外部服务的调用额度），只暴露能力
//! - `RateLimiter` - 按服务的并发、间隔与令牌桶限流
//!
//! ### ② 外部服务（Clients）
//! - `clients/` - 代码托管 API、补全 API、语言检测
//!
//! ### ③ 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个文件
//! - `CacheStore` - 语言检测缓存与运行快照
//! - `ContentLifecycleManager` - 分支 / PR 的创建、更新与清理
//! - `Translator` - 保护代码块后调用补全 API
//!
//! ### ④ 流程层（Workflow）
//! - `workflow/` - 定义"一个文件"的完整处理流程
//! - `ItemFlow` - 缓存 → 检测 → 翻译 → 发布
//!
//! ### ⑤ 编排层（Orchestration）
//! - `orchestrator/` - 批量处理、并发控制与汇总报告
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, ErrorRecord};
pub use infrastructure::{RateLimiter, RateLimiterConfig};
pub use models::{ProcessedResult, Snapshot, WorkItem};
pub use orchestrator::{App, BatchOptions, BatchOrchestrator, BatchOutcome, BatchReport};
pub use services::{CacheStore, ContentLifecycleManager, Translator};
pub use workflow::{ItemCtx, ItemFlow};
