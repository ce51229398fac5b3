//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和流程调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用入口
//! - 注册限流服务、连接数据库、组装各层组件
//! - 读取仓库树，加载待翻译文件（Vec<WorkItem>）
//! - 处理终止信号，退出前清理分支和资源
//!
//! ### `batch_processor` - 批量处理器
//! - 控制并发数量（Semaphore）
//! - 把每个文件交给 ItemFlow，收集全部结果
//! - 把快照和结果写入数据库
//!
//! ### `report` - 汇总报告
//! - 按目录分组的结果统计，可发布为 issue 评论
//!
//! ## 层次关系
//!
//! ```text
//! app (加载 Vec<WorkItem>)
//!     ↓
//! batch_processor (处理 Vec<WorkItem>)
//!     ↓
//! workflow::ItemFlow (处理单个 WorkItem)
//!     ↓
//! services (能力层：translator / lifecycle / cache)
//!     ↓
//! infrastructure (基础设施：RateLimiter)
//! ```

pub mod app;
pub mod batch_processor;
pub mod report;

// 重新导出主要类型
pub use app::App;
pub use batch_processor::{BatchOptions, BatchOrchestrator, BatchOutcome};
pub use report::{BatchReport, EntryStatus, ReportEntry, REPORT_MARKER};
