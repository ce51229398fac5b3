//! 日志工具模块
//!
//! 初始化 tracing 订阅者，并提供格式化输出的辅助函数

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{AppError, ErrorRecord};
use crate::infrastructure::RateLimiterMetrics;
use crate::orchestrator::report::BatchReport;

/// 初始化日志
///
/// `RUST_LOG` 优先；未设置时按 `verbose` 决定默认级别。可重复调用。
pub fn init(verbose: bool) {
    let default_level = if verbose { "docs_translator=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 文档批量翻译");
    info!(
        "📦 上游仓库: {}/{} ({})",
        config.upstream_owner, config.upstream_repo, config.base_branch
    );
    info!("🍴 fork 仓库: {}/{}", config.fork_owner(), config.fork_repo());
    info!("🌐 目标语言: {}", config.target_language);
    info!("📊 最大并发数: {}", config.batch_concurrency);
    info!("{}", "=".repeat(60));
}

/// 记录待处理文件信息
///
/// # 参数
/// - `total`: 文件总数
/// - `skipped`: 续跑时跳过的文件数
/// - `max_concurrent`: 最大并发数
pub fn log_items_loaded(total: usize, skipped: usize, max_concurrent: usize) {
    info!("✓ 找到 {} 个待处理的文件", total);
    if skipped > 0 {
        info!("⏭️ 其中 {} 个在上次运行中已完成，将直接复用结果", skipped);
    }
    info!("📋 同时最多处理 {} 个文件\n", max_concurrent);
}

/// 打印最终统计信息
pub fn print_final_stats(report: &BatchReport, snapshot_id: i64) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("\n{}", report);
    info!("✅ 已翻译: {}/{}", report.translated, report.total);
    info!("⏭️ 已是目标语言: {}", report.already_translated);
    info!("❌ 失败: {}", report.failed);
    info!("{}", "=".repeat(60));
    info!("\n快照编号: #{}", snapshot_id);
}

/// 打印限流器指标
pub fn log_limiter_metrics(service: &str, metrics: &RateLimiterMetrics) {
    info!(
        "📈 {}: 请求 {} 次，失败 {} 次，额度耗尽 {} 次{}",
        service,
        metrics.total_requests,
        metrics.failed_requests,
        metrics.depletion_events,
        metrics
            .last_error
            .as_deref()
            .map(|e| format!("，最后一次错误: {}", truncate_text(e, 80)))
            .unwrap_or_default()
    );
}

/// 记录致命错误，返回输出到 stderr 的结构化记录
pub fn report_fatal(err: &AppError) -> ErrorRecord {
    let record = err.to_record();
    error!(
        kind = %record.kind,
        operation = ?record.operation,
        status = ?record.status,
        request_id = ?record.request_id,
        "❌ 运行失败: {}",
        record.message
    );
    record
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_becomes_fatal_record() {
        let err = Config::from_file("/nonexistent/docs-translator.toml").unwrap_err();
        let record = report_fatal(&err);
        assert_eq!(record.kind, "validation");
        assert_eq!(record.status, None);
        assert!(record.message.contains("/nonexistent/docs-translator.toml"));
    }

    #[test]
    fn test_truncate_text_counts_chars() {
        assert_eq!(truncate_text("привет", 3), "при...");
        assert_eq!(truncate_text("ok", 3), "ok");
    }
}
