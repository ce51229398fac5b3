//! 文件处理上下文
//!
//! 封装"我正在处理第几个文件、它对应哪个分支"这一信息

use std::fmt::Display;
use tokio::sync::watch;

/// 文件处理上下文
#[derive(Debug, Clone)]
pub struct ItemCtx {
    /// 文件序号（从 1 开始，仅用于日志显示）
    pub index: usize,

    pub total: usize,

    /// 译文所在的分支名
    pub branch: String,

    /// 终止信号，为 `true` 时不再开始新的步骤
    pub shutdown: watch::Receiver<bool>,
}

impl ItemCtx {
    pub fn new(index: usize, total: usize, branch: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            index,
            total,
            branch,
            shutdown,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Display for ItemCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[文件 {}/{}]", self.index, self.total)
    }
}
