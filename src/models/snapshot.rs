use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::result::ProcessedResult;
use crate::models::work_item::{TreeEntry, WorkItem};

/// 一次批处理运行的审计记录
///
/// 运行结束后不再修改，只会被更新的快照取代。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub repository_tree: Vec<TreeEntry>,
    pub work_items: Vec<WorkItem>,
    pub results: Vec<ProcessedResult>,
}

impl Snapshot {
    /// 上次运行中已成功处理、且源内容未变化的路径
    pub fn is_done(&self, item: &WorkItem) -> bool {
        let same_source = self
            .work_items
            .iter()
            .any(|prev| prev.path == item.path && prev.sha == item.sha);
        same_source
            && self
                .results
                .iter()
                .any(|result| result.filename == item.path && result.is_success())
    }
}

/// 语言检测缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageCacheEntry {
    pub filename: String,
    pub content_hash: String,
    pub language: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}
