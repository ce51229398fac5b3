//! 数据模型
//!
//! 批处理过程中流转的所有数据结构

pub mod lifecycle;
pub mod result;
pub mod snapshot;
pub mod work_item;

pub use lifecycle::{LifecycleState, MergeableState, PrState, PrStatus};
pub use result::{BranchRef, Outcome, ProcessedResult, PullRequestRecord};
pub use snapshot::{LanguageCacheEntry, Snapshot};
pub use work_item::{EntryType, TreeEntry, WorkItem};
