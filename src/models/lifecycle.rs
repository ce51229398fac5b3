//! 分支 / PR 生命周期

use serde::{Deserialize, Serialize};

/// 单个分支在本进程内经历的状态
///
/// ```text
/// NoBranch → BranchCreated → Committed → PrOpen → {PrClean | PrNeedsUpdate | PrConflicted}
///                                                → {Closed | MergedExternally}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    NoBranch,
    BranchCreated,
    Committed,
    PrOpen,
    PrClean,
    PrNeedsUpdate,
    PrConflicted,
    Closed,
    MergedExternally,
}

impl LifecycleState {
    /// 清理时是否需要删除该分支
    pub fn is_disposable(&self) -> bool {
        matches!(
            self,
            LifecycleState::BranchCreated
                | LifecycleState::Committed
                | LifecycleState::PrNeedsUpdate
                | LifecycleState::PrConflicted
                | LifecycleState::Closed
        )
    }
}

/// PR 的可合并状态（托管方返回的 `mergeable_state`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeableState {
    Clean,
    Dirty,
    Behind,
    Blocked,
    Unstable,
    Unknown,
}

impl MergeableState {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("clean") => MergeableState::Clean,
            Some("dirty") => MergeableState::Dirty,
            Some("behind") => MergeableState::Behind,
            Some("blocked") => MergeableState::Blocked,
            Some("unstable") => MergeableState::Unstable,
            _ => MergeableState::Unknown,
        }
    }
}

/// PR 的开闭状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

/// `check_pr_status` 的结果，是过期 PR 处理策略的唯一输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrStatus {
    pub needs_update: bool,
    pub has_conflicts: bool,
    pub mergeable_state: MergeableState,
}

impl PrStatus {
    pub fn from_mergeable_state(state: MergeableState) -> Self {
        let (needs_update, has_conflicts) = match state {
            MergeableState::Dirty => (true, true),
            _ => (false, false),
        };
        Self {
            needs_update,
            has_conflicts,
            mergeable_state: state,
        }
    }

    /// 分支落后于基线，需要走刷新流程
    pub fn is_behind(&self) -> bool {
        self.mergeable_state == MergeableState::Behind
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        if self.has_conflicts {
            LifecycleState::PrConflicted
        } else if self.needs_update {
            LifecycleState::PrNeedsUpdate
        } else if self.mergeable_state == MergeableState::Clean {
            LifecycleState::PrClean
        } else {
            LifecycleState::PrOpen
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pr_status_table() {
        let table = [
            ("clean", false, false),
            ("dirty", true, true),
            ("behind", false, false),
        ];
        for (raw, needs_update, has_conflicts) in table {
            let status = PrStatus::from_mergeable_state(MergeableState::parse(Some(raw)));
            assert_eq!(status.needs_update, needs_update, "{}", raw);
            assert_eq!(status.has_conflicts, has_conflicts, "{}", raw);
        }
        assert!(PrStatus::from_mergeable_state(MergeableState::Behind).is_behind());
    }

    #[test]
    fn test_lifecycle_from_status() {
        assert_eq!(
            PrStatus::from_mergeable_state(MergeableState::Dirty).lifecycle_state(),
            LifecycleState::PrConflicted
        );
        assert_eq!(
            PrStatus::from_mergeable_state(MergeableState::Clean).lifecycle_state(),
            LifecycleState::PrClean
        );
        assert!(!LifecycleState::PrClean.is_disposable());
        assert!(LifecycleState::PrConflicted.is_disposable());
    }
}
