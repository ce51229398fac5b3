//! 缓存与快照存储
//!
//! SQLite 数据库，保存两类数据：
//! - **语言检测缓存**：按文件路径为键，只有内容 hash 一致时才算命中
//! - **运行快照**：每次批处理的仓库树、待处理文件与处理结果，用于审计与断点续跑
//!
//! 每一次多行写入都包在一个事务里，崩溃不会留下写了一半的快照。

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::{AppError, AppResult, ErrorRecord};
use crate::models::{
    BranchRef, EntryType, LanguageCacheEntry, Outcome, ProcessedResult, PullRequestRecord, Snapshot,
    TreeEntry, WorkItem,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
const MAX_CONNECTIONS: u32 = 5;

#[derive(sqlx::FromRow)]
struct LanguageCacheRow {
    filename: String,
    content_hash: String,
    language: String,
    confidence: f64,
    timestamp: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: i64,
    timestamp: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct TreeRow {
    path: String,
    sha: String,
    #[sqlx(rename = "type")]
    entry_type: String,
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    path: String,
    content: String,
    sha: String,
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    filename: String,
    branch_ref: Option<String>,
    branch_sha: Option<String>,
    pull_request: Option<String>,
    translation: Option<String>,
    error: Option<String>,
    already_translated: bool,
}

impl ResultRow {
    fn into_result(self) -> AppResult<ProcessedResult> {
        let outcome = match (self.translation, self.error) {
            (Some(text), None) => Outcome::Translation(text),
            (None, Some(raw)) => Outcome::Error(parse_json::<ErrorRecord>(&raw)?),
            _ => {
                return Err(AppError::Validation(format!(
                    "{} 的处理结果必须恰好包含译文或错误之一",
                    self.filename
                )))
            }
        };
        let pull_request = self
            .pull_request
            .as_deref()
            .map(parse_json::<PullRequestRecord>)
            .transpose()?;
        Ok(ProcessedResult {
            branch: self.branch_ref.map(|name| BranchRef {
                name,
                sha: self.branch_sha.unwrap_or_default(),
                created: false,
            }),
            filename: self.filename,
            outcome,
            pull_request,
            already_translated: self.already_translated,
        })
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> AppResult<T> {
    serde_json::from_str(raw).map_err(|e| AppError::Validation(format!("无法解析存储的记录: {}", e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> AppResult<String> {
    serde_json::to_string(value).map_err(AppError::unknown)
}

/// 缓存与快照存储
#[derive(Debug, Clone)]
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    async fn new(options: SqliteConnectOptions, max: u32) -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await
            .map_err(AppError::storage("connect"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// 打开（必要时创建）数据库文件并执行迁移
    pub async fn connect(path: impl AsRef<Path>) -> AppResult<Self> {
        let options = Self::base_options()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::new(options, MAX_CONNECTIONS).await
    }

    /// 内存数据库
    ///
    /// 每个连接看到的是各自独立的内存库，所以只能有一个连接。
    pub async fn connect_in_memory() -> AppResult<Self> {
        let options = Self::base_options().filename(":memory:");
        Self::new(options, 1).await
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(1500))
    }

    #[instrument(skip(self))]
    async fn migrate(&self) -> AppResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Storage {
                operation: "migrate",
                source: e.into(),
            })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // 语言检测缓存
    // =========================================================================

    /// 读取缓存；存储的 hash 与 `content_hash` 不一致时视为未命中
    pub async fn get_language_cache(&self, filename: &str, content_hash: &str) -> AppResult<Option<LanguageCacheEntry>> {
        let row: Option<LanguageCacheRow> = sqlx::query_as(
            "SELECT filename, content_hash, language, confidence, timestamp
             FROM language_cache WHERE filename = ?",
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::storage("get_language_cache"))?;

        Ok(row
            .filter(|row| row.content_hash == content_hash)
            .map(|row| LanguageCacheEntry {
                filename: row.filename,
                content_hash: row.content_hash,
                language: row.language,
                confidence: row.confidence,
                timestamp: row.timestamp,
            }))
    }

    /// 写入缓存，同一文件的旧条目被整体替换
    pub async fn set_language_cache(
        &self,
        filename: &str,
        content_hash: &str,
        language: &str,
        confidence: f64,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO language_cache (filename, content_hash, language, confidence, timestamp)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(filename)
        .bind(content_hash)
        .bind(language)
        .bind(confidence)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(AppError::storage("set_language_cache"))?;
        Ok(())
    }

    /// 批量删除缓存，返回实际删除的条数
    pub async fn invalidate_language_cache(&self, filenames: &[String]) -> AppResult<u64> {
        if filenames.is_empty() {
            return Ok(0);
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(AppError::storage("invalidate_language_cache"))?;
        let mut removed = 0;
        for filename in filenames {
            removed += sqlx::query("DELETE FROM language_cache WHERE filename = ?")
                .bind(filename)
                .execute(&mut *tx)
                .await
                .map_err(AppError::storage("invalidate_language_cache"))?
                .rows_affected();
        }
        tx.commit()
            .await
            .map_err(AppError::storage("invalidate_language_cache"))?;
        debug!("已清除 {} 条语言缓存", removed);
        Ok(removed)
    }

    // =========================================================================
    // 快照
    // =========================================================================

    pub async fn create_snapshot(&self, timestamp: DateTime<Utc>) -> AppResult<i64> {
        let id = sqlx::query("INSERT INTO snapshots (timestamp) VALUES (?)")
            .bind(timestamp)
            .execute(&self.pool)
            .await
            .map_err(AppError::storage("create_snapshot"))?
            .last_insert_rowid();
        info!("📸 创建快照 #{}", id);
        Ok(id)
    }

    pub async fn save_repository_tree(&self, snapshot_id: i64, entries: &[TreeEntry]) -> AppResult<()> {
        let op = "save_repository_tree";
        let mut tx = self.pool.begin().await.map_err(AppError::storage(op))?;
        for entry in entries {
            sqlx::query("INSERT INTO repository_tree (snapshot_id, path, sha, type) VALUES (?, ?, ?, ?)")
                .bind(snapshot_id)
                .bind(&entry.path)
                .bind(&entry.sha)
                .bind(entry.entry_type.as_str())
                .execute(&mut *tx)
                .await
                .map_err(AppError::storage(op))?;
        }
        tx.commit().await.map_err(AppError::storage(op))
    }

    pub async fn save_work_items(&self, snapshot_id: i64, items: &[WorkItem]) -> AppResult<()> {
        let op = "save_work_items";
        let mut tx = self.pool.begin().await.map_err(AppError::storage(op))?;
        for item in items {
            sqlx::query("INSERT INTO work_items (snapshot_id, path, content, sha) VALUES (?, ?, ?, ?)")
                .bind(snapshot_id)
                .bind(&item.path)
                .bind(&item.content)
                .bind(&item.sha)
                .execute(&mut *tx)
                .await
                .map_err(AppError::storage(op))?;
        }
        tx.commit().await.map_err(AppError::storage(op))
    }

    pub async fn save_processed_results(&self, snapshot_id: i64, results: &[ProcessedResult]) -> AppResult<()> {
        let op = "save_processed_results";
        // 先完成序列化，事务内只剩 SQL
        let mut rows = Vec::with_capacity(results.len());
        for result in results {
            let error = result.error().map(to_json).transpose()?;
            let pull_request = result.pull_request.as_ref().map(to_json).transpose()?;
            rows.push((result, error, pull_request));
        }

        let mut tx = self.pool.begin().await.map_err(AppError::storage(op))?;
        for (result, error, pull_request) in rows {
            sqlx::query(
                "INSERT INTO processed_results
                    (snapshot_id, filename, branch_ref, branch_sha, pr_number, pull_request,
                     translation, error, already_translated)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(snapshot_id)
            .bind(&result.filename)
            .bind(result.branch.as_ref().map(|b| b.name.as_str()))
            .bind(result.branch.as_ref().map(|b| b.sha.as_str()))
            .bind(result.pull_request.as_ref().map(|pr| pr.number as i64))
            .bind(pull_request)
            .bind(result.translation())
            .bind(error)
            .bind(result.already_translated)
            .execute(&mut *tx)
            .await
            .map_err(AppError::storage(op))?;
        }
        tx.commit().await.map_err(AppError::storage(op))
    }

    /// 重建最近一次快照
    pub async fn get_latest_snapshot(&self) -> AppResult<Option<Snapshot>> {
        let op = "get_latest_snapshot";
        let Some(head) = sqlx::query_as::<_, SnapshotRow>("SELECT id, timestamp FROM snapshots ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::storage(op))?
        else {
            return Ok(None);
        };

        let tree: Vec<TreeRow> =
            sqlx::query_as("SELECT path, sha, type FROM repository_tree WHERE snapshot_id = ? ORDER BY id")
                .bind(head.id)
                .fetch_all(&self.pool)
                .await
                .map_err(AppError::storage(op))?;
        let items: Vec<WorkItemRow> =
            sqlx::query_as("SELECT path, content, sha FROM work_items WHERE snapshot_id = ? ORDER BY id")
                .bind(head.id)
                .fetch_all(&self.pool)
                .await
                .map_err(AppError::storage(op))?;
        let results: Vec<ResultRow> = sqlx::query_as(
            "SELECT filename, branch_ref, branch_sha, pull_request, translation, error, already_translated
             FROM processed_results WHERE snapshot_id = ? ORDER BY id",
        )
        .bind(head.id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::storage(op))?;

        Ok(Some(Snapshot {
            id: head.id,
            timestamp: head.timestamp,
            repository_tree: tree
                .into_iter()
                .filter_map(|row| {
                    EntryType::parse(&row.entry_type).map(|entry_type| TreeEntry {
                        path: row.path,
                        sha: row.sha,
                        entry_type,
                    })
                })
                .collect(),
            work_items: items
                .into_iter()
                .map(|row| WorkItem::new(row.path, row.content, row.sha))
                .collect(),
            results: results
                .into_iter()
                .map(ResultRow::into_result)
                .collect::<AppResult<Vec<_>>>()?,
        }))
    }

    /// 清空全部快照
    pub async fn clear_snapshots(&self) -> AppResult<()> {
        let op = "clear_snapshots";
        let mut tx = self.pool.begin().await.map_err(AppError::storage(op))?;
        for table in ["processed_results", "work_items", "repository_tree", "snapshots"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .map_err(AppError::storage(op))?;
        }
        tx.commit().await.map_err(AppError::storage(op))?;
        info!("🧹 已清空全部快照");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MergeableState, PrState};
    use tokio_test::{assert_err, assert_ok};

    async fn store() -> CacheStore {
        CacheStore::connect_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_miss() {
        let store = store().await;
        store
            .set_language_cache("docs/a.md", "h1", "rus", 0.93)
            .await
            .unwrap();
        let hit = store.get_language_cache("docs/a.md", "h1").await.unwrap().unwrap();
        assert_eq!(hit.language, "rus");
        assert_eq!(hit.confidence, 0.93);

        assert!(store.get_language_cache("docs/a.md", "h2").await.unwrap().is_none());
        assert!(store.get_language_cache("docs/other.md", "h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_replaces_previous_entry() {
        let store = store().await;
        store.set_language_cache("a.md", "h1", "eng", 0.9).await.unwrap();
        store.set_language_cache("a.md", "h2", "rus", 0.8).await.unwrap();

        assert!(store.get_language_cache("a.md", "h1").await.unwrap().is_none());
        let entry = store.get_language_cache("a.md", "h2").await.unwrap().unwrap();
        assert_eq!(entry.language, "rus");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM language_cache")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_invalidate_only_named() {
        let store = store().await;
        store.set_language_cache("a.md", "h", "eng", 0.9).await.unwrap();
        store.set_language_cache("b.md", "h", "eng", 0.9).await.unwrap();

        let removed = store
            .invalidate_language_cache(&["a.md".to_string(), "unknown.md".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_language_cache("a.md", "h").await.unwrap().is_none());
        assert!(store.get_language_cache("b.md", "h").await.unwrap().is_some());
        assert_eq!(store.invalidate_language_cache(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_and_clear() {
        let store = store().await;
        assert!(store.get_latest_snapshot().await.unwrap().is_none());

        let old = store.create_snapshot(Utc::now()).await.unwrap();
        let id = store.create_snapshot(Utc::now()).await.unwrap();
        assert!(id > old);

        let item = WorkItem::new("docs/guide/a.md", "# A", "sha-a");
        store
            .save_repository_tree(
                id,
                &[TreeEntry {
                    path: item.path.clone(),
                    sha: item.sha.clone(),
                    entry_type: EntryType::Blob,
                }],
            )
            .await
            .unwrap();
        store.save_work_items(id, &[item.clone()]).await.unwrap();

        let pr = PullRequestRecord {
            number: 12,
            head_branch: "translate/docs-guide-a".into(),
            state: PrState::Open,
            mergeable_state: MergeableState::Clean,
            url: None,
        };
        let ok = ProcessedResult::translated(
            &item.path,
            "# А".into(),
            BranchRef {
                name: pr.head_branch.clone(),
                sha: "c1".into(),
                created: true,
            },
            pr.clone(),
        );
        let failed = ProcessedResult::failed(
            "docs/b.md",
            ErrorRecord {
                kind: "remote_api.server_error".into(),
                operation: Some("create_pr".into()),
                status: Some(502),
                request_id: Some("req-1".into()),
                message: "Bad Gateway".into(),
            },
        );
        store.save_processed_results(id, &[ok.clone()]).await.unwrap();
        store.save_processed_results(id, &[failed.clone()]).await.unwrap();

        let snapshot = store.get_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.repository_tree.len(), 1);
        assert_eq!(snapshot.work_items, vec![item.clone()]);
        assert_eq!(snapshot.results.len(), 2);
        assert_eq!(snapshot.results[0].pull_request, Some(pr));
        assert_eq!(snapshot.results[0].branch.as_ref().unwrap().sha, "c1");
        assert_eq!(snapshot.results[1], failed);
        assert!(snapshot.is_done(&item));

        assert_ok!(store.clear_snapshots().await);
        assert!(store.get_latest_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rows_require_existing_snapshot() {
        let store = store().await;
        let result = store
            .save_work_items(999, &[WorkItem::new("a.md", "a", "s"), WorkItem::new("b.md", "b", "s")])
            .await;
        assert_err!(&result);
        assert_eq!(result.unwrap_err().operation(), Some("save_work_items"));

        // 事务回滚，没有写入任何一行
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM work_items")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_check_constraint_rejects_empty_outcome() {
        let store = store().await;
        let id = store.create_snapshot(Utc::now()).await.unwrap();
        let result = sqlx::query("INSERT INTO processed_results (snapshot_id, filename) VALUES (?, ?)")
            .bind(id)
            .bind("a.md")
            .execute(store.pool())
            .await;
        assert_err!(result);
    }
}
