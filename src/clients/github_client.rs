//! 代码托管 API 客户端（GitHub REST）
//!
//! 所有失败都在这里映射为 [`RemoteApiError`]，附带操作名、状态码与 request id。

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::clients::{FileChange, IssueComment, NewPullRequest, PullRequestUpdate, VersionControlHost};
use crate::config::Config;
use crate::error::{AppError, AppResult, RemoteApiError};
use crate::models::{EntryType, MergeableState, PrState, PullRequestRecord, TreeEntry};

const REQUEST_ID_HEADER: &str = "x-github-request-id";

/// GitHub 客户端
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    upstream: (String, String),
    fork: (String, String),
    base_branch: String,
}

impl GithubClient {
    pub fn new(config: &Config) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("docs-translator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteApiError::classify("build_client", None, None, e.to_string()))?;
        Ok(Self {
            http,
            api_base: config.hosting_api_base_url.trim_end_matches('/').to_string(),
            token: config.hosting_token.clone(),
            upstream: (config.upstream_owner.clone(), config.upstream_repo.clone()),
            fork: (config.fork_owner().to_string(), config.fork_repo().to_string()),
            base_branch: config.base_branch.clone(),
        })
    }

    fn head_label(&self, branch: &str) -> String {
        format!("{}:{}", self.fork.0, branch)
    }

    /// 拼接 `/repos/{owner}/{repo}/...`，每一段单独编码
    fn repo_url(&self, repo: &(String, String), segments: &[&str]) -> AppResult<Url> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| AppError::Validation(format!("无效的 API 地址 {}: {}", self.api_base, e)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| AppError::Validation(format!("无效的 API 地址: {}", self.api_base)))?;
            path.pop_if_empty().extend(["repos", repo.0.as_str(), repo.1.as_str()]);
            for segment in segments {
                path.extend(segment.split('/').filter(|s| !s.is_empty()));
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    /// 发送请求，非 2xx 响应转换为 `RemoteApiError`
    async fn send(&self, operation: &str, builder: RequestBuilder) -> AppResult<Response> {
        let response = builder.send().await.map_err(|e| {
            RemoteApiError::classify(operation, e.status().map(|s| s.as_u16()), None, e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or(body);
        debug!("{} 失败: status={} message={}", operation, status, message);
        Err(RemoteApiError::classify(operation, Some(status.as_u16()), request_id, message).into())
    }

    async fn send_json<T: DeserializeOwned>(&self, operation: &str, builder: RequestBuilder) -> AppResult<T> {
        let response = self.send(operation, builder).await?;
        response.json::<T>().await.map_err(|e| {
            RemoteApiError::classify(operation, None, None, format!("无法解析响应: {}", e)).into()
        })
    }

    /// 404 视为不存在
    async fn send_optional<T: DeserializeOwned>(&self, operation: &str, builder: RequestBuilder) -> AppResult<Option<T>> {
        match self.send_json(operation, builder).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<RawTreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct RawTreeEntry {
    path: String,
    sha: String,
    #[serde(rename = "type")]
    entry_type: String,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Deserialize)]
struct ContentResponse {
    sha: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    commit: CommitInfo,
}

#[derive(Deserialize)]
struct CommitInfo {
    sha: String,
}

#[derive(Deserialize)]
struct RawPullRequest {
    number: u64,
    state: String,
    #[serde(default)]
    merged: bool,
    merged_at: Option<String>,
    mergeable_state: Option<String>,
    html_url: Option<String>,
    head: RawHead,
}

#[derive(Deserialize)]
struct RawHead {
    #[serde(rename = "ref")]
    branch: String,
}

impl From<RawPullRequest> for PullRequestRecord {
    fn from(raw: RawPullRequest) -> Self {
        let state = if raw.merged || raw.merged_at.is_some() {
            PrState::Merged
        } else if raw.state == "open" {
            PrState::Open
        } else {
            PrState::Closed
        };
        Self {
            number: raw.number,
            head_branch: raw.head.branch,
            state,
            mergeable_state: MergeableState::parse(raw.mergeable_state.as_deref()),
            url: raw.html_url,
        }
    }
}

#[derive(Deserialize)]
struct RawComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
}

impl From<RawComment> for IssueComment {
    fn from(raw: RawComment) -> Self {
        Self {
            id: raw.id,
            body: raw.body.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl VersionControlHost for GithubClient {
    async fn get_tree(&self, reference: &str) -> AppResult<Vec<TreeEntry>> {
        let mut url = self.repo_url(&self.upstream, &["git", "trees", reference])?;
        url.query_pairs_mut().append_pair("recursive", "1");
        let response: TreeResponse = self.send_json("get_tree", self.request(Method::GET, url)).await?;
        if response.truncated {
            tracing::warn!("⚠️ 仓库树过大，返回结果被截断");
        }
        Ok(response
            .tree
            .into_iter()
            .filter_map(|entry| {
                EntryType::parse(&entry.entry_type).map(|entry_type| TreeEntry {
                    path: entry.path,
                    sha: entry.sha,
                    entry_type,
                })
            })
            .collect())
    }

    async fn get_blob(&self, sha: &str) -> AppResult<Vec<u8>> {
        let url = self.repo_url(&self.upstream, &["git", "blobs", sha])?;
        let blob: BlobResponse = self.send_json("get_blob", self.request(Method::GET, url)).await?;
        if blob.encoding != "base64" {
            return Ok(blob.content.into_bytes());
        }
        let compact: String = blob.content.chars().filter(|c| !c.is_whitespace()).collect();
        BASE64
            .decode(compact)
            .map_err(|e| RemoteApiError::classify("get_blob", None, None, format!("blob 解码失败: {}", e)).into())
    }

    async fn get_base_ref(&self, branch: &str) -> AppResult<Option<String>> {
        let url = self.repo_url(&self.upstream, &["git", "ref", "heads", branch])?;
        let found: Option<RefResponse> = self.send_optional("get_base_ref", self.request(Method::GET, url)).await?;
        Ok(found.map(|r| r.object.sha))
    }

    async fn get_ref(&self, branch: &str) -> AppResult<Option<String>> {
        let url = self.repo_url(&self.fork, &["git", "ref", "heads", branch])?;
        let found: Option<RefResponse> = self.send_optional("get_ref", self.request(Method::GET, url)).await?;
        Ok(found.map(|r| r.object.sha))
    }

    async fn create_ref(&self, branch: &str, sha: &str) -> AppResult<String> {
        let url = self.repo_url(&self.fork, &["git", "refs"])?;
        let body = json!({ "ref": format!("refs/heads/{}", branch), "sha": sha });
        let created: RefResponse = self
            .send_json("create_ref", self.request(Method::POST, url).json(&body))
            .await?;
        Ok(created.object.sha)
    }

    async fn delete_ref(&self, branch: &str) -> AppResult<()> {
        let url = self.repo_url(&self.fork, &["git", "refs", "heads", branch])?;
        self.send("delete_ref", self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn get_file_sha(&self, path: &str, branch: &str) -> AppResult<Option<String>> {
        let mut url = self.repo_url(&self.fork, &["contents", path])?;
        url.query_pairs_mut().append_pair("ref", branch);
        let found: Option<ContentResponse> = self
            .send_optional("get_file", self.request(Method::GET, url))
            .await?;
        Ok(found.map(|c| c.sha))
    }

    async fn create_or_update_file(&self, change: FileChange) -> AppResult<String> {
        let url = self.repo_url(&self.fork, &["contents", &change.path])?;
        let mut body = json!({
            "message": change.message,
            "content": BASE64.encode(change.content.as_bytes()),
            "branch": change.branch,
        });
        if let Some(sha) = change.sha {
            body["sha"] = json!(sha);
        }
        let response: CommitResponse = self
            .send_json("create_or_update_file", self.request(Method::PUT, url).json(&body))
            .await?;
        Ok(response.commit.sha)
    }

    async fn list_open_prs(&self, branch: &str) -> AppResult<Vec<PullRequestRecord>> {
        let mut url = self.repo_url(&self.upstream, &["pulls"])?;
        url.query_pairs_mut()
            .append_pair("state", "open")
            .append_pair("head", &self.head_label(branch));
        let prs: Vec<RawPullRequest> = self.send_json("list_open_prs", self.request(Method::GET, url)).await?;
        Ok(prs.into_iter().map(PullRequestRecord::from).collect())
    }

    async fn create_pr(&self, request: NewPullRequest) -> AppResult<PullRequestRecord> {
        let url = self.repo_url(&self.upstream, &["pulls"])?;
        let body = json!({
            "title": request.title,
            "body": request.body,
            "head": self.head_label(&request.branch),
            "base": self.base_branch,
        });
        let pr: RawPullRequest = self
            .send_json("create_pr", self.request(Method::POST, url).json(&body))
            .await?;
        Ok(pr.into())
    }

    async fn update_pr(&self, number: u64, update: PullRequestUpdate) -> AppResult<PullRequestRecord> {
        let url = self.repo_url(&self.upstream, &["pulls", &number.to_string()])?;
        let mut body = json!({});
        if let Some(title) = update.title {
            body["title"] = json!(title);
        }
        if let Some(text) = update.body {
            body["body"] = json!(text);
        }
        if let Some(state) = update.state {
            let raw = if state == PrState::Open { "open" } else { "closed" };
            body["state"] = json!(raw);
        }
        let pr: RawPullRequest = self
            .send_json("update_pr", self.request(Method::PATCH, url).json(&body))
            .await?;
        Ok(pr.into())
    }

    async fn get_pr(&self, number: u64) -> AppResult<PullRequestRecord> {
        let url = self.repo_url(&self.upstream, &["pulls", &number.to_string()])?;
        let pr: RawPullRequest = self.send_json("get_pr", self.request(Method::GET, url)).await?;
        Ok(pr.into())
    }

    async fn create_issue_comment(&self, issue: u64, body: &str) -> AppResult<IssueComment> {
        let url = self.repo_url(&self.upstream, &["issues", &issue.to_string(), "comments"])?;
        let comment: RawComment = self
            .send_json(
                "create_issue_comment",
                self.request(Method::POST, url).json(&json!({ "body": body })),
            )
            .await?;
        Ok(comment.into())
    }

    async fn update_issue_comment(&self, comment_id: u64, body: &str) -> AppResult<IssueComment> {
        let url = self.repo_url(&self.upstream, &["issues", "comments", &comment_id.to_string()])?;
        let comment: RawComment = self
            .send_json(
                "update_issue_comment",
                self.request(Method::PATCH, url).json(&json!({ "body": body })),
            )
            .await?;
        Ok(comment.into())
    }

    async fn list_issue_comments(&self, issue: u64) -> AppResult<Vec<IssueComment>> {
        let mut url = self.repo_url(&self.upstream, &["issues", &issue.to_string(), "comments"])?;
        url.query_pairs_mut().append_pair("per_page", "100");
        let comments: Vec<RawComment> = self
            .send_json("list_issue_comments", self.request(Method::GET, url))
            .await?;
        Ok(comments.into_iter().map(IssueComment::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GithubClient {
        let config = Config {
            upstream_owner: "acme".into(),
            upstream_repo: "docs".into(),
            fork_owner: "bot".into(),
            ..Default::default()
        };
        GithubClient::new(&config).unwrap()
    }

    #[test]
    fn test_repo_url_encodes_segments() {
        let client = client();
        let url = client
            .repo_url(&client.fork, &["contents", "docs/getting started.md"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/bot/docs/contents/docs/getting%20started.md"
        );
        assert_eq!(client.head_label("translate/a"), "bot:translate/a");
    }

    #[test]
    fn test_pull_request_conversion() {
        let raw: RawPullRequest = serde_json::from_value(json!({
            "number": 7,
            "state": "closed",
            "merged": false,
            "merged_at": "2024-01-01T00:00:00Z",
            "mergeable_state": "dirty",
            "html_url": "https://example.test/pr/7",
            "head": { "ref": "translate/docs-a" }
        }))
        .unwrap();
        let record = PullRequestRecord::from(raw);
        assert_eq!(record.state, PrState::Merged);
        assert_eq!(record.mergeable_state, MergeableState::Dirty);
        assert_eq!(record.head_branch, "translate/docs-a");
    }

    /// 需要真实的 token 和仓库：cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_get_tree_live() {
        let _ = tracing_subscriber::fmt::try_init();
        let config = Config::from_env();
        let client = GithubClient::new(&config).unwrap();
        let tree = client.get_tree(&config.base_branch).await.unwrap();
        println!("共 {} 个条目", tree.len());
        assert!(!tree.is_empty());
    }
}
