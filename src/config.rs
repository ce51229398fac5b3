use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::infrastructure::RateLimiterConfig;

/// 程序配置
///
/// 优先级：环境变量 > 配置文件 > 默认值
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- 托管 API ---
    pub hosting_api_base_url: String,
    pub hosting_token: String,
    /// 上游仓库（PR 目标）
    pub upstream_owner: String,
    pub upstream_repo: String,
    /// fork 仓库（分支所在）
    pub fork_owner: String,
    pub fork_repo: String,
    pub base_branch: String,
    /// 只处理该目录下的文件
    pub source_dir: String,
    pub file_extensions: Vec<String>,
    /// 翻译分支名前缀
    pub branch_prefix: String,
    // --- LLM ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    pub llm_max_tokens: u32,
    /// 补全被限流时的重试次数
    pub llm_max_retries: u32,
    // --- 翻译 ---
    /// 目标语言（ISO 639-3）
    pub target_language: String,
    /// 判定"已是目标语言"的置信度阈值
    pub confidence_threshold: f64,
    // --- 批处理 ---
    /// 同时处理的文件数量
    pub batch_concurrency: usize,
    pub database_path: String,
    /// 跳过上一次快照中已成功且源文件未变化的文件
    pub resume: bool,
    /// 汇总报告所评论的 issue
    pub tracking_issue: Option<u64>,
    pub verbose_logging: bool,
    // --- 限流 ---
    pub hosting_limits: LimitSettings,
    pub completion_limits: LimitSettings,
}

/// 单个服务的限流配置（配置文件形式）
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitSettings {
    pub max_concurrent: usize,
    pub min_interval_ms: u64,
    pub reservoir: Option<u32>,
    pub refill_amount: u32,
    pub refill_interval_ms: Option<u64>,
    pub high_water: Option<usize>,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            min_interval_ms: 0,
            reservoir: None,
            refill_amount: 0,
            refill_interval_ms: None,
            high_water: None,
        }
    }
}

impl LimitSettings {
    pub fn to_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_concurrent: self.max_concurrent,
            min_interval: Duration::from_millis(self.min_interval_ms),
            reservoir: self.reservoir,
            refill_amount: self.refill_amount,
            refill_interval: self.refill_interval_ms.map(Duration::from_millis),
            high_water: self.high_water,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosting_api_base_url: "https://api.github.com".to_string(),
            hosting_token: String::new(),
            upstream_owner: String::new(),
            upstream_repo: String::new(),
            fork_owner: String::new(),
            fork_repo: String::new(),
            base_branch: "main".to_string(),
            source_dir: "docs".to_string(),
            file_extensions: vec!["md".to_string(), "mdx".to_string()],
            branch_prefix: "translate".to_string(),
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            llm_max_tokens: 8192,
            llm_max_retries: 3,
            target_language: "rus".to_string(),
            confidence_threshold: 0.8,
            batch_concurrency: 4,
            database_path: "translations.db".to_string(),
            resume: false,
            tracking_issue: None,
            verbose_logging: false,
            // 主限额 5000 次/小时；写操作之间留出间隔以避开二级限流
            hosting_limits: LimitSettings {
                max_concurrent: 10,
                min_interval_ms: 100,
                reservoir: Some(5000),
                refill_amount: 5000,
                refill_interval_ms: Some(60 * 60 * 1000),
                high_water: None,
            },
            completion_limits: LimitSettings {
                max_concurrent: 3,
                min_interval_ms: 1000,
                reservoir: Some(60),
                refill_amount: 60,
                refill_interval_ms: Some(60 * 1000),
                high_water: None,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// 从 TOML 文件加载，未出现的字段使用默认值
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Validation(format!("无法读取配置文件 {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| AppError::Validation(format!("无法解析配置文件 {}: {}", path.display(), e)))
    }

    /// `CONFIG_FILE` 指向的文件（若存在）叠加环境变量
    pub fn load() -> AppResult<Self> {
        let base = match std::env::var("CONFIG_FILE") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        let config = base.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(self) -> Self {
        let d = self;
        Self {
            hosting_api_base_url: env_or("HOSTING_API_BASE_URL", d.hosting_api_base_url),
            hosting_token: env_or("HOSTING_TOKEN", d.hosting_token),
            upstream_owner: env_or("UPSTREAM_OWNER", d.upstream_owner),
            upstream_repo: env_or("UPSTREAM_REPO", d.upstream_repo),
            fork_owner: env_or("FORK_OWNER", d.fork_owner),
            fork_repo: env_or("FORK_REPO", d.fork_repo),
            base_branch: env_or("BASE_BRANCH", d.base_branch),
            source_dir: env_or("SOURCE_DIR", d.source_dir),
            file_extensions: std::env::var("FILE_EXTENSIONS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or(d.file_extensions),
            branch_prefix: env_or("BRANCH_PREFIX", d.branch_prefix),
            llm_api_key: env_or("LLM_API_KEY", d.llm_api_key),
            llm_api_base_url: env_or("LLM_API_BASE_URL", d.llm_api_base_url),
            llm_model_name: env_or("LLM_MODEL_NAME", d.llm_model_name),
            llm_max_tokens: env_parse_or("LLM_MAX_TOKENS", d.llm_max_tokens),
            llm_max_retries: env_parse_or("LLM_MAX_RETRIES", d.llm_max_retries),
            target_language: env_or("TARGET_LANGUAGE", d.target_language),
            confidence_threshold: env_parse_or("CONFIDENCE_THRESHOLD", d.confidence_threshold),
            batch_concurrency: env_parse_or("BATCH_CONCURRENCY", d.batch_concurrency),
            database_path: env_or("DATABASE_PATH", d.database_path),
            resume: env_parse_or("RESUME", d.resume),
            tracking_issue: std::env::var("TRACKING_ISSUE").ok().and_then(|v| v.parse().ok()).or(d.tracking_issue),
            verbose_logging: env_parse_or("VERBOSE_LOGGING", d.verbose_logging),
            hosting_limits: d.hosting_limits,
            completion_limits: d.completion_limits,
        }
    }

    /// 校验配置
    pub fn validate(&self) -> AppResult<()> {
        if self.batch_concurrency == 0 {
            return Err(AppError::Validation("batch_concurrency 必须大于 0".into()));
        }
        if self.upstream_owner.is_empty() || self.upstream_repo.is_empty() {
            return Err(AppError::Validation("未配置上游仓库 (UPSTREAM_OWNER / UPSTREAM_REPO)".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(AppError::Validation(format!(
                "confidence_threshold 超出范围 [0, 1]: {}",
                self.confidence_threshold
            )));
        }
        if whatlang::Lang::from_code(&self.target_language).is_none() {
            return Err(AppError::Validation(format!(
                "不支持的语言代码: {}",
                self.target_language
            )));
        }
        Ok(())
    }

    /// fork 的 owner，未配置时与上游相同
    pub fn fork_owner(&self) -> &str {
        if self.fork_owner.is_empty() {
            &self.upstream_owner
        } else {
            &self.fork_owner
        }
    }

    pub fn fork_repo(&self) -> &str {
        if self.fork_repo.is_empty() {
            &self.upstream_repo
        } else {
            &self.fork_repo
        }
    }

    /// 路径是否属于待翻译范围
    pub fn is_translatable(&self, path: &str) -> bool {
        let prefix = self.source_dir.trim_matches('/');
        let in_dir = prefix.is_empty() || path.starts_with(&format!("{}/", prefix));
        let extension = Path::new(path).extension().and_then(|e| e.to_str());
        in_dir
            && extension
                .map(|ext| self.file_extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
                .unwrap_or(false)
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            upstream_owner: "acme".into(),
            upstream_repo: "docs".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_rejects_unknown_language() {
        let config = Config {
            target_language: "xx-not-a-language".into(),
            ..valid_config()
        };
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = Config {
            batch_concurrency: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_translatable() {
        let config = valid_config();
        assert!(config.is_translatable("docs/guide/intro.md"));
        assert!(config.is_translatable("docs/a.MDX"));
        assert!(!config.is_translatable("docs/image.png"));
        assert!(!config.is_translatable("src/readme.md"));
        assert!(!config.is_translatable("docsearch.md"));
    }

    #[test]
    fn test_toml_partial_config() {
        let config: Config = toml::from_str(
            r#"
            upstream_owner = "acme"
            upstream_repo = "handbook"
            batch_concurrency = 2

            [completion_limits]
            max_concurrent = 1
            min_interval_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.upstream_repo, "handbook");
        assert_eq!(config.batch_concurrency, 2);
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.completion_limits.min_interval_ms, 500);
        assert_eq!(config.completion_limits.reservoir, None);
        assert_eq!(config.fork_owner(), "acme");
        assert_eq!(
            config.completion_limits.to_limiter_config().min_interval,
            Duration::from_millis(500)
        );
    }
}
