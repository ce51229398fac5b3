//! 翻译服务 - 业务能力层
//!
//! 只负责"把一段 Markdown 翻译成目标语言"，不关心分支和 PR。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clients::LanguageModelCompletion;
use crate::error::{AppError, AppResult};
use crate::infrastructure::{RateLimiter, COMPLETION_SERVICE};
use crate::services::markdown::{MarkdownGuard, Protected};

/// 翻译服务
///
/// 职责：
/// - 保护 front matter 与代码块
/// - 通过限流器调用补全服务，被限流时退避重试
/// - 校验并还原占位符
pub struct Translator {
    completion: Arc<dyn LanguageModelCompletion>,
    limiter: Arc<RateLimiter>,
    guard: MarkdownGuard,
    target_language: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Translator {
    pub fn new(
        completion: Arc<dyn LanguageModelCompletion>,
        limiter: Arc<RateLimiter>,
        target_language: impl Into<String>,
        max_retries: u32,
    ) -> AppResult<Self> {
        let target_language = target_language.into();
        if whatlang::Lang::from_code(&target_language).is_none() {
            return Err(AppError::Validation(format!("不支持的语言代码: {}", target_language)));
        }
        Ok(Self {
            completion,
            limiter,
            guard: MarkdownGuard::new()?,
            target_language,
            max_retries,
            retry_backoff: Duration::from_secs(2),
        })
    }

    /// 修改退避基数（测试中缩短等待）
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn target_language(&self) -> &str {
        &self.target_language
    }

    /// 去掉代码块和 front matter 后的正文
    pub fn prose(&self, content: &str) -> String {
        self.guard.protect(content).prose(&self.guard)
    }

    fn instructions(&self) -> String {
        let language = whatlang::Lang::from_code(&self.target_language)
            .map(|lang| lang.eng_name().to_string())
            .unwrap_or_else(|| self.target_language.clone());
        format!(
            "You are a professional technical translator. Translate the Markdown document \
             provided by the user into {language}. Preserve the Markdown structure, links, \
             inline code and HTML tags. Every placeholder of the form <!-- keep:N --> must \
             appear in the output exactly once and unchanged. Reply with the translated \
             document only."
        )
    }

    /// 翻译一篇文档
    pub async fn translate(&self, content: &str) -> AppResult<String> {
        let protected = self.guard.protect(content);
        if protected.prose(&self.guard).trim().is_empty() {
            debug!("没有可翻译的正文，原样返回");
            return Ok(content.to_string());
        }

        let translated = self.complete_with_retry(&protected).await?;
        self.guard.restore(&translated, &protected)
    }

    /// 每一次尝试都重新经过限流器调度
    async fn complete_with_retry(&self, protected: &Protected) -> AppResult<String> {
        let instructions = self.instructions();
        let mut attempt = 0u32;
        loop {
            let result = self
                .limiter
                .schedule(COMPLETION_SERVICE, || {
                    self.completion.complete(&instructions, &protected.text)
                })
                .await;

            match result {
                Err(AppError::CompletionApi(e)) if e.is_rate_limited() && attempt < self.max_retries => {
                    attempt += 1;
                    let wait = self.retry_backoff * attempt;
                    warn!("⚠️ 补全服务限流，{:?} 后第 {} 次重试: {}", wait, attempt, e.message);
                    tokio::time::sleep(wait).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::MockCompletion;
    use crate::infrastructure::RateLimiterConfig;

    fn limiter() -> Arc<RateLimiter> {
        let limiter = Arc::new(RateLimiter::new());
        limiter
            .register(COMPLETION_SERVICE, RateLimiterConfig::default())
            .unwrap();
        limiter
    }

    #[tokio::test]
    async fn test_code_blocks_survive_translation() {
        let completion = Arc::new(MockCompletion::new());
        let translator = Translator::new(completion.clone(), limiter(), "rus", 0).unwrap();
        let doc = "Intro text\n\n```rust\nfn main() {}\n```\n";
        let translated = translator.translate(doc).await.unwrap();
        assert!(translated.starts_with("[译] Intro text"));
        assert!(translated.contains("```rust\nfn main() {}\n```"));
        assert_eq!(completion.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_attempts_are_rescheduled() {
        let completion = Arc::new(MockCompletion::new().rate_limit_first(2));
        let limiter = limiter();
        let translator = Translator::new(completion.clone(), limiter.clone(), "rus", 3)
            .unwrap()
            .with_retry_backoff(Duration::from_millis(1));
        assert!(translator.translate("Some prose").await.is_ok());
        assert_eq!(completion.calls(), 3);

        let metrics = limiter.metrics(COMPLETION_SERVICE).unwrap();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.failed_requests, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let completion = Arc::new(MockCompletion::new().rate_limit_first(5));
        let translator = Translator::new(completion.clone(), limiter(), "rus", 1)
            .unwrap()
            .with_retry_backoff(Duration::from_millis(1));
        let err = translator.translate("Some prose").await.unwrap_err();
        assert_eq!(err.kind(), "completion_api.rate_limited");
        assert_eq!(completion.calls(), 2);
    }

    #[tokio::test]
    async fn test_only_code_skips_completion() {
        let completion = Arc::new(MockCompletion::new());
        let translator = Translator::new(completion.clone(), limiter(), "rus", 0).unwrap();
        let doc = "```\nls\n```\n";
        assert_eq!(translator.translate(doc).await.unwrap(), doc);
        assert_eq!(completion.calls(), 0);
    }

    #[test]
    fn test_unknown_language_rejected() {
        let completion = Arc::new(MockCompletion::new());
        let result = Translator::new(completion, Arc::new(RateLimiter::new()), "klingon", 0);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
