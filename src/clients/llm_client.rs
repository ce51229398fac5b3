//! LLM 补全客户端
//!
//! 使用 `async-openai`，兼容任何 OpenAI 风格的端点。

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clients::LanguageModelCompletion;
use crate::config::Config;
use crate::error::{AppResult, CompletionApiError};

const OPERATION: &str = "complete";

/// OpenAI 兼容的补全服务
pub struct OpenAiCompletion {
    client: Client<OpenAIConfig>,
    model_name: String,
    max_tokens: u32,
}

impl OpenAiCompletion {
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
            max_tokens: config.llm_max_tokens,
        }
    }
}

fn completion_error(message: impl std::fmt::Display) -> CompletionApiError {
    CompletionApiError::classify(OPERATION, None, message.to_string())
}

#[async_trait]
impl LanguageModelCompletion for OpenAiCompletion {
    async fn complete(&self, instructions: &str, content: &str) -> AppResult<String> {
        debug!("调用 LLM API，模型: {}，内容长度: {} 字符", self.model_name, content.len());

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(instructions)
            .build()
            .map_err(completion_error)?;
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map_err(completion_error)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(0.3)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(completion_error)?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            completion_error(e)
        })?;

        let text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| completion_error("LLM 返回内容为空"))?;

        debug!("LLM API 调用成功，返回 {} 字符", text.len());
        Ok(text)
    }
}
