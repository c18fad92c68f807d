use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs, ResponseFormat,
        ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use tracing::debug;

use crate::{
    backends::{CompletionBackend, EmbeddingBackend},
    error::AppError,
};

fn build_client(api_key: &str, base_url: &str) -> Client<OpenAIConfig> {
    Client::with_config(
        OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url),
    )
}

/// Embeddings via an OpenAI-compatible HTTP API.
pub struct OpenAiEmbeddingBackend {
    id: String,
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: u32,
}

impl OpenAiEmbeddingBackend {
    pub fn new(id: &str, api_key: &str, base_url: &str, model: &str, dimensions: u32) -> Self {
        Self {
            id: id.to_string(),
            client: build_client(api_key, base_url),
            model: model.to_string(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbeddingBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.dimensions as usize
    }

    async fn ensure_available(&self) -> Result<(), AppError> {
        // A models listing is the cheapest authenticated round-trip.
        self.client
            .models()
            .list()
            .await
            .map(|_| ())
            .map_err(|err| AppError::Transient(format!("embedding backend probe failed: {err}")))
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .dimensions(self.dimensions)
            .input(inputs.to_vec())
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        if response.data.len() != inputs.len() {
            return Err(AppError::LLMParsing(format!(
                "embedding response returned {} vectors for {} inputs",
                response.data.len(),
                inputs.len()
            )));
        }

        // The API reports an index per vector; honor it rather than assuming
        // response order.
        let mut vectors = vec![Vec::new(); inputs.len()];
        for item in response.data {
            let index = item.index as usize;
            let Some(slot) = vectors.get_mut(index) else {
                return Err(AppError::LLMParsing(format!(
                    "embedding response index {index} out of range"
                )));
            };
            *slot = item.embedding;
        }

        debug!(
            backend = %self.id,
            inputs = inputs.len(),
            dimension = self.dimensions,
            "embeddings generated"
        );

        Ok(vectors)
    }
}

/// Schema-constrained JSON completions via an OpenAI-compatible HTTP API.
pub struct OpenAiCompletionBackend {
    id: String,
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiCompletionBackend {
    pub fn new(id: &str, api_key: &str, base_url: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            client: build_client(api_key, base_url),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompletionBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ensure_available(&self) -> Result<(), AppError> {
        self.client
            .models()
            .list()
            .await
            .map(|_| ())
            .map_err(|err| AppError::Transient(format!("completion backend probe failed: {err}")))
    }

    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: serde_json::Value,
        temperature: f32,
    ) -> Result<serde_json::Value, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: schema_name.to_string(),
                schema: Some(schema),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(temperature)
            .messages([
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(user).into(),
            ])
            .response_format(response_format)
            .build()?;

        let response = self.client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or(AppError::LLMParsing(
                "No content found in LLM response".into(),
            ))?;

        let value: serde_json::Value = serde_json::from_str(content).map_err(|e| {
            AppError::LLMParsing(format!("completion was not valid JSON: {e}"))
        })?;

        if !value.is_object() {
            return Err(AppError::LLMParsing(
                "completion JSON was not an object".into(),
            ));
        }

        Ok(value)
    }
}
