//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM.
//!
//! El pipeline sólo conoce el trait [`TextGenerator`]: recibe un prompt de
//! sistema y un payload y devuelve texto. Cualquier implementación que cumpla
//! ese contrato (servicio remoto, modelo local, mock en tests) sirve.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::completion::Prompt;

use crate::config::{AppConfig, LlmProvider};

/// Capacidad de generación de texto. Las respuestas pueden variar entre
/// llamadas idénticas; el pipeline sólo exige texto no vacío y bien formado.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<String>;

    /// Nombre del modelo, para trazas y el registro de grafos.
    fn model_name(&self) -> &str;

    /// Comprueba que el modelo responde. Por defecto, una generación mínima.
    async fn health(&self) -> Result<()> {
        self.generate(HEALTH_PROMPT, "ping").await.map(|_| ())
    }
}

const HEALTH_PROMPT: &str = "Responde únicamente con la palabra: ok";

/// Gestor de LLMs.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub chat_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        if cfg.llm_chat_model.trim().is_empty() {
            return Err(anyhow!("LLM_CHAT_MODEL no puede estar vacío"));
        }
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        })
    }

    async fn generate_with_openai(&self, system_prompt: &str, prompt: &str) -> Result<String> {
        use rig::client::{CompletionClient as _, ProviderClient as _};
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let agent = client
            .agent(&self.chat_model)
            .preamble(system_prompt)
            .temperature(0.0)
            .build();

        let answer = agent.prompt(prompt).await?;
        Ok(answer)
    }

    async fn generate_with_ollama(&self, system_prompt: &str, prompt: &str) -> Result<String> {
        use rig::client::{CompletionClient as _, ProviderClient as _};
        use rig::providers::ollama;

        let client = ollama::Client::from_env();
        let agent = client
            .agent(&self.chat_model)
            .preamble(system_prompt)
            .temperature(0.0)
            .build();

        let answer = agent.prompt(prompt).await?;
        Ok(answer)
    }
}

#[async_trait]
impl TextGenerator for LlmManager {
    async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<String> {
        let response = match self.provider {
            LlmProvider::OpenAI => self.generate_with_openai(system_prompt, prompt).await?,
            LlmProvider::Ollama => self.generate_with_ollama(system_prompt, prompt).await?,
        };
        if response.trim().is_empty() {
            return Err(anyhow!("El LLM devolvió una respuesta vacía"));
        }
        Ok(response)
    }

    fn model_name(&self) -> &str {
        &self.chat_model
    }

    async fn health(&self) -> Result<()> {
        self.generate(HEALTH_PROMPT, "ping")
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("{} ({}) no responde: {e}", self.provider.as_str(), self.chat_model))
    }
}

/// Limpia la respuesta del LLM para quedarse sólo con el JSON
/// (los modelos suelen envolverlo en bloques ```json ... ```).
pub fn strip_code_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
