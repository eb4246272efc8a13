//! Inference service client.
//!
//! [`OllamaBackend`] speaks the Ollama HTTP API over a blocking client.
//! [`DecisionClient`] wraps any backend and never fails: transport errors,
//! unparseable replies and schema violations all collapse into the fail-safe
//! decision (or console apology), with the cause logged.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::decision::{
    ConsoleIntent, Decision, parse_console_intent, parse_decision, preview,
};
use crate::io::config::LlmConfig;

/// Text-generation service.
pub trait InferenceBackend {
    /// Single non-streaming completion.
    fn generate(&self, system: &str, prompt: &str) -> Result<String>;

    /// Names of the models the service can run.
    fn list_models(&self) -> Result<Vec<String>>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

/// Ollama over HTTP.
pub struct OllamaBackend {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    temperature: f64,
    num_predict: u32,
    disable_thinking: bool,
    health_timeout: Duration,
}

impl OllamaBackend {
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.health_timeout_secs))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            num_predict: cfg.num_predict,
            disable_thinking: cfg.disable_thinking,
            health_timeout: Duration::from_secs(cfg.health_timeout_secs),
        })
    }
}

impl InferenceBackend for OllamaBackend {
    #[instrument(skip_all, fields(model = %self.model))]
    fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        let prompt = if self.disable_thinking {
            format!("{prompt} /no_think")
        } else {
            prompt.to_string()
        };
        let request = GenerateRequest {
            model: &self.model,
            prompt: &prompt,
            system,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
                num_predict: self.num_predict,
            },
        };
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .with_context(|| format!("POST {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("POST {url}: HTTP {status}: {}", preview(&body, 200)));
        }
        let body: GenerateResponse = response
            .json()
            .with_context(|| format!("decode response from {url}"))?;
        debug!(bytes = body.response.len(), "generation finished");
        Ok(body.response)
    }

    fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .with_context(|| format!("GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {url}: HTTP {status}"));
        }
        let tags: TagsResponse = response
            .json()
            .with_context(|| format!("decode response from {url}"))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

/// Structured decisions on top of an [`InferenceBackend`].
pub struct DecisionClient<B: InferenceBackend> {
    backend: B,
    model: String,
    decision_system: String,
}

impl<B: InferenceBackend> DecisionClient<B> {
    pub fn new(backend: B, model: impl Into<String>, decision_system: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            decision_system: decision_system.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask for a routing decision. Any failure yields `flag_human`.
    #[instrument(skip_all)]
    pub fn decide(&self, context: &str) -> Decision {
        let raw = match self.backend.generate(&self.decision_system, context) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "decision service unavailable");
                return Decision::flag_human(
                    "Decision service unavailable; review the task manually.",
                    format!("{err:#}"),
                );
            }
        };
        match parse_decision(&raw) {
            Ok(decision) => {
                info!(action = ?decision.action, reasoning = %decision.reasoning, "decision received");
                decision
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), reply = %preview(&raw, 200), "unusable decision reply");
                Decision::flag_human(
                    "Decision service returned an unusable reply; review the task manually.",
                    format!("{err:#}"),
                )
            }
        }
    }

    /// Interpret free-text operator input. Any failure yields an apology.
    #[instrument(skip_all)]
    pub fn decide_freeform(&self, system: &str, context: &str) -> ConsoleIntent {
        let raw = match self.backend.generate(system, context) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "decision service unavailable");
                return ConsoleIntent::apology();
            }
        };
        parse_console_intent(&raw).unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), reply = %preview(&raw, 200), "unusable console reply");
            ConsoleIntent::apology()
        })
    }

    /// True if the service answers and lists the configured model (matched
    /// on the name before any `:tag`).
    pub fn health_check(&self) -> bool {
        let base = self.model.split(':').next().unwrap_or(&self.model);
        match self.backend.list_models() {
            Ok(models) => {
                let available = models.iter().any(|m| m.contains(base));
                if !available {
                    warn!(model = %self.model, ?models, "model not available");
                }
                available
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "decision service health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision::{DecisionAction, FREEFORM_APOLOGY};
    use crate::core::types::Role;
    use crate::test_support::ScriptedBackend;

    fn client(backend: ScriptedBackend) -> DecisionClient<ScriptedBackend> {
        DecisionClient::new(backend, "qwen3:8b", "system")
    }

    #[test]
    fn valid_reply_is_returned() {
        let client = client(ScriptedBackend::replies([
            "<think>hmm</think>{\"action\": \"next_task\", \"message\": \"\", \"reasoning\": \"passed\"}",
        ]));
        let decision = client.decide("context");
        assert_eq!(decision.action, DecisionAction::NextTask);
        assert_eq!(client.backend().prompts(), vec!["context".to_string()]);
    }

    #[test]
    fn fenced_invalid_json_flags_human() {
        let client = client(ScriptedBackend::replies(["```json\n{action: next_task\n```"]));
        let decision = client.decide("context");
        assert_eq!(decision.action, DecisionAction::FlagHuman);
        assert!(decision.reasoning.contains("parse decision json"));
    }

    #[test]
    fn transport_error_flags_human() {
        let client = client(ScriptedBackend::failing("connection refused"));
        let decision = client.decide("context");
        assert_eq!(decision.action, DecisionAction::FlagHuman);
        assert!(decision.reasoning.contains("connection refused"));
    }

    #[test]
    fn freeform_failure_apologises() {
        let client = client(ScriptedBackend::replies(["I think you should relax"]));
        assert_eq!(
            client.decide_freeform("sys", "input"),
            ConsoleIntent::Reply {
                text: FREEFORM_APOLOGY.to_string()
            }
        );
    }

    #[test]
    fn freeform_intent_is_parsed() {
        let client = client(ScriptedBackend::replies([
            "{\"action\": \"nudge\", \"agent\": \"refactorer\"}",
        ]));
        assert_eq!(
            client.decide_freeform("sys", "wake the refactorer"),
            ConsoleIntent::Nudge {
                agent: Role::Refactorer
            }
        );
    }

    #[test]
    fn health_check_matches_model_family() {
        let ok = client(ScriptedBackend::replies(Vec::<String>::new()).with_models(["qwen3:14b"]));
        assert!(ok.health_check());
        let missing = client(ScriptedBackend::replies(Vec::<String>::new()).with_models(["llama3:8b"]));
        assert!(!missing.health_check());
        assert!(!client(ScriptedBackend::failing("down")).health_check());
    }
}
