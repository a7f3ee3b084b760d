use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::LlmError;
use crate::provider::{
    ChatMessage, ChatProvider, GenerationOptions, GenerationProvider, LlmResponse, ProviderStats,
    TextDeltaStream,
};

/// Outcome of actively probing one provider with a minimal completion.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub model: String,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Ordered chain of chat providers. Requests walk the chain until one
/// succeeds; only when every provider has failed does the caller see an
/// error, carrying the last failure for diagnosis.
pub struct LlmGateway {
    providers: Vec<Arc<dyn GenerationProvider>>,
}

impl LlmGateway {
    /// Build the chain for one tenant. Tenant overrides resolve first, then
    /// providers that cannot start (no credentials) are skipped with a log
    /// line rather than failing construction.
    pub fn for_tenant(settings: &Settings, tenant_id: Option<&str>) -> Self {
        let effective = match tenant_id {
            Some(tenant) => settings.llm_for_tenant(tenant),
            None => settings.llm.clone(),
        };
        let mut providers: Vec<Arc<dyn GenerationProvider>> = Vec::new();
        match ChatProvider::new(effective) {
            Ok(provider) => providers.push(Arc::new(provider)),
            Err(error) => warn!(error = %error, "skipping unconfigured chat provider"),
        }
        Self { providers }
    }

    pub fn from_providers(providers: Vec<Arc<dyn GenerationProvider>>) -> Self {
        Self { providers }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub async fn generate_response(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<LlmResponse, LlmError> {
        if self.providers.is_empty() {
            return Err(LlmError::AllProvidersFailed("no providers configured".to_string()));
        }
        let mut last_error: Option<LlmError> = None;
        for provider in &self.providers {
            match provider.generate(messages, options).await {
                Ok(response) => {
                    info!(
                        provider = provider.name(),
                        model = provider.model(),
                        tokens = response.usage.total_tokens,
                        "response generated"
                    );
                    return Ok(response);
                }
                Err(error) => {
                    warn!(provider = provider.name(), error = %error, "provider failed, trying next");
                    last_error = Some(error);
                }
            }
        }
        Err(LlmError::AllProvidersFailed(
            last_error.map(|error| error.to_string()).unwrap_or_default(),
        ))
    }

    /// Streaming variant. Fallback applies to stream setup only: once a
    /// provider has started yielding, mid-stream failures surface as `Err`
    /// items instead of switching providers.
    pub async fn stream_response(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<TextDeltaStream, LlmError> {
        if self.providers.is_empty() {
            return Err(LlmError::AllProvidersFailed("no providers configured".to_string()));
        }
        let mut last_error: Option<LlmError> = None;
        for provider in &self.providers {
            match provider.stream(messages, options).await {
                Ok(stream) => {
                    info!(provider = provider.name(), "stream started");
                    return Ok(stream);
                }
                Err(error) => {
                    warn!(provider = provider.name(), error = %error, "stream setup failed, trying next");
                    last_error = Some(error);
                }
            }
        }
        Err(LlmError::AllProvidersFailed(
            last_error.map(|error| error.to_string()).unwrap_or_default(),
        ))
    }

    /// Probe every provider with a minimal real completion. A cheap request
    /// is the only probe that actually proves credentials and connectivity.
    pub async fn health(&self) -> Vec<ProviderHealth> {
        let probe = [ChatMessage::user("Hello")];
        let options = GenerationOptions {
            max_tokens: Some(10),
            temperature: None,
        };
        let mut results = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let outcome = provider.generate(&probe, options).await;
            results.push(ProviderHealth {
                provider: provider.name().to_string(),
                model: provider.model().to_string(),
                healthy: outcome.is_ok(),
                error: outcome.err().map(|error| error.to_string()),
            });
        }
        results
    }

    pub async fn provider_stats(&self) -> Vec<ProviderStats> {
        let mut stats = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            stats.push(provider.stats().await);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::StreamExt;

    use crate::models::TokenUsage;

    struct ScriptedProvider {
        name: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn ok(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn model(&self) -> &str {
            "test-model"
        }

        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _options: GenerationOptions,
        ) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LlmError::Provider(format!("{} is down", self.name)));
            }
            Ok(LlmResponse {
                content: format!("answer from {}", self.name),
                provider: self.name.to_string(),
                model: "test-model".to_string(),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
                metadata: Map::new(),
            })
        }

        async fn stream(
            &self,
            _messages: &[ChatMessage],
            _options: GenerationOptions,
        ) -> Result<TextDeltaStream, LlmError> {
            if self.fail {
                return Err(LlmError::Provider(format!("{} is down", self.name)));
            }
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            let name = self.name;
            tokio::spawn(async move {
                let _ = tx.send(Ok("answer ".to_string())).await;
                let _ = tx.send(Ok(format!("from {name}"))).await;
            });
            Ok(TextDeltaStream::new(rx))
        }

        async fn stats(&self) -> ProviderStats {
            ProviderStats {
                provider: self.name.to_string(),
                model: "test-model".to_string(),
                total_keys: 1,
                available_keys: 1,
                exhausted_keys: 0,
                total_requests: self.calls.load(Ordering::SeqCst) as u64,
                total_tokens_used: 0,
                requests_per_minute: 30,
                tokens_per_minute: 6000,
            }
        }
    }

    #[tokio::test]
    async fn falls_back_to_the_next_provider() {
        let first = ScriptedProvider::failing("primary");
        let second = ScriptedProvider::ok("backup");
        let gateway = LlmGateway::from_providers(vec![first.clone(), second.clone()]);

        let response = gateway
            .generate_response(&[ChatMessage::user("hi")], GenerationOptions::default())
            .await
            .unwrap();

        assert_eq!(response.provider, "backup");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reports_last_error_when_every_provider_fails() {
        let gateway = LlmGateway::from_providers(vec![
            ScriptedProvider::failing("primary"),
            ScriptedProvider::failing("backup"),
        ]);

        let error = gateway
            .generate_response(&[ChatMessage::user("hi")], GenerationOptions::default())
            .await
            .unwrap_err();

        match error {
            LlmError::AllProvidersFailed(detail) => assert!(detail.contains("backup is down")),
            other => panic!("expected AllProvidersFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn empty_gateway_fails_without_panicking() {
        let gateway = LlmGateway::from_providers(Vec::new());
        let error = gateway
            .generate_response(&[ChatMessage::user("hi")], GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, LlmError::AllProvidersFailed(_)));
    }

    #[tokio::test]
    async fn stream_setup_falls_back_and_yields_deltas() {
        let gateway = LlmGateway::from_providers(vec![
            ScriptedProvider::failing("primary"),
            ScriptedProvider::ok("backup"),
        ]);

        let mut stream = gateway
            .stream_response(&[ChatMessage::user("hi")], GenerationOptions::default())
            .await
            .unwrap();

        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            text.push_str(&delta.unwrap());
        }
        assert_eq!(text, "answer from backup");
    }

    #[tokio::test]
    async fn health_probe_reports_per_provider() {
        let gateway = LlmGateway::from_providers(vec![
            ScriptedProvider::ok("primary"),
            ScriptedProvider::failing("backup"),
        ]);

        let health = gateway.health().await;
        assert_eq!(health.len(), 2);
        assert!(health[0].healthy);
        assert!(!health[1].healthy);
        assert!(health[1].error.as_deref().unwrap().contains("backup is down"));
    }

    #[tokio::test]
    async fn unconfigured_settings_produce_an_empty_chain() {
        let settings = Settings::default();
        let gateway = LlmGateway::for_tenant(&settings, Some("tenant-a"));
        assert_eq!(gateway.provider_count(), 0);
    }

    #[tokio::test]
    async fn configured_settings_produce_one_provider() {
        let mut settings = Settings::default();
        settings.llm.api_keys = vec!["gsk_test".into()];
        let gateway = LlmGateway::for_tenant(&settings, None);
        assert_eq!(gateway.provider_count(), 1);
        let stats = gateway.provider_stats().await;
        assert_eq!(stats[0].provider, "groq");
        assert_eq!(stats[0].total_keys, 1);
    }
}
