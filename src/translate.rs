use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::TranslationConfig;
use crate::db::{Database, OwnerScope};

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("Translation API not configured")]
    Unconfigured,
    #[error("Article not found")]
    NotFound,
    #[error("Translation failed: {0}")]
    Upstream(String),
    #[error("Translation failed: empty response")]
    EmptyResponse,
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Text in, text out, or failure.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> Result<String, TranslateError>;
}

/// Stand-in used when no API key is available.
pub struct UnconfiguredTranslator;

#[async_trait]
impl Translator for UnconfiguredTranslator {
    async fn translate(&self, _text: &str) -> Result<String, TranslateError> {
        Err(TranslateError::Unconfigured)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}

/// Chat-completions endpoint with a bearer key.
pub struct ChatCompletionTranslator {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    system_prompt: String,
}

impl ChatCompletionTranslator {
    pub fn new(config: &TranslationConfig, api_key: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.base_url.clone(),
            api_key,
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
        })
    }
}

#[async_trait]
impl Translator for ChatCompletionTranslator {
    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TranslateError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TranslateError::Upstream(format!(
                "HTTP error: status {}",
                response.status().as_u16()
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::Upstream(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(TranslateError::EmptyResponse)
    }
}

/// Build the translator the environment allows.
pub fn translator_from_config(
    config: &TranslationConfig,
    api_key: Option<String>,
) -> anyhow::Result<Arc<dyn Translator>> {
    match api_key.filter(|key| !key.trim().is_empty()) {
        Some(key) => Ok(Arc::new(ChatCompletionTranslator::new(config, key)?)),
        None => {
            warn!("No translation API key set; translation is disabled");
            Ok(Arc::new(UnconfiguredTranslator))
        }
    }
}

/// Cached, per-article translation.
pub struct TranslationService {
    db: Arc<Database>,
    translator: Arc<dyn Translator>,
}

impl TranslationService {
    pub fn new(db: Arc<Database>, translator: Arc<dyn Translator>) -> Self {
        Self { db, translator }
    }

    /// Returns the stored translation if there is one; otherwise translates
    /// the raw body and stores the result. Nothing is stored on failure.
    /// When another request stored a translation first, that one is returned.
    pub async fn translate_entry(
        &self,
        scope: &OwnerScope,
        entry_id: i64,
    ) -> Result<String, TranslateError> {
        let entry = self
            .db
            .get_entry(scope, entry_id)
            .await?
            .ok_or(TranslateError::NotFound)?;

        if let Some(cached) = entry.content_translated {
            return Ok(cached);
        }

        let translated = self.translator.translate(&entry.content_raw).await?;
        self.db.set_translation(entry.id, &translated).await?;
        info!(owner = %scope, entry_id, "Stored translation");

        let stored = self
            .db
            .get_entry(scope, entry.id)
            .await?
            .and_then(|e| e.content_translated);
        Ok(stored.unwrap_or(translated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EntryFilter, SourceSpec};
    use crate::parser::NormalizedEntry;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Uppercases its input and counts calls.
    pub struct CountingTranslator {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait]
    impl Translator for CountingTranslator {
        async fn translate(&self, text: &str) -> Result<String, TranslateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TranslateError::Upstream("stub failure".to_string()));
            }
            Ok(text.to_uppercase())
        }
    }

    async fn setup(fail: bool) -> (TranslationService, Arc<CountingTranslator>, OwnerScope, i64) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);
        let scope = OwnerScope::user("alice");

        let source = db
            .upsert_source(&scope, &SourceSpec::new("A", "https://a.example.com/rss"))
            .await
            .unwrap();
        let entry = NormalizedEntry {
            canonical_url: "https://a.example.com/1".to_string(),
            title: "One".to_string(),
            body: "hello world".to_string(),
            published_at: Utc::now(),
        };
        db.insert_entry_if_absent(&scope, source.id, &entry).await.unwrap();
        let entry_id = db.list_entries(&scope, EntryFilter::All, 1, 0).await.unwrap()[0].id;

        let translator = Arc::new(CountingTranslator {
            calls: AtomicUsize::new(0),
            fail,
        });
        let service = TranslationService::new(db, translator.clone());
        (service, translator, scope, entry_id)
    }

    #[tokio::test]
    async fn test_second_call_uses_cache() {
        let (service, translator, scope, entry_id) = setup(false).await;

        let first = service.translate_entry(&scope, entry_id).await.unwrap();
        let second = service.translate_entry(&scope, entry_id).await.unwrap();

        assert_eq!(first, "HELLO WORLD");
        assert_eq!(first, second);
        assert_eq!(translator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_owner_gets_not_found() {
        let (service, translator, _scope, entry_id) = setup(false).await;

        let result = service
            .translate_entry(&OwnerScope::user("mallory"), entry_id)
            .await;

        assert!(matches!(result, Err(TranslateError::NotFound)));
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_leaves_translation_unset() {
        let (service, translator, scope, entry_id) = setup(true).await;

        assert!(service.translate_entry(&scope, entry_id).await.is_err());
        assert!(service.translate_entry(&scope, entry_id).await.is_err());

        assert_eq!(translator.calls.load(Ordering::SeqCst), 2);
    }

    /// Stores a competing translation before answering, as a concurrent
    /// request finishing first would.
    struct RacedTranslator {
        db: Arc<Database>,
        entry_id: i64,
    }

    #[async_trait]
    impl Translator for RacedTranslator {
        async fn translate(&self, _text: &str) -> Result<String, TranslateError> {
            self.db.set_translation(self.entry_id, "stored first").await?;
            Ok("stored second".to_string())
        }
    }

    #[tokio::test]
    async fn test_losing_a_race_returns_stored_translation() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);
        let scope = OwnerScope::user("alice");
        let source = db
            .upsert_source(&scope, &SourceSpec::new("A", "https://a.example.com/rss"))
            .await
            .unwrap();
        let entry = NormalizedEntry {
            canonical_url: "https://a.example.com/1".to_string(),
            title: "One".to_string(),
            body: "hello".to_string(),
            published_at: Utc::now(),
        };
        db.insert_entry_if_absent(&scope, source.id, &entry).await.unwrap();
        let entry_id = db.list_entries(&scope, EntryFilter::All, 1, 0).await.unwrap()[0].id;

        let service = TranslationService::new(
            db.clone(),
            Arc::new(RacedTranslator {
                db: db.clone(),
                entry_id,
            }),
        );

        assert_eq!(
            service.translate_entry(&scope, entry_id).await.unwrap(),
            "stored first"
        );
    }

    #[tokio::test]
    async fn test_shared_article_translates_for_any_user() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);
        let source = db
            .upsert_source(&OwnerScope::Shared, &SourceSpec::new("S", "https://s.example.com/rss"))
            .await
            .unwrap();
        let entry = NormalizedEntry {
            canonical_url: "https://s.example.com/1".to_string(),
            title: "Shared".to_string(),
            body: "shared body".to_string(),
            published_at: Utc::now(),
        };
        db.insert_entry_if_absent(&OwnerScope::Shared, source.id, &entry)
            .await
            .unwrap();
        let entry_id = db
            .list_entries(&OwnerScope::Shared, EntryFilter::All, 1, 0)
            .await
            .unwrap()[0]
            .id;
        let translator = Arc::new(CountingTranslator {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let service = TranslationService::new(db, translator.clone());

        let alice = service
            .translate_entry(&OwnerScope::user("alice"), entry_id)
            .await
            .unwrap();
        let bob = service
            .translate_entry(&OwnerScope::user("bob"), entry_id)
            .await
            .unwrap();

        assert_eq!(alice, "SHARED BODY");
        assert_eq!(alice, bob);
        assert_eq!(translator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_translator() {
        let translator = translator_from_config(&TranslationConfig::default(), None).unwrap();
        let result = translator.translate("text").await;
        assert!(matches!(result, Err(TranslateError::Unconfigured)));
    }

    #[tokio::test]
    async fn test_chat_completion_translator() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "你好" } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = TranslationConfig {
            base_url: format!("{}/v1/chat", server.uri()),
            ..TranslationConfig::default()
        };
        let translator = ChatCompletionTranslator::new(&config, "secret".to_string()).unwrap();

        assert_eq!(translator.translate("hello").await.unwrap(), "你好");
    }

    #[tokio::test]
    async fn test_chat_completion_without_choices() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "base_resp": { "status_code": 1004 } })),
            )
            .mount(&server)
            .await;

        let config = TranslationConfig {
            base_url: server.uri(),
            ..TranslationConfig::default()
        };
        let translator = ChatCompletionTranslator::new(&config, "secret".to_string()).unwrap();

        assert!(matches!(
            translator.translate("hello").await,
            Err(TranslateError::EmptyResponse)
        ));
    }
}
