use crate::config::Settings;
use crate::core::cache::CACHE_MEDIA_FILENAME;
use crate::domain::model::{Card, MediaFile, RenderedCard, SyncOutcome};
use crate::domain::ports::CardStore;
use crate::utils::error::{Result, Typ2AnkiError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::OnceCell;
use url::Url;

const API_VERSION: u8 = 6;

/// Note types with two fields, by locale.
const BASIC_MODEL_NAMES: [&str; 3] = ["Basic", "Basique", "Grundlegend"];

#[derive(Debug, Serialize)]
struct AnkiRequest<'a> {
    action: &'a str,
    version: u8,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct AnkiResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicModel {
    pub name: String,
    pub front_field: String,
    pub back_field: String,
}

/// Escapes the characters Anki's search syntax treats specially.
pub fn tag_query(tag: &str) -> String {
    let mut query = String::from("tag:");
    for c in tag.chars() {
        if matches!(c, '\\' | '*' | '_' | '"') {
            query.push('\\');
        }
        query.push(c);
    }
    query
}

fn image_field(media: &MediaFile) -> String {
    format!("<img src=\"{}\">", media.filename)
}

/// Client for the AnkiConnect add-on's HTTP API.
pub struct AnkiConnectClient {
    client: Client,
    endpoint: Url,
    max_attempts: u32,
    retry_delay: Duration,
    basic_model: OnceCell<BasicModel>,
}

impl AnkiConnectClient {
    pub fn new(
        endpoint: &str,
        max_attempts: u32,
        retry_delay: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| Typ2AnkiError::InvalidConfigValueError {
            field: "anki_url".to_string(),
            value: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            max_attempts: max_attempts.max(1),
            retry_delay,
            basic_model: OnceCell::new(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            &settings.anki_url,
            settings.max_attempts,
            settings.retry_delay(),
            settings.request_timeout(),
        )
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn send_once(&self, action: &str, params: &Value) -> Result<Value> {
        let request = AnkiRequest {
            action,
            version: API_VERSION,
            params,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Typ2AnkiError::HttpStatusError {
                action: action.to_string(),
                status: status.as_u16(),
            });
        }

        let body: AnkiResponse = response.json().await?;
        match body.error {
            Value::Null => Ok(body.result),
            Value::String(message) => Err(Typ2AnkiError::AnkiError {
                action: action.to_string(),
                message,
            }),
            other => Err(Typ2AnkiError::AnkiError {
                action: action.to_string(),
                message: other.to_string(),
            }),
        }
    }

    /// Sends one action, retrying transport failures and server errors.
    pub async fn invoke(&self, action: &str, params: Value) -> Result<Value> {
        let mut attempt = 1;
        loop {
            match self.send_once(action, &params).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    tracing::debug!(
                        "AnkiConnect {} failed (attempt {}/{}): {}",
                        action,
                        attempt,
                        self.max_attempts,
                        e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn invoke_as<T: DeserializeOwned>(&self, action: &str, params: Value) -> Result<T> {
        let result = self.invoke(action, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn basic_model(&self) -> Result<&BasicModel> {
        self.basic_model
            .get_or_try_init(|| async move {
                let models: Vec<String> = self.invoke_as("modelNames", json!({})).await?;
                let name = BASIC_MODEL_NAMES
                    .iter()
                    .find(|candidate| models.iter().any(|m| m.as_str() == **candidate))
                    .ok_or_else(|| Typ2AnkiError::AnkiError {
                        action: "modelNames".to_string(),
                        message: format!(
                            "no basic note type found (looked for {})",
                            BASIC_MODEL_NAMES.join(", ")
                        ),
                    })?
                    .to_string();

                let fields: Vec<String> = self
                    .invoke_as("modelFieldNames", json!({ "modelName": name }))
                    .await?;
                match <[String; 2]>::try_from(fields) {
                    Ok([front_field, back_field]) => {
                        tracing::debug!("Using note type {} ({} / {})", name, front_field, back_field);
                        Ok(BasicModel {
                            name,
                            front_field,
                            back_field,
                        })
                    }
                    Err(fields) => Err(Typ2AnkiError::AnkiError {
                        action: "modelFieldNames".to_string(),
                        message: format!(
                            "note type {} should have 2 fields, found {}",
                            name,
                            fields.len()
                        ),
                    }),
                }
            })
            .await
    }

    pub async fn store_media(&self, filename: &str, data: &[u8]) -> Result<()> {
        self.invoke(
            "storeMediaFile",
            json!({ "filename": filename, "data": STANDARD.encode(data) }),
        )
        .await?;
        Ok(())
    }

    pub async fn find_notes(&self, tag: &str) -> Result<Vec<i64>> {
        self.invoke_as("findNotes", json!({ "query": tag_query(tag) }))
            .await
    }
}

#[async_trait]
impl CardStore for AnkiConnectClient {
    async fn ping(&self) -> Result<u64> {
        let version: u64 = self.invoke_as("version", json!({})).await?;
        tracing::debug!("AnkiConnect API version {} at {}", version, self.endpoint);
        Ok(version)
    }

    async fn deck_names(&self) -> Result<Vec<String>> {
        self.invoke_as("deckNames", json!({})).await
    }

    async fn ensure_deck(&self, deck: &str) -> Result<()> {
        self.invoke("createDeck", json!({ "deck": deck })).await?;
        Ok(())
    }

    async fn upsert_card(
        &self,
        card: &Card,
        deck: &str,
        rendered: &RenderedCard,
    ) -> Result<SyncOutcome> {
        let model = self.basic_model().await?;

        for media in [&rendered.front, &rendered.back] {
            self.store_media(&media.filename, &media.data).await?;
        }

        let mut fields = Map::new();
        fields.insert(model.front_field.clone(), json!(image_field(&rendered.front)));
        fields.insert(model.back_field.clone(), json!(image_field(&rendered.back)));

        let tag = card.tag();
        let existing = self.find_notes(&tag).await?;

        if let Some(note_id) = existing.first() {
            if existing.len() > 1 {
                tracing::warn!(
                    "⚠️ {} notes carry tag {}, updating note {}",
                    existing.len(),
                    tag,
                    note_id
                );
            }
            self.invoke(
                "updateNoteFields",
                json!({ "note": { "id": note_id, "fields": fields } }),
            )
            .await?;
            Ok(SyncOutcome::Updated)
        } else {
            self.invoke(
                "addNote",
                json!({
                    "note": {
                        "deckName": deck,
                        "modelName": model.name,
                        "fields": fields,
                        "tags": [tag],
                    }
                }),
            )
            .await?;
            Ok(SyncOutcome::Created)
        }
    }

    async fn load_cache(&self) -> Result<Option<String>> {
        let result = self
            .invoke("retrieveMediaFile", json!({ "filename": CACHE_MEDIA_FILENAME }))
            .await?;
        let Some(encoded) = result.as_str() else {
            return Ok(None);
        };

        match STANDARD
            .decode(encoded)
            .map_err(|e| e.to_string())
            .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()))
        {
            Ok(contents) => Ok(Some(contents)),
            Err(e) => {
                tracing::warn!("⚠️ Ignoring unreadable cards cache: {}", e);
                Ok(None)
            }
        }
    }

    async fn save_cache(&self, contents: &str) -> Result<()> {
        self.store_media(CACHE_MEDIA_FILENAME, contents.as_bytes())
            .await
    }
}
