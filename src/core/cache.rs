use crate::config::Settings;
use crate::domain::model::Card;
use crate::utils::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the cache file inside Anki's media folder.
pub const CACHE_MEDIA_FILENAME: &str = "_typ-cards-cache.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Digest of the configuration the card was compiled with.
    pub config: String,
    /// Digest of the card's marker source.
    pub content: String,
}

/// Combines the `ankiconf.typ` digest with the render settings fingerprint.
pub fn config_digest(ankiconf_digest: &str, render_fingerprint: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ankiconf_digest.as_bytes());
    hasher.update(b"\n");
    hasher.update(render_fingerprint.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Digests of the cards pushed by earlier runs, used to skip unchanged cards.
#[derive(Debug, Clone)]
pub struct CardsCache {
    enabled: bool,
    recompile_on_config_change: bool,
    config_digest: String,
    previous: BTreeMap<String, CacheEntry>,
    current: BTreeMap<String, CacheEntry>,
    forgotten: BTreeSet<String>,
}

impl CardsCache {
    pub fn new(config_digest: impl Into<String>, settings: &Settings) -> Self {
        Self {
            enabled: !settings.no_cache,
            recompile_on_config_change: settings.recompile_on_config_change,
            config_digest: config_digest.into(),
            previous: BTreeMap::new(),
            current: BTreeMap::new(),
            forgotten: BTreeSet::new(),
        }
    }

    /// Loads the entries stored by the previous run. Unreadable contents
    /// leave the cache empty.
    pub fn with_contents(mut self, contents: Option<&str>) -> Self {
        if let Some(contents) = contents {
            match serde_json::from_str(contents) {
                Ok(previous) => self.previous = previous,
                Err(e) => tracing::warn!("⚠️ Ignoring malformed cards cache: {}", e),
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }

    /// Whether any cached card was compiled with a different configuration.
    pub fn config_changed(&self) -> bool {
        self.previous
            .values()
            .any(|entry| entry.config != self.config_digest)
    }

    pub fn needs_push(&self, card: &Card) -> bool {
        if !self.enabled {
            return true;
        }
        match self.previous.get(&card.cache_key()) {
            None => true,
            Some(entry) if entry.content != card.content_hash => true,
            Some(entry) => {
                entry.config != self.config_digest && self.recompile_on_config_change
            }
        }
    }

    /// Marks a card as up to date in Anki.
    pub fn record(&mut self, card: &Card) {
        let key = card.cache_key();
        self.forgotten.remove(&key);
        self.current.insert(
            key,
            CacheEntry {
                config: self.config_digest.clone(),
                content: card.content_hash.clone(),
            },
        );
    }

    /// Drops a card whose push failed, so the next run retries it.
    pub fn forget(&mut self, card: &Card) {
        let key = card.cache_key();
        self.current.remove(&key);
        self.forgotten.insert(key);
    }

    /// Previous entries merged with this run's, as uploaded to Anki.
    pub fn to_json(&self) -> Result<String> {
        let mut merged: BTreeMap<&str, &CacheEntry> = self
            .previous
            .iter()
            .filter(|(key, _)| !self.forgotten.contains(*key))
            .map(|(key, entry)| (key.as_str(), entry))
            .collect();
        for (key, entry) in &self.current {
            merged.insert(key, entry);
        }
        Ok(serde_json::to_string(&merged)?)
    }
}
