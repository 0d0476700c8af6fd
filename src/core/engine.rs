use crate::config::Settings;
use crate::core::cache::{config_digest, CardsCache};
use crate::core::project::Project;
use crate::core::scanner::CardScanner;
use crate::domain::model::{Card, RunSummary, Stage};
use crate::domain::ports::{CardRenderer, CardStore};
use crate::utils::error::{Result, Typ2AnkiError};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct AbortState {
    requests: AtomicUsize,
    notify: Notify,
}

/// Shared stop request. The first `abort` lets the current card finish,
/// the second one stops the run at once.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AbortState>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.requests.fetch_add(1, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.0.requests.load(Ordering::SeqCst) >= 1
    }

    pub fn is_forced(&self) -> bool {
        self.0.requests.load(Ordering::SeqCst) >= 2
    }

    /// Resolves once a second stop request arrives.
    pub async fn forced(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_forced() {
                return;
            }
            notified.await;
        }
    }
}

/// Full name of the deck a card goes to: an existing deck with the same
/// name, or whose last `::` component is that name, wins.
pub fn resolve_deck(existing: &[String], deck: &str) -> String {
    let suffix = format!("::{}", deck);
    existing
        .iter()
        .find(|name| name.as_str() == deck)
        .or_else(|| existing.iter().find(|name| name.ends_with(&suffix)))
        .cloned()
        .unwrap_or_else(|| deck.to_string())
}

fn failure_message(error: &Typ2AnkiError) -> String {
    match error {
        Typ2AnkiError::CompileError { message, .. } => message.clone(),
        Typ2AnkiError::ApiError(_) => error.user_friendly_message(),
        other => other.to_string(),
    }
}

/// Runs one scan, compile and sync pass over a project.
pub struct SyncEngine<R: CardRenderer, S: CardStore> {
    renderer: R,
    store: S,
    settings: Settings,
    abort: AbortHandle,
}

impl<R: CardRenderer, S: CardStore> SyncEngine<R, S> {
    pub fn new(renderer: R, store: S, settings: Settings) -> Self {
        Self {
            renderer,
            store,
            settings,
            abort: AbortHandle::default(),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub async fn run(&self, project: &Project) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        project.ensure_ankiconf(self.settings.dry_run)?;

        let report = CardScanner::new(project.root(), &self.settings).scan();
        for warning in &report.warnings {
            tracing::warn!("⚠️ {}", warning);
            summary.record_warning(warning.to_string());
        }
        for card in &report.empty {
            tracing::debug!("Skipping empty card {}", card.label());
            summary.record_skipped(&card.file);
        }
        for card in &report.duplicates {
            summary.record_skipped(&card.file);
        }
        tracing::info!(
            "🔍 Found {} cards in {}",
            report.cards.len(),
            project.requested().display()
        );

        if self.settings.dry_run {
            for card in &report.cards {
                tracing::info!("Would sync {} ({}:{})", card.label(), card.file, card.line);
                summary.record_skipped(&card.file);
            }
            return Ok(summary);
        }

        if let Err(e) = self.store.ping().await {
            tracing::error!("❌ {}", e.user_friendly_message());
            let message = failure_message(&e);
            for card in &report.cards {
                summary.record_failure(card, Stage::Sync, message.clone());
            }
            return Ok(summary);
        }

        let digest = config_digest(
            &project.ankiconf_digest()?,
            &self.settings.render_fingerprint(),
        );
        let previous = match self.store.load_cache().await {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("⚠️ Could not load the cards cache: {}", e);
                None
            }
        };
        let mut cache = CardsCache::new(digest, &self.settings).with_contents(previous.as_deref());
        tracing::debug!("Loaded {} cached cards", cache.len());
        if cache.config_changed() {
            if self.settings.recompile_on_config_change {
                tracing::info!("Configuration changed since the last run, recompiling cached cards");
            } else {
                tracing::info!("Configuration changed since the last run, keeping cached cards");
            }
        }

        let decks = self.prepare_decks(&report.cards, &mut summary).await;

        let mut pending = Vec::new();
        for card in &report.cards {
            if cache.needs_push(card) {
                pending.push(card);
            } else {
                tracing::debug!("Unchanged {}", card.label());
                summary.record_skipped(&card.file);
            }
        }

        // Compiles run ahead of the sync, but results come back in card order.
        let mut renders = stream::iter(pending.iter().copied())
            .map(|card| async move { (card, self.renderer.render(card).await) })
            .buffered(self.settings.generation_concurrency.max(1));
        let mut processed = 0;
        let mut forced = false;

        loop {
            if self.abort.is_aborted() {
                tracing::warn!(
                    "⚠️ Aborted, {} cards left unprocessed",
                    pending.len() - processed
                );
                summary.aborted = true;
                break;
            }

            let Some(next) = self.unless_forced(renders.next()).await else {
                tracing::warn!(
                    "⚠️ Stopped at once, {} cards left unprocessed",
                    pending.len() - processed
                );
                summary.aborted = true;
                forced = true;
                break;
            };
            let Some((card, rendered)) = next else {
                break;
            };
            processed += 1;

            let rendered = match rendered {
                Ok(rendered) => rendered,
                Err(e) => {
                    tracing::error!("❌ {}: {}", card.label(), e);
                    cache.forget(card);
                    summary.record_failure(card, Stage::Compile, failure_message(&e));
                    continue;
                }
            };

            let deck = decks
                .get(&card.deck)
                .map(String::as_str)
                .unwrap_or(&card.deck);
            let Some(synced) = self
                .unless_forced(self.store.upsert_card(card, deck, &rendered))
                .await
            else {
                tracing::warn!("⚠️ Stopped at once while syncing {}", card.label());
                summary.aborted = true;
                forced = true;
                break;
            };
            match synced {
                Ok(outcome) => {
                    tracing::debug!("{:?} {} in {}", outcome, card.label(), deck);
                    cache.record(card);
                    summary.record_synced(card, outcome);
                }
                Err(e) => {
                    tracing::error!("❌ {}: {}", card.label(), e);
                    cache.forget(card);
                    summary.record_failure(card, Stage::Sync, failure_message(&e));
                }
            }
        }
        // Kills the compilations still running ahead.
        drop(renders);

        if forced {
            tracing::warn!("⚠️ Cards cache not saved after a forced stop");
            return Ok(summary);
        }

        match cache.to_json() {
            Ok(contents) => {
                if let Err(e) = self.store.save_cache(&contents).await {
                    tracing::warn!("⚠️ Could not save the cards cache: {}", e);
                    summary.record_warning(format!("cards cache not saved: {}", e));
                }
            }
            Err(e) => tracing::warn!("⚠️ Could not serialize the cards cache: {}", e),
        }

        tracing::info!(
            "✅ Sync finished in {:.1}s ({} created, {} updated, {} failed)",
            started.elapsed().as_secs_f64(),
            summary.created,
            summary.updated,
            summary.failed()
        );
        Ok(summary)
    }

    /// Runs `work` unless a forced stop arrives first.
    async fn unless_forced<T>(&self, work: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            output = work => Some(output),
            _ = self.abort.forced() => None,
        }
    }

    /// Maps each deck named by the cards to its full Anki name, creating
    /// the decks Anki does not have yet.
    async fn prepare_decks(
        &self,
        cards: &[Card],
        summary: &mut RunSummary,
    ) -> HashMap<String, String> {
        let existing = match self.store.deck_names().await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!("⚠️ Could not list decks: {}", e);
                Vec::new()
            }
        };

        let mut resolved = HashMap::new();
        for card in cards {
            if resolved.contains_key(&card.deck) {
                continue;
            }
            let full_name = resolve_deck(&existing, &card.deck);
            if !existing.contains(&full_name) {
                match self.store.ensure_deck(&full_name).await {
                    Ok(()) => tracing::info!("📂 Created deck {}", full_name),
                    Err(e) => {
                        tracing::warn!("⚠️ Could not create deck {}: {}", full_name, e);
                        summary.record_warning(format!("deck {} not created: {}", full_name, e));
                    }
                }
            }
            resolved.insert(card.deck.clone(), full_name);
        }
        resolved
    }
}
