use crate::domain::model::{Card, RenderedCard, SyncOutcome};
use crate::utils::error::Result;
use async_trait::async_trait;

/// Turns a card into its front and back images.
#[async_trait]
pub trait CardRenderer: Send + Sync {
    async fn render(&self, card: &Card) -> Result<RenderedCard>;
}

/// The destination application holding decks and notes.
#[async_trait]
pub trait CardStore: Send + Sync {
    /// Returns the endpoint's API version; fails when it is unreachable.
    async fn ping(&self) -> Result<u64>;

    async fn deck_names(&self) -> Result<Vec<String>>;

    async fn ensure_deck(&self, deck: &str) -> Result<()>;

    /// Creates the card in `deck`, or updates the note already carrying its identifier.
    async fn upsert_card(
        &self,
        card: &Card,
        deck: &str,
        rendered: &RenderedCard,
    ) -> Result<SyncOutcome>;

    async fn load_cache(&self) -> Result<Option<String>>;

    async fn save_cache(&self, contents: &str) -> Result<()>;
}
