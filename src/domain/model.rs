use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_DECK: &str = "Default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CardKind {
    Card,
    CustomCard,
}

impl CardKind {
    pub fn marker(self) -> &'static str {
        match self {
            CardKind::Card => "#card(",
            CardKind::CustomCard => "#custom-card(",
        }
    }
}

/// A flashcard extracted from a `#card(...)` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub deck: String,
    /// Raw Typst source of the `q` argument.
    pub question: String,
    /// Raw Typst source of the `a` argument.
    pub answer: String,
    /// Remaining named arguments, verbatim.
    pub options: BTreeMap<String, String>,
    pub kind: CardKind,
    /// The complete marker text, compiled as is.
    pub source: String,
    /// Path of the defining document relative to the project root, `/`-separated.
    pub file: String,
    pub line: usize,
    pub content_hash: String,
}

impl Card {
    /// Cache key, unique per deck and identifier.
    pub fn cache_key(&self) -> String {
        format!("{}_{}", self.deck, self.id)
    }

    /// The Anki tag carrying the identifier. Tags cannot contain whitespace.
    pub fn tag(&self) -> String {
        self.id
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect()
    }

    /// Identifier reduced to characters safe in file names.
    pub fn safe_id(&self) -> String {
        self.id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn max_width(&self) -> Option<&str> {
        self.options.get("max-width").map(String::as_str)
    }

    pub fn label(&self) -> String {
        format!("{}.{}", self.deck, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Front and back images of a compiled card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCard {
    pub front: MediaFile,
    pub back: MediaFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Compile,
    Sync,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Compile => write!(f, "compile"),
            Stage::Sync => write!(f, "sync"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardFailure {
    pub file: String,
    pub card_id: String,
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileStats {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Accounting of one run. Failures accumulate here instead of ending the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failures: Vec<CardFailure>,
    pub warnings: Vec<String>,
    pub files: BTreeMap<String, FileStats>,
    pub aborted: bool,
}

impl RunSummary {
    pub fn record_synced(&mut self, card: &Card, outcome: SyncOutcome) {
        let stats = self.files.entry(card.file.clone()).or_default();
        match outcome {
            SyncOutcome::Created => {
                self.created += 1;
                stats.created += 1;
            }
            SyncOutcome::Updated => {
                self.updated += 1;
                stats.updated += 1;
            }
        }
    }

    pub fn record_skipped(&mut self, file: &str) {
        self.skipped += 1;
        self.files.entry(file.to_string()).or_default().skipped += 1;
    }

    pub fn record_failure(&mut self, card: &Card, stage: Stage, message: impl Into<String>) {
        self.files.entry(card.file.clone()).or_default().failed += 1;
        self.failures.push(CardFailure {
            file: card.file.clone(),
            card_id: card.id.clone(),
            stage,
            message: message.into(),
        });
    }

    pub fn record_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn processed(&self) -> usize {
        self.created + self.updated + self.skipped + self.failed()
    }

    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            130
        } else if self.failures.is_empty() {
            0
        } else {
            1
        }
    }

    /// Human readable report: one line per file, then totals, warnings and failures.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let width = self.files.keys().map(|f| f.len()).max().unwrap_or(0) + 1;

        for (file, stats) in &self.files {
            out.push_str(&format!(
                "{:<width$}+{} ↑{} ☓{} ↷{}\n",
                file,
                stats.created,
                stats.updated,
                stats.failed,
                stats.skipped,
                width = width
            ));
        }

        out.push_str(&format!(
            "Created: {}, Updated: {}, Skipped: {}, Failed: {}\n",
            self.created,
            self.updated,
            self.skipped,
            self.failed()
        ));

        if !self.warnings.is_empty() {
            out.push_str(&format!("Warnings ({}):\n", self.warnings.len()));
            for warning in &self.warnings {
                out.push_str(&format!("  - {}\n", warning));
            }
        }

        if !self.failures.is_empty() {
            out.push_str(&format!("Failures ({}):\n", self.failures.len()));
            for failure in &self.failures {
                out.push_str(&format!(
                    "  - {} [{}] {}: {}\n",
                    failure.file, failure.stage, failure.card_id, failure.message
                ));
            }
        }

        if self.aborted {
            out.push_str("Run aborted before all cards were processed.\n");
        }

        out
    }
}
