#[cfg(feature = "cli")]
pub mod cli;
pub mod toml_config;

use crate::config::toml_config::FileConfig;
use crate::utils::error::Result;
use crate::utils::validation::{
    compile_glob_patterns, validate_non_empty_string, validate_path, validate_positive_number,
    validate_typst_length, validate_url, Validate,
};
use glob::Pattern;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_ANKI_URL: &str = "http://127.0.0.1:8765";
pub const DEFAULT_TYPST_PROGRAM: &str = "typst";

/// Where the effective value of a setting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Default,
    File,
    Cli,
}

/// Values given on the command line. Unset fields fall through to the
/// configuration file, then to the built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_file: Option<String>,
    pub max_card_width: Option<String>,
    pub exclude_decks: Vec<String>,
    pub exclude_files: Vec<String>,
    pub check_duplicates: bool,
    pub no_cache: bool,
    pub recompile_on_config_change: Option<bool>,
    pub dry_run: bool,
    pub verbose: bool,
    pub anki_url: Option<String>,
    pub max_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub typst: Option<String>,
    pub ppi: Option<u32>,
    pub generation_concurrency: Option<usize>,
}

/// Effective settings of one run, layered as defaults < `typ2anki.toml` < CLI.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_path: String,
    /// `None` means `auto`.
    pub max_card_width: Option<String>,
    pub exclude_decks: Vec<String>,
    pub exclude_files: Vec<String>,
    pub check_duplicates: bool,
    pub no_cache: bool,
    pub recompile_on_config_change: bool,
    pub dry_run: bool,
    pub verbose: bool,
    pub anki_url: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub typst: String,
    pub ppi: Option<u32>,
    /// Cards compiled ahead of the one being synced.
    pub generation_concurrency: usize,
    sources: BTreeMap<&'static str, ValueSource>,
    deck_patterns: Vec<Pattern>,
    file_patterns: Vec<Pattern>,
}

fn layer<T>(
    key: &'static str,
    cli: Option<T>,
    file: Option<T>,
    default: T,
    sources: &mut BTreeMap<&'static str, ValueSource>,
) -> T {
    let (value, source) = match (cli, file) {
        (Some(v), _) => (v, ValueSource::Cli),
        (None, Some(v)) => (v, ValueSource::File),
        (None, None) => (default, ValueSource::Default),
    };
    sources.insert(key, source);
    value
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    (!values.is_empty()).then_some(values)
}

impl Settings {
    pub fn resolve(
        project_path: impl Into<String>,
        file: Option<FileConfig>,
        cli: Overrides,
    ) -> Result<Self> {
        let file = file.unwrap_or_default();
        let mut sources = BTreeMap::new();

        let file_recompile = file
            .recompile_on_config_change
            .as_ref()
            .map(|t| t.as_bool("recompile_on_config_change"))
            .transpose()?;
        let file_no_cache = file.no_cache.or(file.check_checksums.map(|check| !check));

        let max_card_width = layer(
            "max_card_width",
            cli.max_card_width,
            file.max_card_width,
            "auto".to_string(),
            &mut sources,
        );
        let exclude_decks = layer(
            "exclude_decks",
            non_empty(cli.exclude_decks),
            file.exclude_decks,
            Vec::new(),
            &mut sources,
        );
        let exclude_files = layer(
            "exclude_files",
            non_empty(cli.exclude_files),
            file.exclude_files,
            Vec::new(),
            &mut sources,
        );
        let check_duplicates = layer(
            "check_duplicates",
            cli.check_duplicates.then_some(true),
            file.check_duplicates,
            false,
            &mut sources,
        );
        let no_cache = layer(
            "no_cache",
            cli.no_cache.then_some(true),
            file_no_cache,
            false,
            &mut sources,
        );
        let recompile_on_config_change = layer(
            "recompile_on_config_change",
            cli.recompile_on_config_change,
            file_recompile,
            true,
            &mut sources,
        );
        let dry_run = layer(
            "dry_run",
            cli.dry_run.then_some(true),
            file.dry_run,
            false,
            &mut sources,
        );
        let verbose = layer(
            "verbose",
            cli.verbose.then_some(true),
            file.verbose,
            false,
            &mut sources,
        );
        let anki_url = layer(
            "anki_url",
            cli.anki_url,
            file.anki_url,
            DEFAULT_ANKI_URL.to_string(),
            &mut sources,
        );
        let max_attempts = layer(
            "max_attempts",
            cli.max_attempts,
            file.max_attempts,
            3,
            &mut sources,
        );
        let retry_delay_ms = layer(
            "retry_delay_ms",
            cli.retry_delay_ms,
            file.retry_delay_ms,
            500,
            &mut sources,
        );
        let request_timeout_secs = layer(
            "request_timeout_secs",
            cli.request_timeout_secs,
            file.request_timeout_secs,
            10,
            &mut sources,
        );
        let typst = layer(
            "typst",
            cli.typst,
            file.typst,
            DEFAULT_TYPST_PROGRAM.to_string(),
            &mut sources,
        );
        let ppi = layer("ppi", cli.ppi.map(Some), file.ppi.map(Some), None, &mut sources);
        let generation_concurrency = layer(
            "generation_concurrency",
            cli.generation_concurrency,
            file.generation_concurrency,
            1,
            &mut sources,
        );

        validate_typst_length("max_card_width", &max_card_width)?;
        let deck_patterns = compile_glob_patterns("exclude_decks", &exclude_decks)?;
        let file_patterns = compile_glob_patterns("exclude_files", &exclude_files)?;

        let settings = Settings {
            project_path: project_path.into(),
            max_card_width: (max_card_width != "auto").then_some(max_card_width),
            exclude_decks,
            exclude_files,
            check_duplicates,
            no_cache,
            recompile_on_config_change,
            dry_run,
            verbose,
            anki_url,
            max_attempts,
            retry_delay_ms,
            request_timeout_secs,
            typst,
            ppi,
            generation_concurrency,
            sources,
            deck_patterns,
            file_patterns,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Settings with every value at its default.
    pub fn for_project(project_path: impl Into<String>) -> Result<Self> {
        Self::resolve(project_path, None, Overrides::default())
    }

    pub fn is_deck_excluded(&self, deck: &str) -> bool {
        self.deck_patterns.iter().any(|p| p.matches(deck))
    }

    pub fn is_file_excluded(&self, relative_path: &str) -> bool {
        self.file_patterns.iter().any(|p| p.matches(relative_path))
    }

    pub fn source(&self, key: &str) -> ValueSource {
        self.sources
            .get(key)
            .copied()
            .unwrap_or(ValueSource::Default)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Digest of the settings that change how a card looks once compiled.
    pub fn render_fingerprint(&self) -> String {
        let mut exclude_decks = self.exclude_decks.clone();
        exclude_decks.sort();
        let relevant = json!({
            "exclude_decks": exclude_decks,
            "max_card_width": self.max_card_width.as_deref().unwrap_or("auto"),
            "output_type": "png",
            "ppi": self.ppi,
        });
        blake3::hash(relevant.to_string().as_bytes())
            .to_hex()
            .to_string()
    }

    /// Every setting with its value and source, as printed by `--print-config`.
    pub fn report(&self) -> serde_json::Value {
        let values = [
            (
                "max_card_width",
                json!(self.max_card_width.as_deref().unwrap_or("auto")),
            ),
            ("exclude_decks", json!(self.exclude_decks)),
            ("exclude_files", json!(self.exclude_files)),
            ("check_duplicates", json!(self.check_duplicates)),
            ("no_cache", json!(self.no_cache)),
            (
                "recompile_on_config_change",
                json!(if self.recompile_on_config_change { "y" } else { "n" }),
            ),
            ("dry_run", json!(self.dry_run)),
            ("verbose", json!(self.verbose)),
            ("anki_url", json!(self.anki_url)),
            ("max_attempts", json!(self.max_attempts)),
            ("retry_delay_ms", json!(self.retry_delay_ms)),
            ("request_timeout_secs", json!(self.request_timeout_secs)),
            ("typst", json!(self.typst)),
            ("ppi", json!(self.ppi)),
            ("generation_concurrency", json!(self.generation_concurrency)),
        ];

        let options: Vec<serde_json::Value> = values
            .into_iter()
            .map(|(id, value)| {
                json!({
                    "id": id,
                    "source": self.source(id),
                    "value": value,
                })
            })
            .collect();

        json!({ "project_path": self.project_path, "options": options })
    }
}

impl Validate for Settings {
    fn validate(&self) -> Result<()> {
        validate_path("project_path", &self.project_path)?;
        validate_url("anki_url", &self.anki_url)?;
        validate_positive_number("max_attempts", u64::from(self.max_attempts), 1)?;
        validate_positive_number("request_timeout_secs", self.request_timeout_secs, 1)?;
        validate_non_empty_string("typst", &self.typst)?;
        if let Some(ppi) = self.ppi {
            validate_positive_number("ppi", u64::from(ppi), 1)?;
        }
        validate_positive_number(
            "generation_concurrency",
            self.generation_concurrency as u64,
            1,
        )?;
        Ok(())
    }
}
