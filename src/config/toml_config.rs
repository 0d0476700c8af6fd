use crate::utils::error::{Result, Typ2AnkiError};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const DEFAULT_CONFIG_FILENAME: &str = "typ2anki.toml";

static ENV_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]+)\}").expect("environment variable pattern is valid")
});

/// A yes/no setting written either as a TOML boolean or as `"y"` / `"n"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Toggle {
    Flag(bool),
    Word(String),
}

impl Toggle {
    pub fn as_bool(&self, field: &str) -> Result<bool> {
        match self {
            Toggle::Flag(b) => Ok(*b),
            Toggle::Word(w) => parse_yes_no(w).map_err(|reason| {
                Typ2AnkiError::InvalidConfigValueError {
                    field: field.to_string(),
                    value: w.clone(),
                    reason,
                }
            }),
        }
    }
}

pub fn parse_yes_no(value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" => Ok(true),
        "n" | "no" | "false" => Ok(false),
        other => Err(format!("expected 'y' or 'n', got '{}'", other)),
    }
}

/// Project-local defaults read from `typ2anki.toml`. Every key is optional;
/// command line flags take precedence over anything set here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub max_card_width: Option<String>,
    pub exclude_decks: Option<Vec<String>>,
    pub exclude_files: Option<Vec<String>>,
    pub check_duplicates: Option<bool>,
    pub no_cache: Option<bool>,
    /// Inverse of `no_cache`.
    pub check_checksums: Option<bool>,
    pub recompile_on_config_change: Option<Toggle>,
    pub dry_run: Option<bool>,
    pub verbose: Option<bool>,
    pub anki_url: Option<String>,
    pub max_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub typst: Option<String>,
    pub ppi: Option<u32>,
    pub generation_concurrency: Option<usize>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl FileConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(Typ2AnkiError::IoError)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);

        let config: FileConfig =
            toml::from_str(&processed_content).map_err(|e| Typ2AnkiError::ConfigValidationError {
                field: "toml_parsing".to_string(),
                message: format!("TOML parsing error: {}", e),
            })?;

        Ok(config)
    }

    /// Replaces `${VAR}` with the environment value, leaving unset variables untouched.
    fn substitute_env_vars(content: &str) -> String {
        ENV_VAR_RE
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
            })
            .into_owned()
    }

    /// Loads the configuration file of a project.
    ///
    /// `None` looks for [`DEFAULT_CONFIG_FILENAME`] and tolerates its absence,
    /// an empty name disables the file, and any other name must exist.
    pub fn load_for_project(
        root: &Path,
        config_file: Option<&str>,
    ) -> Result<Option<(PathBuf, FileConfig)>> {
        let (name, required) = match config_file {
            None => (DEFAULT_CONFIG_FILENAME, false),
            Some("") => return Ok(None),
            Some(name) => (name, true),
        };

        let path = root.join(name);
        if !path.is_file() {
            if required {
                return Err(Typ2AnkiError::config(format!(
                    "Config file {} not found",
                    path.display()
                )));
            }
            return Ok(None);
        }

        let config = Self::from_file(&path)?;
        Ok(Some((path, config)))
    }
}
