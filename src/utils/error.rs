use thiserror::Error;

#[derive(Error, Debug)]
pub enum Typ2AnkiError {
    #[error("Archive operation failed: {0}")]
    ArchiveError(#[from] zip::result::ZipError),

    #[error("AnkiConnect request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value for '{field}': '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid project path '{path}': {reason}")]
    ProjectError { path: String, reason: String },

    #[error("Card parse error: {message}")]
    ParseError { message: String },

    #[error("Failed to compile card '{card_id}': {message}")]
    CompileError { card_id: String, message: String },

    #[error("AnkiConnect rejected '{action}': {message}")]
    AnkiError { action: String, message: String },

    #[error("AnkiConnect returned HTTP {status} for '{action}'")]
    HttpStatusError { action: String, status: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Project,
    Parse,
    Compile,
    Sync,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Process exit code used when an error of this severity ends the run.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorSeverity::Low => 0,
            ErrorSeverity::Medium => 1,
            ErrorSeverity::High => 2,
            ErrorSeverity::Critical => 3,
        }
    }
}

impl Typ2AnkiError {
    pub fn config(message: impl Into<String>) -> Self {
        Typ2AnkiError::ConfigError {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Typ2AnkiError::ParseError {
            message: message.into(),
        }
    }

    pub fn compile(card_id: impl Into<String>, message: impl Into<String>) -> Self {
        Typ2AnkiError::CompileError {
            card_id: card_id.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Typ2AnkiError::ConfigError { .. }
            | Typ2AnkiError::InvalidConfigValueError { .. }
            | Typ2AnkiError::ConfigValidationError { .. } => ErrorCategory::Configuration,
            Typ2AnkiError::ProjectError { .. } | Typ2AnkiError::ArchiveError(_) => {
                ErrorCategory::Project
            }
            Typ2AnkiError::ParseError { .. } => ErrorCategory::Parse,
            Typ2AnkiError::CompileError { .. } => ErrorCategory::Compile,
            Typ2AnkiError::ApiError(_)
            | Typ2AnkiError::AnkiError { .. }
            | Typ2AnkiError::HttpStatusError { .. } => ErrorCategory::Sync,
            Typ2AnkiError::IoError(_) | Typ2AnkiError::SerializationError(_) => {
                ErrorCategory::System
            }
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Parse => ErrorSeverity::Low,
            ErrorCategory::Compile | ErrorCategory::Sync => ErrorSeverity::Medium,
            ErrorCategory::Configuration => ErrorSeverity::High,
            ErrorCategory::Project | ErrorCategory::System => ErrorSeverity::Critical,
        }
    }

    /// Whether repeating the same request may succeed. AnkiConnect
    /// rejections are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Typ2AnkiError::ApiError(_) => true,
            Typ2AnkiError::HttpStatusError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            Typ2AnkiError::ProjectError { path, reason } => {
                format!("Cannot use '{}' as a project: {}", path, reason)
            }
            Typ2AnkiError::ArchiveError(e) => format!("The project archive could not be read: {}", e),
            Typ2AnkiError::ApiError(e) if e.is_connect() || e.is_timeout() => {
                "Anki could not be reached through AnkiConnect".to_string()
            }
            Typ2AnkiError::CompileError { card_id, .. } => {
                format!("Typst could not compile card '{}'", card_id)
            }
            other => other.to_string(),
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Configuration => {
                "Check typ2anki.toml and the command line flags (run with --help)"
            }
            ErrorCategory::Project => {
                "Pass a directory or a .zip archive containing your .typ files"
            }
            ErrorCategory::Parse => "Check the #card(...) markers in the reported file",
            ErrorCategory::Compile => {
                "Make sure typst is installed and the card compiles with ankiconf.typ"
            }
            ErrorCategory::Sync => {
                "Make sure Anki is running with the AnkiConnect add-on installed"
            }
            ErrorCategory::System => "Check file permissions and available disk space",
        }
    }
}

pub type Result<T> = std::result::Result<T, Typ2AnkiError>;
