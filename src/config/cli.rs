use crate::config::toml_config::parse_yes_no;
use crate::config::Overrides;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "typ2anki", version)]
#[command(about = "Compile Typst flashcards and push them to Anki through AnkiConnect")]
pub struct CliArgs {
    /// Path to the Typst documents folder or a .zip archive of it. Spaces are allowed.
    #[arg(required = true, num_args = 1..)]
    pub path: Vec<String>,

    /// Config file, relative to the project root. Defaults to typ2anki.toml; an empty string disables it.
    #[arg(long)]
    pub config_file: Option<String>,

    /// Maximum card width in Typst units, or 'auto' to not limit the width.
    #[arg(long)]
    pub max_card_width: Option<String>,

    /// Deck to exclude. Repeat for several decks. Glob patterns are supported.
    #[arg(short = 'e', long = "exclude-decks")]
    pub exclude_decks: Vec<String>,

    /// File to exclude, relative to the project root. Repeat for several files. Glob patterns are supported.
    #[arg(long = "exclude-files")]
    pub exclude_files: Vec<String>,

    /// Skip cards whose identifier was already used in this run instead of overwriting.
    #[arg(long)]
    pub check_duplicates: bool,

    /// Push every card, ignoring the cards cache.
    #[arg(long)]
    pub no_cache: bool,

    /// Whether cards are recompiled when ankiconf.typ or render settings change ('y' or 'n').
    #[arg(long, value_parser = parse_yes_no)]
    pub recompile_on_config_change: Option<bool>,

    /// Show what would be done without compiling or contacting Anki.
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    pub verbose: bool,

    /// AnkiConnect endpoint.
    #[arg(long)]
    pub anki_url: Option<String>,

    /// Attempts per AnkiConnect request before a card is marked failed.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Delay between AnkiConnect attempts, in milliseconds.
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// Timeout of a single AnkiConnect request, in seconds.
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// The typst program to run.
    #[arg(long)]
    pub typst: Option<String>,

    /// Pixels per inch of the rendered images.
    #[arg(long)]
    pub ppi: Option<u32>,

    /// Number of cards compiled in parallel. Cards are still synced in order.
    #[arg(long)]
    pub generation_concurrency: Option<usize>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long, hide = true)]
    pub print_config: bool,
}

impl CliArgs {
    /// The project path, with separate words joined back together.
    pub fn project_path(&self) -> String {
        self.path.join(" ")
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            config_file: self.config_file.clone(),
            max_card_width: self.max_card_width.clone(),
            exclude_decks: self.exclude_decks.clone(),
            exclude_files: self.exclude_files.clone(),
            check_duplicates: self.check_duplicates,
            no_cache: self.no_cache,
            recompile_on_config_change: self.recompile_on_config_change,
            dry_run: self.dry_run,
            verbose: self.verbose,
            anki_url: self.anki_url.clone(),
            max_attempts: self.max_attempts,
            retry_delay_ms: self.retry_delay_ms,
            request_timeout_secs: self.request_timeout_secs,
            typst: self.typst.clone(),
            ppi: self.ppi,
            generation_concurrency: self.generation_concurrency,
        }
    }
}
