use crate::config::Settings;
use crate::core::scanner::SCRATCH_PREFIX;
use crate::domain::model::{Card, MediaFile, RenderedCard};
use crate::domain::ports::CardRenderer;
use crate::utils::error::{Result, Typ2AnkiError};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;

const PAGE_SETUP: &str = "#set page(
  width: auto,
  height: auto,
  margin: 3pt,
  fill: rgb(255,255,255),
)";

const CARD_FUNCTIONS: &str = "#let card(
  id: \"\",
  q: \"\",
  a: \"\",
  ..args
) = {
  let args = arguments(..args, type: \"basic\")
  if args.at(\"type\") == \"basic\" {
    context[
      #display_with_width(q)
      #pagebreak()
      #display_with_width(a)
    ]
  }
}
#let custom-card = card";

fn display_with_width(max_width: Option<&str>) -> String {
    match max_width {
        None => "#let display_with_width(body) = {\n  body\n}".to_string(),
        Some(max) => format!(
            "#let display_with_width(body) = {{
  layout(size => {{
    let (width,) = measure(body)
    if width > {max} {{
      width = {max}
    }} else {{
      width = auto
    }}
    context[
      #block(width: width, body)
    ]
  }})
}}"
        ),
    }
}

/// The standalone document compiled for one card: the project's
/// `ankiconf.typ`, a page fitted to the content, then the marker itself.
pub fn card_document(card: &Card, max_width: Option<&str>) -> String {
    let mut document = String::from("#import \"/ankiconf.typ\": *\n#show: doc => conf(doc)\n\n");
    document.push_str(PAGE_SETUP);
    document.push_str("\n\n");
    document.push_str(&display_with_width(max_width));
    document.push_str("\n\n");
    document.push_str(CARD_FUNCTIONS);
    document.push_str("\n\n");
    document.push_str(&card.source);
    document.push('\n');
    document
}

/// Safe identifier plus a short content digest. Cards compiled at the same
/// time never share scratch or page files.
fn file_stem(card: &Card) -> String {
    let hash = card.content_hash.get(..8).unwrap_or(&card.content_hash);
    format!("{}-{}", card.safe_id(), hash)
}

/// Removes the scratch document once the compilation is over, or when the
/// render is dropped half way.
struct TempSource(PathBuf);

impl Drop for TempSource {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            tracing::debug!("Could not remove {}: {}", self.0.display(), e);
        }
    }
}

/// Renders cards by running the `typst` command line compiler, one process per card.
#[derive(Debug)]
pub struct TypstCompiler {
    program: String,
    global_flags: Vec<String>,
    root: PathBuf,
    max_card_width: Option<String>,
    ppi: Option<u32>,
    output: TempDir,
}

impl TypstCompiler {
    pub fn new(root: &Path, settings: &Settings) -> Result<Self> {
        let output = tempfile::Builder::new()
            .prefix("typ2anki-render-")
            .tempdir()?;
        Ok(Self {
            program: settings.typst.clone(),
            global_flags: vec!["--color".to_string(), "never".to_string()],
            root: root.to_path_buf(),
            max_card_width: settings.max_card_width.clone(),
            ppi: settings.ppi,
            output,
        })
    }

    /// Replaces the program and the flags placed before the `compile` subcommand.
    pub fn with_program(mut self, program: impl Into<String>, global_flags: Vec<String>) -> Self {
        self.program = program.into();
        self.global_flags = global_flags;
        self
    }

    fn effective_width<'a>(&'a self, card: &'a Card) -> Option<&'a str> {
        card.max_width()
            .filter(|w| *w != "auto")
            .or(self.max_card_width.as_deref())
    }

    fn page_path(&self, card: &Card, page: u32) -> PathBuf {
        self.output
            .path()
            .join(format!("typ-{}-{}.png", file_stem(card), page))
    }

    fn command(&self, card: &Card, source: &Path) -> Command {
        let pattern = self
            .output
            .path()
            .join(format!("typ-{}-{{p}}.png", file_stem(card)));

        let mut command = Command::new(&self.program);
        command
            .args(&self.global_flags)
            .arg("compile")
            .arg("--root")
            .arg(&self.root)
            .args(["--input", "typ2anki_compile=1"]);
        if let Some(width) = self.effective_width(card) {
            command.arg("--input").arg(format!("max_card_width={}", width));
        }
        if let Some(ppi) = self.ppi {
            command.arg("--ppi").arg(ppi.to_string());
        }
        command.arg(source).arg(pattern).kill_on_drop(true);
        command
    }

    fn read_page(&self, card: &Card, page: u32) -> Result<MediaFile> {
        let path = self.page_path(card, page);
        let data = fs::read(&path).map_err(|_| {
            Typ2AnkiError::compile(&card.id, "expected two pages (question and answer)")
        })?;
        if let Err(e) = fs::remove_file(&path) {
            tracing::debug!("Could not remove {}: {}", path.display(), e);
        }
        Ok(MediaFile {
            filename: format!("typ-{}-{}.png", file_stem(card), page),
            data,
        })
    }
}

#[async_trait]
impl CardRenderer for TypstCompiler {
    async fn render(&self, card: &Card) -> Result<RenderedCard> {
        let source_dir = self
            .root
            .join(&card.file)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let source = TempSource(source_dir.join(format!("{}{}.typ", SCRATCH_PREFIX, file_stem(card))));

        let document = card_document(card, self.effective_width(card));
        fs::write(&source.0, document)?;

        for page in 1..=2 {
            let stale = self.page_path(card, page);
            if stale.exists() {
                fs::remove_file(stale)?;
            }
        }

        tracing::debug!("Compiling {} with {}", card.label(), self.program);
        let output = self
            .command(card, &source.0)
            .output()
            .await
            .map_err(|e| Typ2AnkiError::compile(&card.id, format!("cannot run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = [stderr.trim(), stdout.trim()]
                .into_iter()
                .find(|m| !m.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} exited with {}", self.program, output.status));
            return Err(Typ2AnkiError::compile(&card.id, message));
        }

        Ok(RenderedCard {
            front: self.read_page(card, 1)?,
            back: self.read_page(card, 2)?,
        })
    }
}
