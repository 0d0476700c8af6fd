use crate::utils::error::{Result, Typ2AnkiError};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::TempDir;

pub const ANKICONF_FILENAME: &str = "ankiconf.typ";

const DEFAULT_ANKICONF: &str = "#let conf(
  doc,
) = {
  doc
}
";

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*#import\s*"([^"]+)""#).expect("import pattern is valid")
});

/// The documents of one run: a directory, or an archive extracted for the
/// lifetime of this value.
#[derive(Debug)]
pub struct Project {
    requested: PathBuf,
    root: PathBuf,
    extracted: Option<TempDir>,
}

impl Project {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let requested = path.as_ref().to_path_buf();
        let resolved = fs::canonicalize(&requested).map_err(|e| Typ2AnkiError::ProjectError {
            path: requested.display().to_string(),
            reason: e.to_string(),
        })?;

        if resolved.is_dir() {
            return Ok(Self {
                requested,
                root: resolved,
                extracted: None,
            });
        }

        if resolved.is_file() && is_zip_path(&resolved) {
            let extracted = extract_archive(&resolved)?;
            let root = archive_root(extracted.path())?;
            return Ok(Self {
                requested,
                root,
                extracted: Some(extracted),
            });
        }

        Err(Typ2AnkiError::ProjectError {
            path: requested.display().to_string(),
            reason: "expected a directory or a .zip archive".to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn requested(&self) -> &Path {
        &self.requested
    }

    pub fn is_archive(&self) -> bool {
        self.extracted.is_some()
    }

    pub fn ankiconf_path(&self) -> PathBuf {
        self.root.join(ANKICONF_FILENAME)
    }

    /// Writes a pass-through `ankiconf.typ` when the project has none.
    /// Returns whether a file was (or, in a dry run, would be) created.
    pub fn ensure_ankiconf(&self, dry_run: bool) -> Result<bool> {
        let path = self.ankiconf_path();
        if path.exists() {
            return Ok(false);
        }
        if dry_run {
            tracing::info!("📝 Would create {}", path.display());
            return Ok(true);
        }
        fs::write(&path, DEFAULT_ANKICONF)?;
        tracing::info!("📝 Created default {}", path.display());
        Ok(true)
    }

    /// Digest of `ankiconf.typ` and every local file it imports, transitively.
    pub fn ankiconf_digest(&self) -> Result<String> {
        let ankiconf = self.ankiconf_path();
        let mut hasher = blake3::Hasher::new();

        let content = match fs::read_to_string(&ankiconf) {
            Ok(content) => content,
            // the default document compiles the same as a missing one
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DEFAULT_ANKICONF.to_string(),
            Err(e) => return Err(e.into()),
        };
        hasher.update(content.as_bytes());

        for import in self.local_imports(&ankiconf, &content) {
            match fs::read(&import) {
                Ok(bytes) => {
                    hasher.update(b"\n");
                    hasher.update(&bytes);
                }
                Err(e) => tracing::warn!("⚠️ Cannot read import {}: {}", import.display(), e),
            }
        }

        Ok(hasher.finalize().to_hex().to_string())
    }

    fn local_imports(&self, from: &Path, content: &str) -> BTreeSet<PathBuf> {
        let mut found = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut pending: Vec<(PathBuf, String)> = vec![(from.to_path_buf(), content.to_string())];

        while let Some((file, text)) = pending.pop() {
            let base = file.parent().unwrap_or(&self.root).to_path_buf();
            for caps in IMPORT_RE.captures_iter(&text) {
                let target = &caps[1];
                if target.starts_with('@') {
                    continue;
                }
                let path = match target.strip_prefix('/') {
                    Some(rooted) => self.root.join(rooted),
                    None => base.join(target),
                };
                if !path.is_file() || !visited.insert(path.clone()) {
                    continue;
                }
                if let Ok(imported) = fs::read_to_string(&path) {
                    pending.push((path.clone(), imported));
                }
                found.insert(path);
            }
        }

        found
    }
}

fn is_zip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

fn extract_archive(archive_path: &Path) -> Result<TempDir> {
    let dir = tempfile::Builder::new().prefix("typ2anki-").tempdir()?;
    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    archive.extract(dir.path())?;
    tracing::debug!(
        "Extracted {} entries from {} to {}",
        archive.len(),
        archive_path.display(),
        dir.path().display()
    );
    Ok(dir)
}

/// An archive holding a single top-level folder is rooted at that folder.
fn archive_root(extracted: &Path) -> Result<PathBuf> {
    let entries: Vec<PathBuf> = fs::read_dir(extracted)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n != "__MACOSX")
                .unwrap_or(true)
        })
        .collect();

    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Ok(extracted.to_path_buf()),
    }
}
