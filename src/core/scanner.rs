//! Extraction of `#card(...)` markers from Typst documents.
//!
//! Markers are located with a small nesting-aware walker instead of a full
//! Typst parser: code context tracks `()`, `[]`, `{}` and string literals,
//! markup context (inside `[...]`) only tracks brackets, escapes and raw text.
//! Comments are skipped in both.

use crate::config::Settings;
use crate::core::project::ANKICONF_FILENAME;
use crate::domain::model::{Card, CardKind, DEFAULT_DECK};
use crate::utils::error::{Result, Typ2AnkiError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

pub const SCRATCH_PREFIX: &str = "temporal-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardMarker {
    pub kind: CardKind,
    pub text: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerScan {
    pub markers: Vec<CardMarker>,
    /// Lines of markers that are never closed.
    pub unterminated: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWarning {
    pub file: String,
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}: {}", self.file, self.message)
        } else {
            write!(f, "{}:{}: {}", self.file, self.line, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanItem {
    Card(Card),
    /// A card without question and answer.
    Empty(Card),
    Warning(ScanWarning),
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub cards: Vec<Card>,
    pub empty: Vec<Card>,
    /// Definitions left out because another card owns their tag.
    pub duplicates: Vec<Card>,
    pub warnings: Vec<ScanWarning>,
}

/// Calls `visit(offset, ch, depth, significant)` for every character of `s`
/// outside comments. Characters inside string literals, escapes and raw
/// text are reported as not significant. Returns early when `visit`
/// returns false.
fn walk_code(
    s: &str,
    mut stack: Vec<char>,
    mut visit: impl FnMut(usize, char, usize, bool) -> bool,
) {
    let mut chars = s.char_indices().peekable();
    let mut prev: Option<char> = None;

    macro_rules! emit {
        ($offset:expr, $ch:expr, $significant:expr) => {
            if !visit($offset, $ch, stack.len(), $significant) {
                return;
            }
        };
    }

    while let Some((offset, ch)) = chars.next() {
        let in_markup = stack.last() == Some(&']');
        let next = chars.peek().map(|&(_, c)| c);

        // `https://` in markup is a link, not a comment.
        if ch == '/' && next == Some('/') && !(in_markup && prev == Some(':')) {
            while chars.next_if(|&(_, c)| c != '\n').is_some() {}
            prev = Some(' ');
            continue;
        }
        if ch == '/' && next == Some('*') {
            chars.next();
            let mut last = ' ';
            for (_, c) in chars.by_ref() {
                if last == '*' && c == '/' {
                    break;
                }
                last = c;
            }
            prev = Some(' ');
            continue;
        }
        prev = Some(ch);

        if in_markup {
            match ch {
                '\\' => {
                    emit!(offset, ch, false);
                    if let Some((o, c)) = chars.next() {
                        prev = Some(c);
                        emit!(o, c, false);
                    }
                    continue;
                }
                '`' => {
                    emit!(offset, ch, false);
                    for (o, c) in chars.by_ref() {
                        emit!(o, c, false);
                        if c == '`' {
                            break;
                        }
                    }
                    continue;
                }
                '[' => stack.push(']'),
                ']' => {
                    stack.pop();
                }
                _ => {}
            }
        } else {
            match ch {
                '"' => {
                    emit!(offset, ch, false);
                    let mut escaped = false;
                    for (o, c) in chars.by_ref() {
                        emit!(o, c, false);
                        match c {
                            '\\' if !escaped => escaped = true,
                            '"' if !escaped => break,
                            _ => escaped = false,
                        }
                    }
                    continue;
                }
                '(' => stack.push(')'),
                '[' => stack.push(']'),
                '{' => stack.push('}'),
                ')' | '}' if stack.last() == Some(&ch) => {
                    stack.pop();
                }
                _ => {}
            }
        }
        emit!(offset, ch, true);
    }
}

/// End offset (exclusive) of the argument list opened just before `body_start`.
fn marker_end(content: &str, body_start: usize) -> Option<usize> {
    let mut end = None;
    walk_code(&content[body_start..], vec![')'], |offset, ch, depth, significant| {
        if significant && ch == ')' && depth == 0 {
            end = Some(body_start + offset + 1);
            false
        } else {
            true
        }
    });
    end
}

fn split_top_level(s: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut last = 0;
    walk_code(s, Vec::new(), |offset, ch, depth, significant| {
        if significant && ch == separator && depth == 0 {
            parts.push(&s[last..offset]);
            last = offset + separator.len_utf8();
        }
        true
    });
    parts.push(&s[last..]);
    parts
}

fn find_top_level(s: &str, target: char) -> Option<usize> {
    let mut found = None;
    walk_code(s, Vec::new(), |offset, ch, depth, significant| {
        if significant && ch == target && depth == 0 {
            found = Some(offset);
            false
        } else {
            true
        }
    });
    found
}

/// `s` with its comments removed.
fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    walk_code(s, Vec::new(), |_, ch, _, _| {
        out.push(ch);
        true
    });
    out
}

fn marker_at(rest: &str) -> Option<CardKind> {
    [CardKind::Card, CardKind::CustomCard]
        .into_iter()
        .find(|kind| rest.starts_with(kind.marker()))
}

/// Finds every card marker in a document, outside comments.
pub fn find_markers(content: &str) -> MarkerScan {
    let mut scan = MarkerScan::default();
    let mut i = 0;
    let mut line = 1;
    let mut prev: Option<char> = None;

    while i < content.len() {
        let rest = &content[i..];

        if rest.starts_with("//") && prev != Some(':') {
            let skip = rest.find('\n').unwrap_or(rest.len());
            i += skip;
            prev = Some(' ');
            continue;
        }

        if rest.starts_with("/*") {
            let skip = rest.find("*/").map_or(rest.len(), |p| p + 2);
            line += rest[..skip].matches('\n').count();
            i += skip;
            prev = Some(' ');
            continue;
        }

        if prev != Some('\\') {
            if let Some(kind) = marker_at(rest) {
                match marker_end(content, i + kind.marker().len()) {
                    Some(end) => {
                        let text = &content[i..end];
                        scan.markers.push(CardMarker {
                            kind,
                            text: text.to_string(),
                            line,
                        });
                        line += text.matches('\n').count();
                        i = end;
                        prev = Some(')');
                    }
                    None => {
                        scan.unterminated.push(line);
                        break;
                    }
                }
                continue;
            }
        }

        let Some(ch) = rest.chars().next() else {
            break;
        };
        if ch == '\n' {
            line += 1;
        }
        prev = Some(ch);
        i += ch.len_utf8();
    }

    scan
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(other) => out.push(other),
                    None => {}
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        value.to_string()
    }
}

fn is_empty_content(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() || value == "\"\"" || value == "none" {
        return true;
    }
    value.starts_with('[') && value.ends_with(']') && value[1..value.len() - 1].trim().is_empty()
}

/// Named arguments of a marker, in order of appearance.
pub fn marker_arguments(marker: &CardMarker) -> Vec<(String, String)> {
    let body = &marker.text[marker.kind.marker().len()..marker.text.len() - 1];
    split_top_level(body, ',')
        .into_iter()
        .filter_map(|arg| {
            let colon = find_top_level(arg, ':')?;
            let name = strip_comments(&arg[..colon]);
            let name = name.trim();
            let value = strip_comments(&arg[colon + 1..]);
            is_identifier(name).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Builds a card from a marker.
pub fn parse_card(marker: &CardMarker, file: &str) -> Result<Card> {
    let mut id = None;
    let mut deck = None;
    let mut question = String::new();
    let mut answer = String::new();
    let mut options = BTreeMap::new();

    for (name, value) in marker_arguments(marker) {
        match name.as_str() {
            "id" => id = Some(unquote(&value)),
            "target-deck" | "deck" => deck = Some(unquote(&value)),
            "q" => question = value,
            "a" => answer = value,
            _ => {
                options.insert(name, value);
            }
        }
    }

    let id = match id {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        Some(_) => return Err(Typ2AnkiError::parse("card has an empty id, skipped")),
        None => return Err(Typ2AnkiError::parse("card has no id, skipped")),
    };
    let deck = deck
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| DEFAULT_DECK.to_string());

    Ok(Card {
        id,
        deck,
        question,
        answer,
        options,
        kind: marker.kind,
        content_hash: blake3::hash(marker.text.as_bytes()).to_hex().to_string(),
        source: marker.text.clone(),
        file: file.to_string(),
        line: marker.line,
    })
}

pub fn is_empty_card(card: &Card) -> bool {
    is_empty_content(&card.question) && is_empty_content(&card.answer)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

fn is_source_document(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_file()
        && name.ends_with(".typ")
        && name != ANKICONF_FILENAME
        && !name.starts_with(SCRATCH_PREFIX)
}

fn relative_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub struct CardScanner<'a> {
    root: &'a Path,
    settings: &'a Settings,
}

impl<'a> CardScanner<'a> {
    pub fn new(root: &'a Path, settings: &'a Settings) -> Self {
        Self { root, settings }
    }

    /// Source documents of the project, sorted, with exclusions applied.
    pub fn documents(
        &self,
    ) -> impl Iterator<Item = std::result::Result<PathBuf, ScanWarning>> + '_ {
        WalkDir::new(self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry))
            .filter_map(move |entry| match entry {
                Ok(entry) if is_source_document(&entry) => {
                    let relative = relative_name(self.root, entry.path());
                    if self.settings.is_file_excluded(&relative) {
                        tracing::debug!("Skipping excluded file {}", relative);
                        None
                    } else {
                        Some(Ok(entry.into_path()))
                    }
                }
                Ok(_) => None,
                Err(e) => Some(Err(ScanWarning {
                    file: e
                        .path()
                        .map(|p| relative_name(self.root, p))
                        .unwrap_or_default(),
                    line: 0,
                    message: format!("cannot be read: {}", e),
                })),
            })
    }

    /// Lazily yields the cards of each document, one document at a time.
    pub fn iter(&self) -> impl Iterator<Item = ScanItem> + '_ {
        self.documents().flat_map(move |document| match document {
            Ok(path) => self.scan_document(&path),
            Err(warning) => vec![ScanItem::Warning(warning)],
        })
    }

    pub fn scan_document(&self, path: &Path) -> Vec<ScanItem> {
        let file = relative_name(self.root, path);
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                return vec![ScanItem::Warning(ScanWarning {
                    file,
                    line: 0,
                    message: format!("cannot be read: {}", e),
                })]
            }
        };

        let scan = find_markers(&content);
        let mut items = Vec::with_capacity(scan.markers.len());

        for marker in &scan.markers {
            match parse_card(marker, &file) {
                Ok(card) if self.settings.is_deck_excluded(&card.deck) => {
                    tracing::debug!("Skipping {} from excluded deck", card.label());
                }
                Ok(card) if is_empty_card(&card) => items.push(ScanItem::Empty(card)),
                Ok(card) => items.push(ScanItem::Card(card)),
                Err(Typ2AnkiError::ParseError { message }) => {
                    items.push(ScanItem::Warning(ScanWarning {
                        file: file.clone(),
                        line: marker.line,
                        message,
                    }))
                }
                Err(e) => items.push(ScanItem::Warning(ScanWarning {
                    file: file.clone(),
                    line: marker.line,
                    message: e.to_string(),
                })),
            }
        }

        for line in scan.unterminated {
            items.push(ScanItem::Warning(ScanWarning {
                file: file.clone(),
                line,
                message: "card marker is never closed, skipped".to_string(),
            }));
        }

        items
    }

    /// Collects every document, keeping one card per Anki tag.
    ///
    /// A repeated identifier keeps its last definition, or its first one
    /// with `check_duplicates`. Distinct identifiers that reduce to the same
    /// tag would share a note, so the later one is always left out.
    pub fn scan(&self) -> ScanReport {
        let mut report = ScanReport::default();
        let mut cards: Vec<Card> = Vec::new();
        let mut by_tag: HashMap<String, usize> = HashMap::new();
        let mut dropped: HashSet<usize> = HashSet::new();

        for item in self.iter() {
            match item {
                ScanItem::Card(card) => {
                    let tag = card.tag();
                    let index = cards.len();
                    let Some(&kept) = by_tag.get(&tag) else {
                        by_tag.insert(tag, index);
                        cards.push(card);
                        continue;
                    };

                    let earlier = &cards[kept];
                    let (message, replaces) = if earlier.id != card.id {
                        (
                            format!(
                                "card id '{}' maps to the same Anki tag '{}' as card id '{}' ({}:{}), skipped",
                                card.id, tag, earlier.id, earlier.file, earlier.line
                            ),
                            false,
                        )
                    } else if self.settings.check_duplicates {
                        (
                            format!(
                                "duplicate card id '{}' (first defined at {}:{}), skipped",
                                card.id, earlier.file, earlier.line
                            ),
                            false,
                        )
                    } else {
                        (
                            format!(
                                "card id '{}' is also defined at {}:{}; this definition overwrites it",
                                card.id, earlier.file, earlier.line
                            ),
                            true,
                        )
                    };
                    report.warnings.push(ScanWarning {
                        file: card.file.clone(),
                        line: card.line,
                        message,
                    });

                    if replaces {
                        dropped.insert(kept);
                        by_tag.insert(tag, index);
                    } else {
                        dropped.insert(index);
                    }
                    cards.push(card);
                }
                ScanItem::Empty(card) => report.empty.push(card),
                ScanItem::Warning(warning) => report.warnings.push(warning),
            }
        }

        for (index, card) in cards.into_iter().enumerate() {
            if dropped.contains(&index) {
                report.duplicates.push(card);
            } else {
                report.cards.push(card);
            }
        }
        report
    }
}
