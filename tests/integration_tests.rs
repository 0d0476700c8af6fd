use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use typ2anki::core::cache::CacheEntry;
use typ2anki::domain::model::{Card, MediaFile, RenderedCard, Stage, SyncOutcome};
use typ2anki::domain::ports::{CardRenderer, CardStore};
use typ2anki::{
    AnkiConnectClient, CardScanner, Overrides, Project, Result, Settings, SyncEngine,
    Typ2AnkiError,
};

const A_TYP: &str = r#"= Arithmetic

#card(
  id: "1",
  target-deck: "Math",
  q: [2+2],
  a: [4],
)
"#;

const B_TYP: &str = r#"#card(id: "2", target-deck: "Math", q: [3+3], a: [6])
"#;

/// Renders without typst: the images only carry the card's content hash.
#[derive(Clone, Default)]
struct StubRenderer {
    failing_ids: Vec<String>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CardRenderer for StubRenderer {
    async fn render(&self, card: &Card) -> Result<RenderedCard> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_ids.contains(&card.id) {
            return Err(Typ2AnkiError::compile(&card.id, "error: unknown variable: foo"));
        }
        let media = |page: u32| MediaFile {
            filename: format!("typ-{}-{}.png", card.safe_id(), page),
            data: card.content_hash.as_bytes().to_vec(),
        };
        Ok(RenderedCard {
            front: media(1),
            back: media(2),
        })
    }
}

#[derive(Debug, Clone)]
struct StoredNote {
    tag: String,
    deck: String,
    front: Vec<u8>,
}

#[derive(Debug, Default)]
struct AnkiState {
    decks: Vec<String>,
    notes: Vec<StoredNote>,
    cache: Option<String>,
    pings: usize,
}

/// Keeps decks, notes and the cache file in memory, matching notes by tag.
#[derive(Clone, Default)]
struct MemoryStore {
    state: Arc<Mutex<AnkiState>>,
}

impl MemoryStore {
    fn with_decks(decks: &[&str]) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().decks = decks.iter().map(|d| d.to_string()).collect();
        store
    }

    fn notes(&self) -> Vec<StoredNote> {
        self.state.lock().unwrap().notes.clone()
    }

    fn cache(&self) -> BTreeMap<String, CacheEntry> {
        let state = self.state.lock().unwrap();
        state
            .cache
            .as_deref()
            .map(|c| serde_json::from_str(c).unwrap())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CardStore for MemoryStore {
    async fn ping(&self) -> Result<u64> {
        self.state.lock().unwrap().pings += 1;
        Ok(6)
    }

    async fn deck_names(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().decks.clone())
    }

    async fn ensure_deck(&self, deck: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.decks.iter().any(|d| d == deck) {
            state.decks.push(deck.to_string());
        }
        Ok(())
    }

    async fn upsert_card(
        &self,
        card: &Card,
        deck: &str,
        rendered: &RenderedCard,
    ) -> Result<SyncOutcome> {
        let mut state = self.state.lock().unwrap();
        let tag = card.tag();
        if let Some(note) = state.notes.iter_mut().find(|n| n.tag == tag) {
            note.front = rendered.front.data.clone();
            return Ok(SyncOutcome::Updated);
        }
        state.notes.push(StoredNote {
            tag,
            deck: deck.to_string(),
            front: rendered.front.data.clone(),
        });
        Ok(SyncOutcome::Created)
    }

    async fn load_cache(&self) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().cache.clone())
    }

    async fn save_cache(&self, contents: &str) -> Result<()> {
        self.state.lock().unwrap().cache = Some(contents.to_string());
        Ok(())
    }
}

/// Never finishes a render; only a forced stop ends the run.
struct HangingRenderer;

#[async_trait]
impl CardRenderer for HangingRenderer {
    async fn render(&self, _card: &Card) -> Result<RenderedCard> {
        std::future::pending().await
    }
}

/// Records how many renders overlap.
#[derive(Clone, Default)]
struct TrackingRenderer {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl CardRenderer for TrackingRenderer {
    async fn render(&self, card: &Card) -> Result<RenderedCard> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        StubRenderer::default().render(card).await
    }
}

fn write(root: &Path, name: &str, content: &str) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn example_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.typ", A_TYP);
    write(dir.path(), "b.typ", B_TYP);
    dir
}

fn settings(root: &Path, overrides: Overrides) -> Settings {
    Settings::resolve(root.display().to_string(), None, overrides).unwrap()
}

fn engine(
    root: &Path,
    overrides: Overrides,
    store: &MemoryStore,
) -> SyncEngine<StubRenderer, MemoryStore> {
    SyncEngine::new(
        StubRenderer::default(),
        store.clone(),
        settings(root, overrides),
    )
}

#[tokio::test]
async fn test_sync_creates_cards_in_their_deck() {
    let dir = example_project();
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();

    let summary = engine(dir.path(), Overrides::default(), &store)
        .run(&project)
        .await
        .unwrap();

    assert_eq!(summary.created, 2);
    assert_eq!(summary.failed(), 0);
    assert_eq!(summary.exit_code(), 0);
    assert!(project.ankiconf_path().is_file());

    let notes = store.notes();
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().all(|n| n.deck == "Math"));
    assert!(store.state.lock().unwrap().decks.contains(&"Math".to_string()));

    let cache = store.cache();
    assert!(cache.contains_key("Math_1"));
    assert!(cache.contains_key("Math_2"));

    let rendered = summary.render();
    assert!(rendered.contains("a.typ +1 ↑0 ☓0 ↷0"));
    assert!(rendered.contains("b.typ +1 ↑0 ☓0 ↷0"));
}

#[tokio::test]
async fn test_duplicate_id_last_definition_wins() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.typ", r#"#card(id: "1", target-deck: "Math", q: [old], a: [x])"#);
    write(dir.path(), "b.typ", r#"#card(id: "1", target-deck: "Math", q: [new], a: [x])"#);
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();

    let summary = engine(dir.path(), Overrides::default(), &store)
        .run(&project)
        .await
        .unwrap();

    assert_eq!(summary.created, 1);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.files["a.typ"].skipped, 1);

    let scan_settings = settings(dir.path(), Overrides::default());
    let cards = CardScanner::new(project.root(), &scan_settings).scan().cards;
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].file, "b.typ");
    let notes = store.notes();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].front, cards[0].content_hash.as_bytes());
}

#[tokio::test]
async fn test_duplicate_id_keeps_last_definition_across_runs() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.typ", r#"#card(id: "1", target-deck: "Math", q: [old], a: [x])"#);
    write(dir.path(), "b.typ", r#"#card(id: "1", target-deck: "Math", q: [new], a: [x])"#);
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();
    let engine = engine(dir.path(), Overrides::default(), &store);

    let scan_settings = settings(dir.path(), Overrides::default());
    let last = CardScanner::new(project.root(), &scan_settings).scan().cards[0].clone();
    assert_eq!(last.question, "[new]");

    for run in 1..=4 {
        let summary = engine.run(&project).await.unwrap();
        let notes = store.notes();
        assert_eq!(notes.len(), 1, "run {}", run);
        assert_eq!(notes[0].front, last.content_hash.as_bytes(), "run {}", run);
        if run > 1 {
            assert_eq!(summary.created + summary.updated, 0, "run {}", run);
            assert_eq!(summary.skipped, 2, "run {}", run);
        }
    }
}

#[tokio::test]
async fn test_ids_sharing_a_tag_are_not_merged() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "a.typ",
        "#card(id: \"set 1\", q: [first], a: [x])\n#card(id: \"set_1\", q: [second], a: [x])\n",
    );
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();

    let summary = engine(dir.path(), Overrides::default(), &store)
        .run(&project)
        .await
        .unwrap();

    assert_eq!(summary.created, 1);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.files["a.typ"].skipped, 1);
    assert_eq!(summary.warnings.len(), 1);
    assert!(summary.warnings[0].contains("card id 'set_1' maps to the same Anki tag"));

    let scan_settings = settings(dir.path(), Overrides::default());
    let kept = CardScanner::new(project.root(), &scan_settings).scan().cards;
    let notes = store.notes();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].front, kept[0].content_hash.as_bytes());
    assert_eq!(kept[0].id, "set 1");
}

#[tokio::test]
async fn test_check_duplicates_skips_later_definition() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.typ", r#"#card(id: "1", q: [first], a: [x])"#);
    write(dir.path(), "b.typ", r#"#card(id: "1", q: [second], a: [x])"#);
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();

    let summary = engine(
        dir.path(),
        Overrides {
            check_duplicates: true,
            ..Overrides::default()
        },
        &store,
    )
    .run(&project)
    .await
    .unwrap();

    assert_eq!(summary.created, 1);
    assert_eq!(summary.updated, 0);
    assert!(summary.warnings[0].contains("duplicate card id '1'"));
    assert_eq!(store.notes()[0].deck, "Default");
}

#[tokio::test]
async fn test_unreachable_anki_fails_every_card() {
    let dir = example_project();
    let project = Project::open(dir.path()).unwrap();
    let renderer = StubRenderer::default();
    let calls = renderer.calls.clone();
    let client = AnkiConnectClient::new(
        "http://127.0.0.1:1",
        2,
        Duration::from_millis(0),
        Duration::from_secs(2),
    )
    .unwrap();

    let summary = SyncEngine::new(
        renderer,
        client,
        settings(dir.path(), Overrides::default()),
    )
    .run(&project)
    .await
    .unwrap();

    assert_eq!(summary.failed(), 2);
    assert!(summary.failures.iter().all(|f| f.stage == Stage::Sync));
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_compile_failure_is_isolated() {
    let dir = example_project();
    write(dir.path(), "c.typ", r#"#card(id: "3", target-deck: "Math", q: [#foo], a: [x])"#);
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();
    let renderer = StubRenderer {
        failing_ids: vec!["3".to_string()],
        ..StubRenderer::default()
    };

    let summary = SyncEngine::new(
        renderer,
        store.clone(),
        settings(dir.path(), Overrides::default()),
    )
    .run(&project)
    .await
    .unwrap();

    assert_eq!(summary.created, 2);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.failures[0].card_id, "3");
    assert_eq!(summary.failures[0].stage, Stage::Compile);
    assert!(summary.failures[0].message.contains("unknown variable"));
    assert_eq!(summary.exit_code(), 1);
    assert!(!store.cache().contains_key("Math_3"));
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let dir = example_project();
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();
    let renderer = StubRenderer::default();
    let calls = renderer.calls.clone();

    let summary = SyncEngine::new(
        renderer,
        store.clone(),
        settings(
            dir.path(),
            Overrides {
                dry_run: true,
                ..Overrides::default()
            },
        ),
    )
    .run(&project)
    .await
    .unwrap();

    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.state.lock().unwrap().pings, 0);
    assert!(store.state.lock().unwrap().cache.is_none());
    assert!(!project.ankiconf_path().exists());
}

#[tokio::test]
async fn test_unchanged_cards_are_skipped_on_the_next_run() {
    let dir = example_project();
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();
    let renderer = StubRenderer::default();
    let calls = renderer.calls.clone();
    let engine = SyncEngine::new(
        renderer,
        store.clone(),
        settings(dir.path(), Overrides::default()),
    );

    engine.run(&project).await.unwrap();
    let second = engine.run(&project).await.unwrap();
    assert_eq!(second.skipped, 2);
    assert_eq!(second.created + second.updated, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    write(dir.path(), "b.typ", r#"#card(id: "2", target-deck: "Math", q: [3+3], a: [six])"#);
    let third = engine.run(&project).await.unwrap();
    assert_eq!(third.updated, 1);
    assert_eq!(third.skipped, 1);

    write(dir.path(), "ankiconf.typ", "#let conf(doc) = { set text(size: 14pt); doc }\n");
    let fourth = engine.run(&project).await.unwrap();
    assert_eq!(fourth.updated, 2);
}

#[tokio::test]
async fn test_no_cache_pushes_every_card() {
    let dir = example_project();
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();

    engine(dir.path(), Overrides::default(), &store)
        .run(&project)
        .await
        .unwrap();
    let summary = engine(
        dir.path(),
        Overrides {
            no_cache: true,
            ..Overrides::default()
        },
        &store,
    )
    .run(&project)
    .await
    .unwrap();

    assert_eq!(summary.updated, 2);
}

#[tokio::test]
async fn test_abort_stops_between_cards_and_keeps_cache() {
    let dir = example_project();
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();
    let engine = engine(dir.path(), Overrides::default(), &store);

    engine.abort_handle().abort();
    let summary = engine.run(&project).await.unwrap();

    assert!(summary.aborted);
    assert_eq!(summary.exit_code(), 130);
    assert_eq!(summary.created, 0);
    assert!(store.state.lock().unwrap().cache.is_some());
    assert!(summary.render().contains("aborted"));
}

#[tokio::test]
async fn test_second_abort_stops_a_hanging_render() {
    let dir = example_project();
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();
    let engine = SyncEngine::new(
        HangingRenderer,
        store.clone(),
        settings(dir.path(), Overrides::default()),
    );

    let abort = engine.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        abort.abort();
        abort.abort();
    });
    let summary = tokio::time::timeout(Duration::from_secs(5), engine.run(&project))
        .await
        .expect("a forced stop ends the run")
        .unwrap();

    assert!(summary.aborted);
    assert_eq!(summary.exit_code(), 130);
    assert_eq!(summary.created, 0);
    assert!(store.state.lock().unwrap().cache.is_none());
}

#[tokio::test]
async fn test_generation_concurrency_bounds_renders_and_keeps_order() {
    let dir = TempDir::new().unwrap();
    let cards: String = (1..=6)
        .map(|i| format!("#card(id: \"{}\", q: [{}], a: [x])\n", i, i))
        .collect();
    write(dir.path(), "a.typ", &cards);
    let project = Project::open(dir.path()).unwrap();

    for concurrency in [1, 3] {
        let store = MemoryStore::default();
        let renderer = TrackingRenderer::default();
        let peak = renderer.peak.clone();
        let summary = SyncEngine::new(
            renderer,
            store.clone(),
            settings(
                dir.path(),
                Overrides {
                    generation_concurrency: Some(concurrency),
                    ..Overrides::default()
                },
            ),
        )
        .run(&project)
        .await
        .unwrap();

        assert_eq!(summary.created, 6);
        assert_eq!(peak.load(Ordering::SeqCst), concurrency);
        let tags: Vec<String> = store.notes().into_iter().map(|n| n.tag).collect();
        assert_eq!(tags, vec!["1", "2", "3", "4", "5", "6"]);
    }
}

#[tokio::test]
async fn test_existing_nested_deck_is_reused() {
    let dir = example_project();
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::with_decks(&["Default", "School::Math"]);

    engine(dir.path(), Overrides::default(), &store)
        .run(&project)
        .await
        .unwrap();

    assert!(store.notes().iter().all(|n| n.deck == "School::Math"));
    assert_eq!(store.state.lock().unwrap().decks.len(), 2);
}

#[tokio::test]
async fn test_excluded_deck_and_empty_cards_are_not_synced() {
    let dir = example_project();
    write(
        dir.path(),
        "c.typ",
        "#card(id: \"draft\", target-deck: \"Drafts\", q: [x], a: [y])\n#card(id: \"blank\", q: [], a: [])\n",
    );
    let project = Project::open(dir.path()).unwrap();
    let store = MemoryStore::default();

    let summary = engine(
        dir.path(),
        Overrides {
            exclude_decks: vec!["Drafts".to_string()],
            ..Overrides::default()
        },
        &store,
    )
    .run(&project)
    .await
    .unwrap();

    assert_eq!(summary.created, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.files["c.typ"].skipped, 1);
    assert_eq!(store.notes().len(), 2);
}

fn write_zip(path: &Path, files: &[(&str, &str)]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, content) in files {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

#[tokio::test]
async fn test_archive_and_directory_yield_the_same_cards() {
    let dir = example_project();
    let archive_dir = TempDir::new().unwrap();
    let archive = archive_dir.path().join("notes.zip");
    write_zip(&archive, &[("notes/a.typ", A_TYP), ("notes/b.typ", B_TYP)]);

    let from_dir = Project::open(dir.path()).unwrap();
    let from_zip = Project::open(&archive).unwrap();
    let scan_settings = settings(dir.path(), Overrides::default());

    let ids = |project: &Project| -> Vec<(String, String, String)> {
        CardScanner::new(project.root(), &scan_settings)
            .scan()
            .cards
            .into_iter()
            .map(|c| (c.id, c.deck, c.file))
            .collect()
    };
    assert_eq!(ids(&from_dir), ids(&from_zip));

    let store = MemoryStore::default();
    let summary = engine(dir.path(), Overrides::default(), &store)
        .run(&from_zip)
        .await
        .unwrap();
    assert_eq!(summary.created, 2);

    let extracted = from_zip.root().to_path_buf();
    drop(from_zip);
    assert!(!extracted.exists());
}
