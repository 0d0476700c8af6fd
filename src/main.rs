use clap::Parser;
use typ2anki::config::toml_config::FileConfig;
use typ2anki::utils::logger;
use typ2anki::{
    AnkiConnectClient, CliArgs, Project, Result, Settings, SyncEngine, TypstCompiler,
};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let exit_code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(
                "❌ typ2anki failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 {}", e.recovery_suggestion());
            e.severity().exit_code()
        }
    };

    std::process::exit(exit_code);
}

/// Runs the whole sync and returns the process exit code. The project, and
/// with it any extracted archive, is dropped before the process exits.
async fn run(args: CliArgs) -> Result<i32> {
    let project = Project::open(args.project_path())?;
    let overrides = args.overrides();
    let file = FileConfig::load_for_project(project.root(), overrides.config_file.as_deref())?;
    let (config_path, file_config) = match file {
        Some((path, config)) => (Some(path), Some(config)),
        None => (None, None),
    };
    let unknown_keys: Vec<String> = file_config
        .as_ref()
        .map(|c| c.unknown.keys().cloned().collect())
        .unwrap_or_default();

    let settings = Settings::resolve(args.project_path(), file_config, overrides)?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&settings.report())?);
        return Ok(0);
    }

    logger::init_cli_logger(settings.verbose);
    tracing::info!("🚀 Starting typ2anki on {}", project.requested().display());
    if let Some(path) = &config_path {
        tracing::debug!("Loaded configuration from {}", path.display());
    }
    for key in &unknown_keys {
        tracing::warn!("⚠️ Ignoring unknown configuration key '{}'", key);
    }
    if project.is_archive() {
        tracing::debug!("Archive extracted to {}", project.root().display());
    }

    let compiler = TypstCompiler::new(project.root(), &settings)?;
    let client = AnkiConnectClient::from_settings(&settings)?;
    tracing::debug!("Using AnkiConnect at {}", client.endpoint());
    let engine = SyncEngine::new(compiler, client, settings);

    let abort = engine.abort_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
            if abort.is_forced() {
                tracing::warn!("⚠️ Interrupted again, stopping now");
                break;
            }
            tracing::warn!("⚠️ Interrupted, stopping after the current card (press Ctrl-C again to stop now)");
        }
    });

    let summary = engine.run(&project).await?;
    print!("{}", summary.render());
    Ok(summary.exit_code())
}
