/// chatsync replay - run a sync script against in-memory collaborators
use chatsync_core::replay::{self, ReplayScript};
use chatsync_core::Config;
use colored::*;
use std::env;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, the snapshot to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let bin = args.first().map(|s| s.as_str()).unwrap_or("chatsync-replay");
    let Some(script_path) = args.get(1) else {
        eprintln!(
            "{}",
            format!(
                "Usage: {} <script.json> [--typing-quiet-ms N] [--dedup-capacity N] [--legacy-reconcile] [--update-buffer N] [--data-dir DIR]",
                bin
            )
            .yellow()
        );
        return Ok(());
    };

    let config = Config::from_flags(&args[2..])
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let script = ReplayScript::from_file(Path::new(script_path))
        .map_err(|e| anyhow::anyhow!("Cannot load {}: {}", script_path, e))?;
    info!(
        "Replaying {} steps for {} ({:?} reconcile)",
        script.steps.len(),
        script.user_id,
        config.reconcile_mode
    );

    let outcome = replay::run_script(script, config)
        .await
        .map_err(|e| anyhow::anyhow!("Replay error: {}", e))?;

    println!("{}", serde_json::to_string_pretty(&outcome.snapshot)?);
    eprint!("{}", replay::render_summary(&outcome));
    Ok(())
}
