//! CLI smoke entry point.
//!
//! # Responsibility
//! - Exercise `codex_core` end to end against a real store.
//! - Keep output deterministic for quick local sanity checks.
//!
//! Usage: `codex_cli [db_path] [story_id]`. Without `db_path` an in-memory
//! store is used. Set `CODEX_LOG_DIR` to an absolute path to enable logging.

use codex_core::{
    CodexRepository, DocumentStore, MemoryDocumentStore, NewEntry, RepositoryConfig,
    SqliteDocumentStore,
};
use log::info;
use std::error::Error;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let db_path = args.next();
    let story_id = args.next().unwrap_or_else(|| "demo".to_string());

    if let Ok(log_dir) = std::env::var("CODEX_LOG_DIR") {
        codex_core::init_logging(codex_core::default_log_level(), &log_dir)?;
    }

    let store: Arc<dyn DocumentStore> = match db_path.as_deref() {
        Some(path) => Arc::new(SqliteDocumentStore::open(path)?),
        None => Arc::new(MemoryDocumentStore::new()),
    };
    let repo = CodexRepository::new(store, RepositoryConfig::default());

    repo.load_all().await?;
    let codex = repo.get_or_create_codex(&story_id).await?;
    if codex.entry_count() == 0 {
        if let Some(first) = codex.categories.first() {
            repo.add_entry(
                &story_id,
                &first.id,
                NewEntry {
                    title: "Sample".to_string(),
                    ..NewEntry::default()
                },
            )
            .await?;
        }
    }

    println!(
        "codex_core version={} stories={}",
        codex_core::core_version(),
        repo.channel().snapshot().len()
    );
    for group in repo.get_all_codex_entries(&story_id) {
        println!("{} ({})", group.category, group.entries.len());
        for entry in group.entries {
            println!("  {}. {}", entry.order, entry.title);
        }
    }
    info!("event=cli_run module=cli status=ok story_id={story_id}");
    Ok(())
}
