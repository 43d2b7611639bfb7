use super::progress::is_interactive;
use super::prompts;
use super::session::Settings;
use super::GlobalOpts;
use crate::output::Output;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde_json::json;

/// `clear`: empty every table of the movie store.
pub async fn run_clear(force: bool, opts: &GlobalOpts, output: &Output) -> Result<()> {
    let settings = Settings::load(opts)?;
    let db_path = settings.paths.database_file(&settings.config);
    if !db_path.exists() {
        output.info(format!("No movie store at {}, nothing to clear", db_path.display()));
        return Ok(());
    }

    if !force {
        if !is_interactive() {
            return Err(eyre!("Refusing to clear {} without --force", db_path.display()));
        }
        let question = format!("Delete all movies, credits and change history in {}?", db_path.display());
        if !prompts::prompt_yes_no(&question, false)? {
            output.info("Aborted, nothing was deleted");
            return Ok(());
        }
    }

    let store = settings.open_store()?;
    let removed = store.clear().wrap_err("Failed to clear the movie store")?;
    tracing::info!(operation = "clear", movies = removed.movies, "Movie store cleared");

    if output.is_human() {
        output.success(format!(
            "Cleared {} movies, {} people, {} credits, {} keywords and {} change records",
            removed.movies, removed.people, removed.credits, removed.keywords, removed.changes
        ));
    } else {
        output.json(&json!({ "success": true, "removed": removed }));
    }
    Ok(())
}
