use super::session::Settings;
use super::summary::styled_table;
use super::GlobalOpts;
use crate::output::Output;
use cinesync_models::ChangeKind;
use color_eyre::eyre::Context;
use color_eyre::Result;
use comfy_table::{Cell, Color};
use serde_json::json;

pub async fn run_history(days: u32, opts: &GlobalOpts, output: &Output) -> Result<()> {
    let settings = Settings::load(opts)?;
    let store = settings.open_store()?;
    let changes = store
        .recent_changes(days)
        .wrap_err("Failed to read change history")?;

    if !output.is_human() {
        output.json(&json!({ "days": days, "changes": changes }));
        return Ok(());
    }
    if changes.is_empty() {
        output.info(format!("No changes in the last {} days", days));
        return Ok(());
    }
    if output.is_quiet() {
        return Ok(());
    }

    let mut table = styled_table();
    table.set_header(vec![
        Cell::new("When (UTC)").fg(Color::Cyan),
        Cell::new("Change").fg(Color::Cyan),
        Cell::new("TMDB ID").fg(Color::Cyan),
        Cell::new("Title").fg(Color::Cyan),
    ]);
    for change in &changes {
        let title = change
            .details
            .as_ref()
            .and_then(|d| d.get("title"))
            .and_then(|t| t.as_str())
            .unwrap_or("");
        let kind = match change.kind {
            ChangeKind::Create => Cell::new("create").fg(Color::Green),
            ChangeKind::Update => Cell::new("update").fg(Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(change.changed_at.format("%Y-%m-%d %H:%M:%S")),
            kind,
            Cell::new(change.tmdb_id),
            Cell::new(title),
        ]);
    }
    println!("{}", table);
    output.info(format!("{} changes in the last {} days", changes.len(), days));
    Ok(())
}
