use super::session::{Requirements, Session};
use super::summary::styled_table;
use super::GlobalOpts;
use crate::output::Output;
use color_eyre::Result;
use comfy_table::{Cell, Color};
use owo_colors::OwoColorize;
use serde_json::json;

pub async fn run_search(query: &str, opts: &GlobalOpts, output: &Output) -> Result<()> {
    let needs = Requirements {
        catalog: true,
        ..Requirements::default()
    };
    let session = Session::open(opts, output, needs)?;
    let hits = session
        .pipeline
        .search(query)
        .await
        .map_err(|e| color_eyre::eyre::eyre!("{:#}", e))?;

    if !output.is_human() {
        output.json(&json!({ "query": query, "results": hits }));
        return Ok(());
    }
    if hits.is_empty() {
        output.warn(format!("No catalog matches for '{}'", query));
        return Ok(());
    }
    if output.is_quiet() {
        return Ok(());
    }

    let mut table = styled_table();
    table.set_header(vec![
        Cell::new("TMDB ID").fg(Color::Cyan),
        Cell::new("Title").fg(Color::Cyan),
        Cell::new("Released").fg(Color::Cyan),
        Cell::new("Rating").fg(Color::Cyan),
        Cell::new("Stored").fg(Color::Cyan),
    ]);
    for hit in &hits {
        let item = &hit.item;
        table.add_row(vec![
            Cell::new(item.id),
            Cell::new(item.title.as_deref().unwrap_or("")),
            Cell::new(item.release_date.map(|d| d.to_string()).unwrap_or_default()),
            Cell::new(item.vote_average.map(|v| format!("{:.1}", v)).unwrap_or_default()),
            Cell::new(if hit.stored { "✓".green().to_string() } else { "✗".red().to_string() }),
        ]);
    }
    println!("{}", table);
    output.info(format!("{} results for '{}'", hits.len(), query));
    Ok(())
}
