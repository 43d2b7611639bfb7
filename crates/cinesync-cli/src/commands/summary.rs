use crate::output::Output;
use cinesync_core::RunReport;
use cinesync_sources::ErrorCategory;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use comfy_table::{Cell, Color, Table};

pub fn styled_table() -> Table {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS);
    table
}

/// Print the end-of-run summary. A run stopped by a fatal upstream error is
/// reported and then returned as an error so the exit status reflects it.
pub fn report_run(report: &RunReport, output: &Output) -> Result<()> {
    if output.is_human() {
        print_table(report, output);
    } else {
        output.json(&serde_json::to_value(report).unwrap_or_default());
    }

    if let Some(fatal) = &report.fatal {
        return Err(eyre!("{} stopped early: {}", report.operation, fatal));
    }
    if report.cancelled {
        output.warn(format!("{} interrupted; finished batches were kept", report.operation));
    } else if report.failures.is_clean() {
        output.success(format!("{} completed in {:.1}s", report.operation, report.duration_secs));
    } else {
        output.warn(format!(
            "{} completed with {} failures and {} rejected candidates",
            report.operation,
            report.failures.failures(),
            report.failures.rejected
        ));
    }
    Ok(())
}

fn print_table(report: &RunReport, output: &Output) {
    if output.is_quiet() {
        return;
    }

    let mut table = styled_table();
    table.set_header(vec![
        Cell::new(format!("Run: {}", report.operation)).fg(Color::Cyan),
        Cell::new("Count").fg(Color::Cyan),
    ]);
    table.add_row(vec![Cell::new("Candidates"), Cell::new(report.candidates)]);
    table.add_row(vec![Cell::new("Created"), Cell::new(report.created).fg(Color::Green)]);
    table.add_row(vec![Cell::new("Updated"), Cell::new(report.updated).fg(Color::Green)]);
    table.add_row(vec![Cell::new("Skipped"), Cell::new(report.skipped)]);
    if report.fetched > 0 {
        table.add_row(vec![Cell::new("Written to batch files"), Cell::new(report.fetched)]);
    }
    for category in ErrorCategory::ALL {
        let count = report.failures.get(category);
        let cell = Cell::new(count);
        table.add_row(vec![
            Cell::new(format!("Failed ({})", category)),
            if count > 0 { cell.fg(Color::Red) } else { cell },
        ]);
    }
    table.add_row(vec![Cell::new("Rejected (no external ID)"), Cell::new(report.failures.rejected)]);
    table.add_row(vec![Cell::new("Duration"), Cell::new(format!("{:.1}s", report.duration_secs))]);
    println!("{}", table);

    for path in &report.files {
        output.info(format!("  {}", path.display()));
    }
}
