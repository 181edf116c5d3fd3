//! Human-readable and JSON rendering of a run report.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use zrebase_core::controller::RunMode;
use zrebase_core::report::RunReport;

use crate::style;

/// Print the per-branch table, the summary and, for dry runs, the commands
/// that were not executed.
pub fn print_report(report: &RunReport) {
    println!();
    println!(
        "{}",
        style::header(&format!(
            "zrebase {} run: {} → {}",
            report.mode, report.source_root, report.dest_root
        ))
    );
    println!();

    if report.branches.is_empty() {
        println!("  {}", style::dim("No candidate branches on the destination."));
    } else {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Branch", "Outcome", "Range", "Detail"]);

        for branch in &report.branches {
            let range = branch
                .range
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "—".to_string());
            table.add_row(vec![
                Cell::new(&branch.branch),
                Cell::new(branch.outcome.to_string()).fg(style::outcome_color(&branch.outcome)),
                Cell::new(range),
                Cell::new(&branch.reason),
            ]);
        }
        println!("{table}");
    }

    let summary = report.summary();
    println!();
    println!(
        "  {} candidate(s): {} rebased, {} failed, {} skipped, {} planned",
        summary.candidates, summary.rebased, summary.failed, summary.skipped, summary.planned
    );

    if report.mode == RunMode::DryRun && !report.planned_commands.is_empty() {
        println!();
        println!("  {}", style::header("Commands not executed (dry run)"));
        for command in &report.planned_commands {
            println!("    {}", style::dim(command));
        }
        println!();
        println!("  {}", style::dim("Re-run with --execute to apply."));
    }

    println!();
    let status = report.final_status();
    if summary.failed > 0 {
        println!("{}", style::error(&format!("finished with status {}", status)));
    } else if report.mode == RunMode::Live {
        println!("{}", style::success("reconciliation complete"));
    } else {
        println!("{}", style::success("nothing was changed"));
    }
}

/// Print the report as one JSON document.
pub fn print_json(report: &RunReport) -> Result<()> {
    let document = serde_json::json!({
        "report": report,
        "summary": report.summary(),
        "final_status": report.final_status(),
    });
    let rendered =
        serde_json::to_string_pretty(&document).context("failed to serialize run report")?;
    println!("{rendered}");
    Ok(())
}
