use chrono::Local;
use comfy_table::modifiers::{UTF8_ROUND_CORNERS, UTF8_SOLID_INNER_BORDERS};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};

use codictate_backup::{
    ExportReport, LastOperation, OperationStatus, Outcome, PreflightReport, ReconcileReport,
    RestoreReport, SafetyBackup, SessionMarker, Severity, format_bytes,
};
use codictate_model::ComponentKind;

pub fn print_export(report: &ExportReport) {
    if let Some(recovered) = &report.recovered {
        print_reconcile(Some(recovered));
    }
    println!("Archive: {}", report.path.display());
    let mut table = counts_table(&["Component", "Exported"]);
    for kind in ComponentKind::ALL {
        table.add_row(vec![
            Cell::new(kind.to_string()),
            Cell::new(report.manifest.count(kind)),
        ]);
    }
    table.add_row(vec![
        total_cell("Size"),
        Cell::new(format_bytes(report.size_bytes)).add_attribute(Attribute::Bold),
    ]);
    println!("{table}");
    print_warnings(&report.warnings);
    println!("{}", report.summary());
}

pub fn print_restore(report: &RestoreReport, verbose: bool) {
    if let Some(recovered) = &report.recovered {
        print_reconcile(Some(recovered));
    }
    println!("Archive: {}", report.archive.display());
    let c = &report.counts;
    let mut table = counts_table(&["Component", "Restored", "Skipped", "Notes"]);
    table.add_row(vec![
        Cell::new("history"),
        Cell::new(c.history_restored),
        count_cell(c.history_skipped, Color::Yellow),
        note_cell(c.ids_rekeyed, "id(s) reassigned"),
    ]);
    table.add_row(vec![
        Cell::new("dictionary"),
        Cell::new(c.dictionary_added),
        count_cell(c.dictionary_skipped, Color::Yellow),
        note_cell(c.dictionary_duplicates, "duplicate(s) merged"),
    ]);
    table.add_row(vec![
        Cell::new("settings"),
        Cell::new(c.settings_applied),
        dim_cell("-"),
        note_cell(c.settings_dropped, "field(s) ignored"),
    ]);
    table.add_row(vec![
        Cell::new("recordings"),
        Cell::new(c.recordings_restored),
        count_cell(c.recordings_missing, Color::Yellow),
        note_cell(c.recordings_renamed, "renamed"),
    ]);
    println!("{table}");
    println!(
        "Statistics recomputed: {} words in {} transcriptions.",
        report.stats.total_words, report.stats.total_transcriptions
    );
    match (&report.safety_backup, report.safety_backup_kept) {
        (Some(path), true) => println!("Safety backup kept: {}", path.display()),
        (Some(_), false) => println!("Safety backup discarded."),
        (None, _) => {}
    }
    print_warnings(&report.warnings);
    if verbose && !report.details.is_empty() {
        println!("Details:");
        for line in &report.details {
            println!("  {line}");
        }
    }
    println!("{}", report.summary());
}

pub fn print_preflight(report: &PreflightReport) {
    println!("Archive: {}", report.archive.display());
    if let Some(manifest) = &report.manifest {
        println!(
            "Format {} from Codictate {}, {} backup created {}.",
            manifest.backup_format_version,
            manifest.created_with_app_version,
            manifest.scope,
            manifest.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        );
    }
    println!(
        "{} entries, {} uncompressed, {} history rows.",
        report.entry_count,
        format_bytes(report.total_uncompressed),
        report.history_rows
    );
    if report.findings.is_empty() {
        println!("No problems found.");
        return;
    }
    let mut table = styled_table(vec![header_cell("Severity"), header_cell("Finding")]);
    align_column(&mut table, 0, CellAlignment::Center);
    for finding in &report.findings {
        let severity = match finding.severity {
            Severity::Blocking => Cell::new("BLOCKING")
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
            Severity::Recoverable => Cell::new("CONFIRM").fg(Color::Yellow),
        };
        table.add_row(vec![severity, Cell::new(finding.error.user_message())]);
    }
    println!("{table}");
}

pub fn print_status(
    running: &OperationStatus,
    pending: Option<&SessionMarker>,
    last: Option<&LastOperation>,
    recovery: Option<&ReconcileReport>,
) {
    match (&running.operation, &running.progress) {
        (Some(kind), Some(progress)) => println!(
            "Running: {kind} ({}, {:.0}%)",
            progress.phase,
            progress.fraction() * 100.0
        ),
        (Some(kind), None) => println!("Running: {kind}"),
        (None, _) => {}
    }
    if let Some(marker) = pending {
        println!(
            "Interrupted restore of {} during {} (started {}). Run `recover` to resolve it.",
            marker.archive.display(),
            marker.phase,
            marker.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        );
    }
    let Some(last) = last else {
        if pending.is_none() {
            println!("No backup operation has run yet.");
        }
        return;
    };
    let result = if last.success {
        Cell::new("succeeded").fg(Color::Green)
    } else {
        Cell::new("failed").fg(Color::Red).add_attribute(Attribute::Bold)
    };
    let mut table = styled_table(vec![header_cell("Last operation"), header_cell("")]);
    table.add_row(vec![Cell::new("Kind"), Cell::new(last.kind.to_string())]);
    table.add_row(vec![Cell::new("Result"), result]);
    table.add_row(vec![
        Cell::new("Finished"),
        Cell::new(last.finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")),
    ]);
    table.add_row(vec![Cell::new("Summary"), Cell::new(&last.summary)]);
    if let Some(category) = &last.category {
        table.add_row(vec![Cell::new("Category"), Cell::new(category.to_string())]);
    }
    if let Some(guidance) = &last.guidance {
        table.add_row(vec![Cell::new("Next step"), Cell::new(guidance)]);
    }
    println!("{table}");
    if let Some(recovery) = recovery {
        println!(
            "Last recovery {}: restore of {} interrupted during {}.",
            recovery.resolved_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            recovery.archive.display(),
            recovery.interrupted_phase
        );
    }
}

pub fn print_reconcile(report: Option<&ReconcileReport>) {
    let Some(report) = report else {
        println!("Nothing to recover.");
        return;
    };
    let outcome = match report.outcome {
        Outcome::Restored => "completed",
        Outcome::RolledBack => "rolled back",
    };
    println!(
        "Interrupted restore ({}) {outcome}: {:?}.",
        report.interrupted_phase, report.action
    );
    println!("{}", report.guidance);
}

pub fn print_safety_list(backups: &[SafetyBackup]) {
    if backups.is_empty() {
        println!("No safety backups.");
        return;
    }
    let mut table = styled_table(vec![
        header_cell("Name"),
        header_cell("Created"),
        header_cell("Scope"),
        header_cell("Size"),
        header_cell("Kept"),
    ]);
    align_column(&mut table, 3, CellAlignment::Right);
    align_column(&mut table, 4, CellAlignment::Center);
    for backup in backups {
        let kept = if backup.user_saved {
            Cell::new("✓").fg(Color::Green).add_attribute(Attribute::Bold)
        } else {
            dim_cell("-")
        };
        table.add_row(vec![
            Cell::new(&backup.file_name),
            Cell::new(backup.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")),
            Cell::new(backup.scope.to_string()),
            Cell::new(format_bytes(backup.size_bytes)),
            kept,
        ]);
    }
    println!("{table}");
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    eprintln!("Warnings:");
    for warning in warnings {
        eprintln!("- {warning}");
    }
}

fn counts_table(headers: &[&str]) -> Table {
    let mut table = styled_table(headers.iter().map(|h| header_cell(h)).collect());
    for index in 1..headers.len() {
        align_column(&mut table, index, CellAlignment::Right);
    }
    table
}

fn styled_table(header: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table.set_header(header);
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .apply_modifier(UTF8_SOLID_INNER_BORDERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_width(120);
    table
}

fn align_column(table: &mut Table, index: usize, alignment: CellAlignment) {
    if let Some(column) = table.column_mut(index) {
        column.set_cell_alignment(alignment);
    }
}

fn header_cell(label: &str) -> Cell {
    Cell::new(label)
        .fg(Color::Cyan)
        .add_attribute(Attribute::Bold)
}

fn total_cell(label: &str) -> Cell {
    Cell::new(label)
        .fg(Color::Cyan)
        .add_attribute(Attribute::Bold)
}

fn count_cell(count: u64, color: Color) -> Cell {
    if count > 0 {
        Cell::new(count).fg(color).add_attribute(Attribute::Bold)
    } else {
        dim_cell(count)
    }
}

fn note_cell(count: u64, label: &str) -> Cell {
    if count > 0 {
        Cell::new(format!("{count} {label}"))
    } else {
        dim_cell("-")
    }
}

fn dim_cell<T: ToString>(value: T) -> Cell {
    Cell::new(value).fg(Color::DarkGrey)
}
