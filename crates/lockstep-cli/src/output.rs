use anyhow::{Context, Result};
use lockstep_db::{LockHolder, LockState, MigrationStatus, RunReport};
use serde::Serialize;

const WIDTH: usize = 60;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}

fn rule(title: &str) -> String {
    let dashes = WIDTH.saturating_sub(title.len() + 5);
    format!("─── {title} {}", "─".repeat(dashes))
}

fn holder_line(holder: &LockHolder) -> String {
    let id = holder.id.as_deref().unwrap_or("unknown holder");
    match holder.locked_at {
        Some(at) => format!("held by {id} since {}", at.to_rfc3339()),
        None => format!("held by {id}"),
    }
}

pub fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    if report.applied.is_empty() {
        println!("nothing to apply ({} already applied)", report.skipped.len());
        return Ok(());
    }
    println!("{}", rule("Applied"));
    for version in &report.applied {
        println!("  {version}");
    }
    println!(
        "{} applied, {} already applied",
        report.applied.len(),
        report.skipped.len()
    );
    Ok(())
}

pub fn print_status(status: &MigrationStatus, json: bool) -> Result<()> {
    if json {
        return print_json(status);
    }

    let lock = match &status.lock {
        LockState::Unlocked => "unlocked".to_string(),
        LockState::Locked(holder) => holder_line(holder),
    };
    println!("{}", rule("Lock"));
    println!("  {lock}");

    println!("{}", rule(&format!("Applied ({})", status.applied.len())));
    for applied in &status.applied {
        println!(
            "  {:<40} {}",
            applied.version,
            applied.applied_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("{}", rule(&format!("Pending ({})", status.pending.len())));
    for version in &status.pending {
        println!("  {version}");
    }
    Ok(())
}

pub fn print_unlock(previous: Option<&LockHolder>, json: bool) -> Result<()> {
    if json {
        return print_json(&previous);
    }
    match previous {
        Some(holder) => println!("lock cleared (was {})", holder_line(holder)),
        None => println!("lock was not held"),
    }
    Ok(())
}
