// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `micart list` command - List containers under the state root.

use micart_core::StateRecord;

use super::RuntimeContext;
use crate::ListFormat;

pub async fn execute(
    ctx: &RuntimeContext,
    format: ListFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = ctx.store.list()?;

    if format == ListFormat::Json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No containers under {}.", ctx.store.root().display());
        return Ok(());
    }

    println!("╔══════════════════════╦════════╦══════════╦════════════════════════════════╦═══════════════════════════╗");
    println!("║ ID                   ║ PID    ║ STATUS   ║ BUNDLE                         ║ CREATED                   ║");
    println!("╠══════════════════════╬════════╬══════════╬════════════════════════════════╬═══════════════════════════╣");

    for record in &records {
        println!("{}", row(record));
    }

    println!("╚══════════════════════╩════════╩══════════╩════════════════════════════════╩═══════════════════════════╝");
    println!();
    println!("Total: {} container(s)", records.len());

    Ok(())
}

fn row(record: &StateRecord) -> String {
    let created = record
        .created
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "║ {:<20} ║ {:<6} ║ {:<8} ║ {:<30} ║ {:<25} ║",
        truncate(record.id.as_str(), 20),
        record.pid,
        record.status.as_str(),
        truncate(&record.bundle.to_string_lossy(), 30),
        created
    )
}

/// Shorten to `width` chars, marking the cut with `…`.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let kept: String = s.chars().take(width.saturating_sub(1)).collect();
    format!("{kept}…")
}
