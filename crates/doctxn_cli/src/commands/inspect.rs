//! Inspect command implementation.

use super::{load_atrs, now_millis, open_snapshot};
use doctxn_core::AtrPhase;
use doctxn_store::InMemoryStore;
use serde::Serialize;
use std::path::Path;

/// Snapshot inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Snapshot path.
    pub path: String,
    /// Clock reading used for ages, in ms since the Unix epoch.
    pub now: u64,
    /// One entry per ATR document.
    pub records: Vec<RecordInfo>,
}

/// One ATR document.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// ATR key.
    pub key: String,
    /// Attempts recorded in it.
    pub attempts: Vec<AttemptInfo>,
    /// Parse error, if the record is corrupt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One attempt entry of an ATR.
#[derive(Debug, Serialize)]
pub struct AttemptInfo {
    /// Attempt id.
    pub attempt_id: String,
    /// Transaction id.
    pub transaction_id: String,
    /// Current phase.
    pub phase: AtrPhase,
    /// Time since the attempt started, in ms.
    pub age_ms: u64,
    /// Whether the deadline has passed.
    pub expired: bool,
    /// Documents the attempt staged.
    pub mutations: usize,
    /// Sweeper holding a cleanup claim, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_snapshot(path)?;
    let result = inspect(&store, path, now_millis());

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects every ATR entry in `store`.
pub fn inspect(store: &InMemoryStore, path: &Path, now: u64) -> InspectResult {
    let records = load_atrs(store)
        .into_iter()
        .map(|(atr, doc)| match doc {
            Ok(doc) => RecordInfo {
                key: atr.key,
                attempts: doc
                    .attempts
                    .values()
                    .map(|entry| AttemptInfo {
                        attempt_id: entry.attempt_id.to_string(),
                        transaction_id: entry.transaction_id.to_string(),
                        phase: entry.phase,
                        age_ms: now.saturating_sub(entry.start_timestamp),
                        expired: entry.is_expired(now),
                        mutations: entry.effective_mutations().len(),
                        claimed_by: entry.cleanup.as_ref().map(|c| c.owner.clone()),
                    })
                    .collect(),
                error: None,
            },
            Err(e) => RecordInfo {
                key: atr.key,
                attempts: Vec::new(),
                error: Some(e),
            },
        })
        .collect();

    InspectResult {
        path: path.display().to_string(),
        now,
        records,
    }
}

fn print_text_output(result: &InspectResult) {
    println!("doctxn Snapshot Inspection");
    println!("==========================");
    println!();
    println!("Path: {}", result.path);
    println!("Transaction records: {}", result.records.len());

    for record in &result.records {
        println!();
        println!("{}", record.key);
        if let Some(error) = &record.error {
            println!("  corrupt: {error}");
            continue;
        }
        for attempt in &record.attempts {
            println!(
                "  {} {:?} age {} {} mutations{}{}",
                attempt.attempt_id,
                attempt.phase,
                format_age(attempt.age_ms),
                attempt.mutations,
                if attempt.expired { ", expired" } else { "" },
                attempt
                    .claimed_by
                    .as_deref()
                    .map(|owner| format!(", claimed by {owner}"))
                    .unwrap_or_default(),
            );
        }
    }
}

fn format_age(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else if ms < 3_600_000 {
        format!("{:.1}m", ms as f64 / 60_000.0)
    } else {
        format!("{:.1}h", ms as f64 / 3_600_000.0)
    }
}
