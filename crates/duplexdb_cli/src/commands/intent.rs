//! Intent command implementation.

use duplexdb_persist::{FileIntentStore, IntentDirection, IntentPhase, IntentRecord, IntentStore};
use serde::Serialize;
use std::path::Path;

/// What the intent file says.
#[derive(Debug, Serialize)]
pub struct IntentReport {
    /// Intent file path.
    pub path: String,
    /// Recorded intent, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentView>,
    /// What recovery would conclude from the intent alone.
    pub verdict: &'static str,
    /// The file was removed.
    pub cleared: bool,
}

/// A decoded intent record.
#[derive(Debug, Serialize)]
pub struct IntentView {
    /// Transaction id.
    pub transaction_id: u64,
    /// Job number.
    pub job_number: u64,
    /// Commit or rollback.
    pub direction: &'static str,
    /// How far the write got.
    pub phase: &'static str,
}

impl From<IntentRecord> for IntentView {
    fn from(record: IntentRecord) -> Self {
        Self {
            transaction_id: record.transaction_id,
            job_number: record.job_number,
            direction: match record.direction {
                IntentDirection::Commit => "commit",
                IntentDirection::Rollback => "rollback",
            },
            phase: match record.phase {
                IntentPhase::Prepared => "prepared",
                IntentPhase::GeneralCommitted => "general-committed",
            },
        }
    }
}

/// Reads the intent at `path` and describes it.
pub fn inspect(path: &Path, clear: bool) -> Result<IntentReport, Box<dyn std::error::Error>> {
    let store = FileIntentStore::open(path)?;
    let record = store.load()?;
    let verdict = match record {
        None => "no transaction was writing the logs",
        Some(r) if r.direction == IntentDirection::Rollback => "rollback must be run again",
        Some(r) if r.phase == IntentPhase::GeneralCommitted => "commit is durable and will be finished",
        Some(_) => "commit durability depends on the general log replay",
    };
    if clear {
        store.clear()?;
    }
    Ok(IntentReport {
        path: path.display().to_string(),
        intent: record.map(IntentView::from),
        verdict,
        cleared: clear,
    })
}

/// Runs the intent command.
pub fn run(path: &Path, clear: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = inspect(path, clear)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }
    Ok(())
}

fn print_text_output(report: &IntentReport) {
    println!("Intent file: {}", report.path);
    match &report.intent {
        Some(intent) => {
            println!("  Transaction: {}", intent.transaction_id);
            println!("  Job:         {}", intent.job_number);
            println!("  Direction:   {}", intent.direction);
            println!("  Phase:       {}", intent.phase);
        }
        None => println!("  (empty)"),
    }
    println!("Verdict: {}", report.verdict);
    if report.cleared {
        println!("Intent cleared.");
    }
}
