//! Simulate command implementation.
//!
//! Builds an active and a passive controller over a loopback link, runs one
//! transaction on the active side, and optionally crashes it at a panic
//! checkpoint so the passive side has to take over.

use duplexdb_core::{Engine, HookAction, HookType, RecoveryAction};
use duplexdb_testkit::{crash_during, job, object, DuplexArray};
use serde::Serialize;
use std::panic;
use tracing::info;

/// First object id the simulated transaction creates.
const FIRST_OBJECT: u32 = 100;

/// Outcome of a simulation.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Objects staged by the transaction.
    pub staged: u32,
    /// Checkpoint the active controller crashed at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crashed_at: Option<&'static str>,
    /// What the transaction or the takeover did.
    pub outcome: String,
    /// Objects in the active controller's tables.
    pub active_objects: usize,
    /// Objects in the passive controller's tables.
    pub passive_objects: usize,
    /// Slot state left on the passive controller.
    pub passive_state: String,
    /// Role of the passive controller at the end.
    pub passive_role: String,
    /// Committed general-log records.
    pub general_records: usize,
    /// Committed system-log records.
    pub system_records: usize,
}

/// Runs the simulation and returns what happened.
pub fn simulate(
    objects: u32,
    crash_at: Option<HookType>,
) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    if let Some(hook) = crash_at {
        if hook.action() != HookAction::Panic {
            return Err(format!("{hook} waits instead of crashing; pick a panic checkpoint").into());
        }
    }

    let array = DuplexArray::new();
    array.active.start(job(1))?;
    for id in FIRST_OBJECT..FIRST_OBJECT.saturating_add(objects) {
        array.active.add_object_entry(object(id, 1))?;
    }
    array.active.next_generation_id()?;

    let outcome = match crash_at {
        None => {
            array.active.commit()?;
            "committed".to_string()
        }
        Some(hook) => crash_and_recover(&array, hook)?,
    };
    info!(%outcome, "simulation finished");

    Ok(SimulationReport {
        staged: objects,
        crashed_at: crash_at.map(HookType::name),
        outcome,
        active_objects: array.active.tables().objects().len(),
        passive_objects: array.passive.tables().objects().len(),
        passive_state: array.passive.state().to_string(),
        passive_role: array.passive.role().to_string(),
        general_records: array.persist.len(),
        system_records: array.system.len(),
    })
}

fn crash_and_recover(
    array: &DuplexArray,
    hook: HookType,
) -> Result<String, Box<dyn std::error::Error>> {
    let rollback = matches!(
        hook,
        HookType::PanicInUpdateRollbackTransaction | HookType::PanicBeforeRollbackTransactionPersist
    );
    let run = |engine: &Engine| {
        if rollback {
            engine.rollback()
        } else {
            engine.commit()
        }
    };

    // The unwind is expected; keep it off the terminal.
    let previous = panic::take_hook();
    panic::set_hook(Box::new(|_| {}));
    let crashed = crash_during(&array.active, hook, || run(&array.active));
    panic::set_hook(previous);

    match crashed {
        Ok(result) => {
            result?;
            Ok(format!("{hook} never reached"))
        }
        Err(crash) => {
            info!(hook = %crash.hook, txn = %crash.transaction_id, "active controller crashed");
            array.kill_active();
            let action = array.passive.recover_after_peer_death()?;
            Ok(match action {
                RecoveryAction::Nothing => "survivor had nothing to recover".to_string(),
                RecoveryAction::RolledBack => "survivor rolled the transaction back".to_string(),
                RecoveryAction::FinishedCommit => "survivor finished the commit".to_string(),
            })
        }
    }
}

/// Runs the simulate command.
pub fn run(
    objects: u32,
    crash_at: Option<HookType>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = simulate(objects, crash_at)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }
    Ok(())
}

fn print_text_output(report: &SimulationReport) {
    println!("Staged objects:   {}", report.staged);
    if let Some(hook) = report.crashed_at {
        println!("Crashed at:       {hook}");
    }
    println!("Outcome:          {}", report.outcome);
    println!("Active objects:   {}", report.active_objects);
    println!("Passive objects:  {}", report.passive_objects);
    println!("Passive state:    {}", report.passive_state);
    println!("Passive role:     {}", report.passive_role);
    println!("General records:  {}", report.general_records);
    println!("System records:   {}", report.system_records);
}
