//! Hooks command implementation.

use duplexdb_core::{HookAction, HookType};
use serde::Serialize;

/// One checkpoint as listed.
#[derive(Debug, Serialize)]
pub struct HookInfo {
    /// Control-surface code.
    pub code: u32,
    /// Checkpoint name.
    pub name: &'static str,
    /// Built-in behavior when armed.
    pub action: &'static str,
}

impl From<HookType> for HookInfo {
    fn from(hook: HookType) -> Self {
        Self {
            code: hook.code(),
            name: hook.name(),
            action: match hook.action() {
                HookAction::Wait => "wait",
                HookAction::Panic => "panic",
            },
        }
    }
}

/// Runs the hooks command.
pub fn run(format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let hooks: Vec<HookInfo> = HookType::ALL.into_iter().map(HookInfo::from).collect();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&hooks)?),
        _ => {
            println!("{:>4}  {:<6} NAME", "CODE", "ACTION");
            for hook in &hooks {
                println!("{:>4}  {:<6} {}", hook.code, hook.action, hook.name);
            }
        }
    }
    Ok(())
}

/// Parses a checkpoint given by code or by name, in any case.
pub fn parse(value: &str) -> Result<HookType, String> {
    if let Ok(code) = value.parse::<u32>() {
        return HookType::from_code(code).ok_or_else(|| format!("no checkpoint with code {code}"));
    }
    let wanted = value.trim().replace('-', "_").to_ascii_uppercase();
    HookType::ALL
        .into_iter()
        .find(|hook| hook.name() == wanted)
        .ok_or_else(|| format!("no checkpoint named {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_codes_and_names() {
        assert_eq!(parse("4").unwrap(), HookType::PanicBeforeTransactionPersist);
        assert_eq!(
            parse("panic-in-update-transaction").unwrap(),
            HookType::PanicInUpdateTransaction
        );
        assert_eq!(
            parse("WAIT_BEFORE_ROLLBACK_TRANSACTION_PERSIST").unwrap(),
            HookType::WaitBeforeRollbackTransactionPersist
        );
        assert!(parse("0").is_err());
        assert!(parse("sometimes").is_err());
    }

    #[test]
    fn lists_every_checkpoint() {
        let listed: Vec<HookInfo> = HookType::ALL.into_iter().map(HookInfo::from).collect();
        assert_eq!(listed.len(), 8);
        assert_eq!(listed.iter().filter(|h| h.action == "panic").count(), 4);
    }
}
