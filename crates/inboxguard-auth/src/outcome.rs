//! Aggregated result of an operation over several independent items.

use serde::{Deserialize, Serialize};

/// How many sub-operations were attempted, how many succeeded, and what
/// went wrong with the rest.
///
/// The policy is explicit: any success makes the whole operation a success
/// ([`is_success`](Self::is_success)), but callers can still tell a clean
/// run from a partial one ([`is_partial`](Self::is_partial)).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub errors: Vec<String>,
}

impl PartialOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sub-operation. `item` names it in the error list.
    pub fn record<E: std::fmt::Display>(&mut self, item: &str, result: Result<(), E>) {
        self.attempted += 1;
        match result {
            Ok(()) => self.succeeded += 1,
            Err(e) => self.errors.push(format!("{item}: {e}")),
        }
    }

    pub fn failed(&self) -> usize {
        self.attempted - self.succeeded
    }

    /// At least one item succeeded, or there was nothing to do.
    pub fn is_success(&self) -> bool {
        self.succeeded > 0 || self.attempted == 0
    }

    /// Every attempted item succeeded.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Some items succeeded and some failed.
    pub fn is_partial(&self) -> bool {
        self.succeeded > 0 && !self.errors.is_empty()
    }
}

impl std::fmt::Display for PartialOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} succeeded", self.succeeded, self.attempted)?;
        if !self.errors.is_empty() {
            write!(f, " ({})", self.errors.join("; "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_success_is_success() {
        let mut outcome = PartialOutcome::new();
        outcome.record::<String>("a", Ok(()));
        outcome.record("b", Err("locked"));
        outcome.record::<String>("c", Ok(()));

        assert!(outcome.is_success());
        assert!(outcome.is_partial());
        assert!(!outcome.is_complete());
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.to_string(), "2/3 succeeded (b: locked)");
    }

    #[test]
    fn total_failure_is_not_success() {
        let mut outcome = PartialOutcome::new();
        outcome.record("a", Err("x"));
        outcome.record("b", Err("y"));
        assert!(!outcome.is_success());
        assert!(!outcome.is_partial());
    }

    #[test]
    fn clean_run_is_complete() {
        let mut outcome = PartialOutcome::new();
        outcome.record::<String>("a", Ok(()));
        assert!(outcome.is_complete());
        assert!(!outcome.is_partial());
        assert_eq!(outcome.to_string(), "1/1 succeeded");
    }
}
