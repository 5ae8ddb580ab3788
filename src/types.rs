use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use solana_sdk::signature::Signature;

/// How far a round goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapMode {
    /// Quote only
    Quote,
    /// Build and sign, never submit
    #[default]
    #[value(name = "dryrun")]
    DryRun,
    /// Build, sign, submit and wait for confirmation
    Send,
}

impl SwapMode {
    pub fn builds_transaction(&self) -> bool {
        !matches!(self, SwapMode::Quote)
    }

    pub fn submits(&self) -> bool {
        matches!(self, SwapMode::Send)
    }
}

/// Which aggregator endpoint produces the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildFlow {
    /// `/swap-instructions`, assembled locally
    Instructions,
    /// `/swap`, re-signed as returned
    Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Quoted { in_amount: u64, out_amount: u64 },
    /// Built and signed; `size` in bytes.
    DryRun { size: usize },
    /// Too large to submit.
    Skipped { size: usize, max: usize },
    Confirmed { signature: Signature, failed: bool },
    NotConfirmed,
}

impl RoundOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RoundOutcome::Quoted { .. } => "quoted",
            RoundOutcome::DryRun { .. } => "dry-run",
            RoundOutcome::Skipped { .. } => "skipped",
            RoundOutcome::Confirmed { failed: false, .. } => "confirmed",
            RoundOutcome::Confirmed { failed: true, .. } => "confirmed-with-error",
            RoundOutcome::NotConfirmed => "not-confirmed",
        }
    }
}

/// Tally over all rounds of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds: u32,
    pub succeeded: u32,
    pub skipped: u32,
    pub unconfirmed: u32,
    pub errors: u32,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &RoundOutcome) {
        self.rounds += 1;
        match outcome {
            RoundOutcome::Skipped { .. } => self.skipped += 1,
            RoundOutcome::NotConfirmed | RoundOutcome::Confirmed { failed: true, .. } => {
                self.unconfirmed += 1
            }
            _ => self.succeeded += 1,
        }
    }

    pub fn record_error(&mut self) {
        self.rounds += 1;
        self.errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_cli_names() {
        assert_eq!(SwapMode::from_str("dryrun", true).unwrap(), SwapMode::DryRun);
        assert_eq!(SwapMode::from_str("send", true).unwrap(), SwapMode::Send);
        assert_eq!(SwapMode::from_str("quote", true).unwrap(), SwapMode::Quote);
        assert_eq!(SwapMode::default(), SwapMode::DryRun);
        assert!(!SwapMode::Quote.builds_transaction());
        assert!(!SwapMode::DryRun.submits());
    }

    #[test]
    fn summary_counts_each_outcome_kind() {
        let mut summary = RunSummary::default();
        summary.record(&RoundOutcome::DryRun { size: 900 });
        summary.record(&RoundOutcome::Skipped { size: 1300, max: 1232 });
        summary.record(&RoundOutcome::NotConfirmed);
        summary.record(&RoundOutcome::Confirmed {
            signature: Signature::default(),
            failed: true,
        });
        summary.record_error();

        assert_eq!(
            summary,
            RunSummary {
                rounds: 5,
                succeeded: 1,
                skipped: 1,
                unconfirmed: 2,
                errors: 1,
            }
        );
    }
}
