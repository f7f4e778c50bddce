//! Multi-account retry orchestration.
//!
//! Accounts run strictly one after another. Every account that does not
//! succeed is carried into the next round until it succeeds or spends its
//! retry budget; rounds themselves are capped so a run always terminates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};
use rand::Rng;
use serde_derive::Serialize;

use crate::checkin::{Account, Attempt, AttemptRunner};
use crate::util;

/// Randomized delay bounds, in seconds, inclusive.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub account_delay: (u64, u64),
    pub round_backoff: (u64, u64),
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            account_delay: (30, 120),
            round_backoff: (60, 180),
        }
    }
}

impl Pacing {
    /// No waiting at all. Used by tests and debug runs.
    pub fn none() -> Self {
        Self {
            account_delay: (0, 0),
            round_backoff: (0, 0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retries per account after its first attempt.
    pub max_retries: u32,
    pub pacing: Pacing,
}

/// Final record for one account: its last attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AccountResult {
    /// Masked; safe for logs and reports.
    pub account: String,
    pub attempt: Attempt,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub results: Vec<AccountResult>,
    pub rounds: u32,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.attempt.is_success())
            .count()
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }
}

/// Run every account to completion. Per account at most
/// `max_retries + 1` attempts happen, and the whole run takes at most
/// `max_retries + 1` rounds. The cancel flag is honored between accounts
/// and between rounds, never mid-attempt.
pub async fn run_accounts<R: AttemptRunner>(
    accounts: &[Account],
    runner: &mut R,
    cfg: &OrchestratorConfig,
    cancel: &AtomicBool,
) -> RunReport {
    let mut latest: Vec<Option<Attempt>> = vec![None; accounts.len()];
    let mut retries_used = vec![0u32; accounts.len()];
    let mut pending: Vec<usize> = (0..accounts.len()).collect();
    let mut round = 0u32;

    while !pending.is_empty() && round <= cfg.max_retries && !cancel.load(Ordering::SeqCst) {
        round += 1;
        info!("===== round {} with {} account(s) =====", round, pending.len());
        let mut carried = Vec::new();

        for (pos, &idx) in pending.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                warn!("interrupted, skipping the rest of round {}", round);
                break;
            }
            let account = &accounts[idx];
            let sequence = retries_used[idx] + 1;
            let attempt = runner.run(account, sequence).await;
            let succeeded = attempt.is_success();
            latest[idx] = Some(attempt);

            if succeeded {
                info!("{}: done", util::mask(&account.id));
            } else if retries_used[idx] < cfg.max_retries {
                retries_used[idx] += 1;
                carried.push(idx);
                info!(
                    "{}: queued for retry {}/{}",
                    util::mask(&account.id),
                    retries_used[idx],
                    cfg.max_retries
                );
            } else {
                warn!("{}: retries exhausted", util::mask(&account.id));
            }

            if pos + 1 < pending.len() {
                pause("next account", cfg.pacing.account_delay).await;
            }
        }

        pending = carried;
        if !pending.is_empty() && round <= cfg.max_retries {
            pause("next round", cfg.pacing.round_backoff).await;
        }
    }

    let results = accounts
        .iter()
        .zip(latest)
        .filter_map(|(account, attempt)| {
            attempt.map(|attempt| AccountResult {
                account: util::mask(&account.id),
                attempt,
            })
        })
        .collect();
    let report = RunReport { results, rounds: round };
    info!(
        "===== run finished: {}/{} succeeded in {} round(s) =====",
        report.succeeded(),
        report.total(),
        report.rounds
    );
    report
}

async fn pause(what: &str, (lo, hi): (u64, u64)) {
    if hi == 0 {
        return;
    }
    let secs = rand::thread_rng().gen_range(lo..=hi);
    info!("waiting {}s before {}", secs, what);
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkin::Outcome;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Plays back a scripted outcome sequence per account and records
    /// every invocation.
    struct ScriptedRunner {
        script: HashMap<String, Vec<Outcome>>,
        calls: Vec<(String, u32)>,
    }

    impl ScriptedRunner {
        fn new(script: &[(&str, &[Outcome])]) -> Self {
            Self {
                script: script
                    .iter()
                    .map(|(id, outcomes)| (id.to_string(), outcomes.to_vec()))
                    .collect(),
                calls: Vec::new(),
            }
        }

        fn calls_for(&self, id: &str) -> usize {
            self.calls.iter().filter(|(c, _)| c == id).count()
        }
    }

    #[async_trait]
    impl AttemptRunner for ScriptedRunner {
        async fn run(&mut self, account: &Account, sequence: u32) -> Attempt {
            self.calls.push((account.id.clone(), sequence));
            let seen = self.calls_for(&account.id);
            let outcome = self.script[&account.id]
                .get(seen - 1)
                .copied()
                .unwrap_or(Outcome::Exception);
            Attempt {
                sequence,
                outcome,
                points: (outcome == Outcome::Success).then_some(23000),
                retries: sequence - 1,
                screenshot: None,
                proxy: None,
                message: String::new(),
            }
        }
    }

    fn account(id: &str) -> Account {
        Account {
            id: id.to_owned(),
            secret: "hunter2".to_owned(),
        }
    }

    fn config(max_retries: u32) -> OrchestratorConfig {
        OrchestratorConfig {
            max_retries,
            pacing: Pacing::none(),
        }
    }

    #[tokio::test]
    async fn retry_until_success_across_rounds() {
        // A succeeds immediately; B needs two retries.
        let accounts = [account("alice"), account("bob")];
        let mut runner = ScriptedRunner::new(&[
            ("alice", &[Outcome::Success][..]),
            (
                "bob",
                &[Outcome::LoginFailed, Outcome::Timeout, Outcome::Success][..],
            ),
        ]);

        let report = run_accounts(&accounts, &mut runner, &config(3), &AtomicBool::new(false)).await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.total(), 2);
        assert_eq!(report.rounds, 3);
        assert_eq!(runner.calls_for("alice"), 1);
        assert_eq!(runner.calls_for("bob"), 3);
        let bob = &report.results[1];
        assert!(bob.attempt.is_success());
        assert_eq!(bob.attempt.retries, 2);
        // Masked identifiers only in the report.
        assert!(!report.results.iter().any(|r| r.account.contains("alice")));
    }

    #[tokio::test]
    async fn attempts_per_account_are_bounded() {
        let accounts = [account("alice"), account("bob")];
        let mut runner = ScriptedRunner::new(&[
            ("alice", &[][..]), // always Exception
            ("bob", &[][..]),
        ]);
        let max_retries = 2;

        let report = run_accounts(&accounts, &mut runner, &config(max_retries), &AtomicBool::new(false)).await;

        assert_eq!(report.succeeded(), 0);
        assert_eq!(runner.calls_for("alice"), (max_retries + 1) as usize);
        assert_eq!(runner.calls_for("bob"), (max_retries + 1) as usize);
        assert!(report.rounds <= max_retries + 1);
    }

    #[tokio::test]
    async fn sequences_are_strictly_increasing_per_account() {
        let accounts = [account("alice")];
        let mut runner = ScriptedRunner::new(&[("alice", &[][..])]);

        run_accounts(&accounts, &mut runner, &config(3), &AtomicBool::new(false)).await;

        let sequences: Vec<u32> = runner.calls.iter().map(|(_, s)| *s).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn zero_retries_means_single_round() {
        let accounts = [account("alice")];
        let mut runner = ScriptedRunner::new(&[("alice", &[][..])]);

        let report = run_accounts(&accounts, &mut runner, &config(0), &AtomicBool::new(false)).await;

        assert_eq!(runner.calls_for("alice"), 1);
        assert_eq!(report.rounds, 1);
    }

    #[tokio::test]
    async fn cancel_flag_stops_before_any_attempt() {
        let accounts = [account("alice"), account("bob")];
        let mut runner = ScriptedRunner::new(&[
            ("alice", &[Outcome::Success][..]),
            ("bob", &[Outcome::Success][..]),
        ]);
        let cancel = AtomicBool::new(true);

        let report = run_accounts(&accounts, &mut runner, &config(3), &cancel).await;

        assert!(runner.calls.is_empty());
        assert_eq!(report.total(), 0);
    }

    #[tokio::test]
    async fn empty_account_set_is_a_noop() {
        let mut runner = ScriptedRunner::new(&[]);
        let report = run_accounts(&[], &mut runner, &config(3), &AtomicBool::new(false)).await;
        assert_eq!(report.total(), 0);
        assert_eq!(report.rounds, 0);
    }
}
