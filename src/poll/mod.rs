//! Per-wallet polling loop.
//!
//! Each cycle lists the most recent wallet transactions, fetches the full
//! record for every id not yet acted on, evaluates it against the policy and
//! fires the trigger for qualifying ones. A fired id is marked seen whether
//! the action succeeded or not, so no transaction is ever acted on twice.
//!
//! Transport failures abort the current cycle only. After
//! `max_consecutive_failures` failed cycles in a row the loop gives up with
//! [`PollError::FatalTransport`].

use crate::action::{self, ActionContext, ActionResult, ActionTrigger};
use crate::ledger::{LedgerClient, TransportError};
use crate::policy::{evaluate, Policy};
use crate::seen::SeenSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum PollError {
    #[error("watcher {watcher} stopped after {failures} consecutive transport failures: {last}")]
    FatalTransport {
        watcher: String,
        failures: u32,
        #[source]
        last: TransportError,
    },
}

/// Why a single cycle ended early.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    /// How many recent transactions to list per cycle.
    pub page_size: usize,
    pub include_watch_only: bool,
    pub max_consecutive_failures: u32,
    /// Bound on each individual ledger query.
    pub query_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            page_size: 10,
            include_watch_only: true,
            max_consecutive_failures: 5,
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub listed: usize,
    pub skipped_seen: usize,
    pub evaluated: usize,
    pub actions: Vec<ActionResult>,
}

/// Sending half of the cooperative cancellation signal.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half, cloned into every loop. Dropping the handle counts as a
/// shutdown request.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        let requested = *self.rx.borrow();
        requested || self.rx.has_changed().is_err()
    }

    /// Resolves once shutdown has been requested.
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Monitors one wallet. Owns its seen set exclusively.
pub struct PollLoop {
    name: String,
    client: Arc<dyn LedgerClient>,
    policy: Policy,
    trigger: Box<dyn ActionTrigger>,
    seen: SeenSet,
    settings: PollSettings,
}

impl PollLoop {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn LedgerClient>,
        policy: Policy,
        trigger: Box<dyn ActionTrigger>,
        settings: PollSettings,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            policy,
            trigger,
            seen: SeenSet::new(),
            settings,
        }
    }

    /// Start from a pre-populated (e.g. journal-backed) seen set.
    pub fn with_seen(mut self, seen: SeenSet) -> Self {
        self.seen = seen;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Poll until cancelled (`Ok`) or until transport failures escalate.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<(), PollError> {
        info!(
            watcher = %self.name,
            action = self.trigger.name(),
            category = %self.policy.required_category,
            min_confirmations = self.policy.min_confirmations,
            interval_secs = self.settings.interval.as_secs(),
            page_size = self.settings.page_size,
            "watcher started"
        );

        let mut consecutive_failures: u32 = 0;

        loop {
            match self.poll_once(&shutdown).await {
                Ok(report) => {
                    consecutive_failures = 0;
                    debug!(
                        watcher = %self.name,
                        listed = report.listed,
                        skipped_seen = report.skipped_seen,
                        evaluated = report.evaluated,
                        fired = report.actions.len(),
                        "poll cycle complete"
                    );
                }
                Err(CycleError::Cancelled) => break,
                Err(CycleError::Transport(e)) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.settings.max_consecutive_failures {
                        error!(
                            watcher = %self.name,
                            failures = consecutive_failures,
                            error = %e,
                            "transport failures exceeded threshold, stopping watcher"
                        );
                        return Err(PollError::FatalTransport {
                            watcher: self.name,
                            failures: consecutive_failures,
                            last: e,
                        });
                    }
                    warn!(
                        watcher = %self.name,
                        failures = consecutive_failures,
                        max = self.settings.max_consecutive_failures,
                        status = ?e.status_code(),
                        error = %e,
                        "poll cycle aborted"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = shutdown.triggered() => break,
            }
        }

        info!(watcher = %self.name, seen = self.seen.len(), "watcher stopped");
        Ok(())
    }

    /// Run a single cycle. Cancellation is checked before every query.
    pub async fn poll_once(&mut self, shutdown: &Shutdown) -> Result<CycleReport, CycleError> {
        if shutdown.is_triggered() {
            return Err(CycleError::Cancelled);
        }

        let recent = self
            .bounded(
                "listtransactions",
                self.client.list_recent(
                    self.settings.page_size,
                    0,
                    self.settings.include_watch_only,
                ),
            )
            .await?;

        let mut report = CycleReport {
            listed: recent.len(),
            ..Default::default()
        };

        for summary in &recent {
            if self.seen.contains(&summary.txid) {
                report.skipped_seen += 1;
                continue;
            }
            if shutdown.is_triggered() {
                return Err(CycleError::Cancelled);
            }

            let detail = self
                .bounded("gettransaction", self.client.get_detail(&summary.txid))
                .await?;
            let tx = detail.reconcile(summary);
            report.evaluated += 1;

            let decision = evaluate(&tx, &self.policy);
            let Some(payload) = decision.payload else {
                if let Some(reason) = decision.rejection {
                    debug!(watcher = %self.name, txid = %tx.txid, reason = %reason, "not qualifying");
                }
                continue;
            };

            let ctx = ActionContext {
                watcher: self.name.clone(),
                payload,
            };
            let result = action::fire(self.trigger.as_ref(), &ctx).await;
            self.seen.mark_seen(&tx.txid);
            report.actions.push(result);
        }

        Ok(report)
    }

    async fn bounded<T>(
        &self,
        method: &str,
        query: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        let after = self.settings.query_timeout;
        tokio::time::timeout(after, query)
            .await
            .map_err(|_| TransportError::Timeout {
                method: method.to_string(),
                after,
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionError, ActionOutcome};
    use crate::ledger::{Amount, Category, DetailEntry, Transaction};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Ledger whose `list_recent` answers come from a script; once the script
    /// runs out the last answer repeats.
    #[derive(Default)]
    struct ScriptedLedger {
        lists: Mutex<VecDeque<Result<Vec<Transaction>, u16>>>,
        last_list: Mutex<Vec<Transaction>>,
        details: Mutex<HashMap<String, Transaction>>,
        failing_details: Mutex<Vec<String>>,
        list_delay: Option<Duration>,
        list_calls: Mutex<usize>,
        detail_calls: Mutex<Vec<String>>,
        /// Triggered from inside the next `get_detail`.
        cancel_on_detail: Mutex<Option<ShutdownHandle>>,
    }

    impl ScriptedLedger {
        fn push_list(&self, txs: Vec<Transaction>) {
            for tx in &txs {
                self.details
                    .lock()
                    .unwrap()
                    .insert(tx.txid.clone(), tx.clone());
            }
            self.lists.lock().unwrap().push_back(Ok(txs));
        }

        fn push_failure(&self, status: u16) {
            self.lists.lock().unwrap().push_back(Err(status));
        }

        fn list_calls(&self) -> usize {
            *self.list_calls.lock().unwrap()
        }

        fn detail_calls(&self) -> Vec<String> {
            self.detail_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LedgerClient for ScriptedLedger {
        async fn list_recent(
            &self,
            _count: usize,
            _skip: usize,
            _include_watch_only: bool,
        ) -> Result<Vec<Transaction>, TransportError> {
            *self.list_calls.lock().unwrap() += 1;
            if let Some(delay) = self.list_delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.lists.lock().unwrap().pop_front();
            match next {
                Some(Ok(txs)) => {
                    *self.last_list.lock().unwrap() = txs.clone();
                    Ok(txs)
                }
                Some(Err(status)) => Err(TransportError::Status {
                    method: "listtransactions".to_string(),
                    status,
                    body: "scripted failure".to_string(),
                }),
                None => Ok(self.last_list.lock().unwrap().clone()),
            }
        }

        async fn get_detail(&self, txid: &str) -> Result<Transaction, TransportError> {
            self.detail_calls.lock().unwrap().push(txid.to_string());
            if let Some(handle) = self.cancel_on_detail.lock().unwrap().take() {
                handle.trigger();
            }
            if self.failing_details.lock().unwrap().iter().any(|t| t == txid) {
                return Err(TransportError::Status {
                    method: "gettransaction".to_string(),
                    status: 500,
                    body: String::new(),
                });
            }
            self.details
                .lock()
                .unwrap()
                .get(txid)
                .cloned()
                .ok_or_else(|| TransportError::Malformed {
                    method: "gettransaction".to_string(),
                    reason: format!("unknown txid {txid}"),
                })
        }

        async fn send(&self, _destination: &str, _amount: Amount) -> Result<String, TransportError> {
            Ok("unused".to_string())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingTrigger {
        fired: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl ActionTrigger for RecordingTrigger {
        fn name(&self) -> &str {
            "record"
        }

        async fn execute(&self, ctx: &ActionContext) -> Result<String, ActionError> {
            self.fired.lock().unwrap().push(ctx.payload.txid.clone());
            if self.fail {
                return Err(ActionError::MissingAmount(ctx.payload.amount));
            }
            Ok("recorded".to_string())
        }
    }

    fn tx(txid: &str, amount: rust_decimal::Decimal, confirmations: u32) -> Transaction {
        Transaction {
            txid: txid.to_string(),
            category: Category::Receive,
            amount: Amount::from_decimal(amount).unwrap(),
            confirmations,
            details: vec![],
        }
    }

    fn settings() -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(60),
            page_size: 10,
            include_watch_only: true,
            max_consecutive_failures: 3,
            query_timeout: Duration::from_secs(5),
        }
    }

    fn payout_policy() -> Policy {
        Policy::new(Category::Receive)
            .with_min_confirmations(1)
            .with_expected_amount(Amount::from_decimal(dec!(50)).unwrap())
    }

    fn build(
        ledger: &Arc<ScriptedLedger>,
        policy: Policy,
        trigger: &RecordingTrigger,
    ) -> PollLoop {
        PollLoop::new(
            "test",
            ledger.clone(),
            policy,
            Box::new(trigger.clone()),
            settings(),
        )
    }

    #[tokio::test]
    async fn test_same_transaction_fires_once_across_cycles() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.push_list(vec![tx("tx1", dec!(50), 1)]);
        let trigger = RecordingTrigger::default();
        let mut poll = build(&ledger, payout_policy(), &trigger);
        let (_handle, shutdown) = shutdown_channel();

        let first = poll.poll_once(&shutdown).await.unwrap();
        assert_eq!(first.actions.len(), 1);
        assert_eq!(first.actions[0].triggered_id, "tx1");
        assert_eq!(first.actions[0].outcome, ActionOutcome::Success);

        for _ in 0..3 {
            let again = poll.poll_once(&shutdown).await.unwrap();
            assert!(again.actions.is_empty());
            assert_eq!(again.skipped_seen, 1);
            assert_eq!(again.evaluated, 0);
        }

        assert_eq!(*trigger.fired.lock().unwrap(), vec!["tx1".to_string()]);
        // Seen ids are short-circuited before any detail fetch.
        assert_eq!(ledger.detail_calls(), vec!["tx1".to_string()]);
    }

    #[tokio::test]
    async fn test_fires_once_confirmations_reach_minimum() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.push_list(vec![tx("tx1", dec!(50), 0)]);
        let trigger = RecordingTrigger::default();
        let mut poll = build(&ledger, payout_policy(), &trigger);
        let (_handle, shutdown) = shutdown_channel();

        let pending = poll.poll_once(&shutdown).await.unwrap();
        assert_eq!(pending.evaluated, 1);
        assert!(pending.actions.is_empty());
        assert!(!poll.seen().contains("tx1"));

        ledger.push_list(vec![tx("tx1", dec!(50), 1)]);
        let confirmed = poll.poll_once(&shutdown).await.unwrap();
        assert_eq!(confirmed.actions.len(), 1);

        ledger.push_list(vec![tx("tx1", dec!(50), 2)]);
        assert!(poll.poll_once(&shutdown).await.unwrap().actions.is_empty());
        assert_eq!(trigger.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_action_is_not_retried() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.push_list(vec![tx("tx1", dec!(50), 1)]);
        let trigger = RecordingTrigger {
            fail: true,
            ..Default::default()
        };
        let mut poll = build(&ledger, payout_policy(), &trigger);
        let (_handle, shutdown) = shutdown_channel();

        let report = poll.poll_once(&shutdown).await.unwrap();
        assert_eq!(report.actions[0].outcome, ActionOutcome::Failure);
        assert!(poll.seen().contains("tx1"));

        poll.poll_once(&shutdown).await.unwrap();
        assert_eq!(trigger.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_evaluates_in_ledger_order() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.push_list(vec![
            tx("c", dec!(1), 3),
            tx("a", dec!(1), 2),
            tx("b", dec!(1), 1),
        ]);
        let trigger = RecordingTrigger::default();
        let mut poll = build(
            &ledger,
            Policy::new(Category::Receive).with_min_confirmations(1),
            &trigger,
        );
        let (_handle, shutdown) = shutdown_channel();

        poll.poll_once(&shutdown).await.unwrap();
        assert_eq!(
            *trigger.fired.lock().unwrap(),
            vec!["c".to_string(), "a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_detail_failure_aborts_cycle_then_recovers() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.push_list(vec![tx("bad", dec!(1), 1), tx("good", dec!(1), 1)]);
        ledger.failing_details.lock().unwrap().push("bad".to_string());
        let trigger = RecordingTrigger::default();
        let mut poll = build(
            &ledger,
            Policy::new(Category::Receive).with_min_confirmations(1),
            &trigger,
        );
        let (_handle, shutdown) = shutdown_channel();

        let err = poll.poll_once(&shutdown).await.unwrap_err();
        assert!(matches!(err, CycleError::Transport(_)));
        assert!(trigger.fired.lock().unwrap().is_empty());

        ledger.failing_details.lock().unwrap().clear();
        let report = poll.poll_once(&shutdown).await.unwrap();
        assert_eq!(report.actions.len(), 2);
    }

    #[tokio::test]
    async fn test_detail_category_uses_reconciled_detail() {
        let ledger = Arc::new(ScriptedLedger::default());
        let summary = tx("tx2", dec!(2.5), 1);
        let mut detail = summary.clone();
        detail.category = Category::Other;
        detail.details = vec![DetailEntry {
            category: Category::Generate,
            amount: Amount::from_decimal(dec!(2.5)).unwrap(),
            address: Some("addr".to_string()),
        }];
        ledger.push_list(vec![summary]);
        ledger
            .details
            .lock()
            .unwrap()
            .insert("tx2".to_string(), detail);

        let trigger = RecordingTrigger::default();
        let policy = Policy::new(Category::Receive)
            .with_min_confirmations(1)
            .with_detail_category(Category::Generate);
        let mut poll = build(&ledger, policy, &trigger);
        let (_handle, shutdown) = shutdown_channel();

        let report = poll.poll_once(&shutdown).await.unwrap();
        assert_eq!(report.actions.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_query() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.push_list(vec![tx("tx1", dec!(50), 1)]);
        let trigger = RecordingTrigger::default();
        let poll = build(&ledger, payout_policy(), &trigger);
        let (handle, shutdown) = shutdown_channel();

        handle.trigger();
        poll.run(shutdown).await.unwrap();
        assert_eq!(ledger.list_calls(), 0);
        assert!(trigger.fired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_detail_fetches() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.push_list(vec![tx("tx1", dec!(50), 1), tx("tx2", dec!(50), 1)]);
        let trigger = RecordingTrigger::default();
        let mut poll = build(&ledger, payout_policy(), &trigger);
        let (handle, shutdown) = shutdown_channel();
        *ledger.cancel_on_detail.lock().unwrap() = Some(handle);

        let err = poll.poll_once(&shutdown).await.unwrap_err();
        assert!(matches!(err, CycleError::Cancelled));
        assert_eq!(ledger.detail_calls().len(), 1);
        // The detail already fetched is still acted on; the next one is not.
        assert_eq!(*trigger.fired.lock().unwrap(), vec!["tx1".to_string()]);
        assert!(!poll.seen().contains("tx2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.push_list(vec![tx("tx1", dec!(50), 1)]);
        let trigger = RecordingTrigger::default();
        let poll = build(&ledger, payout_policy(), &trigger);
        let (handle, shutdown) = shutdown_channel();

        let task = tokio::spawn(poll.run(shutdown));
        // Two full cycles, then cancel mid-sleep.
        tokio::time::sleep(Duration::from_secs(90)).await;
        handle.trigger();
        task.await.unwrap().unwrap();

        assert_eq!(ledger.list_calls(), 2);
        assert_eq!(trigger.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_reset_on_success() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.push_failure(503);
        ledger.push_failure(503);
        ledger.push_list(vec![tx("tx1", dec!(50), 1)]);
        ledger.push_failure(503);
        ledger.push_failure(503);
        ledger.push_list(vec![tx("tx1", dec!(50), 1)]);
        let trigger = RecordingTrigger::default();
        let poll = build(&ledger, payout_policy(), &trigger);
        let (handle, shutdown) = shutdown_channel();

        let task = tokio::spawn(poll.run(shutdown));
        tokio::time::sleep(Duration::from_secs(60 * 6 + 30)).await;
        handle.trigger();
        task.await.unwrap().unwrap();

        assert_eq!(ledger.list_calls(), 7);
        assert_eq!(trigger.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_escalate() {
        let ledger = Arc::new(ScriptedLedger::default());
        for _ in 0..3 {
            ledger.push_failure(500);
        }
        let trigger = RecordingTrigger::default();
        let poll = build(&ledger, payout_policy(), &trigger);
        let (_handle, shutdown) = shutdown_channel();

        let err = poll.run(shutdown).await.unwrap_err();
        match err {
            PollError::FatalTransport { failures, last, .. } => {
                assert_eq!(failures, 3);
                assert_eq!(last.status_code(), Some(500));
            }
        }
        assert_eq!(ledger.list_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_query_times_out() {
        let ledger = Arc::new(ScriptedLedger {
            list_delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let trigger = RecordingTrigger::default();
        let mut poll = build(&ledger, payout_policy(), &trigger);
        let (_handle, shutdown) = shutdown_channel();

        let err = poll.poll_once(&shutdown).await.unwrap_err();
        assert!(matches!(
            err,
            CycleError::Transport(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_dropped_handle_counts_as_shutdown() {
        let (handle, shutdown) = shutdown_channel();
        assert!(!shutdown.is_triggered());
        drop(handle);
        assert!(shutdown.is_triggered());
    }
}
