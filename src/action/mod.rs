//! Follow-up actions fired for qualifying transactions.
//!
//! An [`ActionTrigger`] is invoked at most once per transaction id; the poll
//! loop enforces that through its seen set, not the trigger. Triggers report
//! failures but never retry, since a repeated forward would double-spend.

use crate::config::ActionConfig;
use crate::ledger::{Amount, LedgerClient, TransportError};
use crate::policy::ActionPayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("send of {amount} to {destination} failed: {source}")]
    Send {
        destination: String,
        amount: Amount,
        #[source]
        source: TransportError,
    },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("nothing to forward: amount {0} is not positive")]
    MissingAmount(Amount),
}

/// Everything a trigger gets to see about the transaction it fires for.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub watcher: String,
    pub payload: ActionPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Success,
    Failure,
}

impl std::fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionOutcome::Success => write!(f, "success"),
            ActionOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// Per-trigger report, kept for logging and cycle summaries.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub triggered_id: String,
    pub outcome: ActionOutcome,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait ActionTrigger: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the action. `Ok` carries a human-readable detail line.
    async fn execute(&self, ctx: &ActionContext) -> Result<String, ActionError>;
}

/// Execute `trigger` and fold the result into an [`ActionResult`], logging
/// failures with the full transaction context.
pub async fn fire(trigger: &dyn ActionTrigger, ctx: &ActionContext) -> ActionResult {
    match trigger.execute(ctx).await {
        Ok(detail) => {
            info!(
                watcher = %ctx.watcher,
                action = trigger.name(),
                txid = %ctx.payload.txid,
                amount = %ctx.payload.amount,
                detail = %detail,
                "action fired"
            );
            ActionResult {
                triggered_id: ctx.payload.txid.clone(),
                outcome: ActionOutcome::Success,
                detail,
                at: Utc::now(),
            }
        }
        Err(e) => {
            error!(
                watcher = %ctx.watcher,
                action = trigger.name(),
                txid = %ctx.payload.txid,
                amount = %ctx.payload.amount,
                confirmations = ctx.payload.confirmations,
                error = %e,
                "action failed; transaction will not be retried"
            );
            ActionResult {
                triggered_id: ctx.payload.txid.clone(),
                outcome: ActionOutcome::Failure,
                detail: e.to_string(),
                at: Utc::now(),
            }
        }
    }
}

/// Build the trigger a watcher's config asks for. Forwarding sends from the
/// watched wallet's own client.
pub fn from_config(
    config: &ActionConfig,
    ledger: Arc<dyn LedgerClient>,
    send_timeout: Duration,
) -> Box<dyn ActionTrigger> {
    match config {
        ActionConfig::Forward {
            destination,
            amount,
        } => Box::new(
            ForwardFunds::new(ledger, destination.clone(), *amount).with_timeout(send_timeout),
        ),
        ActionConfig::Invoke { program, args } => {
            Box::new(InvokeExternal::new(program.clone(), args.clone()))
        }
        ActionConfig::Log => Box::new(LogOnly),
    }
}

/// Pays the qualifying amount (or a fixed amount) to a destination address.
pub struct ForwardFunds {
    ledger: Arc<dyn LedgerClient>,
    destination: String,
    fixed_amount: Option<Amount>,
    timeout: Option<Duration>,
}

impl ForwardFunds {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        destination: String,
        fixed_amount: Option<Amount>,
    ) -> Self {
        Self {
            ledger,
            destination,
            fixed_amount,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn send(&self, amount: Amount) -> Result<String, TransportError> {
        let send = self.ledger.send(&self.destination, amount);
        match self.timeout {
            Some(after) => tokio::time::timeout(after, send).await.map_err(|_| {
                TransportError::Timeout {
                    method: "sendtoaddress".to_string(),
                    after,
                }
            })?,
            None => send.await,
        }
    }
}

#[async_trait]
impl ActionTrigger for ForwardFunds {
    fn name(&self) -> &str {
        "forward"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String, ActionError> {
        let amount = self.fixed_amount.unwrap_or(ctx.payload.amount);
        if !amount.is_positive() {
            return Err(ActionError::MissingAmount(amount));
        }

        let send_txid = self
            .send(amount)
            .await
            .map_err(|source| ActionError::Send {
                destination: self.destination.clone(),
                amount,
                source,
            })?;

        Ok(format!(
            "sent {} to {} in {}",
            amount, self.destination, send_txid
        ))
    }
}

/// Starts an external program and does not wait for it. The transaction
/// context is passed through `THA_*` environment variables.
pub struct InvokeExternal {
    program: String,
    args: Vec<String>,
}

impl InvokeExternal {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

#[async_trait]
impl ActionTrigger for InvokeExternal {
    fn name(&self) -> &str {
        "invoke"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String, ActionError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("THA_WATCHER", &ctx.watcher)
            .env("THA_TXID", &ctx.payload.txid)
            .env("THA_AMOUNT", ctx.payload.amount.to_string())
            .env("THA_CONFIRMATIONS", ctx.payload.confirmations.to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ActionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let pid = child.id();
        let program = self.program.clone();
        let txid = ctx.payload.txid.clone();

        // Reap the child in the background so it never lingers as a zombie.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    info!(program = %program, txid = %txid, "external action exited");
                }
                Ok(status) => {
                    warn!(program = %program, txid = %txid, status = %status, "external action exited with failure");
                }
                Err(e) => {
                    warn!(program = %program, txid = %txid, error = %e, "failed to wait on external action");
                }
            }
        });

        Ok(match pid {
            Some(pid) => format!("spawned {} (pid {})", self.program, pid),
            None => format!("spawned {}", self.program),
        })
    }
}

/// Records the qualifying transaction and nothing else.
pub struct LogOnly;

#[async_trait]
impl ActionTrigger for LogOnly {
    fn name(&self) -> &str {
        "log"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String, ActionError> {
        Ok(format!(
            "transaction {} confirmed with {} confirmations",
            ctx.payload.txid, ctx.payload.confirmations
        ))
    }
}
