//! Wallet transaction watcher.
//!
//! Polls a node's wallet for recent transactions, checks each against a
//! policy (category, amount, confirmations) and fires a follow-up action at
//! most once per qualifying transaction. Binaries build one `PollLoop` per
//! watched wallet from `config`.

pub mod action;
pub mod config;
pub mod ledger;
pub mod policy;
pub mod poll;
pub mod seen;
