//! Qualification rules for a watched wallet.
//!
//! [`evaluate`] is pure: the same transaction and policy always give the
//! same [`Decision`]. Amount comparison is exact at the ledger's 1e-8
//! precision.

use crate::ledger::{Amount, Category, Transaction};
use std::fmt;

/// What a transaction must look like before the watcher acts on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub required_category: Category,
    pub min_confirmations: u32,
    /// Exact-match amount, when set.
    pub expected_amount: Option<Amount>,
    /// At least one detail entry must carry this category, when set.
    pub required_detail_category: Option<Category>,
}

impl Policy {
    pub fn new(required_category: Category) -> Self {
        Self {
            required_category,
            min_confirmations: 0,
            expected_amount: None,
            required_detail_category: None,
        }
    }

    pub fn with_min_confirmations(mut self, min_confirmations: u32) -> Self {
        self.min_confirmations = min_confirmations;
        self
    }

    pub fn with_expected_amount(mut self, amount: Amount) -> Self {
        self.expected_amount = Some(amount);
        self
    }

    pub fn with_detail_category(mut self, category: Category) -> Self {
        self.required_detail_category = Some(category);
        self
    }
}

/// Inputs handed to the action when a transaction qualifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPayload {
    pub txid: String,
    /// The detail entry's amount when the policy matched on a detail
    /// category, otherwise the transaction's own amount.
    pub amount: Amount,
    pub confirmations: u32,
}

/// First criterion a transaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Category { found: Category },
    Confirmations { have: u32, need: u32 },
    Amount { found: Amount },
    DetailCategory,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Category { found } => write!(f, "category {found}"),
            Rejection::Confirmations { have, need } => {
                write!(f, "{have}/{need} confirmations")
            }
            Rejection::Amount { found } => write!(f, "amount {found}"),
            Rejection::DetailCategory => write!(f, "no matching detail entry"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub qualifies: bool,
    pub payload: Option<ActionPayload>,
    pub rejection: Option<Rejection>,
}

impl Decision {
    fn qualified(payload: ActionPayload) -> Self {
        Self {
            qualifies: true,
            payload: Some(payload),
            rejection: None,
        }
    }

    fn rejected(rejection: Rejection) -> Self {
        Self {
            qualifies: false,
            payload: None,
            rejection: Some(rejection),
        }
    }
}

pub fn evaluate(tx: &Transaction, policy: &Policy) -> Decision {
    if tx.category != policy.required_category {
        return Decision::rejected(Rejection::Category { found: tx.category });
    }

    if tx.confirmations < policy.min_confirmations {
        return Decision::rejected(Rejection::Confirmations {
            have: tx.confirmations,
            need: policy.min_confirmations,
        });
    }

    if let Some(expected) = policy.expected_amount {
        if tx.amount != expected {
            return Decision::rejected(Rejection::Amount { found: tx.amount });
        }
    }

    let amount = match policy.required_detail_category {
        Some(wanted) => match tx.details.iter().find(|d| d.category == wanted) {
            Some(entry) => entry.amount,
            None => return Decision::rejected(Rejection::DetailCategory),
        },
        None => tx.amount,
    };

    Decision::qualified(ActionPayload {
        txid: tx.txid.clone(),
        amount,
        confirmations: tx.confirmations,
    })
}
