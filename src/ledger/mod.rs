//! Ledger-facing types and the query interface the watcher consumes.
//!
//! The watcher never talks to a node directly. It goes through
//! [`LedgerClient`], which exposes exactly the three wallet calls the
//! poll loop and the forwarding action need. `rpc::WalletRpcClient` is the
//! production implementation; tests script their own.

pub mod rpc;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub use rpc::{BlockchainInfo, RpcEndpoint, WalletRpcClient};

/// Fractional digits of the ledger's native unit.
pub const COIN_DECIMALS: u32 = 8;

const UNITS_PER_COIN: i64 = 100_000_000;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} returned HTTP {status}: {body}")]
    Status {
        method: String,
        status: u16,
        body: String,
    },
    #[error("{method} failed with RPC error {code}: {message}")]
    Rpc {
        method: String,
        status: u16,
        code: i64,
        message: String,
    },
    #[error("malformed {method} response: {reason}")]
    Malformed { method: String, reason: String },
    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },
}

impl TransportError {
    /// HTTP status of the failed response, when the failure got that far.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TransportError::Http(e) => e.status().map(|s| s.as_u16()),
            TransportError::Status { status, .. } | TransportError::Rpc { status, .. } => {
                Some(*status)
            }
            TransportError::Malformed { .. } | TransportError::Timeout { .. } => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount {0:?}")]
    Invalid(String),
    #[error("amount {0} has more than 8 fractional digits")]
    TooPrecise(Decimal),
    #[error("amount {0} is out of range")]
    Overflow(Decimal),
}

/// A signed coin amount held as an integer count of the ledger's minor unit
/// (1e-8 coin). Equality is exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_units(units: i64) -> Self {
        Amount(units)
    }

    pub fn units(self) -> i64 {
        self.0
    }

    pub fn from_decimal(value: Decimal) -> Result<Self, AmountError> {
        let scaled = value
            .checked_mul(Decimal::from(UNITS_PER_COIN))
            .ok_or(AmountError::Overflow(value))?;
        if !scaled.fract().is_zero() {
            return Err(AmountError::TooPrecise(value));
        }
        scaled
            .to_i64()
            .map(Amount)
            .ok_or(AmountError::Overflow(value))
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, COIN_DECIMALS).normalize()
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = if s.contains(['e', 'E']) {
            Decimal::from_scientific(s)
        } else {
            Decimal::from_str(s)
        };
        let value = parsed.map_err(|_| AmountError::Invalid(s.to_string()))?;
        Amount::from_decimal(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl<'de> serde::de::Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a coin amount as a number or decimal string")
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Amount, E> {
                v.checked_mul(UNITS_PER_COIN)
                    .map(Amount)
                    .ok_or_else(|| E::custom(format!("amount {v} is out of range")))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Amount, E> {
                i64::try_from(v)
                    .ok()
                    .and_then(|v| v.checked_mul(UNITS_PER_COIN))
                    .map(Amount)
                    .ok_or_else(|| E::custom(format!("amount {v} is out of range")))
            }

            // f64 Display is the shortest string that round-trips, so a
            // node-formatted 8-digit amount comes back exactly while the f64
            // step stays below 1e-8, i.e. up to about 2^26 (~67M) coins.
            // Larger values would need serde_json's arbitrary_precision.
            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Amount, E> {
                if !v.is_finite() {
                    return Err(E::custom("amount is not finite"));
                }
                Amount::from_str(&v.to_string()).map_err(E::custom)
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Amount, E> {
                Amount::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

/// Economic direction of a transaction (or one of its detail entries) as
/// reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum Category {
    Receive,
    Generate,
    Send,
    Immature,
    Orphan,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Receive => "receive",
            Category::Generate => "generate",
            Category::Send => "send",
            Category::Immature => "immature",
            Category::Orphan => "orphan",
            Category::Other => "other",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown category {0:?} (expected receive, generate, send, immature, orphan or other)")]
pub struct CategoryError(String);

/// Strict parse for operator input: unknown names are an error.
impl FromStr for Category {
    type Err = CategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "receive" => Ok(Category::Receive),
            "generate" => Ok(Category::Generate),
            "send" => Ok(Category::Send),
            "immature" => Ok(Category::Immature),
            "orphan" => Ok(Category::Orphan),
            "other" => Ok(Category::Other),
            _ => Err(CategoryError(s.to_string())),
        }
    }
}

/// Lenient conversion for ledger input: anything the node invents maps to
/// `Other`.
impl From<&str> for Category {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or(Category::Other)
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        Category::from(s.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One per-address line of a transaction's detail record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailEntry {
    pub category: Category,
    pub amount: Amount,
    pub address: Option<String>,
}

/// A transaction fact as observed at one poll. `details` is empty in the
/// summary form returned by `list_recent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub txid: String,
    pub category: Category,
    pub amount: Amount,
    pub confirmations: u32,
    pub details: Vec<DetailEntry>,
}

impl Transaction {
    /// Fill gaps in a detail record from the summary it was fetched for.
    ///
    /// Detail records carry no top-level category on most nodes, so the
    /// summary's category wins whenever the detail reports `Other`.
    /// Confirmations only move forward between the two reads.
    pub fn reconcile(mut self, summary: &Transaction) -> Transaction {
        if self.category == Category::Other {
            self.category = summary.category;
        }
        self.confirmations = self.confirmations.max(summary.confirmations);
        self
    }
}

/// The wallet queries the watcher depends on.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Most recent wallet transactions in ledger order.
    async fn list_recent(
        &self,
        count: usize,
        skip: usize,
        include_watch_only: bool,
    ) -> Result<Vec<Transaction>, TransportError>;

    /// Full record for one transaction, including `details`.
    async fn get_detail(&self, txid: &str) -> Result<Transaction, TransportError>;

    /// Pay `amount` to `destination`. Not idempotent: every call creates a
    /// new transaction and returns its id.
    async fn send(&self, destination: &str, amount: Amount) -> Result<String, TransportError>;
}
