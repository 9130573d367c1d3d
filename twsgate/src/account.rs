// twsgate/src/account.rs
// Account data structures: positions, summary values, executions.

use crate::contract::Contract;
use serde::{Deserialize, Serialize};

/// A position row from the positions stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
  pub account: String,
  pub contract: Contract,
  pub position: f64,
  pub avg_cost: f64,
}

/// One `tag = value` pair from an account summary request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummaryEntry {
  pub account: String,
  pub tag: String,
  pub value: String,
  pub currency: String,
}

impl AccountSummaryEntry {
  /// Numeric value of the first entry carrying `tag`.
  /// `None` when the tag is absent or its value is not a number.
  pub fn value_for_tag(entries: &[AccountSummaryEntry], tag: &str) -> Option<f64> {
    entries.iter()
      .find(|e| e.tag == tag)
      .and_then(|e| e.value.parse::<f64>().ok())
  }
}

/// Whether an account trades real money.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
  Paper,
  Live,
}

impl TradingMode {
  /// Paper accounts are prefixed "DU" (demo unlimited) or "DF" (demo funded).
  pub fn from_account_id(account_id: &str) -> Self {
    if account_id.starts_with("DU") || account_id.starts_with("DF") {
      TradingMode::Paper
    } else {
      TradingMode::Live
    }
  }
}

/// Execution report, logged to the order audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
  pub exec_id: String,
  pub order_id: i32,
  pub symbol: String,
  pub side: String,
  pub shares: f64,
  pub price: f64,
  pub time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionReport {
  pub exec_id: String,
  pub commission: f64,
  pub currency: String,
  pub realized_pnl: Option<f64>,
}
