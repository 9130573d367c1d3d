// twsgate/src/order.rs
// Order data structures and the bracket-order contract checks.

use crate::base::GatewayError;
use crate::contract::Contract;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
  Buy,
  Sell,
}

impl fmt::Display for OrderSide {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OrderSide::Buy => write!(f, "BUY"),
      OrderSide::Sell => write!(f, "SELL"),
    }
  }
}

impl OrderSide {
  pub fn opposite(self) -> Self {
    match self {
      OrderSide::Buy => OrderSide::Sell,
      OrderSide::Sell => OrderSide::Buy,
    }
  }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
  Market,
  Limit,
  Stop,
  StopLimit,
  MarketOnClose,
}

impl fmt::Display for OrderType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      OrderType::Market => "MKT",
      OrderType::Limit => "LMT",
      OrderType::Stop => "STP",
      OrderType::StopLimit => "STP LMT",
      OrderType::MarketOnClose => "MOC",
    };
    write!(f, "{}", s)
  }
}

/// Time in force for orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
  #[default]
  Day,
  GoodTillCancelled,
  ImmediateOrCancel,
}

impl fmt::Display for TimeInForce {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TimeInForce::Day => "DAY",
      TimeInForce::GoodTillCancelled => "GTC",
      TimeInForce::ImmediateOrCancel => "IOC",
    };
    write!(f, "{}", s)
  }
}

/// Order status as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
  PendingSubmit,
  PendingCancel,
  PreSubmitted,
  Submitted,
  ApiCancelled,
  Cancelled,
  Filled,
  Inactive,
}

impl fmt::Display for OrderStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      OrderStatus::PendingSubmit => "PendingSubmit",
      OrderStatus::PendingCancel => "PendingCancel",
      OrderStatus::PreSubmitted => "PreSubmitted",
      OrderStatus::Submitted => "Submitted",
      OrderStatus::ApiCancelled => "ApiCancelled",
      OrderStatus::Cancelled => "Cancelled",
      OrderStatus::Filled => "Filled",
      OrderStatus::Inactive => "Inactive",
    };
    write!(f, "{}", s)
  }
}

/// Order request parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
  pub side: OrderSide,
  pub order_type: OrderType,
  pub quantity: f64,
  pub limit_price: Option<f64>,
  /// Stop price for stop orders
  pub aux_price: Option<f64>,
  pub time_in_force: TimeInForce,
  pub outside_rth: bool,
  /// Zero when the order has no parent.
  pub parent_id: i32,
  pub transmit: bool,
}

impl OrderRequest {
  fn base(side: OrderSide, order_type: OrderType, quantity: f64) -> Self {
    OrderRequest {
      side,
      order_type,
      quantity,
      limit_price: None,
      aux_price: None,
      time_in_force: TimeInForce::Day,
      outside_rth: false,
      parent_id: 0,
      transmit: true,
    }
  }

  pub fn market(side: OrderSide, quantity: f64) -> Self {
    Self::base(side, OrderType::Market, quantity)
  }

  pub fn limit(side: OrderSide, quantity: f64, limit_price: f64) -> Self {
    OrderRequest { limit_price: Some(limit_price), ..Self::base(side, OrderType::Limit, quantity) }
  }

  pub fn stop(side: OrderSide, quantity: f64, stop_price: f64) -> Self {
    OrderRequest { aux_price: Some(stop_price), ..Self::base(side, OrderType::Stop, quantity) }
  }

  pub fn with_tif(mut self, tif: TimeInForce) -> Self {
    self.time_in_force = tif;
    self
  }

  pub fn outside_rth(mut self, allow: bool) -> Self {
    self.outside_rth = allow;
    self
  }

  /// Price-independent checks every outgoing order must pass.
  pub fn validate(&self) -> Result<(), GatewayError> {
    if !(self.quantity > 0.0) || !self.quantity.is_finite() {
      return Err(GatewayError::InvalidOrder(format!("Quantity must be positive, got {}", self.quantity)));
    }
    match self.order_type {
      OrderType::Limit | OrderType::StopLimit if self.limit_price.is_none() => {
        return Err(GatewayError::InvalidOrder(format!("{} order requires a limit price", self.order_type)));
      }
      _ => {}
    }
    match self.order_type {
      OrderType::Stop | OrderType::StopLimit if self.aux_price.is_none() => {
        return Err(GatewayError::InvalidOrder(format!("{} order requires a stop price", self.order_type)));
      }
      _ => {}
    }
    Ok(())
  }
}

/// Live order state attached to open-order reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
  pub status: OrderStatus,
  pub commission: Option<f64>,
  pub warning_text: Option<String>,
}

/// One entry of an open-orders listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
  pub order_id: i32,
  pub contract: Contract,
  pub order: OrderRequest,
  pub state: OrderState,
}

/// An `orderStatus` callback payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusUpdate {
  pub order_id: i32,
  pub status: OrderStatus,
  pub filled: f64,
  pub remaining: f64,
  pub avg_fill_price: f64,
  pub last_fill_price: f64,
  pub parent_id: i32,
  pub why_held: String,
}

/// Entry order plus its take-profit and stop-loss children.
///
/// Built with [`BracketOrder::new`], which derives the child sides from the
/// entry side. The children are linked to the parent at placement time.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketOrder {
  pub parent: OrderRequest,
  pub take_profit: OrderRequest,
  pub stop_loss: OrderRequest,
}

/// Ids assigned to a placed bracket; always `parent`, `parent + 1`, `parent + 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketOrderIds {
  pub parent: i32,
  pub take_profit: i32,
  pub stop_loss: i32,
}

impl BracketOrder {
  pub fn new(side: OrderSide, quantity: f64, entry_price: f64, take_profit_price: f64, stop_price: f64) -> Self {
    let exit = side.opposite();
    BracketOrder {
      parent: OrderRequest::limit(side, quantity, entry_price),
      take_profit: OrderRequest::limit(exit, quantity, take_profit_price),
      stop_loss: OrderRequest::stop(exit, quantity, stop_price),
    }
  }

  /// Checks price ordering: a long bracket needs `stop < entry < take_profit`,
  /// a short bracket the reverse.
  pub fn validate(&self) -> Result<(), GatewayError> {
    self.parent.validate()?;
    self.take_profit.validate()?;
    self.stop_loss.validate()?;

    let entry = self.parent.limit_price
      .ok_or_else(|| GatewayError::InvalidOrder("Bracket entry requires a limit price".to_string()))?;
    let target = self.take_profit.limit_price
      .ok_or_else(|| GatewayError::InvalidOrder("Take-profit requires a limit price".to_string()))?;
    let stop = self.stop_loss.aux_price
      .ok_or_else(|| GatewayError::InvalidOrder("Stop-loss requires a stop price".to_string()))?;

    if self.take_profit.side == self.parent.side || self.stop_loss.side == self.parent.side {
      return Err(GatewayError::InvalidOrder("Bracket children must close the parent position".to_string()));
    }

    let ordered = match self.parent.side {
      OrderSide::Buy => stop < entry && entry < target,
      OrderSide::Sell => target < entry && entry < stop,
    };
    if !ordered {
      return Err(GatewayError::InvalidOrder(format!(
        "Invalid {} bracket prices: entry={}, take_profit={}, stop={}",
        self.parent.side, entry, target, stop
      )));
    }
    Ok(())
  }

  /// Links the children to `parent_id` and sets transmit flags so the gateway
  /// only activates the group when the last child arrives.
  pub(crate) fn linked(&self, parent_id: i32) -> (OrderRequest, OrderRequest, OrderRequest) {
    let mut parent = self.parent.clone();
    let mut take_profit = self.take_profit.clone();
    let mut stop_loss = self.stop_loss.clone();
    parent.parent_id = 0;
    parent.transmit = false;
    take_profit.parent_id = parent_id;
    take_profit.transmit = false;
    stop_loss.parent_id = parent_id;
    stop_loss.transmit = true;
    (parent, take_profit, stop_loss)
  }
}
