// twsgate/src/session.rs
//! The boundary to the underlying gateway client library.
//!
//! A [`GatewaySession`] owns the socket, the framing and the decoding. This
//! crate only pushes [`OutboundCommand`]s into it and pumps decoded
//! [`GatewayEvent`]s out of it.

use crate::account::{AccountSummaryEntry, CommissionReport, Execution, Position};
use crate::base::GatewayError;
use crate::contract::{Bar, Contract, ContractDetails, ScanData, ScannerSubscription, TagValue};
use crate::data::{HistoricalDataRequest, MarketDataRequest, TickPrice};
use crate::order::{OpenOrder, OrderRequest, OrderStatusUpdate};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub trait GatewaySession: Send + Sync {
  /// Opens the transport. `Ok(false)` means the transport refused without a
  /// hard error (e.g. nothing listening).
  fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<bool, GatewayError>;

  /// Extra connect options sent during the handshake (e.g. "+PACEAPI").
  fn set_connect_options(&self, _options: &str) {}

  fn disconnect(&self);

  fn is_connected(&self) -> bool;

  /// Fire-and-forget. Responses arrive later as events.
  fn send(&self, command: OutboundCommand) -> Result<(), GatewayError>;

  /// Starts the session-owned reader that fills the inbound buffer.
  fn start_reader(&self) -> Result<(), GatewayError>;

  /// Blocks until inbound data may be available or `timeout` elapses.
  /// Returns false on timeout.
  fn wait_for_signal(&self, timeout: Duration) -> bool;

  /// Decodes buffered frames and hands each resulting event to `sink`.
  /// Returns the number of events produced.
  fn process_messages(&self, sink: &mut dyn FnMut(GatewayEvent)) -> Result<usize, GatewayError>;
}

/// Requests this crate issues to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
  RequestMarketData { req_id: i32, request: MarketDataRequest },
  CancelMarketData { req_id: i32 },
  RequestHistoricalData { req_id: i32, request: HistoricalDataRequest },
  RequestContractDetails { req_id: i32, contract: Contract },
  RequestScannerSubscription { req_id: i32, subscription: ScannerSubscription, filter_options: Vec<TagValue> },
  CancelScannerSubscription { req_id: i32 },
  PlaceOrder { order_id: i32, contract: Contract, order: OrderRequest },
  RequestPositions,
  RequestAllOpenOrders,
  RequestAccountSummary { req_id: i32, group: String, tags: String },
  CancelAccountSummary { req_id: i32 },
  GlobalCancel,
  RequestMarketDataType { kind: i32 },
}

/// Discriminant of [`OutboundCommand`], used as the key of mock scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
  RequestMarketData,
  CancelMarketData,
  RequestHistoricalData,
  RequestContractDetails,
  RequestScannerSubscription,
  CancelScannerSubscription,
  PlaceOrder,
  RequestPositions,
  RequestAllOpenOrders,
  RequestAccountSummary,
  CancelAccountSummary,
  GlobalCancel,
  RequestMarketDataType,
}

impl OutboundCommand {
  pub fn kind(&self) -> CommandKind {
    match self {
      OutboundCommand::RequestMarketData { .. } => CommandKind::RequestMarketData,
      OutboundCommand::CancelMarketData { .. } => CommandKind::CancelMarketData,
      OutboundCommand::RequestHistoricalData { .. } => CommandKind::RequestHistoricalData,
      OutboundCommand::RequestContractDetails { .. } => CommandKind::RequestContractDetails,
      OutboundCommand::RequestScannerSubscription { .. } => CommandKind::RequestScannerSubscription,
      OutboundCommand::CancelScannerSubscription { .. } => CommandKind::CancelScannerSubscription,
      OutboundCommand::PlaceOrder { .. } => CommandKind::PlaceOrder,
      OutboundCommand::RequestPositions => CommandKind::RequestPositions,
      OutboundCommand::RequestAllOpenOrders => CommandKind::RequestAllOpenOrders,
      OutboundCommand::RequestAccountSummary { .. } => CommandKind::RequestAccountSummary,
      OutboundCommand::CancelAccountSummary { .. } => CommandKind::CancelAccountSummary,
      OutboundCommand::GlobalCancel => CommandKind::GlobalCancel,
      OutboundCommand::RequestMarketDataType { .. } => CommandKind::RequestMarketDataType,
    }
  }

  /// Correlation id carried by the command; order id for `PlaceOrder`.
  pub fn request_id(&self) -> Option<i32> {
    match self {
      OutboundCommand::RequestMarketData { req_id, .. }
      | OutboundCommand::CancelMarketData { req_id }
      | OutboundCommand::RequestHistoricalData { req_id, .. }
      | OutboundCommand::RequestContractDetails { req_id, .. }
      | OutboundCommand::RequestScannerSubscription { req_id, .. }
      | OutboundCommand::CancelScannerSubscription { req_id }
      | OutboundCommand::RequestAccountSummary { req_id, .. }
      | OutboundCommand::CancelAccountSummary { req_id } => Some(*req_id),
      OutboundCommand::PlaceOrder { order_id, .. } => Some(*order_id),
      OutboundCommand::RequestPositions
      | OutboundCommand::RequestAllOpenOrders
      | OutboundCommand::GlobalCancel
      | OutboundCommand::RequestMarketDataType { .. } => None,
    }
  }
}

/// Decoded inbound callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
  NextValidId { order_id: i32 },
  TickPrice { req_id: i32, tick: TickPrice },
  TickSize { req_id: i32, field: i32, size: f64 },
  TickSnapshotEnd { req_id: i32 },
  MarketDataType { req_id: i32, kind: i32 },
  HistoricalData { req_id: i32, bar: Bar },
  HistoricalDataEnd { req_id: i32, start: String, end: String },
  ContractDetails { req_id: i32, details: ContractDetails },
  ContractDetailsEnd { req_id: i32 },
  ScannerData { req_id: i32, row: ScanData },
  ScannerDataEnd { req_id: i32 },
  Position { position: Position },
  PositionEnd,
  OpenOrder { order: OpenOrder },
  OpenOrderEnd,
  AccountSummary { req_id: i32, entry: AccountSummaryEntry },
  AccountSummaryEnd { req_id: i32 },
  OrderStatus { update: OrderStatusUpdate },
  ExecutionDetails { req_id: i32, execution: Execution },
  CommissionReport { report: CommissionReport },
  Error {
    id: i32,
    code: i32,
    message: String,
    #[serde(default)]
    advanced_order_reject: Option<String>,
  },
  ConnectionClosed,
  CurrentTime { time: i64 },
  ManagedAccounts { accounts: String },
}

impl GatewayEvent {
  /// Copy of the event with its request correlation id replaced. Events without
  /// one (positions, open orders, connection-wide errors with id -1, ...) are
  /// returned unchanged.
  pub fn with_request_id(&self, id: i32) -> GatewayEvent {
    let mut event = self.clone();
    match &mut event {
      GatewayEvent::TickPrice { req_id, .. }
      | GatewayEvent::TickSize { req_id, .. }
      | GatewayEvent::TickSnapshotEnd { req_id }
      | GatewayEvent::MarketDataType { req_id, .. }
      | GatewayEvent::HistoricalData { req_id, .. }
      | GatewayEvent::HistoricalDataEnd { req_id, .. }
      | GatewayEvent::ContractDetails { req_id, .. }
      | GatewayEvent::ContractDetailsEnd { req_id }
      | GatewayEvent::ScannerData { req_id, .. }
      | GatewayEvent::ScannerDataEnd { req_id }
      | GatewayEvent::AccountSummary { req_id, .. }
      | GatewayEvent::AccountSummaryEnd { req_id }
      | GatewayEvent::ExecutionDetails { req_id, .. } => *req_id = id,
      GatewayEvent::Error { id: err_id, .. } if *err_id >= 0 => *err_id = id,
      _ => {}
    }
    event
  }
}
