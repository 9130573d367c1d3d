// twsgate/src/dispatcher.rs
//
// Route decoded gateway events to the trackers and the order id window.
use crate::account::{AccountSummaryEntry, Position};
use crate::base::GatewayErrorReport;
use crate::contract::{Bar, ContractDetails, ScanData};
use crate::data::{MarketDataType, TickPrice};
use crate::order::OpenOrder;
use crate::order_ids::OrderIdAllocator;
use crate::session::GatewayEvent;
use crate::tracker::{TrackerRegistry, OPEN_ORDERS_REQ_ID, POSITIONS_REQ_ID};

use crossbeam_channel::Receiver;
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

/// Log target for order lifecycle events (status, executions, commissions).
pub const ORDER_AUDIT_TARGET: &str = "order_audit";

/// Notified when the session reports it was closed.
pub trait ConnectionObserver: Send + Sync {
  fn connection_lost(&self);
}

/// How a gateway error frame is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
  /// System messages, code 10000 and above.
  Informational,
  /// Connectivity and data farm notices, codes 2100 to 2169.
  Warning,
  /// Everything else: rejections, bad requests, lost connectivity.
  Error,
}

impl ErrorSeverity {
  pub fn classify(code: i32) -> Self {
    if (2100..2170).contains(&code) {
      ErrorSeverity::Warning
    } else if code >= 10000 {
      ErrorSeverity::Informational
    } else {
      ErrorSeverity::Error
    }
  }
}

pub struct CallbackDispatcher {
  trackers: Arc<TrackerRegistry>,
  order_ids: Arc<OrderIdAllocator>,
  last_error: Mutex<Option<GatewayErrorReport>>,
  market_data_type: Mutex<MarketDataType>,
  observer: RwLock<Option<Weak<dyn ConnectionObserver>>>,
}

impl CallbackDispatcher {
  pub fn new(trackers: Arc<TrackerRegistry>, order_ids: Arc<OrderIdAllocator>) -> Self {
    CallbackDispatcher {
      trackers,
      order_ids,
      last_error: Mutex::new(None),
      market_data_type: Mutex::new(MarketDataType::Unknown),
      observer: RwLock::new(None),
    }
  }

  pub fn set_observer(&self, observer: Weak<dyn ConnectionObserver>) {
    *self.observer.write() = Some(observer);
  }

  /// Consumes events until every sender is dropped.
  pub fn run(&self, events: Receiver<GatewayEvent>) {
    debug!("Dispatcher loop started.");
    for event in events.iter() {
      self.dispatch(event);
    }
    debug!("Dispatcher loop finished: event channel closed.");
  }

  pub fn dispatch(&self, event: GatewayEvent) {
    match event {
      GatewayEvent::NextValidId { order_id } => {
        debug!("Next valid order id: {}", order_id);
        self.order_ids.on_next_valid_id(order_id);
      }

      // Market data
      GatewayEvent::TickPrice { req_id, tick } => {
        trace!("Tick price: req_id={}, {:?}={}", req_id, tick.field, tick.price);
        self.trackers.get::<TickPrice>().add(req_id, tick);
      }
      GatewayEvent::TickSize { req_id, field, size } => {
        trace!("Tick size: req_id={}, field={}, size={}", req_id, field, size);
      }
      GatewayEvent::TickSnapshotEnd { req_id } => {
        debug!("Tick snapshot end: req_id={}", req_id);
        self.trackers.get::<TickPrice>().complete(req_id);
      }
      GatewayEvent::MarketDataType { req_id, kind } => {
        let kind = MarketDataType::from(kind);
        debug!("Market data type: req_id={}, type={}", req_id, kind);
        *self.market_data_type.lock() = kind;
      }
      GatewayEvent::HistoricalData { req_id, bar } => {
        trace!("Historical bar: req_id={}, time={}", req_id, bar.time);
        self.trackers.get::<Bar>().add(req_id, bar);
      }
      GatewayEvent::HistoricalDataEnd { req_id, start, end } => {
        debug!("Historical data end: req_id={}, {} to {}", req_id, start, end);
        self.trackers.get::<Bar>().complete(req_id);
      }

      // Reference data and scanner
      GatewayEvent::ContractDetails { req_id, details } => {
        trace!("Contract details: req_id={}, symbol={}", req_id, details.contract.symbol);
        self.trackers.get::<ContractDetails>().add(req_id, details);
      }
      GatewayEvent::ContractDetailsEnd { req_id } => {
        debug!("Contract details end: req_id={}", req_id);
        self.trackers.get::<ContractDetails>().complete(req_id);
      }
      GatewayEvent::ScannerData { req_id, row } => {
        trace!("Scanner row: req_id={}, rank={}, symbol={}", req_id, row.rank, row.contract_details.contract.symbol);
        self.trackers.get::<ScanData>().add(req_id, row);
      }
      GatewayEvent::ScannerDataEnd { req_id } => {
        debug!("Scanner data end: req_id={}", req_id);
        self.trackers.get::<ScanData>().complete(req_id);
      }

      // Account
      GatewayEvent::Position { position } => {
        trace!("Position: {} {} @ {}", position.contract.symbol, position.position, position.avg_cost);
        self.trackers.get::<Position>().add(POSITIONS_REQ_ID, position);
      }
      GatewayEvent::PositionEnd => {
        debug!("Position end");
        self.trackers.get::<Position>().complete(POSITIONS_REQ_ID);
      }
      GatewayEvent::AccountSummary { req_id, entry } => {
        trace!("Account summary: req_id={}, {}={} {}", req_id, entry.tag, entry.value, entry.currency);
        self.trackers.get::<AccountSummaryEntry>().add(req_id, entry);
      }
      GatewayEvent::AccountSummaryEnd { req_id } => {
        debug!("Account summary end: req_id={}", req_id);
        self.trackers.get::<AccountSummaryEntry>().complete(req_id);
      }

      // Orders
      GatewayEvent::OpenOrder { order } => {
        info!(target: ORDER_AUDIT_TARGET, "Open order: id={}, {} {} {} {}, status={}",
              order.order_id, order.order.side, order.order.quantity, order.contract.symbol,
              order.order.order_type, order.state.status);
        self.trackers.get::<OpenOrder>().add(OPEN_ORDERS_REQ_ID, order);
      }
      GatewayEvent::OpenOrderEnd => {
        debug!("Open order end");
        self.trackers.get::<OpenOrder>().complete(OPEN_ORDERS_REQ_ID);
      }
      GatewayEvent::OrderStatus { update } => {
        info!(target: ORDER_AUDIT_TARGET,
              "Order status: id={}, status={}, filled={}, remaining={}, avg_price={}, last_price={}, parent={}, why_held={}",
              update.order_id, update.status, update.filled, update.remaining,
              update.avg_fill_price, update.last_fill_price, update.parent_id, update.why_held);
      }
      GatewayEvent::ExecutionDetails { req_id, execution } => {
        info!(target: ORDER_AUDIT_TARGET,
              "Execution: req_id={}, order_id={}, exec_id={}, {} {} {} @ {}, time={}",
              req_id, execution.order_id, execution.exec_id, execution.side, execution.shares,
              execution.symbol, execution.price, execution.time);
      }
      GatewayEvent::CommissionReport { report } => {
        info!(target: ORDER_AUDIT_TARGET, "Commission: exec_id={}, {} {}, realized_pnl={:?}",
              report.exec_id, report.commission, report.currency, report.realized_pnl);
      }

      // Session
      GatewayEvent::Error { id, code, message, advanced_order_reject } => {
        self.handle_error(id, code, message, advanced_order_reject);
      }
      GatewayEvent::ConnectionClosed => {
        warn!("Gateway reported connection closed.");
        let observer = self.observer.read().as_ref().and_then(|w| w.upgrade());
        match observer {
          Some(observer) => observer.connection_lost(),
          None => debug!("No connection observer registered; ignoring close."),
        }
      }
      GatewayEvent::CurrentTime { time } => {
        debug!("Gateway time: {}", time);
      }
      GatewayEvent::ManagedAccounts { accounts } => {
        info!("Managed accounts: {}", accounts);
      }
    }
  }

  fn handle_error(&self, id: i32, code: i32, message: String, advanced_order_reject: Option<String>) {
    match ErrorSeverity::classify(code) {
      ErrorSeverity::Warning => warn!("Gateway warning: id={}, code={}, msg={}", id, code, message),
      ErrorSeverity::Informational => info!("Gateway info: id={}, code={}, msg={}", id, code, message),
      ErrorSeverity::Error => {
        match &advanced_order_reject {
          Some(reject) => error!("Gateway error: id={}, code={}, msg={}, order_reject={}", id, code, message, reject),
          None => error!("Gateway error: id={}, code={}, msg={}", id, code, message),
        }
        let report = GatewayErrorReport { id, code, message };
        let noted = self.trackers.note_error(id, &report);
        if noted > 0 {
          debug!("Gateway error {} attached to {} pending request(s) with id {}", code, noted, id);
        }
        *self.last_error.lock() = Some(report);
      }
    }
  }

  pub fn last_error(&self) -> Option<GatewayErrorReport> {
    self.last_error.lock().clone()
  }

  pub fn market_data_type(&self) -> MarketDataType {
    *self.market_data_type.lock()
  }

  /// Records a type requested by the caller until the gateway confirms it.
  pub(crate) fn set_market_data_type(&self, kind: MarketDataType) {
    *self.market_data_type.lock() = kind;
  }
}
