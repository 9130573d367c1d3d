// twsgate/src/connection.rs
//! Connection lifecycle and the blocking request operations.
//!
//! [`ConnectionManager`] owns the gateway session. Connecting starts a pump
//! thread that moves decoded events from the session into a channel; a single
//! long-lived dispatch thread drains that channel into the
//! [`CallbackDispatcher`]. Request operations register a tracker entry, send
//! the command and block until the dispatcher resolves the entry or the
//! request timeout expires.
//!
//! When the session is lost unexpectedly every pending request fails with
//! `ConnectionLost` and a recovery thread reconnects on an escalating delay
//! schedule, giving up (state `Failed`) after the configured number of
//! attempts or outside operating hours.

use crate::account::{AccountSummaryEntry, Position};
use crate::base::{GatewayError, GatewayErrorReport};
use crate::config::GatewayConfig;
use crate::contract::{Bar, Contract, ContractDetails, ScanData, ScannerSubscription, TagValue};
use crate::data::{HistoricalDataRequest, MarketDataRequest, MarketDataType, TickPrice};
use crate::dispatcher::{CallbackDispatcher, ConnectionObserver, ORDER_AUDIT_TARGET};
use crate::order::{BracketOrder, BracketOrderIds, OpenOrder, OrderRequest};
use crate::order_ids::OrderIdAllocator;
use crate::session::{GatewayEvent, GatewaySession, OutboundCommand};
use crate::tracker::{TrackerRegistry, OPEN_ORDERS_REQ_ID, POSITIONS_REQ_ID};

use chrono::Utc;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the pump blocks on the session signal before rechecking its generation.
const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum rows a scanner subscription may request.
const MAX_SCANNER_ROWS: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
  /// Automatic recovery gave up. Only `connect()` leaves this state.
  Failed,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ConnectionState::Disconnected => "DISCONNECTED",
      ConnectionState::Connecting => "CONNECTING",
      ConnectionState::Connected => "CONNECTED",
      ConnectionState::Reconnecting => "RECONNECTING",
      ConnectionState::Failed => "FAILED",
    };
    write!(f, "{}", s)
  }
}

/// Where a loss notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LossSource {
  /// A `ConnectionClosed` event. May belong to an already replaced session.
  Event,
  /// The pump of the current session saw the transport go away.
  Transport,
}

struct RecoveryTask {
  /// Dropping this wakes and stops the recovery thread.
  _stop: Sender<()>,
  _handle: JoinHandle<()>,
}

pub struct ConnectionManager {
  config: GatewayConfig,
  session: Arc<dyn GatewaySession>,
  trackers: Arc<TrackerRegistry>,
  order_ids: Arc<OrderIdAllocator>,
  dispatcher: Arc<CallbackDispatcher>,
  event_sender: Sender<GatewayEvent>,
  state: Mutex<ConnectionState>,
  manual_disconnect: AtomicBool,
  reconnect_attempts: AtomicU32,
  /// Bumped for every session attempt and on disconnect; a pump only reports
  /// loss for the generation it was started for.
  generation: AtomicU64,
  /// Serializes session setup and teardown.
  connect_lock: Mutex<()>,
  recovery: Mutex<Option<RecoveryTask>>,
  self_ref: Weak<ConnectionManager>,
}

impl ConnectionManager {
  /// Validates `config` and starts the dispatch thread. No connection is made yet.
  pub fn new(config: GatewayConfig, session: Arc<dyn GatewaySession>) -> Result<Arc<Self>, GatewayError> {
    config.validate()?;
    let trackers = Arc::new(TrackerRegistry::new());
    let order_ids = Arc::new(OrderIdAllocator::new());
    let dispatcher = Arc::new(CallbackDispatcher::new(trackers.clone(), order_ids.clone()));
    let (event_sender, event_receiver) = unbounded();

    let manager = Arc::new_cyclic(|weak: &Weak<ConnectionManager>| {
      let observer: Weak<dyn ConnectionObserver> = weak.clone();
      dispatcher.set_observer(observer);
      ConnectionManager {
        config,
        session,
        trackers,
        order_ids,
        dispatcher: dispatcher.clone(),
        event_sender,
        state: Mutex::new(ConnectionState::Disconnected),
        manual_disconnect: AtomicBool::new(false),
        reconnect_attempts: AtomicU32::new(0),
        generation: AtomicU64::new(0),
        connect_lock: Mutex::new(()),
        recovery: Mutex::new(None),
        self_ref: weak.clone(),
      }
    });

    // Runs until the manager (the last event sender) is dropped.
    thread::Builder::new()
      .name("twsgate-dispatch".to_string())
      .spawn(move || dispatcher.run(event_receiver))
      .map_err(|e| GatewayError::InternalError(format!("Failed to spawn dispatch thread: {}", e)))?;

    Ok(manager)
  }

  pub fn config(&self) -> &GatewayConfig {
    &self.config
  }

  // --- Connection lifecycle ---

  /// Opens the session and blocks until the gateway delivers the initial order id.
  ///
  /// Allowed from `Disconnected` and `Failed`; any other state yields `AlreadyConnected`.
  pub fn connect(&self) -> Result<(), GatewayError> {
    let _guard = self.connect_lock.lock();
    {
      let mut state = self.state.lock();
      match *state {
        ConnectionState::Disconnected | ConnectionState::Failed => *state = ConnectionState::Connecting,
        other => {
          warn!("connect() called while {}", other);
          return Err(GatewayError::AlreadyConnected);
        }
      }
    }
    self.manual_disconnect.store(false, Ordering::SeqCst);
    self.reconnect_attempts.store(0, Ordering::SeqCst);
    self.recovery.lock().take();

    info!("Connecting to gateway at {}:{} with client id {}", self.config.host, self.config.port, self.config.client_id);
    match self.establish_session() {
      Ok(order_id) => {
        *self.state.lock() = ConnectionState::Connected;
        info!("Connection established, next order id {}", order_id);
        Ok(())
      }
      Err(e) => {
        *self.state.lock() = ConnectionState::Disconnected;
        error!("Failed to connect to {}:{}: {}", self.config.host, self.config.port, e);
        Err(e)
      }
    }
  }

  /// Closes the session for good: no reconnection follows, and pending requests
  /// fail with `ConnectionLost`. Stops a running recovery.
  pub fn disconnect(&self) {
    info!("Disconnecting from gateway...");
    self.manual_disconnect.store(true, Ordering::SeqCst);
    *self.state.lock() = ConnectionState::Disconnected;
    self.recovery.lock().take();

    let _guard = self.connect_lock.lock();
    // A connect that was in flight may have published Connected meanwhile.
    *self.state.lock() = ConnectionState::Disconnected;
    self.generation.fetch_add(1, Ordering::SeqCst);
    self.session.disconnect();
    let cancelled = self.trackers.cancel_all_pending("disconnected");
    if cancelled > 0 {
      info!("Cancelled {} pending requests on disconnect", cancelled);
    }
    info!("Disconnected from gateway");
  }

  /// True only while `Connected` with a live transport.
  pub fn is_connected(&self) -> bool {
    *self.state.lock() == ConnectionState::Connected && self.session.is_connected()
  }

  pub fn connection_state(&self) -> ConnectionState {
    *self.state.lock()
  }

  /// Attempts made by the current recovery run; zero when connected.
  pub fn reconnect_attempts(&self) -> u32 {
    self.reconnect_attempts.load(Ordering::SeqCst)
  }

  /// Connects the session, starts its pump and waits for the handshake.
  /// The caller holds `connect_lock`.
  fn establish_session(&self) -> Result<i32, GatewayError> {
    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    self.order_ids.begin_handshake();

    self.session.set_connect_options(&self.config.connect_options);
    let connected = self.session.connect(&self.config.host, self.config.port, self.config.client_id)?;
    if !connected || !self.session.is_connected() {
      return Err(GatewayError::ConnectionFailed(format!(
        "Gateway at {}:{} refused the connection (client id {} in use, API disabled, or not running)",
        self.config.host, self.config.port, self.config.client_id
      )));
    }

    let started = self.session.start_reader().and_then(|_| self.spawn_pump(generation));
    let ready = started.and_then(|_| self.order_ids.wait_until_ready(self.config.handshake_timeout));
    match ready {
      Ok(order_id) => Ok(order_id),
      Err(e) => {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.session.disconnect();
        Err(e)
      }
    }
  }

  fn spawn_pump(&self, generation: u64) -> Result<(), GatewayError> {
    let manager = self.self_ref.clone();
    let session = self.session.clone();
    let events = self.event_sender.clone();
    thread::Builder::new()
      .name(format!("twsgate-pump-{}", generation))
      .spawn(move || run_pump(manager, session, events, generation))
      .map(|_| ())
      .map_err(|e| GatewayError::InternalError(format!("Failed to spawn pump thread: {}", e)))
  }

  fn is_current_generation(&self, generation: u64) -> bool {
    self.generation.load(Ordering::SeqCst) == generation
  }

  fn handle_connection_loss(&self, source: LossSource) {
    if self.manual_disconnect.load(Ordering::SeqCst) {
      info!("Ignoring connection loss: manual disconnect");
      return;
    }
    if source == LossSource::Event && self.session.is_connected() {
      debug!("Ignoring stale connection-closed notification: session is connected");
      return;
    }
    {
      let mut state = self.state.lock();
      match *state {
        ConnectionState::Connected => *state = ConnectionState::Reconnecting,
        ConnectionState::Reconnecting => {
          debug!("Already reconnecting, ignoring duplicate loss notification");
          return;
        }
        other => {
          debug!("Ignoring connection loss while {}", other);
          return;
        }
      }
    }
    self.reconnect_attempts.store(0, Ordering::SeqCst);
    warn!("Connection loss detected ({:?}), initiating reconnection sequence", source);

    let cancelled = self.trackers.cancel_all_pending("connection lost");
    if cancelled > 0 {
      warn!("Cancelled {} pending requests after connection loss", cancelled);
    }
    self.start_recovery();
  }

  fn start_recovery(&self) {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let manager = self.self_ref.clone();
    let spawned = thread::Builder::new()
      .name("twsgate-reconnect".to_string())
      .spawn(move || run_recovery(manager, stop_rx));
    match spawned {
      Ok(handle) => {
        let mut recovery = self.recovery.lock();
        *recovery = Some(RecoveryTask { _stop: stop_tx, _handle: handle });
        // A disconnect that raced with the spawn must still stop the task.
        if self.manual_disconnect.load(Ordering::SeqCst) {
          recovery.take();
        }
      }
      Err(e) => {
        error!("Failed to spawn reconnection thread: {}", e);
        self.leave_reconnecting(ConnectionState::Failed);
      }
    }
  }

  /// Moves out of `Reconnecting`, unless a manual disconnect got there first.
  fn leave_reconnecting(&self, next: ConnectionState) -> bool {
    let mut state = self.state.lock();
    if *state == ConnectionState::Reconnecting && !self.manual_disconnect.load(Ordering::SeqCst) {
      *state = next;
      true
    } else {
      false
    }
  }

  /// One reconnection attempt. `Ok(false)` means recovery was superseded.
  fn reconnect_once(&self, attempt: u32) -> Result<bool, GatewayError> {
    let _guard = self.connect_lock.lock();
    if self.manual_disconnect.load(Ordering::SeqCst) || self.connection_state() != ConnectionState::Reconnecting {
      return Ok(false);
    }
    if self.session.is_connected() {
      debug!("Tearing down stale session before reconnecting");
      self.session.disconnect();
      thread::sleep(self.config.teardown_pause);
    }
    info!("Attempting to reconnect to {}:{}...", self.config.host, self.config.port);
    self.establish_session()?;
    if self.leave_reconnecting(ConnectionState::Connected) {
      self.reconnect_attempts.store(0, Ordering::SeqCst);
      info!("Reconnection successful on attempt {}", attempt);
      Ok(true)
    } else {
      Ok(false)
    }
  }

  // --- Request template ---

  fn ensure_connected(&self) -> Result<(), GatewayError> {
    if self.is_connected() { Ok(()) } else { Err(GatewayError::NotConnected) }
  }

  /// Registers `req_id`, sends `command` and waits for the stream to end.
  /// `cancel` is sent afterwards whatever the outcome.
  fn execute_request<T: Send + 'static>(
    &self,
    what: &str,
    req_id: i32,
    command: OutboundCommand,
    cancel: Option<OutboundCommand>,
  ) -> Result<Vec<T>, GatewayError> {
    let tracker = self.trackers.get::<T>();
    let pending = tracker.start(req_id)?;

    // Checked after registering: a loss either sees the entry in its
    // cancel_all or has already left Connected by now.
    if !self.is_connected() {
      let reason = match self.connection_state() {
        ConnectionState::Connected | ConnectionState::Reconnecting => {
          GatewayError::ConnectionLost(format!("{} request {} issued during connection loss", what, req_id))
        }
        _ => GatewayError::NotConnected,
      };
      tracker.fail(req_id, reason);
      return pending.recv();
    }

    if let Err(e) = self.session.send(command) {
      tracker.fail(req_id, e.clone());
      error!("{} request {} could not be sent: {}", what, req_id, e);
      return Err(e);
    }
    debug!("{} request {} sent", what, req_id);

    let outcome = match pending.wait(self.config.request_timeout) {
      Some(outcome) => outcome,
      None => {
        // A late completion may still win; whichever resolved first is returned.
        tracker.timeout(req_id);
        pending.recv()
      }
    };

    if let Some(cancel) = cancel {
      if self.session.is_connected() {
        if let Err(e) = self.session.send(cancel) {
          warn!("Failed to cancel {} request {}: {}", what, req_id, e);
        }
      }
    }

    match outcome {
      Ok(items) => {
        debug!("{} request {} returned {} items", what, req_id, items.len());
        Ok(items)
      }
      Err(e) => {
        debug!("{} request {} failed: {}", what, req_id, e);
        Err(e)
      }
    }
  }

  // --- Market data ---

  /// Snapshot quote: every price tick up to the snapshot end marker.
  pub fn request_quote(&self, request: MarketDataRequest) -> Result<Vec<TickPrice>, GatewayError> {
    if !request.snapshot && !request.regulatory_snapshot {
      return Err(GatewayError::InvalidParameter("Quotes must be requested as snapshots".to_string()));
    }
    if !request.generic_tick_list.is_empty() {
      return Err(GatewayError::InvalidParameter("Snapshots do not accept generic tick types".to_string()));
    }
    let req_id = self.trackers.get::<TickPrice>().next_request_id();
    debug!("[{}] Requesting quote snapshot", request.contract.symbol);
    self.execute_request("Quote", req_id, OutboundCommand::RequestMarketData { req_id, request }, None)
  }

  pub fn request_history(&self, request: HistoricalDataRequest) -> Result<Vec<Bar>, GatewayError> {
    if request.keep_up_to_date {
      return Err(GatewayError::InvalidParameter("keep_up_to_date streams never end; not supported here".to_string()));
    }
    if request.duration.trim().is_empty() {
      return Err(GatewayError::InvalidParameter("Historical duration must not be empty".to_string()));
    }
    let req_id = self.trackers.get::<Bar>().next_request_id();
    debug!("[{}] Requesting {} of {} bars", request.contract.symbol, request.duration, request.bar_size);
    self.execute_request("History", req_id, OutboundCommand::RequestHistoricalData { req_id, request }, None)
  }

  /// Asks the gateway to switch between real-time, frozen and delayed data.
  pub fn set_market_data_type(&self, kind: MarketDataType) -> Result<(), GatewayError> {
    if kind == MarketDataType::Unknown {
      return Err(GatewayError::InvalidParameter("Market data type must be specified".to_string()));
    }
    self.ensure_connected()?;
    debug!("Setting market data type to {}", kind);
    self.session.send(OutboundCommand::RequestMarketDataType { kind: kind as i32 })?;
    self.dispatcher.set_market_data_type(kind);
    Ok(())
  }

  pub fn market_data_type(&self) -> MarketDataType {
    self.dispatcher.market_data_type()
  }

  pub fn is_market_data_delayed(&self) -> bool {
    self.market_data_type().is_delayed()
  }

  // --- Reference data and scanner ---

  pub fn request_contract_details(&self, contract: &Contract) -> Result<Vec<ContractDetails>, GatewayError> {
    let req_id = self.trackers.get::<ContractDetails>().next_request_id();
    debug!("[{}] Requesting contract details", contract.symbol);
    self.execute_request("ContractDetails", req_id,
                         OutboundCommand::RequestContractDetails { req_id, contract: contract.clone() }, None)
  }

  /// First contract-details match, or `NoData` when the gateway knows none.
  pub fn resolve_contract(&self, contract: &Contract) -> Result<ContractDetails, GatewayError> {
    self.request_contract_details(contract)?
      .into_iter()
      .next()
      .ok_or_else(|| GatewayError::NoData(format!("No contract details for {} {}", contract.sec_type, contract.symbol)))
  }

  /// Runs a scanner subscription once and cancels it.
  pub fn run_scan(&self, subscription: ScannerSubscription, filter_options: Vec<TagValue>) -> Result<Vec<ScanData>, GatewayError> {
    if subscription.number_of_rows <= 0 || subscription.number_of_rows > MAX_SCANNER_ROWS {
      return Err(GatewayError::InvalidParameter(format!(
        "number_of_rows must be between 1 and {}, got {}", MAX_SCANNER_ROWS, subscription.number_of_rows
      )));
    }
    let req_id = self.trackers.get::<ScanData>().next_request_id();
    debug!("Running scan {} on {}", subscription.scan_code, subscription.location_code);
    self.execute_request(
      "Scan", req_id,
      OutboundCommand::RequestScannerSubscription { req_id, subscription, filter_options },
      Some(OutboundCommand::CancelScannerSubscription { req_id }),
    )
  }

  // --- Orders ---

  /// Sends one order under a freshly allocated id and returns that id.
  pub fn place_order(&self, contract: &Contract, order: OrderRequest) -> Result<i32, GatewayError> {
    order.validate()?;
    self.ensure_connected()?;
    let order_id = self.order_ids.next_order_id()?;
    info!(target: ORDER_AUDIT_TARGET, "Placing order {}: {} {} {} {}",
          order_id, order.side, order.quantity, contract.symbol, order.order_type);
    self.session.send(OutboundCommand::PlaceOrder { order_id, contract: contract.clone(), order })?;
    Ok(order_id)
  }

  /// Places an entry order with take-profit and stop-loss children under three
  /// consecutive ids reserved in one step.
  pub fn place_bracket_order(&self, contract: &Contract, bracket: BracketOrder) -> Result<BracketOrderIds, GatewayError> {
    bracket.validate()?;
    self.ensure_connected()?;
    let block = self.order_ids.reserve(3)?;
    let ids = BracketOrderIds { parent: block.first, take_profit: block.first + 1, stop_loss: block.first + 2 };
    let (parent, take_profit, stop_loss) = bracket.linked(ids.parent);

    info!(target: ORDER_AUDIT_TARGET,
          "Placing bracket {}/{}/{} for {}: {} {} entry={:?} target={:?} stop={:?}",
          ids.parent, ids.take_profit, ids.stop_loss, contract.symbol, parent.side, parent.quantity,
          parent.limit_price, take_profit.limit_price, stop_loss.aux_price);
    for (order_id, order) in [(ids.parent, parent), (ids.take_profit, take_profit), (ids.stop_loss, stop_loss)] {
      if let Err(e) = self.session.send(OutboundCommand::PlaceOrder { order_id, contract: contract.clone(), order }) {
        error!(target: ORDER_AUDIT_TARGET, "Bracket {} interrupted at order {}: {}", ids.parent, order_id, e);
        return Err(e);
      }
    }
    Ok(ids)
  }

  pub fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
    self.execute_request("OpenOrders", OPEN_ORDERS_REQ_ID, OutboundCommand::RequestAllOpenOrders, None)
  }

  /// Global cancel of every open order on the account.
  pub fn cancel_all_orders(&self) -> Result<(), GatewayError> {
    self.ensure_connected()?;
    warn!(target: ORDER_AUDIT_TARGET, "Cancelling all open orders");
    self.session.send(OutboundCommand::GlobalCancel)
  }

  // --- Account ---

  pub fn get_positions(&self) -> Result<Vec<Position>, GatewayError> {
    self.execute_request("Positions", POSITIONS_REQ_ID, OutboundCommand::RequestPositions, None)
  }

  /// Account summary values for `tags` (e.g. "NetLiquidation"), then cancels the subscription.
  pub fn get_account_summary(&self, tags: &[&str]) -> Result<Vec<AccountSummaryEntry>, GatewayError> {
    if tags.is_empty() {
      return Err(GatewayError::InvalidParameter("At least one account summary tag is required".to_string()));
    }
    let req_id = self.trackers.get::<AccountSummaryEntry>().next_request_id();
    let command = OutboundCommand::RequestAccountSummary {
      req_id,
      group: self.config.account_summary_group.clone(),
      tags: tags.join(","),
    };
    self.execute_request("AccountSummary", req_id, command, Some(OutboundCommand::CancelAccountSummary { req_id }))
  }

  /// Most recent real error reported by the gateway.
  pub fn last_error(&self) -> Option<GatewayErrorReport> {
    self.dispatcher.last_error()
  }
}

impl ConnectionObserver for ConnectionManager {
  fn connection_lost(&self) {
    self.handle_connection_loss(LossSource::Event);
  }
}

impl Drop for ConnectionManager {
  fn drop(&mut self) {
    self.manual_disconnect.store(true, Ordering::SeqCst);
    self.generation.fetch_add(1, Ordering::SeqCst);
    self.recovery.lock().take();
    if self.session.is_connected() {
      debug!("ConnectionManager dropped; closing session");
      self.session.disconnect();
    }
  }
}

fn run_pump(manager: Weak<ConnectionManager>, session: Arc<dyn GatewaySession>, events: Sender<GatewayEvent>, generation: u64) {
  debug!("Pump {} started", generation);
  let mut forward = |event: GatewayEvent| {
    if events.send(event).is_err() {
      debug!("Pump {}: dispatcher gone, dropping event", generation);
    }
  };
  loop {
    if session.wait_for_signal(PUMP_POLL_INTERVAL) {
      if let Err(e) = session.process_messages(&mut forward) {
        error!("Pump {}: error processing gateway messages: {}", generation, e);
      }
    }
    let current = manager.upgrade().map(|m| m.is_current_generation(generation)).unwrap_or(false);
    if !current {
      debug!("Pump {} superseded, exiting", generation);
      return;
    }
    if !session.is_connected() {
      // Deliver whatever the session buffered before it closed.
      if let Err(e) = session.process_messages(&mut forward) {
        error!("Pump {}: error draining gateway messages: {}", generation, e);
      }
      break;
    }
  }
  warn!("Pump {} exiting: session disconnected", generation);
  if let Some(manager) = manager.upgrade() {
    if manager.is_current_generation(generation) {
      manager.handle_connection_loss(LossSource::Transport);
    }
  }
}

fn run_recovery(manager: Weak<ConnectionManager>, stop: Receiver<()>) {
  loop {
    let (attempt, delay) = {
      let Some(m) = manager.upgrade() else { return };
      let max = m.config.max_reconnect_attempts;
      let attempt = m.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
      if attempt > max {
        m.leave_reconnecting(ConnectionState::Failed);
        return;
      }
      if !m.config.within_operating_hours(Utc::now()) {
        warn!("Outside operating hours, stopping reconnection attempts");
        m.leave_reconnecting(ConnectionState::Failed);
        return;
      }
      let delay = m.config.reconnect_delay(attempt);
      info!("Reconnection attempt {}/{} in {:?}", attempt, max, delay);
      (attempt, delay)
    };

    match stop.recv_timeout(delay) {
      Err(RecvTimeoutError::Timeout) => {}
      _ => {
        info!("Reconnection stopped");
        return;
      }
    }

    let Some(m) = manager.upgrade() else { return };
    match m.reconnect_once(attempt) {
      Ok(_) => return,
      Err(e) => {
        error!("Reconnection attempt {} failed: {}", attempt, e);
        if attempt >= m.config.max_reconnect_attempts {
          error!("Maximum reconnection attempts ({}) reached, giving up", m.config.max_reconnect_attempts);
          m.leave_reconnecting(ConnectionState::Failed);
          return;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::account::TradingMode;
  use crate::config::OperatingHours;
  use crate::data::{TickAttrib, TickType};
  use crate::order::{OrderSide, OrderType};
  use crate::session::CommandKind;
  use crate::session_mock::{MockScript, MockSession};
  use chrono::Duration as ChronoDuration;
  use std::collections::HashSet;
  use std::time::Instant;

  fn test_config() -> GatewayConfig {
    GatewayConfig {
      request_timeout: Duration::from_millis(300),
      handshake_timeout: Duration::from_millis(300),
      reconnect_delays: vec![Duration::ZERO],
      teardown_pause: Duration::ZERO,
      operating_hours: None,
      ..GatewayConfig::default()
    }
  }

  fn setup(config: GatewayConfig) -> (Arc<ConnectionManager>, Arc<MockSession>) {
    let session = Arc::new(MockSession::new(MockScript { handshake_order_id: Some(100), ..Default::default() }));
    let manager = ConnectionManager::new(config, session.clone()).unwrap();
    (manager, session)
  }

  fn connected() -> (Arc<ConnectionManager>, Arc<MockSession>) {
    let (manager, session) = setup(test_config());
    manager.connect().unwrap();
    (manager, session)
  }

  fn wait_for_state(manager: &ConnectionManager, expected: ConnectionState, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
      if manager.connection_state() == expected {
        return true;
      }
      thread::sleep(Duration::from_millis(5));
    }
    manager.connection_state() == expected
  }

  fn tick(field: TickType, price: f64) -> TickPrice {
    TickPrice { field, price, attribs: TickAttrib::default() }
  }

  #[test]
  fn test_connect_and_disconnect() {
    let (manager, session) = setup(test_config());
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    manager.connect().unwrap();
    assert!(manager.is_connected());
    assert_eq!(session.connect_options(), "+PACEAPI");
    assert_eq!(manager.connect(), Err(GatewayError::AlreadyConnected));
    manager.disconnect();
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert!(!session.is_connected());
  }

  #[test]
  fn test_connect_refused() {
    let (manager, session) = setup(test_config());
    session.refuse_next_connects(1);
    assert!(matches!(manager.connect(), Err(GatewayError::ConnectionFailed(_))));
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    manager.connect().unwrap();
    assert!(manager.is_connected());
  }

  #[test]
  fn test_connect_without_handshake_fails() {
    let (manager, session) = setup(test_config());
    session.set_handshake_order_id(None);
    assert!(matches!(manager.connect(), Err(GatewayError::ConnectionFailed(_))));
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert!(!session.is_connected());
  }

  #[test]
  fn test_request_when_disconnected() {
    let (manager, session) = setup(test_config());
    assert_eq!(manager.get_positions(), Err(GatewayError::NotConnected));
    assert!(session.sent_commands().is_empty());
  }

  #[test]
  fn test_request_quote() {
    let (manager, session) = connected();
    session.respond_to(CommandKind::RequestMarketData, vec![
      GatewayEvent::TickPrice { req_id: 0, tick: tick(TickType::BidPrice, 9.99) },
      GatewayEvent::TickPrice { req_id: 0, tick: tick(TickType::AskPrice, 10.01) },
      GatewayEvent::TickSnapshotEnd { req_id: 0 },
    ]);
    let ticks = manager.request_quote(MarketDataRequest::snapshot(Contract::stock("AAPL"))).unwrap();
    assert_eq!(ticks, vec![tick(TickType::BidPrice, 9.99), tick(TickType::AskPrice, 10.01)]);
  }

  #[test]
  fn test_streaming_quote_rejected_before_send() {
    let (manager, session) = connected();
    let mut request = MarketDataRequest::snapshot(Contract::stock("AAPL"));
    request.snapshot = false;
    assert!(matches!(manager.request_quote(request), Err(GatewayError::InvalidParameter(_))));
    assert!(session.sent_commands().is_empty());
  }

  #[test]
  fn test_request_times_out_and_late_events_are_dropped() {
    let (manager, session) = connected();
    let started = Instant::now();
    let result = manager.request_contract_details(&Contract::stock("NOPE"));
    assert!(matches!(result, Err(GatewayError::Timeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(300));

    let req_id = session.sent_commands()[0].request_id().unwrap();
    session.push_event(GatewayEvent::ContractDetails { req_id, details: ContractDetails::default() });
    session.push_event(GatewayEvent::ContractDetailsEnd { req_id });
    thread::sleep(Duration::from_millis(50));
    assert_eq!(manager.trackers.pending_count(), 0);
  }

  #[test]
  fn test_gateway_error_surfaces_after_timeout() {
    let (manager, session) = connected();
    session.respond_to(CommandKind::RequestContractDetails, vec![
      GatewayEvent::Error { id: 0, code: 200, message: "No security definition has been found".to_string(), advanced_order_reject: None },
    ]);
    match manager.resolve_contract(&Contract::stock("XXXX")) {
      Err(GatewayError::ApiError { code, .. }) => assert_eq!(code, 200),
      other => panic!("expected ApiError, got {:?}", other),
    }
    assert_eq!(manager.last_error().map(|e| e.code), Some(200));
  }

  #[test]
  fn test_gateway_error_reaches_its_own_request_type() {
    let (manager, session) = connected();
    session.respond_to(CommandKind::RequestContractDetails, vec![
      GatewayEvent::Error { id: 0, code: 200, message: "No security definition has been found".to_string(), advanced_order_reject: None },
    ]);
    session.respond_to(CommandKind::RequestHistoricalData, vec![
      GatewayEvent::HistoricalDataEnd { req_id: 0, start: String::new(), end: String::new() },
    ]);
    let (details, bars) = thread::scope(|s| {
      let details = s.spawn(|| manager.request_contract_details(&Contract::stock("XXXX")));
      thread::sleep(Duration::from_millis(50));
      let bars = manager.request_history(HistoricalDataRequest::new(Contract::stock("AAPL"), "1 D", crate::contract::BarSize::OneDay));
      (details.join().unwrap(), bars)
    });
    // Both trackers handed out 1000; the error belongs to the details request only.
    let ids: Vec<i32> = session.sent_commands().iter().filter_map(|c| c.request_id()).collect();
    assert_eq!(ids, vec![1000, 1000]);
    assert_eq!(bars, Ok(Vec::new()));
    assert!(matches!(details, Err(GatewayError::ApiError { id: 1000, code: 200, .. })));
  }

  #[test]
  fn test_requests_racing_connection_loss_fail_fast() {
    let mut config = test_config();
    config.request_timeout = Duration::from_secs(5);
    config.reconnect_delays = vec![Duration::from_secs(30)];
    let (manager, session) = setup(config);
    manager.connect().unwrap();
    session.respond_to(CommandKind::RequestContractDetails, vec![GatewayEvent::ContractDetailsEnd { req_id: 0 }]);

    let failures: Vec<(GatewayError, Duration)> = thread::scope(|s| {
      let handles: Vec<_> = (0..8).map(|_| s.spawn(|| loop {
        let started = Instant::now();
        if let Err(e) = manager.request_contract_details(&Contract::stock("AAPL")) {
          return (e, started.elapsed());
        }
      })).collect();
      thread::sleep(Duration::from_millis(20));
      session.drop_connection();
      handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for (error, elapsed) in failures {
      assert!(error.is_connection_error() || matches!(error, GatewayError::SendFailed(_)), "unexpected {:?}", error);
      assert!(elapsed < Duration::from_secs(2), "request blocked {:?} after the loss", elapsed);
    }
    manager.disconnect();
  }

  #[test]
  fn test_resolve_contract_no_data() {
    let (manager, session) = connected();
    session.respond_to(CommandKind::RequestContractDetails, vec![GatewayEvent::ContractDetailsEnd { req_id: 0 }]);
    assert!(matches!(manager.resolve_contract(&Contract::stock("AAPL")), Err(GatewayError::NoData(_))));
  }

  #[test]
  fn test_scan_sends_cancel_after_result() {
    let (manager, session) = connected();
    session.respond_to(CommandKind::RequestScannerSubscription, vec![
      GatewayEvent::ScannerData { req_id: 0, row: ScanData { rank: 0, ..Default::default() } },
      GatewayEvent::ScannerData { req_id: 0, row: ScanData { rank: 1, ..Default::default() } },
      GatewayEvent::ScannerDataEnd { req_id: 0 },
    ]);
    let rows = manager.run_scan(ScannerSubscription::default(), vec![TagValue::new("priceAbove", "1")]).unwrap();
    assert_eq!(rows.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![0, 1]);
    let sent = session.sent_commands();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1], OutboundCommand::CancelScannerSubscription { req_id: sent[0].request_id().unwrap() });
  }

  #[test]
  fn test_account_summary_cancelled_even_on_timeout() {
    let (manager, session) = connected();
    assert!(manager.get_account_summary(&["NetLiquidation"]).unwrap_err().is_timeout());
    assert_eq!(session.sent_kinds(), vec![CommandKind::RequestAccountSummary, CommandKind::CancelAccountSummary]);
  }

  #[test]
  fn test_account_summary_values() {
    let (manager, session) = connected();
    let entry = AccountSummaryEntry {
      account: "DU555".to_string(), tag: "NetLiquidation".to_string(), value: "1000.5".to_string(), currency: "USD".to_string(),
    };
    session.respond_to(CommandKind::RequestAccountSummary, vec![
      GatewayEvent::AccountSummary { req_id: 0, entry },
      GatewayEvent::AccountSummaryEnd { req_id: 0 },
    ]);
    let entries = manager.get_account_summary(&["NetLiquidation", "BuyingPower"]).unwrap();
    assert_eq!(AccountSummaryEntry::value_for_tag(&entries, "NetLiquidation"), Some(1000.5));
    assert_eq!(TradingMode::from_account_id(&entries[0].account), TradingMode::Paper);
    match &session.sent_commands()[0] {
      OutboundCommand::RequestAccountSummary { group, tags, .. } => {
        assert_eq!(group, "All");
        assert_eq!(tags, "NetLiquidation,BuyingPower");
      }
      other => panic!("unexpected command {:?}", other),
    }
  }

  #[test]
  fn test_positions_and_open_orders_use_sentinels() {
    let (manager, session) = connected();
    session.respond_to(CommandKind::RequestPositions, vec![
      GatewayEvent::Position { position: Position {
        account: "DU1".to_string(), contract: Contract::stock("MSFT"), position: 5.0, avg_cost: 300.0,
      }},
      GatewayEvent::PositionEnd,
    ]);
    session.respond_to(CommandKind::RequestAllOpenOrders, vec![GatewayEvent::OpenOrderEnd]);
    assert_eq!(manager.get_positions().unwrap()[0].contract.symbol, "MSFT");
    assert!(manager.get_open_orders().unwrap().is_empty());
  }

  #[test]
  fn test_concurrent_position_requests_conflict() {
    let (manager, _session) = connected();
    let results: Vec<Result<Vec<Position>, GatewayError>> = thread::scope(|s| {
      let a = s.spawn(|| manager.get_positions());
      thread::sleep(Duration::from_millis(50));
      let b = s.spawn(|| manager.get_positions());
      vec![a.join().unwrap(), b.join().unwrap()]
    });
    assert!(results[0].as_ref().unwrap_err().is_timeout());
    assert_eq!(results[1], Err(GatewayError::DuplicateRequestId(POSITIONS_REQ_ID)));
  }

  #[test]
  fn test_place_order_allocates_sequential_ids() {
    let (manager, session) = connected();
    let contract = Contract::stock("AAPL");
    assert_eq!(manager.place_order(&contract, OrderRequest::market(OrderSide::Buy, 10.0)).unwrap(), 100);
    assert_eq!(manager.place_order(&contract, OrderRequest::limit(OrderSide::Sell, 10.0, 200.0)).unwrap(), 101);
    assert_eq!(session.sent_kinds(), vec![CommandKind::PlaceOrder, CommandKind::PlaceOrder]);
    assert!(manager.place_order(&contract, OrderRequest::market(OrderSide::Buy, 0.0)).is_err());
    assert_eq!(session.sent_commands().len(), 2);
  }

  #[test]
  fn test_bracket_order_links_children() {
    let (manager, session) = connected();
    let ids = manager.place_bracket_order(&Contract::stock("AAPL"), BracketOrder::new(OrderSide::Buy, 100.0, 10.0, 11.0, 9.5)).unwrap();
    assert_eq!(ids, BracketOrderIds { parent: 100, take_profit: 101, stop_loss: 102 });
    let orders: Vec<(i32, OrderRequest)> = session.sent_commands().into_iter().filter_map(|c| match c {
      OutboundCommand::PlaceOrder { order_id, order, .. } => Some((order_id, order)),
      _ => None,
    }).collect();
    assert_eq!(orders.len(), 3);
    assert_eq!(orders[0].0, 100);
    assert!(!orders[0].1.transmit);
    assert_eq!((orders[1].1.parent_id, orders[1].1.transmit), (100, false));
    assert_eq!((orders[2].1.parent_id, orders[2].1.transmit), (100, true));
    assert_eq!(orders[2].1.order_type, OrderType::Stop);
  }

  #[test]
  fn test_invalid_bracket_rejected_before_reserving() {
    let (manager, session) = connected();
    let bad = BracketOrder::new(OrderSide::Buy, 100.0, 10.0, 9.0, 9.5);
    assert!(matches!(manager.place_bracket_order(&Contract::stock("AAPL"), bad), Err(GatewayError::InvalidOrder(_))));
    assert!(session.sent_commands().is_empty());
    assert_eq!(manager.place_order(&Contract::stock("AAPL"), OrderRequest::market(OrderSide::Buy, 1.0)).unwrap(), 100);
  }

  #[test]
  fn test_concurrent_brackets_do_not_overlap() {
    let (manager, _session) = connected();
    let contract = Contract::stock("AAPL");
    let all: Vec<BracketOrderIds> = thread::scope(|s| {
      let handles: Vec<_> = (0..16).map(|_| s.spawn(|| {
        manager.place_bracket_order(&contract, BracketOrder::new(OrderSide::Sell, 10.0, 20.0, 18.0, 21.0)).unwrap()
      })).collect();
      handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let mut seen = HashSet::new();
    for ids in &all {
      assert_eq!((ids.take_profit, ids.stop_loss), (ids.parent + 1, ids.parent + 2));
      assert!(seen.insert(ids.parent) && seen.insert(ids.take_profit) && seen.insert(ids.stop_loss));
    }
  }

  #[test]
  fn test_cancel_all_orders_sends_global_cancel() {
    let (manager, session) = connected();
    manager.cancel_all_orders().unwrap();
    assert_eq!(session.sent_kinds(), vec![CommandKind::GlobalCancel]);
  }

  #[test]
  fn test_market_data_type() {
    let (manager, session) = connected();
    assert!(manager.set_market_data_type(MarketDataType::Unknown).is_err());
    manager.set_market_data_type(MarketDataType::Delayed).unwrap();
    assert!(manager.is_market_data_delayed());
    assert_eq!(session.sent_commands(), vec![OutboundCommand::RequestMarketDataType { kind: 3 }]);
  }

  #[test]
  fn test_connection_loss_cancels_pending_and_reconnects() {
    let mut config = test_config();
    config.request_timeout = Duration::from_secs(5);
    config.reconnect_delays = vec![Duration::from_millis(50)];
    let (manager, session) = setup(config);
    manager.connect().unwrap();
    let contract = Contract::stock("AAPL");
    assert_eq!(manager.place_order(&contract, OrderRequest::market(OrderSide::Buy, 1.0)).unwrap(), 100);

    let result = thread::scope(|s| {
      let waiter = s.spawn(|| manager.get_positions());
      thread::sleep(Duration::from_millis(50));
      session.drop_connection();
      waiter.join().unwrap()
    });
    assert!(matches!(result, Err(GatewayError::ConnectionLost(_))));
    assert!(wait_for_state(&manager, ConnectionState::Connected, Duration::from_secs(2)));
    assert_eq!(session.connect_attempts(), 2);
    assert_eq!(manager.reconnect_attempts(), 0);

    // The gateway offers 100 again; ids handed out before the loss are not reused.
    assert_eq!(manager.place_order(&contract, OrderRequest::market(OrderSide::Buy, 1.0)).unwrap(), 101);
  }

  #[test]
  fn test_reconnect_gives_up_after_max_attempts() {
    let (manager, session) = setup(test_config());
    manager.connect().unwrap();
    session.refuse_all_connects(true);
    session.drop_connection();

    assert!(wait_for_state(&manager, ConnectionState::Failed, Duration::from_secs(3)));
    assert_eq!(session.connect_attempts(), 1 + 10);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(session.connect_attempts(), 1 + 10);
    assert_eq!(manager.connection_state(), ConnectionState::Failed);

    // Manual intervention path.
    session.refuse_all_connects(false);
    manager.connect().unwrap();
    assert!(manager.is_connected());
  }

  #[test]
  fn test_reconnect_outside_operating_hours_fails_immediately() {
    let mut config = test_config();
    let now = Utc::now();
    config.operating_hours = Some(OperatingHours::new(
      "UTC",
      (now + ChronoDuration::hours(2)).time(),
      (now + ChronoDuration::hours(3)).time(),
    ));
    let (manager, session) = setup(config);
    manager.connect().unwrap();
    session.drop_connection();
    assert!(wait_for_state(&manager, ConnectionState::Failed, Duration::from_secs(2)));
    assert_eq!(session.connect_attempts(), 1);
  }

  #[test]
  fn test_manual_disconnect_suppresses_reconnect() {
    let (manager, session) = connected();
    manager.disconnect();
    session.push_event(GatewayEvent::ConnectionClosed);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(session.connect_attempts(), 1);
  }

  #[test]
  fn test_disconnect_during_reconnecting_stops_recovery() {
    let mut config = test_config();
    config.reconnect_delays = vec![Duration::from_secs(30)];
    let (manager, session) = setup(config);
    manager.connect().unwrap();
    session.drop_connection();
    assert!(wait_for_state(&manager, ConnectionState::Reconnecting, Duration::from_secs(2)));
    manager.disconnect();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(session.connect_attempts(), 1);
  }

  #[test]
  fn test_stale_close_notification_ignored() {
    let (manager, session) = connected();
    session.push_event(GatewayEvent::ConnectionClosed);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(manager.connection_state(), ConnectionState::Connected);
    assert_eq!(session.connect_attempts(), 1);
  }
}
