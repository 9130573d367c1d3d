// twsgate/src/session_mock.rs
//
// In-process gateway that answers commands from a script. Used by the tests
// and by the `session_replay` binary.
use crate::base::GatewayError;
use crate::session::{CommandKind, GatewayEvent, GatewaySession, OutboundCommand};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

/// What the mock gateway says, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockScript {
  /// Order id delivered right after every successful connect. `None` means the
  /// handshake never completes.
  pub handshake_order_id: Option<i32>,
  /// Extra events queued after the handshake (managed accounts, farm notices...).
  pub on_connect: Vec<GatewayEvent>,
  /// Events answering each command kind. Correlated events get the command's
  /// request id substituted.
  pub responses: HashMap<CommandKind, Vec<GatewayEvent>>,
}

impl Default for MockScript {
  fn default() -> Self {
    MockScript {
      handshake_order_id: Some(1),
      on_connect: Vec::new(),
      responses: HashMap::new(),
    }
  }
}

impl MockScript {
  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| GatewayError::ConfigurationError(format!("Reading script {:?}: {}", path, e)))?;
    serde_json::from_str(&text)
      .map_err(|e| GatewayError::ConfigurationError(format!("Parsing script {:?}: {}", path, e)))
  }
}

#[derive(Default)]
struct MockState {
  script: MockScript,
  connected: bool,
  connect_options: String,
  connect_attempts: u32,
  refuse_next: u32,
  refuse_all: bool,
  sent: Vec<OutboundCommand>,
  queue: VecDeque<GatewayEvent>,
}

pub struct MockSession {
  state: Mutex<MockState>,
  signal_tx: Sender<()>,
  signal_rx: Receiver<()>,
}

impl MockSession {
  pub fn new(script: MockScript) -> Self {
    let (signal_tx, signal_rx) = unbounded();
    MockSession {
      state: Mutex::new(MockState { script, ..Default::default() }),
      signal_tx,
      signal_rx,
    }
  }

  pub fn from_script<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
    Ok(Self::new(MockScript::from_file(path)?))
  }

  /// Replaces the scripted answer for one command kind.
  pub fn respond_to(&self, kind: CommandKind, events: Vec<GatewayEvent>) {
    self.state.lock().script.responses.insert(kind, events);
  }

  pub fn set_handshake_order_id(&self, order_id: Option<i32>) {
    self.state.lock().script.handshake_order_id = order_id;
  }

  /// The next `count` connect calls report failure.
  pub fn refuse_next_connects(&self, count: u32) {
    self.state.lock().refuse_next = count;
  }

  pub fn refuse_all_connects(&self, refuse: bool) {
    self.state.lock().refuse_all = refuse;
  }

  pub fn connect_attempts(&self) -> u32 {
    self.state.lock().connect_attempts
  }

  pub fn connect_options(&self) -> String {
    self.state.lock().connect_options.clone()
  }

  pub fn sent_commands(&self) -> Vec<OutboundCommand> {
    self.state.lock().sent.clone()
  }

  pub fn sent_kinds(&self) -> Vec<CommandKind> {
    self.state.lock().sent.iter().map(|c| c.kind()).collect()
  }

  /// Queues an unsolicited event.
  pub fn push_event(&self, event: GatewayEvent) {
    self.state.lock().queue.push_back(event);
    let _ = self.signal_tx.send(());
  }

  /// Simulates the transport dying underneath the client.
  pub fn drop_connection(&self) {
    {
      let mut state = self.state.lock();
      state.connected = false;
      state.queue.push_back(GatewayEvent::ConnectionClosed);
    }
    info!("Mock: connection dropped");
    let _ = self.signal_tx.send(());
  }
}

impl GatewaySession for MockSession {
  fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<bool, GatewayError> {
    let mut state = self.state.lock();
    state.connect_attempts += 1;
    if state.refuse_all || state.refuse_next > 0 {
      state.refuse_next = state.refuse_next.saturating_sub(1);
      debug!("Mock: refusing connect #{} to {}:{}", state.connect_attempts, host, port);
      return Ok(false);
    }
    state.connected = true;
    if let Some(order_id) = state.script.handshake_order_id {
      state.queue.push_back(GatewayEvent::NextValidId { order_id });
    }
    let greeting = state.script.on_connect.clone();
    state.queue.extend(greeting);
    debug!("Mock: connected to {}:{} as client {}", host, port, client_id);
    drop(state);
    let _ = self.signal_tx.send(());
    Ok(true)
  }

  fn set_connect_options(&self, options: &str) {
    self.state.lock().connect_options = options.to_string();
  }

  fn disconnect(&self) {
    let mut state = self.state.lock();
    state.connected = false;
    debug!("Mock: disconnected");
  }

  fn is_connected(&self) -> bool {
    self.state.lock().connected
  }

  fn send(&self, command: OutboundCommand) -> Result<(), GatewayError> {
    let mut state = self.state.lock();
    if !state.connected {
      return Err(GatewayError::SendFailed(format!("{:?} on a closed session", command.kind())));
    }
    trace!("Mock: received {:?}", command);
    let answer: Vec<GatewayEvent> = match (state.script.responses.get(&command.kind()), command.request_id()) {
      (Some(events), Some(id)) => events.iter().map(|e| e.with_request_id(id)).collect(),
      (Some(events), None) => events.clone(),
      (None, _) => Vec::new(),
    };
    state.queue.extend(answer);
    state.sent.push(command);
    drop(state);
    let _ = self.signal_tx.send(());
    Ok(())
  }

  fn start_reader(&self) -> Result<(), GatewayError> {
    if !self.state.lock().connected {
      return Err(GatewayError::NotConnected);
    }
    trace!("Mock: reader started");
    Ok(())
  }

  fn wait_for_signal(&self, timeout: Duration) -> bool {
    if !self.state.lock().queue.is_empty() {
      return true;
    }
    self.signal_rx.recv_timeout(timeout).is_ok()
  }

  fn process_messages(&self, sink: &mut dyn FnMut(GatewayEvent)) -> Result<usize, GatewayError> {
    let batch: Vec<GatewayEvent> = self.state.lock().queue.drain(..).collect();
    let count = batch.len();
    for event in batch {
      sink(event);
    }
    Ok(count)
  }
}
