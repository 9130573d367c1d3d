// twsgate/src/order_ids.rs
// Order id window seeded by the handshake, plus the readiness gate `connect` waits on.

use crate::base::GatewayError;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct WindowState {
  /// Next id to hand out. `None` until the first handshake.
  next: Option<i32>,
  /// Set once the current session's handshake value arrived.
  ready: bool,
  /// One-shot gate armed by `begin_handshake`, fired by the handshake value.
  gate: Option<(Sender<i32>, Receiver<i32>)>,
}

/// A contiguous range of order ids reserved in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderIdBlock {
  pub first: i32,
  pub count: i32,
}

impl OrderIdBlock {
  pub fn id(&self, offset: i32) -> Option<i32> {
    if (0..self.count).contains(&offset) { Some(self.first + offset) } else { None }
  }

  pub fn ids(&self) -> impl Iterator<Item = i32> {
    self.first..self.first + self.count
  }
}

#[derive(Debug, Default)]
pub struct OrderIdAllocator {
  state: Mutex<WindowState>,
}

impl OrderIdAllocator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Called before each (re)connect so `wait_until_ready` blocks for the new session's value.
  pub fn begin_handshake(&self) {
    let mut state = self.state.lock();
    state.ready = false;
    state.gate = Some(bounded(1));
  }

  /// Handshake callback. The window never moves backwards, so ids handed out
  /// before a reconnect are not reused.
  pub fn on_next_valid_id(&self, order_id: i32) {
    let mut state = self.state.lock();
    let next = match state.next {
      Some(current) if current > order_id => {
        debug!("Gateway offered order id {} but window is already at {}", order_id, current);
        current
      }
      _ => order_id,
    };
    state.next = Some(next);
    if !state.ready {
      state.ready = true;
      info!("Order id window ready at {}", next);
      if let Some((tx, _)) = &state.gate {
        let _ = tx.try_send(next);
      }
    }
  }

  /// Blocks until the handshake value for the current session arrived.
  pub fn wait_until_ready(&self, timeout: Duration) -> Result<i32, GatewayError> {
    let gate = {
      let mut state = self.state.lock();
      if state.ready {
        return state.next.ok_or_else(|| GatewayError::InternalError("Ready without an order id".to_string()));
      }
      state.gate.get_or_insert_with(|| bounded(1)).1.clone()
    };
    gate.recv_timeout(timeout).map_err(|_| {
      warn!("No initial order id received within {:?}", timeout);
      GatewayError::ConnectionFailed(format!("Handshake did not deliver an order id within {:?}", timeout))
    })
  }

  pub fn is_ready(&self) -> bool {
    self.state.lock().ready
  }

  /// Allocates a single id.
  pub fn next_order_id(&self) -> Result<i32, GatewayError> {
    Ok(self.reserve(1)?.first)
  }

  /// Allocates `count` consecutive ids as one read-and-advance step.
  pub fn reserve(&self, count: i32) -> Result<OrderIdBlock, GatewayError> {
    if count <= 0 {
      return Err(GatewayError::InvalidParameter(format!("Cannot reserve {} order ids", count)));
    }
    let mut state = self.state.lock();
    let first = state.next.ok_or(GatewayError::NotConnected)?;
    state.next = Some(first + count);
    debug!("Reserved order ids {}..{}", first, first + count);
    Ok(OrderIdBlock { first, count })
  }
}
