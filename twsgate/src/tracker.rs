// twsgate/src/tracker.rs
//! Correlation of asynchronous callbacks with blocked callers.
//!
//! A [`Tracker<T>`] holds, per request id, the items streamed so far and a
//! one-shot resolver. The caller registers the id with [`Tracker::start`] and
//! blocks on the returned [`PendingResult`]; the dispatch thread appends
//! items with [`Tracker::add`] and resolves the id with [`Tracker::complete`].
//! Exactly one of `complete`, `timeout`, `fail` or `cancel_all` resolves an
//! entry; later calls for the same id are no-ops.
//!
//! A gateway error noted against a pending entry does not resolve it. It is
//! kept on the entry and replaces the `Timeout` if the entry later times out.

use crate::base::{GatewayError, GatewayErrorReport};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// First id handed out by every tracker's counter. Ids below it are reserved.
pub const REQUEST_ID_BASE: i32 = 1000;
/// Fixed id of the "all positions" stream.
pub const POSITIONS_REQ_ID: i32 = 0;
/// Fixed id of the "all open orders" stream.
pub const OPEN_ORDERS_REQ_ID: i32 = 1;

pub type RequestOutcome<T> = Result<Vec<T>, GatewayError>;

struct PendingEntry<T> {
  items: Vec<T>,
  resolver: Sender<RequestOutcome<T>>,
  created: Instant,
  error: Option<GatewayErrorReport>,
}

/// Handle the caller blocks on until the request id is resolved.
pub struct PendingResult<T> {
  req_id: i32,
  receiver: Receiver<RequestOutcome<T>>,
}

impl<T> PendingResult<T> {
  pub fn id(&self) -> i32 {
    self.req_id
  }

  /// Waits up to `timeout`. `None` means nothing resolved the id in time; the
  /// entry is still registered.
  pub fn wait(&self, timeout: Duration) -> Option<RequestOutcome<T>> {
    match self.receiver.recv_timeout(timeout) {
      Ok(outcome) => Some(outcome),
      Err(RecvTimeoutError::Timeout) => None,
      Err(RecvTimeoutError::Disconnected) => Some(Err(GatewayError::InternalError(
        format!("Resolver for request {} dropped without an outcome", self.req_id)
      ))),
    }
  }

  /// Blocks until the outcome arrives. Only call once the entry is known to
  /// have been resolved (e.g. after `Tracker::timeout`).
  pub fn recv(&self) -> RequestOutcome<T> {
    self.receiver.recv().unwrap_or_else(|_| Err(GatewayError::InternalError(
      format!("Resolver for request {} dropped without an outcome", self.req_id)
    )))
  }
}

/// Per result-type correlation table.
pub struct Tracker<T> {
  name: &'static str,
  next_id: AtomicI32,
  pending: Mutex<HashMap<i32, PendingEntry<T>>>,
}

impl<T: Send> Tracker<T> {
  pub fn new(name: &'static str) -> Self {
    Tracker {
      name,
      next_id: AtomicI32::new(REQUEST_ID_BASE),
      pending: Mutex::new(HashMap::new()),
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  /// Fresh id for this result type. Never returns a reserved sentinel.
  pub fn next_request_id(&self) -> i32 {
    self.next_id.fetch_add(1, Ordering::Relaxed)
  }

  /// Registers `req_id` with an empty buffer. Fails if the id is already pending.
  pub fn start(&self, req_id: i32) -> Result<PendingResult<T>, GatewayError> {
    let mut pending = self.pending.lock();
    if pending.contains_key(&req_id) {
      warn!("{} tracker: request {} is already pending", self.name, req_id);
      return Err(GatewayError::DuplicateRequestId(req_id));
    }
    let (resolver, receiver) = bounded(1);
    pending.insert(req_id, PendingEntry { items: Vec::new(), resolver, created: Instant::now(), error: None });
    debug!("{} tracker: started request {}", self.name, req_id);
    Ok(PendingResult { req_id, receiver })
  }

  /// Appends an item. Items for unknown or already resolved ids are dropped.
  pub fn add(&self, req_id: i32, item: T) {
    let mut pending = self.pending.lock();
    match pending.get_mut(&req_id) {
      Some(entry) => entry.items.push(item),
      None => trace!("{} tracker: dropping item for unknown request {}", self.name, req_id),
    }
  }

  /// Resolves the waiter with the buffered items. False if the id was not pending.
  pub fn complete(&self, req_id: i32) -> bool {
    let entry = self.pending.lock().remove(&req_id);
    match entry {
      Some(entry) => {
        debug!("{} tracker: request {} completed with {} items in {:?}",
               self.name, req_id, entry.items.len(), entry.created.elapsed());
        let _ = entry.resolver.send(Ok(entry.items));
        true
      }
      None => {
        trace!("{} tracker: completion for unknown request {}", self.name, req_id);
        false
      }
    }
  }

  /// Attaches a gateway error to a pending entry. The latest error wins.
  /// False if the id is not pending here.
  pub fn note_error(&self, req_id: i32, report: &GatewayErrorReport) -> bool {
    let mut pending = self.pending.lock();
    match pending.get_mut(&req_id) {
      Some(entry) => {
        debug!("{} tracker: request {} got gateway error {}", self.name, req_id, report.code);
        entry.error = Some(report.clone());
        true
      }
      None => false,
    }
  }

  /// Discards the buffer and resolves the waiter with `Timeout`, or with
  /// `ApiError` when a gateway error was noted for the entry.
  pub fn timeout(&self, req_id: i32) -> bool {
    let entry = self.pending.lock().remove(&req_id);
    match entry {
      Some(entry) => {
        let elapsed = entry.created.elapsed();
        let outcome = match entry.error {
          Some(report) => {
            warn!("{} tracker: request {} timed out after {:?} following gateway error {}: {}",
                  self.name, req_id, elapsed, report.code, report.message);
            GatewayError::from(report)
          }
          None => {
            warn!("{} tracker: request {} timed out after {:?} ({} items discarded)",
                  self.name, req_id, elapsed, entry.items.len());
            GatewayError::Timeout(format!("{} request {} timed out after {:?}", self.name, req_id, elapsed))
          }
        };
        let _ = entry.resolver.send(Err(outcome));
        true
      }
      None => false,
    }
  }

  /// Resolves the waiter with `error`, discarding the buffer.
  pub fn fail(&self, req_id: i32, error: GatewayError) -> bool {
    let entry = self.pending.lock().remove(&req_id);
    match entry {
      Some(entry) => {
        debug!("{} tracker: request {} failed: {}", self.name, req_id, error);
        let _ = entry.resolver.send(Err(error));
        true
      }
      None => false,
    }
  }

  /// Resolves every pending waiter with `ConnectionLost`. Returns how many were cancelled.
  pub fn cancel_all(&self, reason: &str) -> usize {
    let drained: Vec<(i32, PendingEntry<T>)> = self.pending.lock().drain().collect();
    for (req_id, entry) in &drained {
      debug!("{} tracker: cancelling request {}: {}", self.name, req_id, reason);
      let _ = entry.resolver.send(Err(GatewayError::ConnectionLost(reason.to_string())));
    }
    drained.len()
  }

  pub fn pending_count(&self) -> usize {
    self.pending.lock().len()
  }

  pub fn is_pending(&self, req_id: i32) -> bool {
    self.pending.lock().contains_key(&req_id)
  }
}

/// Type-erased view used by the registry for bulk operations.
pub trait PendingRequests: Send + Sync {
  fn name(&self) -> &'static str;
  fn cancel_all(&self, reason: &str) -> usize;
  fn pending_count(&self) -> usize;
  fn has_pending(&self, req_id: i32) -> bool;
  fn note_error(&self, req_id: i32, report: &GatewayErrorReport) -> bool;
}

impl<T: Send + 'static> PendingRequests for Tracker<T> {
  fn name(&self) -> &'static str {
    self.name
  }

  fn cancel_all(&self, reason: &str) -> usize {
    Tracker::cancel_all(self, reason)
  }

  fn pending_count(&self) -> usize {
    Tracker::pending_count(self)
  }

  fn has_pending(&self, req_id: i32) -> bool {
    self.is_pending(req_id)
  }

  fn note_error(&self, req_id: i32, report: &GatewayErrorReport) -> bool {
    Tracker::note_error(self, req_id, report)
  }
}

struct RegisteredTracker {
  any: Arc<dyn Any + Send + Sync>,
  pending: Arc<dyn PendingRequests>,
}

/// One tracker per result type, created on first use.
///
/// Owned by a `ConnectionManager`; two managers never share trackers or id counters.
#[derive(Default)]
pub struct TrackerRegistry {
  trackers: RwLock<HashMap<TypeId, RegisteredTracker>>,
}

impl TrackerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// The tracker for result type `T`. Repeated calls return the same instance.
  pub fn get<T: Send + 'static>(&self) -> Arc<Tracker<T>> {
    let key = TypeId::of::<T>();
    if let Some(found) = self.trackers.read().get(&key).and_then(Self::downcast::<T>) {
      return found;
    }
    let mut trackers = self.trackers.write();
    // Another thread may have registered it between the two locks.
    if let Some(found) = trackers.get(&key).and_then(Self::downcast::<T>) {
      return found;
    }
    let tracker = Arc::new(Tracker::<T>::new(short_type_name::<T>()));
    debug!("Created tracker for {}", tracker.name());
    trackers.insert(key, RegisteredTracker { any: tracker.clone(), pending: tracker.clone() });
    tracker
  }

  fn downcast<T: Send + 'static>(registered: &RegisteredTracker) -> Option<Arc<Tracker<T>>> {
    registered.any.clone().downcast::<Tracker<T>>().ok()
  }

  /// Cancels pending waiters in every tracker. Returns the total cancelled.
  pub fn cancel_all_pending(&self, reason: &str) -> usize {
    let trackers: Vec<Arc<dyn PendingRequests>> = self.trackers.read().values().map(|r| r.pending.clone()).collect();
    let mut total = 0;
    for tracker in trackers {
      let n = tracker.cancel_all(reason);
      if n > 0 {
        debug!("Cancelled {} pending {} requests", n, tracker.name());
      }
      total += n;
    }
    total
  }

  /// Whether any tracker has `req_id` pending.
  pub fn has_pending(&self, req_id: i32) -> bool {
    self.trackers.read().values().any(|r| r.pending.has_pending(req_id))
  }

  pub fn pending_count(&self) -> usize {
    self.trackers.read().values().map(|r| r.pending.pending_count()).sum()
  }

  /// Notes `report` on every tracker that has `req_id` pending. Ids are only
  /// unique per result type, so more than one entry may match.
  pub fn note_error(&self, req_id: i32, report: &GatewayErrorReport) -> usize {
    self.trackers.read().values().filter(|r| r.pending.note_error(req_id, report)).count()
  }
}

fn short_type_name<T>() -> &'static str {
  let full = std::any::type_name::<T>();
  full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::thread;

  #[test]
  fn test_items_resolve_in_arrival_order() {
    let tracker = Tracker::<String>::new("test");
    let pending = tracker.start(1000).unwrap();
    tracker.add(1000, "A".to_string());
    tracker.add(1000, "B".to_string());
    assert!(tracker.complete(1000));
    assert_eq!(pending.wait(Duration::from_millis(10)).unwrap().unwrap(), vec!["A", "B"]);
    assert_eq!(tracker.pending_count(), 0);
  }

  #[test]
  fn test_complete_with_no_items_is_empty_success() {
    let tracker = Tracker::<i32>::new("test");
    let pending = tracker.start(1000).unwrap();
    assert!(tracker.complete(1000));
    assert_eq!(pending.wait(Duration::from_millis(10)).unwrap().unwrap(), Vec::<i32>::new());
  }

  #[test]
  fn test_second_complete_is_noop() {
    let tracker = Tracker::<i32>::new("test");
    let pending = tracker.start(1000).unwrap();
    assert!(tracker.complete(1000));
    assert!(!tracker.complete(1000));
    assert!(!tracker.timeout(1000));
    assert!(pending.wait(Duration::from_millis(10)).unwrap().is_ok());
  }

  #[test]
  fn test_add_after_timeout_is_dropped() {
    let tracker = Tracker::<i32>::new("test");
    let pending = tracker.start(1000).unwrap();
    assert!(tracker.timeout(1000));
    tracker.add(1000, 7);
    assert_eq!(tracker.pending_count(), 0);
    assert!(matches!(pending.recv(), Err(GatewayError::Timeout(_))));
  }

  #[test]
  fn test_noted_error_replaces_timeout() {
    let tracker = Tracker::<i32>::new("test");
    let pending = tracker.start(1000).unwrap();
    let report = GatewayErrorReport { id: 1000, code: 200, message: "No security definition".to_string() };
    assert!(tracker.note_error(1000, &report));
    assert!(tracker.is_pending(1000));
    assert!(tracker.timeout(1000));
    assert_eq!(pending.recv(), Err(GatewayError::from(report)));
  }

  #[test]
  fn test_noted_error_does_not_affect_completion() {
    let tracker = Tracker::<i32>::new("test");
    let pending = tracker.start(1000).unwrap();
    tracker.note_error(1000, &GatewayErrorReport { id: 1000, code: 10167, message: "delayed".to_string() });
    tracker.add(1000, 4);
    assert!(tracker.complete(1000));
    assert_eq!(pending.recv(), Ok(vec![4]));
  }

  #[test]
  fn test_error_for_unknown_id_is_not_kept() {
    let tracker = Tracker::<i32>::new("test");
    let report = GatewayErrorReport { id: POSITIONS_REQ_ID, code: 321, message: "bad request".to_string() };
    assert!(!tracker.note_error(POSITIONS_REQ_ID, &report));
    let pending = tracker.start(POSITIONS_REQ_ID).unwrap();
    assert!(tracker.timeout(POSITIONS_REQ_ID));
    assert!(pending.recv().unwrap_err().is_timeout());
  }

  #[test]
  fn test_unknown_id_operations_are_noops() {
    let tracker = Tracker::<i32>::new("test");
    tracker.add(5555, 1);
    assert!(!tracker.complete(5555));
    assert!(!tracker.fail(5555, GatewayError::NotConnected));
    assert_eq!(tracker.pending_count(), 0);
  }

  #[test]
  fn test_duplicate_start_rejected() {
    let tracker = Tracker::<i32>::new("test");
    let _first = tracker.start(POSITIONS_REQ_ID).unwrap();
    assert_eq!(tracker.start(POSITIONS_REQ_ID).err(), Some(GatewayError::DuplicateRequestId(POSITIONS_REQ_ID)));
  }

  #[test]
  fn test_wait_expires_without_resolution() {
    let tracker = Tracker::<i32>::new("test");
    let pending = tracker.start(1000).unwrap();
    assert!(pending.wait(Duration::from_millis(5)).is_none());
    assert!(tracker.is_pending(1000));
  }

  #[test]
  fn test_complete_timeout_race_resolves_once() {
    for _ in 0..200 {
      let tracker = Tracker::<i32>::new("race");
      let pending = tracker.start(1000).unwrap();
      tracker.add(1000, 1);
      let (completed, timed_out) = thread::scope(|s| {
        let a = s.spawn(|| tracker.complete(1000));
        let b = s.spawn(|| tracker.timeout(1000));
        (a.join().unwrap(), b.join().unwrap())
      });
      assert!(completed ^ timed_out, "exactly one resolution must win");
      match pending.recv() {
        Ok(items) => { assert!(completed); assert_eq!(items, vec![1]); }
        Err(e) => { assert!(timed_out); assert!(e.is_timeout()); }
      }
    }
  }

  #[test]
  fn test_concurrent_requests_do_not_mix() {
    let tracker = Tracker::<(i32, i32)>::new("concurrent");
    let results: Vec<(i32, Vec<(i32, i32)>)> = thread::scope(|s| {
      let handles: Vec<_> = (0..16).map(|_| s.spawn(|| {
        let id = tracker.next_request_id();
        let pending = tracker.start(id).unwrap();
        for n in 0..50 {
          tracker.add(id, (id, n));
        }
        tracker.complete(id);
        (id, pending.wait(Duration::from_secs(1)).unwrap().unwrap())
      })).collect();
      handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for (id, items) in results {
      assert_eq!(items.len(), 50);
      assert!(items.iter().enumerate().all(|(n, item)| *item == (id, n as i32)));
    }
  }

  #[test]
  fn test_next_request_id_unique_under_concurrency() {
    let tracker = Tracker::<i32>::new("ids");
    let ids: Vec<i32> = thread::scope(|s| {
      let handles: Vec<_> = (0..8).map(|_| s.spawn(|| (0..250).map(|_| tracker.next_request_id()).collect::<Vec<_>>())).collect();
      handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });
    let unique: HashSet<i32> = ids.iter().copied().collect();
    assert_eq!(unique.len(), 2000);
    assert!(ids.iter().all(|id| *id >= REQUEST_ID_BASE));
  }

  #[test]
  fn test_cancel_all_resolves_every_waiter() {
    let tracker = Tracker::<i32>::new("cancel");
    let a = tracker.start(1000).unwrap();
    let b = tracker.start(1001).unwrap();
    tracker.add(1001, 3);
    assert_eq!(tracker.cancel_all("connection lost"), 2);
    assert_eq!(a.recv(), Err(GatewayError::ConnectionLost("connection lost".to_string())));
    assert!(b.recv().unwrap_err().is_connection_error());
    assert_eq!(tracker.pending_count(), 0);
  }

  #[test]
  fn test_registry_returns_same_tracker_per_type() {
    let registry = TrackerRegistry::new();
    let a = registry.get::<String>();
    let b = registry.get::<String>();
    assert!(Arc::ptr_eq(&a, &b));
    let ints = registry.get::<i32>();
    assert_eq!(a.next_request_id(), REQUEST_ID_BASE);
    assert_eq!(b.next_request_id(), REQUEST_ID_BASE + 1);
    assert_eq!(ints.next_request_id(), REQUEST_ID_BASE);
  }

  #[test]
  fn test_registry_bulk_operations() {
    let registry = TrackerRegistry::new();
    let strings = registry.get::<String>();
    let ints = registry.get::<i32>();
    let s = strings.start(1000).unwrap();
    let i = ints.start(1004).unwrap();
    assert!(registry.has_pending(1004));
    assert!(!registry.has_pending(1005));
    assert_eq!(registry.pending_count(), 2);
    assert_eq!(registry.cancel_all_pending("shutdown"), 2);
    assert!(s.recv().is_err());
    assert!(i.recv().is_err());
    assert_eq!(registry.pending_count(), 0);
  }

  #[test]
  fn test_registry_notes_error_per_entry() {
    let registry = TrackerRegistry::new();
    let strings = registry.get::<String>();
    let ints = registry.get::<i32>();
    let s = strings.start(1000).unwrap();
    let i = ints.start(1000).unwrap();
    let report = GatewayErrorReport { id: 1000, code: 200, message: "not found".to_string() };
    assert_eq!(registry.note_error(1000, &report), 2);
    assert_eq!(registry.note_error(1001, &report), 0);

    // Each entry carries its own copy; completing one leaves the other's intact.
    strings.complete(1000);
    assert_eq!(s.recv(), Ok(Vec::<String>::new()));
    ints.timeout(1000);
    assert_eq!(i.recv(), Err(GatewayError::from(report)));
  }
}
