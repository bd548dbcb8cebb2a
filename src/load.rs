// Copyright 2020-2024 Tauri Programme within The Commons Conservancy
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Resource-load interception decisions.
//!
//! Before issuing a request the engine suspends it and asks the embedder
//! whether the load may proceed. The embedder sees a change-tracked
//! [`ResourceRequest`] it may edit while the decision is pending; on allow,
//! the outcome names exactly the fields that were touched so the engine can
//! re-apply them (and redirect when the URL was rewritten).
//!
//! The live engine request can be torn down at any moment while the
//! decision is pending. The [`Disconnector`] the engine holds alongside its
//! request severs the association on teardown: the continuation is dropped,
//! never invoked, since the operation it would resume no longer exists.

use std::sync::Arc;

use http::Uri;

use crate::guard::{Continuation, GuardedCallback, WeakCallback};
use crate::request::{RequestChanges, RequestSnapshot, ResourceRequest};

/// What a before-load handler tells the dispatch path to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadVerdict {
  /// Allow the load now.
  Allow,
  /// Cancel the load now.
  Cancel,
  /// The handler keeps the [`LoadDecision`] and answers later.
  Defer,
}

/// Delivered to the engine once the interception decision lands.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
  pub allowed: bool,
  /// Final request state, including embedder edits.
  pub request: RequestSnapshot,
  /// The fields the embedder touched; empty on deny.
  pub changes: RequestChanges,
  /// Set when the embedder rewrote the URL of an allowed load.
  pub redirect: Option<Uri>,
}

/// Continuation the engine resumes with.
pub type LoadContinuation = Box<dyn FnOnce(LoadOutcome) + Send>;

/// A suspended load plus the continuation that resumes it.
pub(crate) struct LoadQuery {
  request: Arc<ResourceRequest>,
  respond: LoadContinuation,
}

impl LoadQuery {
  pub(crate) fn new(request: Arc<ResourceRequest>, respond: LoadContinuation) -> Self {
    Self { request, respond }
  }
}

impl Continuation<bool> for LoadQuery {
  fn run(self, allowed: bool) {
    // Freeze the request; an embedder still holding the handle can no
    // longer change what the engine is about to apply.
    self.request.set_read_only(true);

    // Update the engine request with only the values that have been
    // changed by the embedder.
    let changes = if allowed {
      self.request.changes()
    } else {
      RequestChanges::NONE
    };
    let snapshot = self.request.snapshot();
    let redirect = if allowed && changes.contains(RequestChanges::URL) {
      Some(snapshot.uri.clone())
    } else {
      None
    };

    (self.respond)(LoadOutcome {
      allowed,
      request: snapshot,
      changes,
      redirect,
    });
  }
}

/// Cloneable embedder-facing handle answering a load interception.
///
/// Resolution is always re-posted to the bound I/O queue, even when already
/// on it, so the engine is resumed from a fresh task. Dropping every handle
/// without answering cancels the load.
#[derive(Clone)]
pub struct LoadDecision {
  guard: GuardedCallback<bool, LoadQuery>,
}

impl LoadDecision {
  pub(crate) fn new(guard: GuardedCallback<bool, LoadQuery>) -> Self {
    Self { guard }
  }

  /// Resume the load, allowing or aborting it.
  pub fn resume(&self, allow: bool) {
    // Always continue asynchronously.
    let guard = self.guard.clone();
    if let Err(err) = self.guard.queue().post(move || guard.resolve(allow)) {
      tracing::warn!("dropping load decision: {err}");
    }
  }

  /// Abort the load.
  pub fn cancel(&self) {
    self.resume(false);
  }
}

/// Severs the request-to-decision association on engine-request teardown.
///
/// The engine keeps the disconnector alive exactly as long as its live
/// request. Dropping it (or calling
/// [`disconnect`](Disconnector::disconnect)) takes the still-pending
/// continuation and discards it without invoking; once the request is
/// gone there is nothing left to resume. Idempotent: after the decision has
/// resolved, or after a first sever, it does nothing.
pub struct Disconnector {
  guard: Option<WeakCallback<bool, LoadQuery>>,
}

impl Disconnector {
  pub(crate) fn new(guard: WeakCallback<bool, LoadQuery>) -> Self {
    Self { guard: Some(guard) }
  }

  /// Sever the association without resuming the engine.
  pub fn disconnect(&mut self) {
    if let Some(guard) = self.guard.take().and_then(|weak| weak.upgrade()) {
      drop(guard.disconnect());
    }
  }
}

impl Drop for Disconnector {
  fn drop(&mut self) {
    self.disconnect();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::TaskQueue;
  use http::Method;
  use std::sync::mpsc;
  use std::time::Duration;

  fn tracked_request(uri: &str) -> Arc<ResourceRequest> {
    let request = Arc::new(ResourceRequest::new(uri.parse().unwrap(), Method::GET));
    request.set_track_changes(true);
    request
  }

  fn pending(
    queue: &TaskQueue,
    request: Arc<ResourceRequest>,
  ) -> (
    GuardedCallback<bool, LoadQuery>,
    LoadDecision,
    mpsc::Receiver<LoadOutcome>,
  ) {
    let (tx, rx) = mpsc::channel();
    let guard = GuardedCallback::new(
      queue.clone(),
      false,
      LoadQuery::new(
        request,
        Box::new(move |outcome| {
          tx.send(outcome).unwrap();
        }),
      ),
    );
    let decision = LoadDecision::new(guard.clone());
    (guard, decision, rx)
  }

  fn drain(queue: &TaskQueue) {
    let (tx, rx) = mpsc::channel();
    queue.post(move || tx.send(()).unwrap()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
  }

  #[test]
  fn test_allow_with_edited_url_redirects() {
    let queue = TaskQueue::spawn("load-redirect").unwrap();
    let request = tracked_request("https://example.com/a");
    let (_guard, decision, rx) = pending(&queue, request.clone());

    request.set_uri_str("https://example.com/b").unwrap();
    request.set_header("x-intercepted", "1").unwrap();
    decision.resume(true);

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(outcome.allowed);
    assert!(outcome.changes.contains(RequestChanges::URL));
    assert!(outcome.changes.contains(RequestChanges::HEADERS));
    assert_eq!(
      outcome.redirect.unwrap(),
      "https://example.com/b".parse::<Uri>().unwrap()
    );
    assert!(request.is_read_only());
  }

  #[test]
  fn test_deny_reports_no_changes() {
    let queue = TaskQueue::spawn("load-deny").unwrap();
    let request = tracked_request("https://example.com/a");
    let (_guard, decision, rx) = pending(&queue, request.clone());

    request.set_uri_str("https://example.com/b").unwrap();
    decision.cancel();

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!outcome.allowed);
    assert!(outcome.changes.is_empty());
    assert!(outcome.redirect.is_none());
  }

  #[test]
  fn test_resume_is_always_deferred() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let queue = TaskQueue::spawn("load-deferred").unwrap();
    let request = tracked_request("https://example.com/a");
    let resolved = Arc::new(AtomicBool::new(false));

    let flag = resolved.clone();
    let guard = GuardedCallback::new(
      queue.clone(),
      false,
      LoadQuery::new(
        request,
        Box::new(move |_outcome| {
          flag.store(true, Ordering::SeqCst);
        }),
      ),
    );
    let decision = LoadDecision::new(guard);

    // Resuming from the bound queue must still go through a fresh task.
    let (probe_tx, probe_rx) = mpsc::channel();
    let flag = resolved.clone();
    queue
      .post(move || {
        decision.resume(true);
        // Nothing ran inline; the outcome lands behind this task.
        probe_tx.send(flag.load(Ordering::SeqCst)).unwrap();
      })
      .unwrap();

    assert!(!probe_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    drain(&queue);
    assert!(resolved.load(Ordering::SeqCst));
  }

  #[test]
  fn test_drop_unresolved_cancels() {
    let queue = TaskQueue::spawn("load-drop").unwrap();
    let request = tracked_request("https://example.com/a");
    let (guard, decision, rx) = pending(&queue, request);

    drop(decision);
    drop(guard);
    drain(&queue);

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!outcome.allowed);
  }

  #[test]
  fn test_disconnector_severs_before_resolution() {
    let queue = TaskQueue::spawn("load-sever").unwrap();
    let request = tracked_request("https://example.com/a");
    let (guard, decision, rx) = pending(&queue, request);
    let mut disconnector = Disconnector::new(guard.downgrade());

    // Engine tears the request down first.
    disconnector.disconnect();

    // A late answer, and the eventual drop of the guard, must not resume
    // anything.
    decision.resume(true);
    drop(decision);
    drop(guard);
    drain(&queue);

    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn test_disconnector_after_resolution_is_noop() {
    let queue = TaskQueue::spawn("load-sever-late").unwrap();
    let request = tracked_request("https://example.com/a");
    let (guard, decision, rx) = pending(&queue, request);
    let disconnector = Disconnector::new(guard.downgrade());

    decision.resume(true);
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(outcome.allowed);

    // Teardown after the fact changes nothing.
    drop(disconnector);
    drop(guard);
    drain(&queue);
    assert!(rx.try_recv().is_err());
  }
}
