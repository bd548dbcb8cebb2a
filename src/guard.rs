// Copyright 2020-2024 Tauri Programme within The Commons Conservancy
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The one-shot, queue-affine wrapper around a pending engine continuation.
//!
//! Every asynchronous decision the engine delegates to the embedder follows
//! the same pattern: the engine suspends an operation and hands over a
//! continuation that must run exactly once, on a specific queue, no matter
//! whether the embedder answers explicitly, lets the handle fall out of
//! scope, or the originating request is torn down first. [`GuardedCallback`]
//! is that pattern, generic over the decision value and the continuation.

use std::sync::{Arc, Mutex, Weak};

use crate::queue::TaskQueue;

/// A pending continuation, consumed with the decision value.
///
/// Implemented for every `FnOnce(R)` closure; adapters implement it on their
/// query types so a disconnected continuation can be recovered as a typed
/// value rather than an opaque box.
pub trait Continuation<R>: Send + 'static {
  /// Consume the continuation, resuming the suspended engine operation.
  fn run(self, decision: R);
}

impl<R, F> Continuation<R> for F
where
  F: FnOnce(R) + Send + 'static,
{
  fn run(self, decision: R) {
    self(decision)
  }
}

struct Shared<R, C>
where
  R: Clone + Send + 'static,
  C: Continuation<R>,
{
  queue: TaskQueue,
  fallback: R,
  pending: Mutex<Option<C>>,
}

impl<R, C> Shared<R, C>
where
  R: Clone + Send + 'static,
  C: Continuation<R>,
{
  fn take(&self) -> Option<C> {
    self.pending.lock().expect("poisoned pending decision").take()
  }
}

impl<R, C> Drop for Shared<R, C>
where
  R: Clone + Send + 'static,
  C: Continuation<R>,
{
  fn drop(&mut self) {
    let pending = self
      .pending
      .get_mut()
      .expect("poisoned pending decision")
      .take();
    if let Some(continuation) = pending {
      // Still pending on last release. Cancel it now.
      let fallback = self.fallback.clone();
      if self.queue.is_current() {
        continuation.run(fallback);
      } else if let Err(err) = self.queue.post(move || continuation.run(fallback)) {
        tracing::warn!("dropping pending decision: {err}");
      }
    }
  }
}

/// Exactly-once, queue-affine resolution of an asynchronous decision.
///
/// The continuation runs at most once across any sequence of
/// [`resolve`](GuardedCallback::resolve), [`cancel`](GuardedCallback::cancel)
/// and drop; later attempts are silent no-ops. If the last handle is dropped
/// while the continuation is still pending, it runs with the fallback
/// (denied/canceled) value. [`disconnect`](GuardedCallback::disconnect)
/// transfers the pending continuation to the caller instead, after which
/// no handle ever runs it.
///
/// Handles are cheap to clone and share the same pending continuation: the
/// embedder-facing decision object and the dispatch path each hold one, and
/// whichever side acts first wins the single take. Taking is the only
/// guarded mutation, so no lock is held while the continuation itself runs.
pub struct GuardedCallback<R, C>
where
  R: Clone + Send + 'static,
  C: Continuation<R>,
{
  inner: Arc<Shared<R, C>>,
}

impl<R, C> Clone for GuardedCallback<R, C>
where
  R: Clone + Send + 'static,
  C: Continuation<R>,
{
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<R, C> GuardedCallback<R, C>
where
  R: Clone + Send + Sync + 'static,
  C: Continuation<R>,
{
  /// Wrap `continuation`, binding it to `queue` and recording the value to
  /// fall back to when nobody resolves explicitly.
  pub fn new(queue: TaskQueue, fallback: R, continuation: C) -> Self {
    Self {
      inner: Arc::new(Shared {
        queue,
        fallback,
        pending: Mutex::new(Some(continuation)),
      }),
    }
  }

  /// Resolve the pending continuation with `decision`.
  ///
  /// Runs the continuation inline when already on the bound queue;
  /// otherwise re-posts itself there and returns immediately. Resolving an
  /// already-resolved or disconnected callback is a no-op.
  pub fn resolve(&self, decision: R) {
    if self.inner.queue.is_current() {
      if let Some(continuation) = self.inner.take() {
        continuation.run(decision);
      }
    } else {
      let this = self.clone();
      if let Err(err) = self.inner.queue.post(move || this.resolve(decision)) {
        tracing::warn!("dropping pending decision: {err}");
      }
    }
  }

  /// Resolve with the fallback value.
  pub fn cancel(&self) {
    self.resolve(self.inner.fallback.clone());
  }

  /// Transfer the still-pending continuation to the caller.
  ///
  /// Returns `None` when the continuation already ran or was disconnected.
  /// After a successful disconnect no handle performs any resolution; the
  /// new owner is responsible for the continuation.
  pub fn disconnect(&self) -> Option<C> {
    self.inner.take()
  }

  /// Whether the continuation has neither run nor been disconnected yet.
  pub fn is_pending(&self) -> bool {
    self
      .inner
      .pending
      .lock()
      .expect("poisoned pending decision")
      .is_some()
  }

  /// The queue the continuation is bound to.
  pub fn queue(&self) -> &TaskQueue {
    &self.inner.queue
  }

  /// A non-owning handle, for back-references that must not keep the
  /// continuation alive.
  pub fn downgrade(&self) -> WeakCallback<R, C> {
    WeakCallback {
      inner: Arc::downgrade(&self.inner),
    }
  }
}

/// Weak counterpart of [`GuardedCallback`], held by whoever may need to
/// sever a pending continuation without owning it.
pub struct WeakCallback<R, C>
where
  R: Clone + Send + 'static,
  C: Continuation<R>,
{
  inner: Weak<Shared<R, C>>,
}

impl<R, C> Clone for WeakCallback<R, C>
where
  R: Clone + Send + 'static,
  C: Continuation<R>,
{
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<R, C> WeakCallback<R, C>
where
  R: Clone + Send + 'static,
  C: Continuation<R>,
{
  /// Recover an owning handle, if any still exists.
  pub fn upgrade(&self) -> Option<GuardedCallback<R, C>> {
    self
      .inner
      .upgrade()
      .map(|inner| GuardedCallback { inner })
  }
}
