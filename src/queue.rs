// Copyright 2020-2024 Tauri Programme within The Commons Conservancy
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Task queues standing in for the host engine's named threads.
//!
//! The engine runs a small set of long-lived, named threads (a UI-affine one
//! and an I/O-affine one in practice) and every decision continuation is
//! bound to exactly one of them. Cross-queue work is always expressed as
//! "post to queue Q"; posted tasks run in FIFO order and posting never
//! blocks the caller.

use std::{
  cell::Cell,
  collections::HashMap,
  sync::{
    atomic::{AtomicU64, Ordering},
    mpsc::{channel, Sender},
    Arc, Mutex,
  },
  thread,
};

use once_cell::sync::Lazy;

use crate::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Process-wide registry so cooperating layers can share queues by label
/// without threading handles through every constructor.
static REGISTRY: Lazy<Mutex<HashMap<String, TaskQueue>>> = Lazy::new(Default::default);

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
  /// Queue id of the worker this thread belongs to, if any.
  static CURRENT: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Handle to a worker thread draining posted tasks in FIFO order.
///
/// Handles are cheap to clone and share ownership of the worker. The worker
/// keeps running until every handle is gone (or [`TaskQueue::shutdown`] is
/// called) and the backlog has drained.
#[derive(Clone)]
pub struct TaskQueue {
  inner: Arc<QueueInner>,
}

struct QueueInner {
  id: u64,
  label: String,
  sender: Mutex<Option<Sender<Task>>>,
}

impl TaskQueue {
  /// Spawn a new queue with a dedicated worker thread.
  pub fn spawn(label: &str) -> Result<TaskQueue> {
    let (sender, receiver) = channel::<Task>();
    let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);

    thread::Builder::new()
      .name(format!("gavel-{label}"))
      .spawn(move || {
        CURRENT.with(|current| current.set(Some(id)));
        while let Ok(task) = receiver.recv() {
          task();
        }
      })?;

    Ok(TaskQueue {
      inner: Arc::new(QueueInner {
        id,
        label: label.to_string(),
        sender: Mutex::new(Some(sender)),
      }),
    })
  }

  /// Look up the queue registered under `label`, spawning it on first use.
  ///
  /// Registered queues live for the rest of the process, like the engine
  /// threads they stand in for.
  pub fn named(label: &str) -> Result<TaskQueue> {
    let mut registry = REGISTRY.lock().expect("poisoned queue registry");
    if let Some(queue) = registry.get(label) {
      return Ok(queue.clone());
    }
    let queue = TaskQueue::spawn(label)?;
    registry.insert(label.to_string(), queue.clone());
    Ok(queue)
  }

  /// Submit `task` to run on this queue, after everything posted before it.
  pub fn post<F>(&self, task: F) -> Result<()>
  where
    F: FnOnce() + Send + 'static,
  {
    let sender = self.inner.sender.lock().expect("poisoned queue sender");
    match sender.as_ref() {
      Some(sender) => sender
        .send(Box::new(task))
        .map_err(|_| Error::QueueClosed(self.label().to_string())),
      None => Err(Error::QueueClosed(self.label().to_string())),
    }
  }

  /// Whether the calling thread is this queue's worker.
  pub fn is_current(&self) -> bool {
    CURRENT.with(|current| current.get() == Some(self.inner.id))
  }

  /// The label the queue was created with.
  pub fn label(&self) -> &str {
    &self.inner.label
  }

  /// Stop accepting tasks on every handle to this queue.
  ///
  /// Already-posted tasks still run; the worker exits once the backlog
  /// drains. Subsequent [`TaskQueue::post`] calls return
  /// [`Error::QueueClosed`].
  pub fn shutdown(&self) {
    self
      .inner
      .sender
      .lock()
      .expect("poisoned queue sender")
      .take();
  }
}

impl std::fmt::Debug for TaskQueue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskQueue")
      .field("label", &self.inner.label)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;
  use std::time::Duration;

  #[test]
  fn test_post_runs_on_worker() {
    let queue = TaskQueue::spawn("test-worker").unwrap();
    let (tx, rx) = mpsc::channel();

    let probe = queue.clone();
    queue
      .post(move || {
        tx.send(probe.is_current()).unwrap();
      })
      .unwrap();

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(!queue.is_current());
  }

  #[test]
  fn test_fifo_order_preserved() {
    let queue = TaskQueue::spawn("test-fifo").unwrap();
    let (tx, rx) = mpsc::channel();

    for n in 0..32 {
      let tx = tx.clone();
      queue.post(move || tx.send(n).unwrap()).unwrap();
    }

    let received: Vec<i32> = (0..32)
      .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
      .collect();
    assert_eq!(received, (0..32).collect::<Vec<_>>());
  }

  #[test]
  fn test_named_returns_shared_queue() {
    let first = TaskQueue::named("test-registry").unwrap();
    let second = TaskQueue::named("test-registry").unwrap();
    let (tx, rx) = mpsc::channel();

    first
      .post(move || {
        tx.send(second.is_current()).unwrap();
      })
      .unwrap();

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
  }

  #[test]
  fn test_post_after_shutdown_fails() {
    let queue = TaskQueue::spawn("test-shutdown").unwrap();
    let (tx, rx) = mpsc::channel();
    queue.post(move || tx.send(()).unwrap()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    queue.shutdown();
    let result = queue.post(|| {});
    assert!(matches!(result, Err(Error::QueueClosed(_))));
  }
}
