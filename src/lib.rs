// Copyright 2020-2024 Tauri Programme within The Commons Conservancy
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Gavel is the decision layer between an embedded browser engine and the
//! application hosting it.
//!
//! Browser engines suspend an operation whenever somebody outside the engine
//! has to decide: may this resource load proceed, which credentials answer
//! this auth challenge, which capture permissions does the page get. The
//! engine hands over a request descriptor together with a one-shot
//! continuation that resumes the suspended operation. Gavel wraps that
//! continuation in a [`GuardedCallback`] (invoked exactly once, on the
//! queue it is bound to, with a denied/canceled fallback when nobody ever
//! answers) and exposes a cloneable decision handle to the handler the
//! embedder registered on the [`Bridge`].
//!
//! ```no_run
//! use gavel::{BridgeBuilder, LoadVerdict};
//!
//! fn main() -> gavel::Result<()> {
//!   let bridge = BridgeBuilder::new()?
//!     .with_media_permission_handler(|_origin, requested, decision| {
//!       // Grant exactly what the page asked for.
//!       decision.grant(requested);
//!       true
//!     })
//!     .with_before_load_handler(|request, _decision| {
//!       if request.uri().host() == Some("ads.example.com") {
//!         LoadVerdict::Cancel
//!       } else {
//!         LoadVerdict::Allow
//!       }
//!     })
//!     .build();
//!   // Hand `bridge` to the engine glue. Dispatch entry points run on the
//!   // "ui" and "io" queues and the registered handlers answer from any
//!   // thread they like.
//!   # let _ = bridge;
//!   Ok(())
//! }
//! ```
//!
//! The three adapters ([`media`], [`load`], [`auth`]) are thin
//! specializations of the same guarded callback: each snapshots the fields
//! the embedder may inspect, validates the answer against what was actually
//! requested, and collapses anything inconsistent to a denial rather than
//! forwarding partial state to the engine.

#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]

use thiserror::Error;

pub use cookie;
pub use http;

pub mod auth;
pub mod bridge;
pub mod guard;
pub mod load;
pub mod media;
pub mod queue;
pub mod request;

pub use auth::{AuthAction, AuthChallenge, AuthContinuation, AuthDecision, Credentials};
pub use bridge::{Bridge, BridgeBuilder, BridgeSettings};
pub use guard::{Continuation, GuardedCallback, WeakCallback};
pub use load::{Disconnector, LoadContinuation, LoadDecision, LoadOutcome, LoadVerdict};
pub use media::{
  DeviceRegistry, MediaAccessDecision, MediaAccessResult, MediaDevice, MediaPermissions,
  MediaResponseContinuation, MediaStreamRequest, StreamDevices, StreamType,
};
pub use queue::TaskQueue;
pub use request::{LoadStatus, RequestChanges, RequestSnapshot, ResourceRequest, ResourceResponse};

/// Convenient type alias of Result type for gavel.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by gavel.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
  /// The queue's worker has shut down; the posted task was dropped.
  #[error("task queue `{0}` is no longer running")]
  QueueClosed(String),
  #[error(transparent)]
  HttpError(#[from] http::Error),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}
