// Copyright 2020-2024 Tauri Programme within The Commons Conservancy
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Authentication challenge decisions.
//!
//! When a server or proxy demands credentials the engine suspends the
//! request and asks the embedder. Supplying credentials resumes it with
//! them. Anything else (explicit cancel, dropping the handle, teardown)
//! resumes it with [`AuthAction::NoAction`] and lets the request fail the
//! challenge.

use crate::guard::{Continuation, GuardedCallback};

/// Immutable snapshot of an authentication challenge.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
  /// Whether the challenger is a proxy rather than the origin server.
  pub is_proxy: bool,
  pub host: String,
  pub port: u16,
  pub realm: Option<String>,
  /// The authentication scheme, e.g. `basic` or `digest`.
  pub scheme: String,
}

/// A username/password pair supplied by the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
  pub username: String,
  pub password: String,
}

/// What the engine is resumed with after a challenge decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
  /// Retry the request with these credentials.
  UseCredentials(Credentials),
  /// Proceed without credentials; the challenge stands.
  NoAction,
}

/// Continuation the engine resumes with.
pub type AuthContinuation = Box<dyn FnOnce(AuthAction) + Send>;

pub(crate) struct AuthQuery {
  respond: AuthContinuation,
}

impl AuthQuery {
  pub(crate) fn new(respond: AuthContinuation) -> Self {
    Self { respond }
  }

  pub(crate) fn into_response(self) -> AuthContinuation {
    self.respond
  }
}

impl Continuation<Option<Credentials>> for AuthQuery {
  fn run(self, credentials: Option<Credentials>) {
    let action = match credentials {
      Some(credentials) => AuthAction::UseCredentials(credentials),
      None => AuthAction::NoAction,
    };
    (self.respond)(action);
  }
}

/// Cloneable embedder-facing handle answering an auth challenge.
#[derive(Clone)]
pub struct AuthDecision {
  guard: GuardedCallback<Option<Credentials>, AuthQuery>,
}

impl AuthDecision {
  pub(crate) fn new(guard: GuardedCallback<Option<Credentials>, AuthQuery>) -> Self {
    Self { guard }
  }

  /// Answer the challenge with credentials.
  pub fn use_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
    self.guard.resolve(Some(Credentials {
      username: username.into(),
      password: password.into(),
    }));
  }

  /// Decline the challenge.
  pub fn cancel(&self) {
    self.guard.cancel();
  }
}
