// Copyright 2020-2024 Tauri Programme within The Commons Conservancy
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Request and response descriptors shared with embedder handlers.
//!
//! A [`ResourceRequest`] is the embedder-visible snapshot of a request the
//! engine is about to issue. While an interception decision is pending the
//! handler may edit it; every edit is recorded in a [`RequestChanges`] bit
//! set so the engine re-applies only the fields the embedder actually
//! touched to its live request object.

use std::ops::{BitOr, BitOrAssign};
use std::sync::Mutex;

use http::{
  header::{HeaderMap, HeaderName, HeaderValue},
  Method, StatusCode, Uri,
};

use crate::Result;

/// Bit set naming the request fields an embedder handler modified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestChanges(u8);

impl RequestChanges {
  pub const NONE: RequestChanges = RequestChanges(0);
  pub const URL: RequestChanges = RequestChanges(1 << 0);
  pub const METHOD: RequestChanges = RequestChanges(1 << 1);
  pub const REFERRER: RequestChanges = RequestChanges(1 << 2);
  pub const HEADERS: RequestChanges = RequestChanges(1 << 3);

  /// Whether every bit in `other` is set in `self`.
  pub fn contains(self, other: RequestChanges) -> bool {
    self.0 & other.0 == other.0
  }

  pub fn is_empty(self) -> bool {
    self.0 == 0
  }
}

impl BitOr for RequestChanges {
  type Output = RequestChanges;

  fn bitor(self, rhs: RequestChanges) -> RequestChanges {
    RequestChanges(self.0 | rhs.0)
  }
}

impl BitOrAssign for RequestChanges {
  fn bitor_assign(&mut self, rhs: RequestChanges) {
    self.0 |= rhs.0;
  }
}

struct RequestData {
  uri: Uri,
  method: Method,
  headers: HeaderMap,
  referrer: Option<Uri>,
  changes: RequestChanges,
  track_changes: bool,
  read_only: bool,
}

impl RequestData {
  fn mark(&mut self, change: RequestChanges) {
    if self.track_changes {
      self.changes |= change;
    }
  }
}

/// The embedder-visible, change-tracked view of a pending engine request.
///
/// Shared between the dispatch path and the handler; all accessors take
/// `&self` and lock internally, mirroring how the handle is passed around by
/// reference while a decision is pending. Once the decision resolves the
/// request is frozen ([`set_read_only`](ResourceRequest::set_read_only)) and
/// late edits become no-ops.
pub struct ResourceRequest {
  data: Mutex<RequestData>,
}

impl ResourceRequest {
  pub fn new(uri: Uri, method: Method) -> Self {
    Self {
      data: Mutex::new(RequestData {
        uri,
        method,
        headers: HeaderMap::new(),
        referrer: None,
        changes: RequestChanges::NONE,
        track_changes: false,
        read_only: false,
      }),
    }
  }

  /// Replace the header map wholesale. Intended for construction, before
  /// the request is handed to a handler.
  pub fn with_headers(self, headers: HeaderMap) -> Self {
    {
      let mut data = self.lock();
      data.headers = headers;
    }
    self
  }

  pub fn with_referrer(self, referrer: Uri) -> Self {
    {
      let mut data = self.lock();
      data.referrer = Some(referrer);
    }
    self
  }

  pub fn uri(&self) -> Uri {
    self.lock().uri.clone()
  }

  pub fn set_uri(&self, uri: Uri) {
    let mut data = self.lock();
    if data.read_only {
      return;
    }
    data.uri = uri;
    data.mark(RequestChanges::URL);
  }

  /// Parse and set the request URL.
  pub fn set_uri_str(&self, uri: &str) -> Result<()> {
    let uri: Uri = uri.parse().map_err(http::Error::from)?;
    self.set_uri(uri);
    Ok(())
  }

  pub fn method(&self) -> Method {
    self.lock().method.clone()
  }

  pub fn set_method(&self, method: Method) {
    let mut data = self.lock();
    if data.read_only {
      return;
    }
    data.method = method;
    data.mark(RequestChanges::METHOD);
  }

  pub fn referrer(&self) -> Option<Uri> {
    self.lock().referrer.clone()
  }

  pub fn set_referrer(&self, referrer: Option<Uri>) {
    let mut data = self.lock();
    if data.read_only {
      return;
    }
    data.referrer = referrer;
    data.mark(RequestChanges::REFERRER);
  }

  pub fn headers(&self) -> HeaderMap {
    self.lock().headers.clone()
  }

  /// Parse and insert a header, replacing any previous value.
  pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(http::Error::from)?;
    let value = HeaderValue::from_str(value).map_err(http::Error::from)?;
    self.insert_header(name, value);
    Ok(())
  }

  pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
    let mut data = self.lock();
    if data.read_only {
      return;
    }
    data.headers.insert(name, value);
    data.mark(RequestChanges::HEADERS);
  }

  /// Insert a header only when absent, so an engine-supplied default never
  /// clobbers a value the page or the embedder already set.
  pub(crate) fn insert_header_if_missing(&self, name: HeaderName, value: HeaderValue) {
    let mut data = self.lock();
    if data.read_only || data.headers.contains_key(&name) {
      return;
    }
    data.headers.insert(name, value);
    data.mark(RequestChanges::HEADERS);
  }

  pub fn remove_header(&self, name: &HeaderName) {
    let mut data = self.lock();
    if data.read_only {
      return;
    }
    if data.headers.remove(name).is_some() {
      data.mark(RequestChanges::HEADERS);
    }
  }

  /// The fields touched since change tracking was enabled.
  pub fn changes(&self) -> RequestChanges {
    self.lock().changes
  }

  pub(crate) fn set_track_changes(&self, track: bool) {
    self.lock().track_changes = track;
  }

  pub fn is_read_only(&self) -> bool {
    self.lock().read_only
  }

  pub fn set_read_only(&self, read_only: bool) {
    self.lock().read_only = read_only;
  }

  /// An owned copy of the current request state.
  pub fn snapshot(&self) -> RequestSnapshot {
    let data = self.lock();
    RequestSnapshot {
      uri: data.uri.clone(),
      method: data.method.clone(),
      headers: data.headers.clone(),
      referrer: data.referrer.clone(),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, RequestData> {
    self.data.lock().expect("poisoned request data")
  }
}

impl std::fmt::Debug for ResourceRequest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let data = self.lock();
    f.debug_struct("ResourceRequest")
      .field("uri", &data.uri)
      .field("method", &data.method)
      .field("changes", &data.changes)
      .field("read_only", &data.read_only)
      .finish()
  }
}

/// Immutable copy of a request, as delivered in outcomes and observer hooks.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
  pub uri: Uri,
  pub method: Method,
  pub headers: HeaderMap,
  pub referrer: Option<Uri>,
}

/// Response metadata for completion notifications.
#[derive(Debug, Clone)]
pub struct ResourceResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
}

/// Terminal state of a finished resource load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
  Success,
  Canceled,
  Failed,
}
