// Copyright 2020-2024 Tauri Programme within The Commons Conservancy
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Embedder-facing registration surface and engine-facing dispatch.
//!
//! The embedder builds a [`Bridge`] once, registering a handler per decision
//! kind; the engine glue calls the dispatch entry points from its queues
//! whenever a suspended operation needs an answer. Handlers either answer
//! inline, keep the decision handle and answer later from any thread, or
//! decline, in which case dispatch falls back to default handling exactly
//! the way the wrapped engine would.

use std::sync::Arc;

use cookie::Cookie;
use http::{header, HeaderValue};

use crate::auth::{AuthAction, AuthChallenge, AuthContinuation, AuthDecision, AuthQuery};
use crate::guard::{Continuation, GuardedCallback};
use crate::load::{Disconnector, LoadDecision, LoadOutcome, LoadQuery, LoadVerdict};
use crate::media::{
  DeviceRegistry, MediaAccessDecision, MediaAccessQuery, MediaAccessResult, MediaPermissions,
  MediaResponseContinuation, MediaStreamRequest, StreamDevices,
};
use crate::queue::TaskQueue;
use crate::request::{LoadStatus, RequestSnapshot, ResourceRequest, ResourceResponse};
use crate::Result;

/// Label of the queue media decisions are bound to.
pub const UI_QUEUE: &str = "ui";
/// Label of the queue network decisions are bound to.
pub const IO_QUEUE: &str = "io";

pub type MediaPermissionHandler =
  Box<dyn Fn(&str, MediaPermissions, MediaAccessDecision) -> bool + Send + Sync>;
pub type BeforeLoadHandler =
  Box<dyn Fn(&Arc<ResourceRequest>, LoadDecision) -> LoadVerdict + Send + Sync>;
pub type AuthHandler = Box<dyn Fn(&AuthChallenge, AuthDecision) -> bool + Send + Sync>;
pub type CookieSendFilter =
  Box<dyn Fn(&RequestSnapshot, &[Cookie<'static>]) -> bool + Send + Sync>;
pub type CookieSaveFilter = Box<dyn Fn(&RequestSnapshot, &Cookie<'static>) -> bool + Send + Sync>;
pub type LoadCompleteHandler =
  Box<dyn Fn(&RequestSnapshot, &ResourceResponse, LoadStatus, i64) + Send + Sync>;

/// Tunables applied at dispatch time.
#[derive(Debug, Clone, Default)]
pub struct BridgeSettings {
  /// `Accept-Language` value applied to intercepted requests that do not
  /// already carry the header.
  pub accept_language: Option<String>,
  /// Grant every capture request in full without consulting the handler.
  pub allow_all_media: bool,
}

/// The assembled decision layer. Build one with [`BridgeBuilder`].
pub struct Bridge {
  ui: TaskQueue,
  io: TaskQueue,
  settings: BridgeSettings,
  devices: DeviceRegistry,
  media_permission_handler: Option<MediaPermissionHandler>,
  before_load_handler: Option<BeforeLoadHandler>,
  auth_handler: Option<AuthHandler>,
  cookie_send_filter: Option<CookieSendFilter>,
  cookie_save_filter: Option<CookieSaveFilter>,
  load_complete_handler: Option<LoadCompleteHandler>,
}

impl Bridge {
  /// The queue media decisions are bound to.
  pub fn ui_queue(&self) -> &TaskQueue {
    &self.ui
  }

  /// The queue network decisions are bound to.
  pub fn io_queue(&self) -> &TaskQueue {
    &self.io
  }

  /// Ask for capture permissions on behalf of a suspended page request.
  ///
  /// Must run on the UI queue. `respond` is resumed exactly once with the
  /// granted devices. When no handler takes responsibility the request is
  /// either denied (`default_disallow`) or the continuation is handed back
  /// for the engine's default handling.
  pub fn request_media_access<F>(
    &self,
    request: MediaStreamRequest,
    respond: F,
    default_disallow: bool,
  ) -> Option<MediaResponseContinuation>
  where
    F: FnOnce(StreamDevices, MediaAccessResult) + Send + 'static,
  {
    debug_assert!(
      self.ui.is_current(),
      "media access must be dispatched on the ui queue"
    );

    let origin = request.origin.clone();
    let query = MediaAccessQuery::new(request, self.devices.clone(), Box::new(respond));
    let requested = query.requested_permissions();

    if self.settings.allow_all_media {
      // Allow all requested permissions.
      query.execute(requested);
      return None;
    }

    let Some(handler) = &self.media_permission_handler else {
      return self.unhandled_media_query(query, default_disallow);
    };

    let guard = GuardedCallback::new(self.ui.clone(), MediaPermissions::NONE, query);
    let handled = {
      let _span = tracing::info_span!("gavel::media_access::handle", %origin).entered();
      handler(&origin, requested, MediaAccessDecision::new(guard.clone()))
    };
    if handled {
      return None;
    }

    match guard.disconnect() {
      Some(query) => self.unhandled_media_query(query, default_disallow),
      None => {
        // The handler answered anyway; nothing left to resolve.
        tracing::error!(
          "media permission handler should return true when executing the decision"
        );
        None
      }
    }
  }

  fn unhandled_media_query(
    &self,
    query: MediaAccessQuery,
    default_disallow: bool,
  ) -> Option<MediaResponseContinuation> {
    if default_disallow {
      // Disallow access by default.
      query.execute(MediaPermissions::NONE);
      None
    } else {
      // Hand the continuation back for default handling.
      Some(query.into_response())
    }
  }

  /// Intercept a request the engine is about to issue.
  ///
  /// Must run on the I/O queue. `respond` is resumed exactly once with the
  /// outcome. Returns the [`Disconnector`] the engine must keep alive
  /// alongside its live request, or `None` when the load was allowed
  /// immediately because no handler is registered.
  pub fn before_resource_load<F>(&self, request: ResourceRequest, respond: F) -> Option<Disconnector>
  where
    F: FnOnce(LoadOutcome) + Send + 'static,
  {
    debug_assert!(
      self.io.is_current(),
      "load interception must be dispatched on the io queue"
    );

    let request = Arc::new(request);
    request.set_track_changes(true);

    if let Some(accept_language) = &self.settings.accept_language {
      match HeaderValue::from_str(accept_language) {
        Ok(value) => request.insert_header_if_missing(header::ACCEPT_LANGUAGE, value),
        Err(_) => {
          tracing::warn!("ignoring configured accept-language: not a valid header value")
        }
      }
    }

    let Some(handler) = &self.before_load_handler else {
      // Nobody intercepting; continue the request immediately.
      LoadQuery::new(request, Box::new(respond)).run(true);
      return None;
    };

    let guard = GuardedCallback::new(
      self.io.clone(),
      false,
      LoadQuery::new(request.clone(), Box::new(respond)),
    );
    let decision = LoadDecision::new(guard.clone());
    let disconnector = Disconnector::new(guard.downgrade());

    let verdict = {
      let _span = tracing::info_span!("gavel::before_load::handle", uri = %request.uri()).entered();
      handler(&request, decision.clone())
    };
    match verdict {
      LoadVerdict::Allow => decision.resume(true),
      LoadVerdict::Cancel => decision.resume(false),
      LoadVerdict::Defer => {}
    }

    Some(disconnector)
  }

  /// Ask for credentials answering `challenge`.
  ///
  /// Must run on the I/O queue. Returns the continuation when no handler
  /// takes responsibility, so the engine can apply its default (fail the
  /// challenge, prompt, …).
  pub fn request_auth_credentials<F>(
    &self,
    challenge: AuthChallenge,
    respond: F,
  ) -> Option<AuthContinuation>
  where
    F: FnOnce(AuthAction) + Send + 'static,
  {
    debug_assert!(
      self.io.is_current(),
      "auth challenges must be dispatched on the io queue"
    );

    let respond: AuthContinuation = Box::new(respond);
    let Some(handler) = &self.auth_handler else {
      return Some(respond);
    };

    let guard = GuardedCallback::new(self.io.clone(), None, AuthQuery::new(respond));
    let handled = {
      let _span = tracing::info_span!("gavel::auth::handle", host = %challenge.host).entered();
      handler(&challenge, AuthDecision::new(guard.clone()))
    };
    if handled {
      None
    } else {
      guard.disconnect().map(AuthQuery::into_response)
    }
  }

  /// Whether `cookies` may be attached to `request`. Allowed when no filter
  /// is registered.
  pub fn can_send_cookies(&self, request: &RequestSnapshot, cookies: &[Cookie<'static>]) -> bool {
    match &self.cookie_send_filter {
      Some(filter) => filter(request, cookies),
      None => true,
    }
  }

  /// Whether a response cookie may be persisted. Allowed when no filter is
  /// registered.
  pub fn can_save_cookie(&self, request: &RequestSnapshot, cookie: &Cookie<'static>) -> bool {
    match &self.cookie_save_filter {
      Some(filter) => filter(request, cookie),
      None => true,
    }
  }

  /// Notify the embedder that a resource load reached a terminal state.
  pub fn notify_load_complete(
    &self,
    request: &RequestSnapshot,
    response: &ResourceResponse,
    status: LoadStatus,
    received_bytes: i64,
  ) {
    if let Some(handler) = &self.load_complete_handler {
      handler(request, response, status, received_bytes);
    }
  }
}

/// Builder for [`Bridge`].
pub struct BridgeBuilder {
  ui: TaskQueue,
  io: TaskQueue,
  settings: BridgeSettings,
  devices: DeviceRegistry,
  media_permission_handler: Option<MediaPermissionHandler>,
  before_load_handler: Option<BeforeLoadHandler>,
  auth_handler: Option<AuthHandler>,
  cookie_send_filter: Option<CookieSendFilter>,
  cookie_save_filter: Option<CookieSaveFilter>,
  load_complete_handler: Option<LoadCompleteHandler>,
}

impl BridgeBuilder {
  /// Create a builder bound to the process-wide "ui" and "io" queues.
  pub fn new() -> Result<Self> {
    Ok(Self {
      ui: TaskQueue::named(UI_QUEUE)?,
      io: TaskQueue::named(IO_QUEUE)?,
      settings: BridgeSettings::default(),
      devices: DeviceRegistry::default(),
      media_permission_handler: None,
      before_load_handler: None,
      auth_handler: None,
      cookie_send_filter: None,
      cookie_save_filter: None,
      load_complete_handler: None,
    })
  }

  /// Bind media decisions to `queue` instead of the registered "ui" queue.
  pub fn with_ui_queue(mut self, queue: TaskQueue) -> Self {
    self.ui = queue;
    self
  }

  /// Bind network decisions to `queue` instead of the registered "io" queue.
  pub fn with_io_queue(mut self, queue: TaskQueue) -> Self {
    self.io = queue;
    self
  }

  pub fn with_settings(mut self, settings: BridgeSettings) -> Self {
    self.settings = settings;
    self
  }

  /// The capture devices available to satisfy device-capture grants.
  pub fn with_media_devices(mut self, devices: DeviceRegistry) -> Self {
    self.devices = devices;
    self
  }

  /// Decide capture permission requests. The handler returns whether it
  /// took responsibility for answering the decision (now or later).
  pub fn with_media_permission_handler<F>(mut self, handler: F) -> Self
  where
    F: Fn(&str, MediaPermissions, MediaAccessDecision) -> bool + Send + Sync + 'static,
  {
    self.media_permission_handler = Some(Box::new(handler));
    self
  }

  /// Intercept requests before the engine issues them.
  pub fn with_before_load_handler<F>(mut self, handler: F) -> Self
  where
    F: Fn(&Arc<ResourceRequest>, LoadDecision) -> LoadVerdict + Send + Sync + 'static,
  {
    self.before_load_handler = Some(Box::new(handler));
    self
  }

  /// Answer authentication challenges. The handler returns whether it took
  /// responsibility for answering the decision (now or later).
  pub fn with_auth_handler<F>(mut self, handler: F) -> Self
  where
    F: Fn(&AuthChallenge, AuthDecision) -> bool + Send + Sync + 'static,
  {
    self.auth_handler = Some(Box::new(handler));
    self
  }

  /// Gate the cookies attached to outgoing requests.
  pub fn with_cookie_send_filter<F>(mut self, filter: F) -> Self
  where
    F: Fn(&RequestSnapshot, &[Cookie<'static>]) -> bool + Send + Sync + 'static,
  {
    self.cookie_send_filter = Some(Box::new(filter));
    self
  }

  /// Gate the response cookies persisted to the jar.
  pub fn with_cookie_save_filter<F>(mut self, filter: F) -> Self
  where
    F: Fn(&RequestSnapshot, &Cookie<'static>) -> bool + Send + Sync + 'static,
  {
    self.cookie_save_filter = Some(Box::new(filter));
    self
  }

  /// Observe terminal load states.
  pub fn with_load_complete_handler<F>(mut self, handler: F) -> Self
  where
    F: Fn(&RequestSnapshot, &ResourceResponse, LoadStatus, i64) + Send + Sync + 'static,
  {
    self.load_complete_handler = Some(Box::new(handler));
    self
  }

  pub fn build(self) -> Bridge {
    Bridge {
      ui: self.ui,
      io: self.io,
      settings: self.settings,
      devices: self.devices,
      media_permission_handler: self.media_permission_handler,
      before_load_handler: self.before_load_handler,
      auth_handler: self.auth_handler,
      cookie_send_filter: self.cookie_send_filter,
      cookie_save_filter: self.cookie_save_filter,
      load_complete_handler: self.load_complete_handler,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::media::{MediaDevice, StreamType};
  use crate::request::RequestChanges;
  use http::Method;
  use std::sync::mpsc;
  use std::time::Duration;

  fn on_queue<T, F>(queue: &TaskQueue, f: F) -> T
  where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
  {
    let (tx, rx) = mpsc::channel();
    queue.post(move || tx.send(f()).unwrap()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
  }

  fn device_request() -> MediaStreamRequest {
    MediaStreamRequest {
      origin: "https://call.example.com".to_string(),
      audio_type: StreamType::DeviceAudioCapture,
      video_type: StreamType::DeviceVideoCapture,
      ..Default::default()
    }
  }

  fn registry() -> DeviceRegistry {
    let mut registry = DeviceRegistry::new();
    registry.add_audio_device(MediaDevice {
      id: "mic".to_string(),
      name: "Microphone".to_string(),
    });
    registry.add_video_device(MediaDevice {
      id: "cam".to_string(),
      name: "Camera".to_string(),
    });
    registry
  }

  #[test]
  fn test_media_handler_grant_resolves_devices() {
    let bridge = Arc::new(
      BridgeBuilder::new()
        .unwrap()
        .with_media_devices(registry())
        .with_media_permission_handler(|_origin, requested, decision| {
          decision.grant(requested);
          true
        })
        .build(),
    );

    let (tx, rx) = mpsc::channel();
    let dispatch = bridge.clone();
    let returned = on_queue(bridge.ui_queue(), move || {
      dispatch
        .request_media_access(
          device_request(),
          move |devices, result| {
            tx.send((devices, result)).unwrap();
          },
          true,
        )
        .is_none()
    });
    assert!(returned);

    let (devices, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result, MediaAccessResult::Allowed);
    assert_eq!(devices.audio.unwrap().id, "mic");
    assert_eq!(devices.video.unwrap().id, "cam");
  }

  #[test]
  fn test_media_unhandled_default_disallow_denies() {
    let bridge = Arc::new(BridgeBuilder::new().unwrap().build());

    let (tx, rx) = mpsc::channel();
    let dispatch = bridge.clone();
    let unhandled = on_queue(bridge.ui_queue(), move || {
      dispatch.request_media_access(
        device_request(),
        move |devices, result| {
          tx.send((devices, result)).unwrap();
        },
        true,
      )
    });
    assert!(unhandled.is_none());

    let (devices, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result, MediaAccessResult::PermissionDenied);
    assert!(devices.audio.is_none());
  }

  #[test]
  fn test_media_unhandled_returns_continuation() {
    let bridge = Arc::new(
      BridgeBuilder::new()
        .unwrap()
        .with_media_permission_handler(|_origin, _requested, _decision| false)
        .build(),
    );

    let (tx, rx) = mpsc::channel();
    let dispatch = bridge.clone();
    let continuation = on_queue(bridge.ui_queue(), move || {
      dispatch.request_media_access(
        device_request(),
        move |devices, result| {
          tx.send((devices, result)).unwrap();
        },
        false,
      )
    });

    // Nothing resolved yet; the engine applies its default handling.
    assert!(rx.try_recv().is_err());
    let continuation = continuation.expect("continuation handed back");
    continuation(StreamDevices::default(), MediaAccessResult::PermissionDenied);
    let (_devices, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result, MediaAccessResult::PermissionDenied);
  }

  #[test]
  fn test_allow_all_media_skips_handler() {
    let bridge = Arc::new(
      BridgeBuilder::new()
        .unwrap()
        .with_settings(BridgeSettings {
          allow_all_media: true,
          ..Default::default()
        })
        .with_media_devices(registry())
        .with_media_permission_handler(|_origin, _requested, _decision| {
          panic!("handler must not be consulted");
        })
        .build(),
    );

    let (tx, rx) = mpsc::channel();
    let dispatch = bridge.clone();
    let unhandled = on_queue(bridge.ui_queue(), move || {
      dispatch.request_media_access(
        device_request(),
        move |devices, result| {
          tx.send((devices, result)).unwrap();
        },
        true,
      )
    });
    assert!(unhandled.is_none());

    let (devices, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result, MediaAccessResult::Allowed);
    assert!(devices.audio.is_some());
    assert!(devices.video.is_some());
  }

  #[test]
  fn test_before_load_applies_accept_language() {
    let bridge = Arc::new(
      BridgeBuilder::new()
        .unwrap()
        .with_settings(BridgeSettings {
          accept_language: Some("en-US,en".to_string()),
          ..Default::default()
        })
        .with_before_load_handler(|_request, _decision| LoadVerdict::Allow)
        .build(),
    );

    let (tx, rx) = mpsc::channel();
    let dispatch = bridge.clone();
    let disconnector = on_queue(bridge.io_queue(), move || {
      dispatch.before_resource_load(
        ResourceRequest::new("https://example.com/".parse().unwrap(), Method::GET),
        move |outcome| {
          tx.send(outcome).unwrap();
        },
      )
    });
    assert!(disconnector.is_some());

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(outcome.allowed);
    assert!(outcome.changes.contains(RequestChanges::HEADERS));
    assert_eq!(
      outcome.request.headers.get(header::ACCEPT_LANGUAGE).unwrap(),
      "en-US,en"
    );
  }

  #[test]
  fn test_before_load_without_handler_allows_immediately() {
    let bridge = Arc::new(BridgeBuilder::new().unwrap().build());

    let (tx, rx) = mpsc::channel();
    let dispatch = bridge.clone();
    let disconnector = on_queue(bridge.io_queue(), move || {
      dispatch.before_resource_load(
        ResourceRequest::new("https://example.com/".parse().unwrap(), Method::GET),
        move |outcome| {
          tx.send(outcome).unwrap();
        },
      )
    });
    assert!(disconnector.is_none());

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(outcome.allowed);
    assert!(outcome.changes.is_empty());
  }

  #[test]
  fn test_before_load_cancel_verdict_denies() {
    let bridge = Arc::new(
      BridgeBuilder::new()
        .unwrap()
        .with_before_load_handler(|_request, _decision| LoadVerdict::Cancel)
        .build(),
    );

    let (tx, rx) = mpsc::channel();
    let dispatch = bridge.clone();
    let _disconnector = on_queue(bridge.io_queue(), move || {
      dispatch.before_resource_load(
        ResourceRequest::new("https://example.com/".parse().unwrap(), Method::GET),
        move |outcome| {
          tx.send(outcome).unwrap();
        },
      )
    });

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!outcome.allowed);
  }

  #[test]
  fn test_auth_handler_supplies_credentials() {
    let bridge = Arc::new(
      BridgeBuilder::new()
        .unwrap()
        .with_auth_handler(|challenge, decision| {
          assert_eq!(challenge.host, "example.com");
          decision.use_credentials("user", "pass");
          true
        })
        .build(),
    );

    let (tx, rx) = mpsc::channel();
    let dispatch = bridge.clone();
    let returned = on_queue(bridge.io_queue(), move || {
      dispatch
        .request_auth_credentials(
          AuthChallenge {
            is_proxy: false,
            host: "example.com".to_string(),
            port: 443,
            realm: Some("site".to_string()),
            scheme: "basic".to_string(),
          },
          move |action| {
            tx.send(action).unwrap();
          },
        )
        .is_none()
    });
    assert!(returned);

    assert!(matches!(
      rx.recv_timeout(Duration::from_secs(5)).unwrap(),
      AuthAction::UseCredentials(_)
    ));
  }

  #[test]
  fn test_auth_unhandled_returns_continuation() {
    let bridge = Arc::new(
      BridgeBuilder::new()
        .unwrap()
        .with_auth_handler(|_challenge, _decision| false)
        .build(),
    );

    let (tx, rx) = mpsc::channel();
    let dispatch = bridge.clone();
    let continuation = on_queue(bridge.io_queue(), move || {
      dispatch.request_auth_credentials(
        AuthChallenge {
          is_proxy: true,
          host: "proxy.example.com".to_string(),
          port: 3128,
          realm: None,
          scheme: "basic".to_string(),
        },
        move |action| {
          tx.send(action).unwrap();
        },
      )
    });

    let continuation = continuation.expect("continuation handed back");
    continuation(AuthAction::NoAction);
    assert_eq!(
      rx.recv_timeout(Duration::from_secs(5)).unwrap(),
      AuthAction::NoAction
    );
  }

  #[test]
  fn test_cookie_filters_default_to_allow() {
    let bridge = BridgeBuilder::new().unwrap().build();
    let request =
      ResourceRequest::new("https://example.com/".parse().unwrap(), Method::GET).snapshot();
    let cookie = Cookie::new("session", "abc");

    assert!(bridge.can_send_cookies(&request, std::slice::from_ref(&cookie)));
    assert!(bridge.can_save_cookie(&request, &cookie));
  }

  #[test]
  fn test_cookie_save_filter_blocks() {
    let bridge = BridgeBuilder::new()
      .unwrap()
      .with_cookie_save_filter(|_request, cookie| cookie.name() != "tracker")
      .build();
    let request =
      ResourceRequest::new("https://example.com/".parse().unwrap(), Method::GET).snapshot();

    assert!(bridge.can_save_cookie(&request, &Cookie::new("session", "abc")));
    assert!(!bridge.can_save_cookie(&request, &Cookie::new("tracker", "xyz")));
  }

  #[test]
  fn test_load_complete_observer_receives_status() {
    let (tx, rx) = mpsc::channel();
    let bridge = BridgeBuilder::new()
      .unwrap()
      .with_load_complete_handler(move |_request, response, status, received| {
        tx.send((response.status, status, received)).unwrap();
      })
      .build();

    let request =
      ResourceRequest::new("https://example.com/".parse().unwrap(), Method::GET).snapshot();
    let response = ResourceResponse {
      status: http::StatusCode::OK,
      headers: http::HeaderMap::new(),
    };
    bridge.notify_load_complete(&request, &response, LoadStatus::Success, 1024);

    let (code, status, received) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(code, http::StatusCode::OK);
    assert_eq!(status, LoadStatus::Success);
    assert_eq!(received, 1024);
  }
}
