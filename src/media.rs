// Copyright 2020-2024 Tauri Programme within The Commons Conservancy
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Media-capture permission decisions.
//!
//! A page requesting capture suspends inside the engine until the embedder
//! answers with the set of permissions it grants. The answer is validated
//! against what was actually requested before anything reaches the engine:
//! a display-capture request must never come back audio-only, and a
//! device-capture request must be granted exactly the set it asked for.
//! Anything inconsistent collapses to a denial instead of forwarding
//! partial state.

use std::ops::{BitOr, BitOrAssign};

use crate::guard::{Continuation, GuardedCallback};

/// Bit set of capture permissions, as requested by a page or granted by the
/// embedder. Device (camera/microphone) and desktop (screen/system-audio)
/// capture are independent bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MediaPermissions(u32);

impl MediaPermissions {
  pub const NONE: MediaPermissions = MediaPermissions(0);
  pub const DEVICE_AUDIO_CAPTURE: MediaPermissions = MediaPermissions(1 << 0);
  pub const DEVICE_VIDEO_CAPTURE: MediaPermissions = MediaPermissions(1 << 1);
  pub const DESKTOP_AUDIO_CAPTURE: MediaPermissions = MediaPermissions(1 << 2);
  pub const DESKTOP_VIDEO_CAPTURE: MediaPermissions = MediaPermissions(1 << 3);

  /// Whether every bit in `other` is set in `self`.
  pub fn contains(self, other: MediaPermissions) -> bool {
    self.0 & other.0 == other.0
  }

  /// Whether any bit in `other` is set in `self`.
  pub fn intersects(self, other: MediaPermissions) -> bool {
    self.0 & other.0 != 0
  }

  pub fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub fn bits(self) -> u32 {
    self.0
  }
}

impl BitOr for MediaPermissions {
  type Output = MediaPermissions;

  fn bitor(self, rhs: MediaPermissions) -> MediaPermissions {
    MediaPermissions(self.0 | rhs.0)
  }
}

impl BitOrAssign for MediaPermissions {
  fn bitor_assign(&mut self, rhs: MediaPermissions) {
    self.0 |= rhs.0;
  }
}

/// The engine-level stream type of one half (audio or video) of a capture
/// request.
///
/// Desktop capture arrives under two distinct types per half: the legacy
/// desktop-capture API and the display-capture (`getDisplayMedia`) API.
/// Both map to the same desktop permission bit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamType {
  /// No capture requested for this half.
  #[default]
  None,
  /// Microphone capture (`getUserMedia`).
  DeviceAudioCapture,
  /// Camera capture (`getUserMedia`).
  DeviceVideoCapture,
  /// System-audio loopback via the legacy desktop-capture API.
  DesktopAudioCapture,
  /// System-audio loopback via `getDisplayMedia`.
  DisplayAudioCapture,
  /// Screen capture via the legacy desktop-capture API.
  DesktopVideoCapture,
  /// Screen capture via `getDisplayMedia`.
  DisplayVideoCapture,
}

/// Immutable snapshot of a pending capture request.
#[derive(Debug, Clone, Default)]
pub struct MediaStreamRequest {
  /// Origin of the frame that issued the request.
  pub origin: String,
  pub audio_type: StreamType,
  pub video_type: StreamType,
  /// Device id the page asked for, empty for "any".
  pub requested_audio_device_id: String,
  pub requested_video_device_id: String,
}

/// A capture device, real or synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDevice {
  pub id: String,
  pub name: String,
}

/// The devices attached to a granted stream. At most one audio and one
/// video device can be used in a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamDevices {
  pub audio: Option<MediaDevice>,
  pub video: Option<MediaDevice>,
}

/// Result code delivered to the engine alongside the granted devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAccessResult {
  Allowed,
  PermissionDenied,
  /// The embedder's grant was inconsistent with the request.
  InvalidState,
}

/// The capture devices available to satisfy device-capture grants.
///
/// Grants name a device id or leave it empty; resolution picks the desired
/// device or falls back to the first available of the given kind.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
  audio: Vec<MediaDevice>,
  video: Vec<MediaDevice>,
}

impl DeviceRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_audio_device(&mut self, device: MediaDevice) {
    self.audio.push(device);
  }

  pub fn add_video_device(&mut self, device: MediaDevice) {
    self.video.push(device);
  }

  fn pick(devices: &[MediaDevice], requested_id: &str) -> Option<MediaDevice> {
    if requested_id.is_empty() {
      return devices.first().cloned();
    }
    devices
      .iter()
      .find(|device| device.id == requested_id)
      .or_else(|| devices.first())
      .cloned()
  }
}

/// Continuation the engine resumes with once the permission decision lands.
pub type MediaResponseContinuation = Box<dyn FnOnce(StreamDevices, MediaAccessResult) + Send>;

/// A suspended capture request plus the continuation that resumes it.
///
/// The query derives the requested permission bits from the stream types,
/// validates a grant against them and resolves the granted bits to concrete
/// devices. It is consumed by [`execute`](MediaAccessQuery::execute), or
/// handed back whole when the embedder leaves the decision to default
/// handling.
pub struct MediaAccessQuery {
  request: MediaStreamRequest,
  devices: DeviceRegistry,
  respond: MediaResponseContinuation,
}

impl MediaAccessQuery {
  pub(crate) fn new(
    request: MediaStreamRequest,
    devices: DeviceRegistry,
    respond: MediaResponseContinuation,
  ) -> Self {
    Self {
      request,
      devices,
      respond,
    }
  }

  /// The permission bits implied by the request's stream types.
  pub fn requested_permissions(&self) -> MediaPermissions {
    let mut requested = MediaPermissions::NONE;
    if self.device_audio_requested() {
      requested |= MediaPermissions::DEVICE_AUDIO_CAPTURE;
    }
    if self.device_video_requested() {
      requested |= MediaPermissions::DEVICE_VIDEO_CAPTURE;
    }
    if self.desktop_audio_requested() {
      requested |= MediaPermissions::DESKTOP_AUDIO_CAPTURE;
    }
    if self.desktop_video_requested() {
      requested |= MediaPermissions::DESKTOP_VIDEO_CAPTURE;
    }
    requested
  }

  /// Resume the engine with the devices matching `allowed`.
  ///
  /// An empty grant denies. A grant that exactly matches the request maps
  /// straight to devices; anything else goes through validation first and
  /// collapses to an invalid-state denial when inconsistent.
  pub fn execute(mut self, allowed: MediaPermissions) {
    let (devices, result) = if allowed.is_empty() {
      (StreamDevices::default(), MediaAccessResult::PermissionDenied)
    } else if allowed == self.requested_permissions() {
      (self.requested_media_devices(), MediaAccessResult::Allowed)
    } else {
      match self.allowed_media_devices(allowed) {
        Some(devices) => (devices, MediaAccessResult::Allowed),
        None => (StreamDevices::default(), MediaAccessResult::InvalidState),
      }
    };

    (self.respond)(devices, result);
  }

  /// Hand the raw continuation back for default handling.
  pub(crate) fn into_response(self) -> MediaResponseContinuation {
    self.respond
  }

  fn device_audio_requested(&self) -> bool {
    self.request.audio_type == StreamType::DeviceAudioCapture
  }

  fn device_video_requested(&self) -> bool {
    self.request.video_type == StreamType::DeviceVideoCapture
  }

  fn desktop_audio_requested(&self) -> bool {
    matches!(
      self.request.audio_type,
      StreamType::DesktopAudioCapture | StreamType::DisplayAudioCapture
    )
  }

  fn desktop_video_requested(&self) -> bool {
    matches!(
      self.request.video_type,
      StreamType::DesktopVideoCapture | StreamType::DisplayVideoCapture
    )
  }

  fn requested_media_devices(&self) -> StreamDevices {
    let mut audio_devices = Vec::new();
    let mut video_devices = Vec::new();

    if self.device_audio_requested() {
      // Pick the desired device or fall back to the first available of the
      // given kind.
      if let Some(device) =
        DeviceRegistry::pick(&self.devices.audio, &self.request.requested_audio_device_id)
      {
        audio_devices.push(device);
      }
    }

    if self.device_video_requested() {
      if let Some(device) =
        DeviceRegistry::pick(&self.devices.video, &self.request.requested_video_device_id)
      {
        video_devices.push(device);
      }
    }

    if self.desktop_audio_requested() {
      audio_devices.push(MediaDevice {
        id: "loopback".to_string(),
        name: "System Audio".to_string(),
      });
    }

    if self.desktop_video_requested() {
      let id = if self.request.requested_video_device_id.is_empty() {
        // Full desktop if the page named no specific surface.
        "screen:-1".to_string()
      } else {
        self.request.requested_video_device_id.clone()
      };
      video_devices.push(MediaDevice {
        id,
        name: "Screen".to_string(),
      });
    }

    // At most one audio device and one video device can be used in a stream.
    StreamDevices {
      audio: audio_devices.into_iter().next(),
      video: video_devices.into_iter().next(),
    }
  }

  fn allowed_media_devices(&mut self, allowed: MediaPermissions) -> Option<StreamDevices> {
    let requested = self.requested_permissions();

    // getDisplayMedia must always request video.
    if self.desktop_video_requested()
      && !allowed.contains(MediaPermissions::DESKTOP_VIDEO_CAPTURE)
      && allowed.contains(MediaPermissions::DESKTOP_AUDIO_CAPTURE)
    {
      tracing::warn!("response to a display capture request is not allowed to only return audio");
      return None;
    }
    if !self.desktop_video_requested() && requested != allowed {
      tracing::warn!(
        requested = requested.bits(),
        allowed = allowed.bits(),
        "response to a device capture request must match the requested permissions",
      );
      return None;
    }

    if !allowed.intersects(
      MediaPermissions::DEVICE_AUDIO_CAPTURE | MediaPermissions::DESKTOP_AUDIO_CAPTURE,
    ) {
      self.request.audio_type = StreamType::None;
    }
    if !allowed.intersects(
      MediaPermissions::DEVICE_VIDEO_CAPTURE | MediaPermissions::DESKTOP_VIDEO_CAPTURE,
    ) {
      self.request.video_type = StreamType::None;
    }

    Some(self.requested_media_devices())
  }
}

impl Continuation<MediaPermissions> for MediaAccessQuery {
  fn run(self, allowed: MediaPermissions) {
    self.execute(allowed);
  }
}

/// Cloneable embedder-facing handle answering a capture permission request.
///
/// Exactly one answer wins; the rest are no-ops. Dropping every handle
/// without answering denies the request.
#[derive(Clone)]
pub struct MediaAccessDecision {
  guard: GuardedCallback<MediaPermissions, MediaAccessQuery>,
}

impl MediaAccessDecision {
  pub(crate) fn new(guard: GuardedCallback<MediaPermissions, MediaAccessQuery>) -> Self {
    Self { guard }
  }

  /// Grant `allowed` of the requested permissions. Subject to the adapter's
  /// validation; an inconsistent grant resolves as a denial.
  pub fn grant(&self, allowed: MediaPermissions) {
    self.guard.resolve(allowed);
  }

  /// Deny the request.
  pub fn deny(&self) {
    self.guard.cancel();
  }
}
