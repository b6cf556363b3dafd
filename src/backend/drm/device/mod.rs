//! Access to the kernel display device
//!
//! Everything the composition engine needs from the device goes through the
//! [`DisplayDevice`] trait: topology enumeration, connector probing, property
//! writes, atomic commits and their completion events.
//!
//! [`AtomicDrmDevice`] implements it on top of a drm device node. With the
//! `test_device` feature (or in tests) an in-memory [`TestDevice`](test::TestDevice)
//! is provided as well.

use std::{
    collections::HashMap,
    fmt,
    os::unix::io::{BorrowedFd, OwnedFd},
    path::PathBuf,
    time::Duration,
};

use super::{
    error::{AccessError, CommitError},
    layer::Blending,
    resources::{ConnectorInterface, ModeInfo},
    ConnectorId, CrtcId, EncoderId, FramebufferId, ObjectId, PlaneId, PropertyId,
};
use crate::backend::allocator::Fourcc;
use crate::utils::{Buffer, Physical, Rectangle, Transform};

#[cfg(feature = "backend_drm")]
mod atomic;
#[cfg(feature = "backend_drm")]
mod fd;
#[cfg(any(test, feature = "test_device"))]
pub mod test;

#[cfg(feature = "backend_drm")]
pub use self::atomic::AtomicDrmDevice;
#[cfg(feature = "backend_drm")]
pub use self::fd::DrmDeviceFd;

/// Name to property id mapping of one object
pub type PropertyMap = HashMap<String, PropertyId>;

/// Connection state of a connector as sampled from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// A sink is attached
    Connected,
    /// Nothing is attached
    Disconnected,
    /// The device cannot tell
    Unknown,
}

/// Snapshot of a connector
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    /// Connector id
    pub id: ConnectorId,
    /// Connector class
    pub interface: ConnectorInterface,
    /// Index of this connector among connectors of the same class
    pub interface_id: u32,
    /// Sampled connection state
    pub state: ConnectionState,
    /// Physical size in millimeters, if known
    pub size: Option<(u32, u32)>,
    /// Modes reported by the sink
    pub modes: Vec<ModeInfo>,
    /// Encoders able to drive this connector
    pub encoders: Vec<EncoderId>,
    /// Encoder currently driving this connector
    pub current_encoder: Option<EncoderId>,
    /// Properties of this connector
    pub properties: PropertyMap,
}

/// Snapshot of an encoder
#[derive(Debug, Clone)]
pub struct EncoderInfo {
    /// Encoder id
    pub id: EncoderId,
    /// Crtcs this encoder can be driven by
    pub possible_crtcs: Vec<CrtcId>,
    /// Crtc currently driving this encoder
    pub current_crtc: Option<CrtcId>,
}

/// Snapshot of a crtc
#[derive(Debug, Clone)]
pub struct CrtcInfo {
    /// Crtc id
    pub id: CrtcId,
    /// Position of the crtc in the device's crtc list
    pub pipe: usize,
    /// Properties of this crtc
    pub properties: PropertyMap,
}

/// Role of a plane as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Primary plane of a crtc
    Primary,
    /// Overlay plane
    Overlay,
    /// Cursor plane
    Cursor,
}

/// Snapshot of a plane
#[derive(Debug, Clone)]
pub struct PlaneInfo {
    /// Plane id
    pub id: PlaneId,
    /// Role of the plane
    pub kind: PlaneType,
    /// Crtcs this plane can be attached to
    pub possible_crtcs: Vec<CrtcId>,
    /// Pixel formats the plane can scan out
    pub formats: Vec<Fourcc>,
    /// Whether the plane can scale its source
    pub scaling: bool,
    /// Immutable z-position, if the device reports one
    pub zpos: Option<u64>,
    /// Properties of this plane
    pub properties: PropertyMap,
}

/// Complete topology of a device
#[derive(Debug, Clone, Default)]
pub struct DeviceResources {
    /// All connectors
    pub connectors: Vec<ConnectorInfo>,
    /// All encoders
    pub encoders: Vec<EncoderInfo>,
    /// All crtcs
    pub crtcs: Vec<CrtcInfo>,
    /// All planes
    pub planes: Vec<PlaneInfo>,
    /// Largest cursor buffer the device accepts
    pub max_cursor_size: Option<(u32, u32)>,
}

/// State of one plane in a commit
#[derive(Debug)]
pub struct PlaneCommit<'a> {
    /// Plane to configure
    pub plane: PlaneId,
    /// Framebuffer to scan out
    pub framebuffer: FramebufferId,
    /// Source rectangle inside the framebuffer
    pub src: Rectangle<f64, Buffer>,
    /// Destination rectangle on the crtc
    pub dst: Rectangle<i32, Physical>,
    /// Transform applied to the source
    pub transform: Transform,
    /// Plane-wide alpha, `0xff` being opaque
    pub alpha: u8,
    /// Blending with the planes below
    pub blending: Blending,
    /// Fence the device waits on before scanning out the framebuffer
    pub in_fence: Option<BorrowedFd<'a>>,
}

/// Mode-setting parameters of a commit
#[derive(Debug, Clone, Copy)]
pub enum Modeset<'a> {
    /// Bind the connector to the crtc and program the mode
    Enable(&'a ModeInfo),
    /// Unbind the connector and turn the crtc off
    Disable,
}

/// One atomic update of a display pipeline
#[derive(Debug)]
pub struct CommitRequest<'a> {
    /// Crtc being updated
    pub crtc: CrtcId,
    /// Connector driven by the crtc
    pub connector: ConnectorId,
    /// Mode-setting changes, if any
    pub modeset: Option<Modeset<'a>>,
    /// Planes to show
    pub planes: Vec<PlaneCommit<'a>>,
    /// Planes to turn off
    pub disable: Vec<PlaneId>,
    /// Request a completion event and return before the update is applied
    pub event: bool,
    /// Only check whether the device would accept the update
    pub test_only: bool,
}

/// Result of a successful commit
#[derive(Debug, Default)]
pub struct CommitOutput {
    /// Fence signaling once the committed state is shown, if the crtc supports it
    pub out_fence: Option<OwnedFd>,
}

/// Notification that a committed state is now shown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    /// Crtc that completed
    pub crtc: CrtcId,
    /// Frame counter of the crtc
    pub frame: u32,
    /// Timestamp of the completion
    pub time: Duration,
}

/// Operations the composition engine needs from a display device
pub trait DisplayDevice: fmt::Debug + Send + Sync {
    /// Enumerate all mode-setting objects and their properties
    fn enumerate(&self) -> Result<DeviceResources, AccessError>;

    /// Re-query a single connector
    fn probe_connector(&self, connector: ConnectorId) -> Result<ConnectorInfo, AccessError>;

    /// Set a property of an object outside of a commit
    fn set_property(&self, object: ObjectId, property: PropertyId, value: u64) -> Result<(), AccessError>;

    /// Apply (or test) a commit
    fn commit(&self, request: &CommitRequest<'_>) -> Result<CommitOutput, CommitError>;

    /// Wait for the next completion event of `crtc`
    ///
    /// Returns `Ok(None)` if no event arrived within `timeout`.
    fn wait_for_completion(
        &self,
        crtc: CrtcId,
        timeout: Duration,
    ) -> Result<Option<CompletionEvent>, AccessError>;

    /// Check whether `mode` can be driven on `connector`
    fn verify_mode(&self, connector: ConnectorId, mode: &ModeInfo) -> bool {
        let _ = (connector, mode);
        true
    }

    /// Whether planes accept fences through the commit
    fn supports_in_fences(&self) -> bool;

    /// Path of the device node, if any
    fn dev_path(&self) -> Option<PathBuf> {
        None
    }
}
