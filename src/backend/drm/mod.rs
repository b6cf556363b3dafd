//! Hardware composition on top of kernel mode-setting
//!
//! This module assigns the layers of a frame to the hardware planes of a drm
//! device and commits them atomically, one display pipeline at a time.
//!
//! ## Overview
//!
//! - A [`DisplayDevice`] gives access to the kernel device. [`AtomicDrmDevice`]
//!   implements it for a drm device node opened through a [`DrmDeviceFd`].
//! - The [`ResourceRegistry`] mirrors the device topology (connectors, encoders,
//!   crtcs, planes and their properties) and binds logical displays to
//!   connector/encoder/crtc pipelines.
//! - Buffers are handed in as opaque [`BufferHandle`](crate::backend::allocator::BufferHandle)s
//!   and turned into framebuffers by an [`Importer`](crate::backend::allocator::Importer),
//!   e.g. the [`DrmImporter`].
//! - The [`DrmCompositor`](compositor::DrmCompositor) plans which layers go onto
//!   planes, which fall back to client composition, and drives one
//!   [`DisplayCompositor`](compositor::DisplayCompositor) worker per display.
//!
//! ## Initialization
//!
//! ```rust,no_run
//! use hwcomposer::backend::drm::{AtomicDrmDevice, DrmDeviceFd, ResourceRegistry};
//! use hwcomposer::utils::DeviceFd;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fd = DrmDeviceFd::new(DeviceFd::open("/dev/dri/card0")?);
//! let device = AtomicDrmDevice::new(fd)?;
//!
//! let registry = ResourceRegistry::initialize(&device)?;
//! let mut report = String::new();
//! registry.dump(&mut report)?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

pub mod compositor;
pub mod device;
mod error;
mod ids;
#[cfg(feature = "backend_drm")]
mod importer;
pub mod layer;
pub mod resources;

pub use compositor::DrmCompositor;
pub use device::{
    CommitOutput, CommitRequest, CompletionEvent, ConnectionState, ConnectorInfo, CrtcInfo, DeviceResources,
    DisplayDevice, EncoderInfo, Modeset, PlaneCommit, PlaneInfo, PlaneType, PropertyMap,
};
#[cfg(feature = "backend_drm")]
pub use device::{AtomicDrmDevice, DrmDeviceFd};
pub use error::{AccessError, CommitError, Error};
pub use ids::{ConnectorId, CrtcId, DisplayId, EncoderId, FramebufferId, ModeId, ObjectId, PlaneId, PropertyId};
#[cfg(feature = "backend_drm")]
pub use importer::DrmImporter;
pub use layer::{Blending, Layer, LayerDescription};
pub use resources::{ColorProperty, Pipeline, PowerMode, ResourceRegistry};
