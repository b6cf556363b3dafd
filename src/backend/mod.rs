//! Hardware backends of the composition engine
//!
//! - [`allocator`] describes the buffers handed in by producers and how they are
//!   imported into a device.
//! - [`sync`] contains the fence types travelling with every frame.
//! - [`drm`] talks to kernel mode-setting devices, plans layers onto hardware
//!   planes and commits them.

pub mod allocator;
pub mod drm;
pub mod sync;
