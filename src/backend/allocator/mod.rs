//! Buffer import and management.
//!
//! The display pipeline never allocates buffers itself. Producers hand in opaque
//! [`BufferHandle`]s, which an [`Importer`] turns into device-side
//! [`BufferObject`]s (gem handles plus a framebuffer the planes can scan out).
//!
//! Imports are tracked through the move-only [`ImportedBuffer`], which hands the
//! buffer object back to the importer that created it exactly once, when dropped.

use std::{fmt, io, sync::Arc};

use tracing::warn;

pub mod handle;
pub use handle::{BufferHandle, BufferHandleBuilder, HandlePlane, MAX_PLANES};

pub use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

use crate::backend::drm::FramebufferId;
use crate::utils::{Buffer as BufferCoords, Size};

bitflags::bitflags! {
    /// Usage flags a buffer was allocated with
    ///
    /// Values follow the gralloc usage bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer may be sampled by the gpu
        const HW_TEXTURE    = 0x0000_0100;
        /// Buffer may be rendered to by the gpu
        const HW_RENDER     = 0x0000_0200;
        /// Buffer may be used by the hardware composer
        const HW_COMPOSER   = 0x0000_0800;
        /// Buffer contents must stay on a secure path to the display
        const PROTECTED     = 0x0000_4000;
        /// Buffer is a cursor image
        const CURSOR        = 0x0000_8000;
    }
}

/// Errors thrown while importing a buffer
#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    /// The device cannot scan out the buffer's format
    #[error("Format `{0:?}` cannot be scanned out by the device")]
    UnsupportedFormat(Fourcc),
    /// The device cannot consume a plane with this stride
    #[error("Stride {stride} of plane {plane} is not supported by the device")]
    InvalidStride {
        /// Index of the offending plane
        plane: usize,
        /// Stride of that plane
        stride: u32,
    },
    /// The handle carried no planes
    #[error("The buffer handle has no planes")]
    NoPlanes,
    /// The device failed to import the buffer
    #[error("Failed to import buffer: {errmsg} ({source})")]
    Access {
        /// Error message associated to the failure
        errmsg: &'static str,
        /// Underlying device error
        #[source]
        source: io::Error,
    },
}

/// Device-side description of an imported buffer
#[derive(Debug, PartialEq, Eq)]
pub struct BufferObject {
    /// Id of the imported [`BufferHandle`]
    pub buffer_id: u64,
    /// Size of the buffer
    pub size: Size<i32, BufferCoords>,
    /// Pixel format
    pub format: Fourcc,
    /// Format modifier
    pub modifier: Modifier,
    /// Per-plane pitches
    pub pitches: [u32; MAX_PLANES],
    /// Per-plane offsets
    pub offsets: [u32; MAX_PLANES],
    /// Per-plane gem handles, `0` for unused planes
    pub gem_handles: [u32; MAX_PLANES],
    /// Framebuffer wrapping the planes
    pub framebuffer: FramebufferId,
}

/// Converts opaque buffer handles into device-usable buffer objects
pub trait Importer: fmt::Debug + Send + Sync {
    /// Import the given handle
    ///
    /// Fails if the device cannot consume the buffer's format or strides.
    fn import_buffer(&self, handle: &BufferHandle) -> Result<BufferObject, ImportError>;

    /// Free the device-side state of a previously imported buffer
    fn release_buffer(&self, bo: BufferObject) -> Result<(), ImportError>;
}

/// A buffer object owned together with the importer that created it
///
/// Move-only: the buffer object is released through its importer exactly once,
/// when this value is dropped or [`release`](ImportedBuffer::release)d.
pub struct ImportedBuffer {
    bo: Option<BufferObject>,
    importer: Arc<dyn Importer>,
}

impl fmt::Debug for ImportedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportedBuffer")
            .field("bo", &self.bo)
            .field("importer", &self.importer)
            .finish()
    }
}

impl ImportedBuffer {
    /// Import `handle` through `importer`
    pub fn import(importer: &Arc<dyn Importer>, handle: &BufferHandle) -> Result<ImportedBuffer, ImportError> {
        let bo = importer.import_buffer(handle)?;
        Ok(ImportedBuffer {
            bo: Some(bo),
            importer: importer.clone(),
        })
    }

    /// The imported buffer object
    pub fn bo(&self) -> &BufferObject {
        // only `release` takes the object and that consumes self
        self.bo.as_ref().unwrap_or_else(|| unreachable!())
    }

    /// Framebuffer to scan out this buffer
    pub fn framebuffer(&self) -> FramebufferId {
        self.bo().framebuffer
    }

    /// Release the buffer object now, reporting failures
    pub fn release(mut self) -> Result<(), ImportError> {
        match self.bo.take() {
            Some(bo) => self.importer.release_buffer(bo),
            None => Ok(()),
        }
    }
}

impl Drop for ImportedBuffer {
    fn drop(&mut self) {
        if let Some(bo) = self.bo.take() {
            if let Err(err) = self.importer.release_buffer(bo) {
                warn!("Failed to release imported buffer: {}", err);
            }
        }
    }
}
