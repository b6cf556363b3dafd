//! Per-frame visual layers
//!
//! A [`Layer`] is built from the host's [`LayerDescription`] once per frame. It
//! imports the buffer through the composition's [`Importer`] and owns the
//! layer's acquire fence and release fence writer until it is retired.

use std::{os::unix::io::OwnedFd, sync::Arc};

use tracing::debug;

use super::resources::LayerRequirements;
use crate::backend::{
    allocator::{BufferHandle, BufferUsage, ImportError, ImportedBuffer, Importer},
    sync::{AcquireFence, FenceSlot, OutputFence},
};
use crate::utils::{Buffer, Physical, Rectangle, Transform};

/// How a layer blends with the layers below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Blending {
    /// The layer is opaque
    #[default]
    None,
    /// Colour values are pre-multiplied with alpha
    Premultiplied,
    /// Colour values are not pre-multiplied
    Coverage,
}

impl Blending {
    /// Name of the matching `pixel blend mode` enum value
    pub fn drm_name(&self) -> &'static str {
        match self {
            Blending::None => "None",
            Blending::Premultiplied => "Pre-multiplied",
            Blending::Coverage => "Coverage",
        }
    }
}

/// A layer as handed in by the host for one frame
#[derive(Debug)]
pub struct LayerDescription {
    /// Buffer to show, `None` for layers only the client can draw
    pub buffer: Option<BufferHandle>,
    /// Transform in the composer's bit encoding, see [`Transform::from_bits`]
    pub transform: u32,
    /// Blending with the layers below
    pub blending: Blending,
    /// Plane-wide alpha, `0xff` being opaque
    pub alpha: u8,
    /// Area of the buffer to show
    pub source_crop: Rectangle<f64, Buffer>,
    /// Area of the display to show it on
    pub display_frame: Rectangle<i32, Physical>,
    /// Damaged regions since the last frame
    pub damage: Vec<Rectangle<i32, Physical>>,
    /// Fence signaling the buffer contents are ready
    pub acquire_fence: Option<OwnedFd>,
    /// Slot receiving the fence signaling the buffer may be reused
    pub release_fence: Option<FenceSlot>,
    /// Always compose this layer on the client
    pub force_client: bool,
    /// Keep an owned copy of the buffer handle
    pub copy_handle: bool,
}

impl Default for LayerDescription {
    fn default() -> Self {
        LayerDescription {
            buffer: None,
            transform: 0,
            blending: Blending::None,
            alpha: 0xff,
            source_crop: Rectangle::default(),
            display_frame: Rectangle::default(),
            damage: Vec::new(),
            acquire_fence: None,
            release_fence: None,
            force_client: false,
            copy_handle: false,
        }
    }
}

impl LayerDescription {
    /// Show all of `buffer` at `display_frame`
    pub fn new(buffer: BufferHandle, display_frame: Rectangle<i32, Physical>) -> Self {
        let source_crop = Rectangle::from_size(buffer.size()).to_f64();
        LayerDescription {
            buffer: Some(buffer),
            source_crop,
            display_frame,
            ..Default::default()
        }
    }
}

/// One visual surface of one frame
#[derive(Debug)]
pub struct Layer {
    handle: Option<BufferHandle>,
    owned_handle: Option<BufferHandle>,
    usage: BufferUsage,
    buffer: Option<ImportedBuffer>,
    import_error: Option<ImportError>,
    transform: Transform,
    blending: Blending,
    alpha: u8,
    source_crop: Rectangle<f64, Buffer>,
    source_crop_int: Rectangle<i32, Buffer>,
    display_frame: Rectangle<i32, Physical>,
    damage: Vec<Rectangle<i32, Physical>>,
    acquire_fence: AcquireFence,
    release_fence: Option<OutputFence>,
    force_client: bool,
}

impl Layer {
    /// Build a layer, importing its buffer through `importer`
    ///
    /// A failed import leaves the layer without a buffer; it is then composed
    /// on the client.
    #[profiling::function]
    pub fn from_description(desc: LayerDescription, importer: &Arc<dyn Importer>) -> Layer {
        let mut import_error = None;

        let owned_handle = match desc.buffer.as_ref().filter(|_| desc.copy_handle) {
            Some(handle) => match handle.try_clone_owned() {
                Ok(copy) => Some(copy),
                Err(source) => {
                    import_error = Some(ImportError::Access {
                        errmsg: "Failed to copy buffer handle",
                        source,
                    });
                    None
                }
            },
            None => None,
        };

        let usable = owned_handle.as_ref().or(desc.buffer.as_ref());
        let buffer = match usable {
            Some(handle) if import_error.is_none() => match ImportedBuffer::import(importer, handle) {
                Ok(buffer) => Some(buffer),
                Err(err) => {
                    debug!(buffer = handle.id(), "Failed to import layer buffer: {}", err);
                    import_error = Some(err);
                    None
                }
            },
            _ => None,
        };

        let crop = desc.source_crop;
        let x1 = crop.loc.x.floor();
        let y1 = crop.loc.y.floor();
        let x2 = (crop.loc.x + crop.size.w).ceil();
        let y2 = (crop.loc.y + crop.size.h).ceil();
        let source_crop_int = Rectangle::from_loc_and_size((x1 as i32, y1 as i32), ((x2 - x1) as i32, (y2 - y1) as i32));

        Layer {
            usage: desc.buffer.as_ref().map(BufferHandle::usage).unwrap_or(BufferUsage::empty()),
            handle: desc.buffer,
            owned_handle,
            buffer,
            import_error,
            transform: Transform::from_bits(desc.transform),
            blending: desc.blending,
            alpha: desc.alpha,
            source_crop: desc.source_crop,
            source_crop_int,
            display_frame: desc.display_frame,
            damage: desc.damage,
            acquire_fence: desc.acquire_fence.map(AcquireFence::new).unwrap_or_default(),
            release_fence: desc.release_fence.as_ref().map(OutputFence::new),
            force_client: desc.force_client,
        }
    }

    /// The handle handed in by the host
    pub fn handle(&self) -> Option<&BufferHandle> {
        self.handle.as_ref()
    }

    /// The owned copy of the handle if one was requested, otherwise the host's handle
    pub fn usable_handle(&self) -> Option<&BufferHandle> {
        self.owned_handle.as_ref().or(self.handle.as_ref())
    }

    /// Usage flags of the buffer
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Whether the buffer contents are protected
    pub fn is_protected(&self) -> bool {
        self.usage.contains(BufferUsage::PROTECTED)
    }

    /// The imported buffer, if the import succeeded
    pub fn buffer(&self) -> Option<&ImportedBuffer> {
        self.buffer.as_ref()
    }

    /// Why the import failed, if it did
    pub fn import_error(&self) -> Option<&ImportError> {
        self.import_error.as_ref()
    }

    /// Transform applied to the buffer
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Blending with the layers below
    pub fn blending(&self) -> Blending {
        self.blending
    }

    /// Plane-wide alpha
    pub fn alpha(&self) -> u8 {
        self.alpha
    }

    /// Area of the buffer to show
    pub fn source_crop(&self) -> Rectangle<f64, Buffer> {
        self.source_crop
    }

    /// Source crop rounded out to whole pixels
    pub fn source_crop_int(&self) -> Rectangle<i32, Buffer> {
        self.source_crop_int
    }

    /// Area of the display to show the buffer on
    pub fn display_frame(&self) -> Rectangle<i32, Physical> {
        self.display_frame
    }

    /// Damaged regions since the last frame
    pub fn damage(&self) -> &[Rectangle<i32, Physical>] {
        &self.damage
    }

    /// Fence signaling the buffer contents are ready
    pub fn acquire_fence(&self) -> &AcquireFence {
        &self.acquire_fence
    }

    /// Writer for the fence signaling the buffer may be reused
    pub fn release_fence(&self) -> Option<&OutputFence> {
        self.release_fence.as_ref()
    }

    /// Whether the host asked to compose this layer on the client
    pub fn force_client(&self) -> bool {
        self.force_client
    }

    /// Force composing this layer on the client
    pub fn set_force_client(&mut self, force: bool) {
        self.force_client = force;
    }

    /// Number of pixels this layer covers on the display
    pub fn area(&self) -> i64 {
        self.display_frame.size.w as i64 * self.display_frame.size.h as i64
    }

    /// What a plane needs to support to show this layer
    ///
    /// Returns `None` if the layer has no imported buffer.
    pub fn requirements(&self) -> Option<LayerRequirements> {
        let bo = self.buffer.as_ref()?.bo();
        let src = self.transform.transform_size(self.source_crop.size);
        let dst = self.display_frame.size.to_f64();
        Some(LayerRequirements {
            format: bo.format,
            buffer_size: bo.size,
            scaling: (src.w - dst.w).abs() >= 1.0 || (src.h - dst.h).abs() >= 1.0,
            transform: self.transform,
            alpha: self.alpha != 0xff,
            blending: self.blending,
            cursor: self.usage.contains(BufferUsage::CURSOR),
            protected: self.is_protected(),
        })
    }
}
