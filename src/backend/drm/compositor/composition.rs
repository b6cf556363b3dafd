use std::{
    fmt,
    os::unix::io::{AsFd, BorrowedFd},
    sync::Arc,
};

use tracing::warn;

use super::planner::PlaneAssignment;
use crate::backend::{
    allocator::Importer,
    drm::{
        layer::{Layer, LayerDescription},
        DisplayId,
    },
    sync::{FenceSlot, OutputFence},
};

/// One frame of one display: its layers, their plane assignment and the retire fence
///
/// Created through [`DrmCompositor::create_composition`](super::DrmCompositor::create_composition)
/// and handed to [`DrmCompositor::queue_composition`](super::DrmCompositor::queue_composition).
/// From then on the display compositor owns it until it is retired or discarded.
pub struct Composition {
    display: DisplayId,
    frame: u64,
    importer: Arc<dyn Importer>,
    layers: Vec<Layer>,
    assignment: Option<PlaneAssignment>,
    retire_fence: Option<OutputFence>,
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("display", &self.display)
            .field("frame", &self.frame)
            .field("layers", &self.layers.len())
            .field("assignment", &self.assignment)
            .field("retire_fence", &self.retire_fence.is_some())
            .finish()
    }
}

impl Composition {
    pub(super) fn new(frame: u64, importer: Arc<dyn Importer>) -> Composition {
        Composition {
            display: DisplayId(0),
            frame,
            importer,
            layers: Vec::new(),
            assignment: None,
            retire_fence: None,
        }
    }

    /// Display this composition targets
    pub fn display(&self) -> DisplayId {
        self.display
    }

    /// Target another display, dropping the plane assignment
    pub fn set_display(&mut self, display: DisplayId) {
        if self.display != display {
            self.display = display;
            self.assignment = None;
        }
    }

    /// Sequence number of this composition
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Importer used for the layers' buffers
    pub fn importer(&self) -> &Arc<dyn Importer> {
        &self.importer
    }

    /// Append a layer on top of the existing ones
    ///
    /// The buffer is imported right away; failures make the layer fall back.
    /// Returns the index of the new layer.
    pub fn add_layer(&mut self, desc: LayerDescription) -> usize {
        self.layers.push(Layer::from_description(desc, &self.importer));
        self.assignment = None;
        self.layers.len() - 1
    }

    /// Layers from back to front
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Mutable access to a layer, dropping the plane assignment
    pub fn layer_mut(&mut self, idx: usize) -> Option<&mut Layer> {
        self.assignment = None;
        self.layers.get_mut(idx)
    }

    /// Slot receiving the fence that signals once this composition left the screen
    pub fn set_retire_fence(&mut self, slot: &FenceSlot) {
        self.retire_fence = Some(OutputFence::new(slot));
    }

    /// Writer of the retire fence, if one was requested
    pub fn retire_fence(&self) -> Option<&OutputFence> {
        self.retire_fence.as_ref()
    }

    /// Plane assignment chosen for the layers, if planned
    pub fn assignment(&self) -> Option<&PlaneAssignment> {
        self.assignment.as_ref()
    }

    pub(super) fn set_assignment(&mut self, assignment: PlaneAssignment) {
        self.assignment = Some(assignment);
    }

    /// Indices of layers the host has to compose itself
    ///
    /// Without an assignment every layer counts as client composed.
    pub fn client_layers(&self) -> Vec<usize> {
        match &self.assignment {
            Some(assignment) => assignment.fallback_layers().collect(),
            None => (0..self.layers.len()).collect(),
        }
    }

    /// Signal the retire fence and all release fences, then free the layers
    ///
    /// `fence` is duplicated into every slot, an already signaled fence is used
    /// if there is none.
    pub(super) fn retire(self, fence: Option<BorrowedFd<'_>>) {
        if let Some(retire) = &self.retire_fence {
            signal(retire, fence);
        }
        self.release_layers(fence);
    }

    /// Free the layers without ever signaling the retire fence
    ///
    /// Release fences are still signaled, the buffers are no longer in use.
    pub(super) fn discard(self) {
        self.release_layers(None);
    }

    fn release_layers(self, fence: Option<BorrowedFd<'_>>) {
        for layer in &self.layers {
            if let Some(release) = layer.release_fence() {
                signal(release, fence);
            }
        }
        // dropping the layers closes acquire fences and releases imports
        drop(self.layers);
    }
}

fn signal(output: &OutputFence, fence: Option<BorrowedFd<'_>>) {
    let result = match fence {
        Some(fence) => output.set_dup(fence.as_fd()),
        None => output.signal(),
    };
    if let Err(err) = result {
        warn!("Failed to signal output fence: {}", err);
    }
}
