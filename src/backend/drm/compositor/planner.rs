//! Assignment of layers to hardware planes
//!
//! The [`Planner`] is a pure function of its inputs: the layers of one frame,
//! the registry and the planes other displays currently hold. Layers it cannot
//! place are marked for client composition with a [`FallbackReason`], the frame
//! itself never fails because of plane starvation.
//!
//! Placement works in two steps. Layers are ranked by the configured
//! [`TieBreak`], then added one by one to the set of hardware layers as long as
//! that set can still be mapped onto the crtc's planes. A mapping must keep the
//! layers' stacking order, so the bottom-most hardware layer lands on the
//! bottom-most plane used.

use std::{collections::HashSet, fmt};

use tracing::{debug, instrument, trace};

use super::config::{CompositorConfig, TieBreak};
use crate::backend::drm::{
    error::Error,
    layer::Layer,
    resources::{LayerRequirements, Plane, PlaneKind, ResourceRegistry},
    CrtcId, DisplayId, PlaneId,
};

/// Why a layer is composed on the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackReason {
    /// The layer has no buffer
    NoBuffer,
    /// The layer's buffer could not be imported
    ImportFailed,
    /// The host asked for client composition
    ForcedClient,
    /// The layer is empty or leaves the display bounds
    InvalidGeometry,
    /// No remaining plane can show the layer
    NoCompatiblePlane,
    /// Placing the layer would exceed the overlay limit
    OverlayLimit,
    /// The topology changed and the assigned plane is no longer usable
    Invalidated,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FallbackReason::NoBuffer => "no buffer",
            FallbackReason::ImportFailed => "import failed",
            FallbackReason::ForcedClient => "forced client",
            FallbackReason::InvalidGeometry => "invalid geometry",
            FallbackReason::NoCompatiblePlane => "no compatible plane",
            FallbackReason::OverlayLimit => "overlay limit",
            FallbackReason::Invalidated => "invalidated",
        };
        f.write_str(reason)
    }
}

/// Where a layer ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerPlacement {
    /// Scanned out by a hardware plane
    Plane(PlaneId),
    /// Composed on the client
    Fallback(FallbackReason),
}

/// Result of planning one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneAssignment {
    display: DisplayId,
    crtc: CrtcId,
    topology_version: u64,
    placements: Vec<LayerPlacement>,
}

impl PlaneAssignment {
    /// Display this assignment was planned for
    pub fn display(&self) -> DisplayId {
        self.display
    }

    /// Crtc driving the planes
    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }

    /// Registry version this assignment is valid for
    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    /// Placement of every layer, by layer index
    pub fn placements(&self) -> &[LayerPlacement] {
        &self.placements
    }

    /// Plane showing layer `layer`, if any
    pub fn plane_for(&self, layer: usize) -> Option<PlaneId> {
        match self.placements.get(layer) {
            Some(LayerPlacement::Plane(plane)) => Some(*plane),
            _ => None,
        }
    }

    /// Layers on hardware planes as `(layer index, plane)`
    pub fn planes(&self) -> impl Iterator<Item = (usize, PlaneId)> + '_ {
        self.placements
            .iter()
            .enumerate()
            .filter_map(|(idx, placement)| match placement {
                LayerPlacement::Plane(plane) => Some((idx, *plane)),
                LayerPlacement::Fallback(_) => None,
            })
    }

    /// Indices of layers composed on the client
    pub fn fallback_layers(&self) -> impl Iterator<Item = usize> + '_ {
        self.placements
            .iter()
            .enumerate()
            .filter(|(_, placement)| matches!(placement, LayerPlacement::Fallback(_)))
            .map(|(idx, _)| idx)
    }

    /// Number of layers composed on the client
    pub fn fallback_count(&self) -> usize {
        self.fallback_layers().count()
    }

    /// Re-check the assignment against a changed topology
    ///
    /// Layers whose plane vanished, moved to another crtc, got claimed by
    /// another display or whose geometry left the display bounds are moved to
    /// client composition. Returns the number of demoted layers.
    pub fn revalidate(
        &mut self,
        layers: &[Layer],
        registry: &ResourceRegistry,
        claimed: &HashSet<PlaneId>,
    ) -> usize {
        let crtc_valid = registry.pipeline(self.display).map(|p| p.crtc) == Some(self.crtc);
        let bounds = registry.display_bounds(self.display);

        let mut demoted = 0;
        for (idx, placement) in self.placements.iter_mut().enumerate() {
            let LayerPlacement::Plane(plane_id) = *placement else {
                continue;
            };
            let usable = crtc_valid
                && !claimed.contains(&plane_id)
                && registry
                    .plane(plane_id)
                    .map(|plane| {
                        plane.can_drive(self.crtc)
                            && plane.crtc().map(|crtc| crtc == self.crtc).unwrap_or(true)
                            && layers
                                .get(idx)
                                .and_then(Layer::requirements)
                                .map(|req| plane.check(&req).is_ok())
                                .unwrap_or(false)
                    })
                    .unwrap_or(false);
            let in_bounds = layers
                .get(idx)
                .zip(bounds)
                .map(|(layer, bounds)| bounds.contains_rect(layer.display_frame()))
                .unwrap_or(false);

            if !usable || !in_bounds {
                debug!(layer = idx, plane = ?plane_id, "Plane assignment invalidated");
                *placement = LayerPlacement::Fallback(if in_bounds {
                    FallbackReason::Invalidated
                } else {
                    FallbackReason::InvalidGeometry
                });
                demoted += 1;
            }
        }
        self.topology_version = registry.version();
        demoted
    }
}

struct Candidate {
    index: usize,
    area: i64,
    requirements: LayerRequirements,
}

/// Assigns layers to hardware planes
#[derive(Debug, Clone)]
pub struct Planner {
    tie_break: TieBreak,
    max_overlays: Option<usize>,
    use_cursor_plane: bool,
}

impl Planner {
    /// Create a planner with the policy of `config`
    pub fn new(config: &CompositorConfig) -> Self {
        Planner {
            tie_break: config.tie_break,
            max_overlays: config.max_overlays,
            use_cursor_plane: config.use_cursor_plane,
        }
    }

    /// Contention policy in use
    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Plan the layers of one frame of `display`
    ///
    /// Planes in `claimed` belong to other displays' compositions and are not used.
    /// Fails only if `display` is not bound to a crtc.
    #[instrument(level = "trace", skip(self, layers, registry, display, claimed), fields(layers = layers.len()))]
    #[profiling::function]
    pub fn plan(
        &self,
        layers: &[Layer],
        registry: &ResourceRegistry,
        display: DisplayId,
        claimed: &HashSet<PlaneId>,
    ) -> Result<PlaneAssignment, Error> {
        let crtc = registry
            .pipeline(display)
            .map(|pipeline| pipeline.crtc)
            .ok_or(Error::UnknownDisplay(display))?;
        let bounds = registry.display_bounds(display);

        let mut planes: Vec<&Plane> = registry
            .legal_planes(crtc)?
            .iter()
            .filter_map(|id| registry.plane(*id))
            .filter(|plane| !claimed.contains(&plane.id()))
            .filter(|plane| plane.crtc().map(|owner| owner == crtc).unwrap_or(true))
            .filter(|plane| self.use_cursor_plane || !matches!(plane.kind(), PlaneKind::Cursor { .. }))
            .collect();
        planes.sort_by_key(|plane| plane.stacking_key());

        let mut placements = vec![LayerPlacement::Fallback(FallbackReason::NoCompatiblePlane); layers.len()];
        let mut candidates = Vec::with_capacity(layers.len());
        for (index, layer) in layers.iter().enumerate() {
            let reason = if layer.force_client() {
                Some(FallbackReason::ForcedClient)
            } else if layer.buffer().is_none() {
                Some(if layer.import_error().is_some() {
                    FallbackReason::ImportFailed
                } else {
                    FallbackReason::NoBuffer
                })
            } else if layer.display_frame().is_empty()
                || layer.source_crop().is_empty()
                || !bounds
                    .map(|bounds| bounds.contains_rect(layer.display_frame()))
                    .unwrap_or(false)
            {
                Some(FallbackReason::InvalidGeometry)
            } else {
                None
            };

            match (reason, layer.requirements()) {
                (None, Some(requirements)) => candidates.push(Candidate {
                    index,
                    area: layer.area(),
                    requirements,
                }),
                (reason, _) => {
                    let reason = reason.unwrap_or(FallbackReason::NoBuffer);
                    debug!(layer = index, %reason, "Layer falls back to client composition");
                    placements[index] = LayerPlacement::Fallback(reason);
                }
            }
        }

        self.rank(&mut candidates);

        // hardware layers, kept in stacking order
        let mut selected: Vec<&Candidate> = Vec::with_capacity(planes.len());
        for candidate in &candidates {
            let mut trial = selected.clone();
            let pos = trial
                .binary_search_by_key(&candidate.index, |c| c.index)
                .unwrap_or_else(|pos| pos);
            trial.insert(pos, candidate);

            match map_in_order(&trial, &planes) {
                Some(mapping) if self.within_overlay_limit(&mapping, &planes) => selected = trial,
                Some(_) => {
                    debug!(layer = candidate.index, "Layer falls back to client composition: overlay limit");
                    placements[candidate.index] = LayerPlacement::Fallback(FallbackReason::OverlayLimit);
                }
                None => {
                    debug!(layer = candidate.index, "Layer falls back to client composition: no compatible plane");
                    placements[candidate.index] = LayerPlacement::Fallback(FallbackReason::NoCompatiblePlane);
                }
            }
        }

        if let Some(mapping) = map_in_order(&selected, &planes) {
            for (candidate, plane) in selected.iter().zip(mapping) {
                placements[candidate.index] = LayerPlacement::Plane(planes[plane].id());
            }
        }

        let assignment = PlaneAssignment {
            display,
            crtc,
            topology_version: registry.version(),
            placements,
        };
        trace!(
            hardware = assignment.planes().count(),
            fallback = assignment.fallback_count(),
            "Planned frame"
        );
        Ok(assignment)
    }

    fn rank(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| {
            let protected = b.requirements.protected.cmp(&a.requirements.protected);
            let area = b.area.cmp(&a.area);
            let tightness = b.requirements.tightness().cmp(&a.requirements.tightness());
            let front_most = b.index.cmp(&a.index);
            let index = a.index.cmp(&b.index);
            protected.then(match self.tie_break {
                TieBreak::Area => area.then(tightness).then(index),
                TieBreak::ZOrder => front_most.then(area),
                TieBreak::CapabilityFit => tightness.then(area).then(index),
            })
        });
    }

    fn within_overlay_limit(&self, mapping: &[usize], planes: &[&Plane]) -> bool {
        match self.max_overlays {
            Some(max) => {
                mapping
                    .iter()
                    .filter(|idx| planes[**idx].kind() == PlaneKind::Overlay)
                    .count()
                    <= max
            }
            None => true,
        }
    }
}

/// Map layers (in stacking order) onto planes (in stacking order) without crossing
///
/// Every layer takes the lowest compatible plane above the previous layer's plane.
/// This finds a mapping whenever an order preserving one exists.
fn map_in_order(layers: &[&Candidate], planes: &[&Plane]) -> Option<Vec<usize>> {
    let mut mapping = Vec::with_capacity(layers.len());
    let mut next = 0;
    for layer in layers {
        let found = (next..planes.len()).find(|idx| planes[*idx].check(&layer.requirements).is_ok())?;
        mapping.push(found);
        next = found + 1;
    }
    Some(mapping)
}
