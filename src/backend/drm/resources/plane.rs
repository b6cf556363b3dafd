use std::fmt;

use crate::backend::{
    allocator::Fourcc,
    drm::{
        device::{PlaneInfo, PlaneType, PropertyMap},
        layer::Blending,
        CrtcId, PlaneId, PropertyId,
    },
};
use crate::utils::{Buffer, Size, Transform};

bitflags::bitflags! {
    /// Optional capabilities of a plane
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PlaneCaps: u32 {
        /// Source and destination size may differ
        const SCALING           = 0b0000_0001;
        /// Plane-wide alpha (`alpha` property)
        const ALPHA             = 0b0000_0010;
        /// Pre-multiplied blending
        const BLEND_PREMULTI    = 0b0000_0100;
        /// Coverage blending
        const BLEND_COVERAGE    = 0b0000_1000;
        /// Rotation and reflection (`rotation` property)
        const ROTATION          = 0b0001_0000;
        /// Waiting on fences (`IN_FENCE_FD` property)
        const IN_FENCE          = 0b0010_0000;
    }
}

/// Role of a plane and its role-specific limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneKind {
    /// Primary plane of a crtc
    Primary,
    /// Overlay plane
    Overlay,
    /// Cursor plane, only accepting cursor buffers up to `max_size`
    Cursor {
        /// Largest buffer the plane accepts, if limited
        max_size: Option<Size<i32, Buffer>>,
    },
}

impl fmt::Display for PlaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaneKind::Primary => f.write_str("primary"),
            PlaneKind::Overlay => f.write_str("overlay"),
            PlaneKind::Cursor { .. } => f.write_str("cursor"),
        }
    }
}

/// What a layer needs from the plane showing it
#[derive(Debug, Clone, PartialEq)]
pub struct LayerRequirements {
    /// Pixel format of the buffer
    pub format: Fourcc,
    /// Size of the buffer
    pub buffer_size: Size<i32, Buffer>,
    /// Source and destination differ in size
    pub scaling: bool,
    /// Transform applied to the buffer
    pub transform: Transform,
    /// Plane-wide alpha is not opaque
    pub alpha: bool,
    /// Blending with the planes below
    pub blending: Blending,
    /// Buffer is a cursor image
    pub cursor: bool,
    /// Buffer contents are protected
    pub protected: bool,
}

impl LayerRequirements {
    /// Number of optional capabilities needed, the higher the harder to place
    pub fn tightness(&self) -> u32 {
        self.scaling as u32
            + (self.transform != Transform::Normal) as u32
            + self.alpha as u32
            + (self.blending == Blending::Coverage) as u32
            + self.cursor as u32
            + self.protected as u32
    }
}

/// Reason a plane cannot show a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneRejection {
    /// The plane cannot scan out the format
    Format(Fourcc),
    /// The plane cannot scale
    Scaling,
    /// The plane cannot rotate or reflect
    Transform,
    /// The plane has no plane-wide alpha
    Alpha,
    /// The plane cannot express the blending mode
    Blending,
    /// Cursor planes only show cursor buffers
    NotCursor,
    /// The buffer exceeds the cursor plane's size limit
    CursorTooLarge,
}

impl fmt::Display for PlaneRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaneRejection::Format(format) => write!(f, "format {:?} unsupported", format),
            PlaneRejection::Scaling => f.write_str("no scaling"),
            PlaneRejection::Transform => f.write_str("no rotation"),
            PlaneRejection::Alpha => f.write_str("no plane alpha"),
            PlaneRejection::Blending => f.write_str("blend mode unsupported"),
            PlaneRejection::NotCursor => f.write_str("not a cursor buffer"),
            PlaneRejection::CursorTooLarge => f.write_str("cursor too large"),
        }
    }
}

/// A plane tracked by the registry
#[derive(Debug, Clone)]
pub struct Plane {
    id: PlaneId,
    kind: PlaneKind,
    possible_crtcs: Vec<CrtcId>,
    formats: Vec<Fourcc>,
    caps: PlaneCaps,
    zpos: Option<u64>,
    crtc: Option<CrtcId>,
    properties: PropertyMap,
}

impl Plane {
    pub(super) fn new(info: PlaneInfo, max_cursor_size: Option<(u32, u32)>) -> Self {
        let kind = match info.kind {
            PlaneType::Primary => PlaneKind::Primary,
            PlaneType::Overlay => PlaneKind::Overlay,
            PlaneType::Cursor => PlaneKind::Cursor {
                max_size: max_cursor_size.map(|(w, h)| Size::from((w as i32, h as i32))),
            },
        };

        let mut caps = PlaneCaps::empty();
        if info.scaling {
            caps |= PlaneCaps::SCALING;
        }
        if info.properties.contains_key("alpha") {
            caps |= PlaneCaps::ALPHA;
        }
        if info.properties.contains_key("pixel blend mode") {
            caps |= PlaneCaps::BLEND_PREMULTI | PlaneCaps::BLEND_COVERAGE;
        }
        if info.properties.contains_key("rotation") {
            caps |= PlaneCaps::ROTATION;
        }
        if info.properties.contains_key("IN_FENCE_FD") {
            caps |= PlaneCaps::IN_FENCE;
        }

        Plane {
            id: info.id,
            kind,
            possible_crtcs: info.possible_crtcs,
            formats: info.formats,
            caps,
            zpos: info.zpos,
            crtc: None,
            properties: info.properties,
        }
    }

    /// Plane id
    pub fn id(&self) -> PlaneId {
        self.id
    }

    /// Role of the plane
    pub fn kind(&self) -> PlaneKind {
        self.kind
    }

    /// Optional capabilities
    pub fn caps(&self) -> PlaneCaps {
        self.caps
    }

    /// Scan-out formats
    pub fn formats(&self) -> &[Fourcc] {
        &self.formats
    }

    /// Crtcs this plane can be attached to
    pub fn possible_crtcs(&self) -> &[CrtcId] {
        &self.possible_crtcs
    }

    /// Whether this plane can be attached to `crtc`
    pub fn can_drive(&self, crtc: CrtcId) -> bool {
        self.possible_crtcs.contains(&crtc)
    }

    /// Crtc the plane is currently attached to
    pub fn crtc(&self) -> Option<CrtcId> {
        self.crtc
    }

    pub(super) fn set_crtc(&mut self, crtc: Option<CrtcId>) {
        self.crtc = crtc;
    }

    /// Stacking key of the plane, lower is further back
    ///
    /// Uses the device's `zpos` if available, otherwise primary planes stack below
    /// overlays, which stack below cursors, each ordered by id.
    pub fn stacking_key(&self) -> (u64, u8, u32) {
        let role = match self.kind {
            PlaneKind::Primary => 0,
            PlaneKind::Overlay => 1,
            PlaneKind::Cursor { .. } => 2,
        };
        (self.zpos.unwrap_or(0), role, self.id.0)
    }

    /// Look up any property by name
    pub fn property(&self, name: &str) -> Option<PropertyId> {
        self.properties.get(name).copied()
    }

    /// Check whether this plane can show a layer with the given requirements
    pub fn check(&self, req: &LayerRequirements) -> Result<(), PlaneRejection> {
        match self.kind {
            PlaneKind::Cursor { max_size } => {
                if !req.cursor {
                    return Err(PlaneRejection::NotCursor);
                }
                if let Some(max) = max_size {
                    if req.buffer_size.w > max.w || req.buffer_size.h > max.h {
                        return Err(PlaneRejection::CursorTooLarge);
                    }
                }
            }
            PlaneKind::Primary | PlaneKind::Overlay => {}
        }

        if !self.formats.contains(&req.format) {
            return Err(PlaneRejection::Format(req.format));
        }
        if req.scaling && !self.caps.contains(PlaneCaps::SCALING) {
            return Err(PlaneRejection::Scaling);
        }
        if req.transform != Transform::Normal && !self.caps.contains(PlaneCaps::ROTATION) {
            return Err(PlaneRejection::Transform);
        }
        if req.alpha && !self.caps.contains(PlaneCaps::ALPHA) {
            return Err(PlaneRejection::Alpha);
        }
        // without a blend mode property the device blends pre-multiplied
        if req.blending == Blending::Coverage && !self.caps.contains(PlaneCaps::BLEND_COVERAGE) {
            return Err(PlaneRejection::Blending);
        }

        Ok(())
    }
}
