use crate::backend::drm::{
    device::{CrtcInfo, EncoderInfo, PropertyMap},
    CrtcId, DisplayId, EncoderId, PlaneId, PropertyId,
};

/// An encoder tracked by the registry
#[derive(Debug, Clone)]
pub struct Encoder {
    id: EncoderId,
    possible_crtcs: Vec<CrtcId>,
    current_crtc: Option<CrtcId>,
}

impl Encoder {
    pub(super) fn new(info: EncoderInfo) -> Self {
        Encoder {
            id: info.id,
            possible_crtcs: info.possible_crtcs,
            current_crtc: info.current_crtc,
        }
    }

    /// Encoder id
    pub fn id(&self) -> EncoderId {
        self.id
    }

    /// Crtcs that can drive this encoder
    pub fn possible_crtcs(&self) -> &[CrtcId] {
        &self.possible_crtcs
    }

    /// Crtc currently driving this encoder
    pub fn current_crtc(&self) -> Option<CrtcId> {
        self.current_crtc
    }

    pub(super) fn set_current_crtc(&mut self, crtc: Option<CrtcId>) {
        self.current_crtc = crtc;
    }
}

/// A crtc tracked by the registry
#[derive(Debug, Clone)]
pub struct Crtc {
    id: CrtcId,
    pipe: usize,
    planes: Vec<PlaneId>,
    display: Option<DisplayId>,
    properties: PropertyMap,
}

impl Crtc {
    pub(super) fn new(info: CrtcInfo) -> Self {
        Crtc {
            id: info.id,
            pipe: info.pipe,
            planes: Vec::new(),
            display: None,
            properties: info.properties,
        }
    }

    /// Crtc id
    pub fn id(&self) -> CrtcId {
        self.id
    }

    /// Position of the crtc in the device's crtc list
    pub fn pipe(&self) -> usize {
        self.pipe
    }

    /// Planes that can be attached to this crtc
    pub fn planes(&self) -> &[PlaneId] {
        &self.planes
    }

    pub(super) fn add_plane(&mut self, plane: PlaneId) {
        if !self.planes.contains(&plane) {
            self.planes.push(plane);
        }
    }

    /// Display driven by this crtc
    pub fn display(&self) -> Option<DisplayId> {
        self.display
    }

    pub(super) fn set_display(&mut self, display: Option<DisplayId>) {
        self.display = display;
    }

    /// Look up any property by name
    pub fn property(&self, name: &str) -> Option<PropertyId> {
        self.properties.get(name).copied()
    }
}
