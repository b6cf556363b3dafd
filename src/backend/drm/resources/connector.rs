use std::fmt;

use tracing::{debug, trace, warn};

use super::mode::{Mode, ModeInfo};
use crate::backend::drm::{
    device::{ConnectionState, ConnectorInfo, PropertyMap},
    ConnectorId, DisplayId, EncoderId, ModeId, PropertyId,
};

/// Class of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ConnectorInterface {
    Unknown,
    VGA,
    DVII,
    DVID,
    DVIA,
    Composite,
    SVideo,
    LVDS,
    Component,
    NinePinDIN,
    DisplayPort,
    HDMIA,
    HDMIB,
    TV,
    EmbeddedDisplayPort,
    Virtual,
    DSI,
    DPI,
    Writeback,
}

impl ConnectorInterface {
    /// Whether connectors of this class are panels built into the device
    pub fn built_in(&self) -> bool {
        matches!(
            self,
            ConnectorInterface::LVDS
                | ConnectorInterface::EmbeddedDisplayPort
                | ConnectorInterface::DSI
                | ConnectorInterface::Virtual
                | ConnectorInterface::TV
        )
    }

    /// Short name of the class, as used in connector names
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorInterface::Unknown => "Unknown",
            ConnectorInterface::VGA => "VGA",
            ConnectorInterface::DVII => "DVI-I",
            ConnectorInterface::DVID => "DVI-D",
            ConnectorInterface::DVIA => "DVI-A",
            ConnectorInterface::Composite => "Composite",
            ConnectorInterface::SVideo => "SVIDEO",
            ConnectorInterface::LVDS => "LVDS",
            ConnectorInterface::Component => "Component",
            ConnectorInterface::NinePinDIN => "DIN",
            ConnectorInterface::DisplayPort => "DP",
            ConnectorInterface::HDMIA => "HDMI-A",
            ConnectorInterface::HDMIB => "HDMI-B",
            ConnectorInterface::TV => "TV",
            ConnectorInterface::EmbeddedDisplayPort => "eDP",
            ConnectorInterface::Virtual => "Virtual",
            ConnectorInterface::DSI => "DSI",
            ConnectorInterface::DPI => "DPI",
            ConnectorInterface::Writeback => "Writeback",
        }
    }
}

impl fmt::Display for ConnectorInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "backend_drm")]
impl From<drm::control::connector::Interface> for ConnectorInterface {
    fn from(interface: drm::control::connector::Interface) -> Self {
        use drm::control::connector::Interface;
        match interface {
            Interface::VGA => ConnectorInterface::VGA,
            Interface::DVII => ConnectorInterface::DVII,
            Interface::DVID => ConnectorInterface::DVID,
            Interface::DVIA => ConnectorInterface::DVIA,
            Interface::Composite => ConnectorInterface::Composite,
            Interface::SVideo => ConnectorInterface::SVideo,
            Interface::LVDS => ConnectorInterface::LVDS,
            Interface::Component => ConnectorInterface::Component,
            Interface::NinePinDIN => ConnectorInterface::NinePinDIN,
            Interface::DisplayPort => ConnectorInterface::DisplayPort,
            Interface::HDMIA => ConnectorInterface::HDMIA,
            Interface::HDMIB => ConnectorInterface::HDMIB,
            Interface::TV => ConnectorInterface::TV,
            Interface::EmbeddedDisplayPort => ConnectorInterface::EmbeddedDisplayPort,
            Interface::Virtual => ConnectorInterface::Virtual,
            Interface::DSI => ConnectorInterface::DSI,
            Interface::DPI => ConnectorInterface::DPI,
            Interface::Writeback => ConnectorInterface::Writeback,
            _ => ConnectorInterface::Unknown,
        }
    }
}

/// Optional vendor colour properties of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorProperty {
    /// `brightness`
    Brightness,
    /// `contrast`
    Contrast,
    /// `saturation`
    Saturation,
    /// `hue`
    Hue,
}

impl ColorProperty {
    /// All colour properties
    pub const ALL: [ColorProperty; 4] = [
        ColorProperty::Brightness,
        ColorProperty::Contrast,
        ColorProperty::Saturation,
        ColorProperty::Hue,
    ];

    /// Name of the kernel property
    pub fn name(&self) -> &'static str {
        match self {
            ColorProperty::Brightness => "brightness",
            ColorProperty::Contrast => "contrast",
            ColorProperty::Saturation => "saturation",
            ColorProperty::Hue => "hue",
        }
    }

    fn index(&self) -> usize {
        match self {
            ColorProperty::Brightness => 0,
            ColorProperty::Contrast => 1,
            ColorProperty::Saturation => 2,
            ColorProperty::Hue => 3,
        }
    }
}

/// Power states of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerMode {
    /// Display is on
    On,
    /// Display is in standby
    Standby,
    /// Display is suspended
    Suspend,
    /// Display is off
    Off,
}

impl PowerMode {
    /// Value of the `DPMS` property for this state
    pub fn dpms_value(&self) -> u64 {
        match self {
            PowerMode::On => 0,
            PowerMode::Standby => 1,
            PowerMode::Suspend => 2,
            PowerMode::Off => 3,
        }
    }
}

/// A connector tracked by the registry
#[derive(Debug, Clone)]
pub struct Connector {
    id: ConnectorId,
    interface: ConnectorInterface,
    interface_id: u32,
    state: ConnectionState,
    force_disconnect: bool,
    size: Option<(u32, u32)>,
    modes: Vec<Mode>,
    active_mode: Option<ModeId>,
    encoders: Vec<EncoderId>,
    current_encoder: Option<EncoderId>,
    display: Option<DisplayId>,
    possible_displays: u32,
    dpms: PropertyId,
    crtc_id: PropertyId,
    color: [Option<PropertyId>; 4],
    properties: PropertyMap,
}

impl Connector {
    pub(super) fn new(info: ConnectorInfo, dpms: PropertyId, crtc_id: PropertyId) -> Self {
        let mut color = [None; 4];
        for prop in ColorProperty::ALL {
            color[prop.index()] = info.properties.get(prop.name()).copied();
            if color[prop.index()].is_none() {
                warn!(
                    connector = ?info.id,
                    "Could not get {} property, {} control is unsupported",
                    prop.name(),
                    prop.name()
                );
            }
        }

        Connector {
            id: info.id,
            interface: info.interface,
            interface_id: info.interface_id,
            state: info.state,
            force_disconnect: false,
            size: info.size,
            modes: Vec::new(),
            active_mode: None,
            encoders: info.encoders,
            current_encoder: info.current_encoder,
            display: None,
            possible_displays: 0,
            dpms,
            crtc_id,
            color,
            properties: info.properties,
        }
    }

    /// Connector id
    pub fn id(&self) -> ConnectorId {
        self.id
    }

    /// Connector class
    pub fn interface(&self) -> ConnectorInterface {
        self.interface
    }

    /// Name of the connector, like `HDMI-A-1`
    pub fn name(&self) -> String {
        format!("{}-{}", self.interface, self.interface_id)
    }

    /// Whether this is a panel built into the device
    pub fn built_in(&self) -> bool {
        self.interface.built_in()
    }

    /// Whether this is an external connector
    pub fn external(&self) -> bool {
        !self.built_in()
    }

    /// Connection state, honoring a forced disconnect
    pub fn state(&self) -> ConnectionState {
        if self.force_disconnect {
            ConnectionState::Disconnected
        } else {
            self.state
        }
    }

    /// Whether a sink is attached
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Override the sampled state with "disconnected" while `force` is set
    pub fn force_disconnect(&mut self, force: bool) {
        self.force_disconnect = force;
    }

    /// Update the physical size with an externally sampled value
    pub fn update_size(&mut self, width_mm: u32, height_mm: u32) {
        self.size = Some((width_mm, height_mm));
    }

    /// Update the connection state with an externally sampled value
    pub fn update_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Physical size in millimeters
    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    /// Modes of the attached sink
    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    /// Look up a mode by id
    pub fn mode(&self, id: ModeId) -> Option<&Mode> {
        self.modes.iter().find(|mode| mode.id() == id)
    }

    /// The preferred mode, or the first one if none is preferred
    pub fn best_mode(&self) -> Option<&Mode> {
        self.modes
            .iter()
            .find(|mode| mode.info().is_preferred())
            .or_else(|| self.modes.first())
    }

    /// The mode selected for scanout, defaulting to [`best_mode`](Connector::best_mode)
    pub fn active_mode(&self) -> Option<&Mode> {
        self.active_mode
            .and_then(|id| self.mode(id))
            .or_else(|| self.best_mode())
    }

    pub(super) fn set_active_mode(&mut self, id: ModeId) -> bool {
        if self.mode(id).is_some() {
            self.active_mode = Some(id);
            true
        } else {
            false
        }
    }

    /// Encoders able to drive this connector
    pub fn encoders(&self) -> &[EncoderId] {
        &self.encoders
    }

    /// Encoder currently driving this connector
    pub fn current_encoder(&self) -> Option<EncoderId> {
        self.current_encoder
    }

    pub(super) fn set_current_encoder(&mut self, encoder: Option<EncoderId>) {
        self.current_encoder = encoder;
    }

    /// Logical display shown on this connector
    pub fn display(&self) -> Option<DisplayId> {
        self.display
    }

    pub(super) fn set_display(&mut self, display: Option<DisplayId>) {
        self.display = display;
    }

    /// Bitmask of displays this connector may show
    pub fn possible_displays(&self) -> u32 {
        self.possible_displays
    }

    /// Restrict the displays this connector may show
    pub fn set_possible_displays(&mut self, mask: u32) {
        self.possible_displays = mask;
    }

    /// The power state (`DPMS`) property
    pub fn dpms_property(&self) -> PropertyId {
        self.dpms
    }

    /// The crtc binding (`CRTC_ID`) property
    pub fn crtc_id_property(&self) -> PropertyId {
        self.crtc_id
    }

    /// A vendor colour property, if the connector has it
    pub fn color_property(&self, prop: ColorProperty) -> Option<PropertyId> {
        self.color[prop.index()]
    }

    /// Look up any property by name
    pub fn property(&self, name: &str) -> Option<PropertyId> {
        self.properties.get(name).copied()
    }

    /// All properties by name
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// Apply a fresh snapshot of the connector
    ///
    /// Modes whose timings are unchanged and that still pass `verify` keep their id,
    /// new modes draw ids from `next_mode_id`. Repeated timings are kept once. A connector without modes is
    /// considered disconnected. Returns whether the connection state or the
    /// set of modes changed.
    pub(super) fn update(
        &mut self,
        info: ConnectorInfo,
        next_mode_id: &mut u32,
        verify: impl Fn(&ModeInfo) -> bool,
    ) -> bool {
        let previous_state = self.state();
        let previous_modes: Vec<ModeId> = self.modes.iter().map(Mode::id).collect();

        let mut modes = Vec::with_capacity(info.modes.len());
        for mode_info in info.modes {
            if !verify(&mode_info) {
                debug!(connector = ?self.id, mode = ?mode_info, "Mode failed verification, skipping");
                continue;
            }
            if modes.iter().any(|mode: &Mode| *mode.info() == mode_info) {
                trace!(connector = ?self.id, mode = ?mode_info, "Duplicate mode timings, skipping");
                continue;
            }
            match self.modes.iter().find(|mode| *mode.info() == mode_info) {
                Some(existing) => modes.push(Mode::new(existing.id(), mode_info)),
                None => {
                    modes.push(Mode::new(ModeId(*next_mode_id), mode_info));
                    *next_mode_id += 1;
                }
            }
        }
        self.modes = modes;

        if self.modes.is_empty() {
            self.state = ConnectionState::Disconnected;
        } else {
            self.state = info.state;
        }
        if let Some(size) = info.size {
            self.size = Some(size);
        }
        self.encoders = info.encoders;
        self.current_encoder = info.current_encoder;

        if self.active_mode.map(|id| self.mode(id).is_none()).unwrap_or(false) {
            debug!(connector = ?self.id, "Active mode vanished, falling back to the best mode");
            self.active_mode = None;
        }

        previous_state != self.state()
            || previous_modes != self.modes.iter().map(Mode::id).collect::<Vec<_>>()
    }
}
