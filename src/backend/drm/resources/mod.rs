//! Topology model of a display device
//!
//! The [`ResourceRegistry`] owns one descriptor per connector, encoder, crtc and
//! plane of a device. Descriptors only refer to each other through identifiers,
//! all lookups go through the registry.
//!
//! Every change to the topology (connection state, modes, display bindings)
//! bumps the registry's [`version`](ResourceRegistry::version), which consumers
//! use to detect stale plane assignments.

use std::fmt::{self, Write};

use indexmap::IndexMap;
use tracing::{debug, info, instrument, warn};

use super::{
    device::{ConnectionState, DisplayDevice},
    error::Error,
    ConnectorId, CrtcId, DisplayId, EncoderId, ModeId, ObjectId, PlaneId, PropertyId,
};
use crate::utils::{Physical, Rectangle};

mod connector;
mod crtc;
mod mode;
mod plane;

pub use self::connector::{ColorProperty, Connector, ConnectorInterface, PowerMode};
pub use self::crtc::{Crtc, Encoder};
pub use self::mode::{Mode, ModeInfo, MODE_TYPE_DRIVER, MODE_TYPE_PREFERRED};
pub use self::plane::{LayerRequirements, Plane, PlaneCaps, PlaneKind, PlaneRejection};

/// A display bound to the hardware driving it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pipeline {
    /// Logical display
    pub display: DisplayId,
    /// Connector showing the display
    pub connector: ConnectorId,
    /// Encoder feeding the connector
    pub encoder: EncoderId,
    /// Crtc scanning out the display
    pub crtc: CrtcId,
}

/// Owner of all resource descriptors of a device
#[derive(Debug)]
pub struct ResourceRegistry {
    connectors: IndexMap<ConnectorId, Connector>,
    encoders: IndexMap<EncoderId, Encoder>,
    crtcs: IndexMap<CrtcId, Crtc>,
    planes: IndexMap<PlaneId, Plane>,
    pipelines: IndexMap<DisplayId, Pipeline>,
    next_mode_id: u32,
    version: u64,
}

fn required(
    props: &super::device::PropertyMap,
    handle: ObjectId,
    name: &'static str,
) -> Result<PropertyId, Error> {
    props
        .get(name)
        .copied()
        .ok_or(Error::UnknownProperty { handle, name })
}

fn malformed(errmsg: &'static str) -> Error {
    Error::DeviceQuery { errmsg, source: None }
}

impl ResourceRegistry {
    /// Enumerate the device and build the topology graph
    ///
    /// Fails if the device cannot be queried, reports a malformed topology or
    /// misses a required property. Missing optional connector properties only
    /// disable the matching controls.
    #[instrument(level = "debug", skip_all)]
    pub fn initialize(device: &dyn DisplayDevice) -> Result<ResourceRegistry, Error> {
        let resources = device.enumerate().map_err(|err| Error::DeviceQuery {
            errmsg: "Error loading drm resources",
            source: Some(err),
        })?;

        if resources.crtcs.is_empty() {
            return Err(malformed("Device has no crtcs"));
        }

        let mut registry = ResourceRegistry {
            connectors: IndexMap::new(),
            encoders: IndexMap::new(),
            crtcs: IndexMap::new(),
            planes: IndexMap::new(),
            pipelines: IndexMap::new(),
            next_mode_id: 1,
            version: 1,
        };

        for info in resources.crtcs {
            let handle = ObjectId::Crtc(info.id);
            required(&info.properties, handle, "ACTIVE")?;
            required(&info.properties, handle, "MODE_ID")?;
            registry.crtcs.insert(info.id, Crtc::new(info));
        }

        for info in resources.encoders {
            if info.possible_crtcs.iter().any(|crtc| !registry.crtcs.contains_key(crtc)) {
                return Err(malformed("Encoder refers to an unknown crtc"));
            }
            registry.encoders.insert(info.id, Encoder::new(info));
        }

        for info in resources.planes {
            if info.possible_crtcs.iter().any(|crtc| !registry.crtcs.contains_key(crtc)) {
                return Err(malformed("Plane refers to an unknown crtc"));
            }
            let handle = ObjectId::Plane(info.id);
            required(&info.properties, handle, "CRTC_ID")?;
            required(&info.properties, handle, "FB_ID")?;
            for crtc in &info.possible_crtcs {
                if let Some(crtc) = registry.crtcs.get_mut(crtc) {
                    crtc.add_plane(info.id);
                }
            }
            let plane = Plane::new(info, resources.max_cursor_size);
            registry.planes.insert(plane.id(), plane);
        }

        for info in resources.connectors {
            if info.encoders.iter().any(|enc| !registry.encoders.contains_key(enc)) {
                return Err(malformed("Connector refers to an unknown encoder"));
            }
            let handle = ObjectId::Connector(info.id);
            let dpms = required(&info.properties, handle, "DPMS")?;
            let crtc_id = required(&info.properties, handle, "CRTC_ID")?;

            let id = info.id;
            let mut connector = Connector::new(info.clone(), dpms, crtc_id);
            connector.update(info, &mut registry.next_mode_id, |mode| device.verify_mode(id, mode));
            debug!(
                connector = ?id,
                name = %connector.name(),
                state = ?connector.state(),
                modes = connector.modes().len(),
                "Found connector"
            );
            registry.connectors.insert(id, connector);
        }

        info!(
            connectors = registry.connectors.len(),
            encoders = registry.encoders.len(),
            crtcs = registry.crtcs.len(),
            planes = registry.planes.len(),
            "Initialized resource registry"
        );

        Ok(registry)
    }

    /// Topology version, bumped on every topology change
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Re-query one connector's modes and connection state
    ///
    /// Modes keep their identifiers as long as their timings are unchanged.
    /// Returns whether anything changed.
    #[instrument(level = "debug", skip(self, device))]
    pub fn refresh_connector(&mut self, device: &dyn DisplayDevice, id: ConnectorId) -> Result<bool, Error> {
        let connector = self.connectors.get_mut(&id).ok_or(Error::UnknownConnector(id))?;
        let info = device.probe_connector(id)?;
        if info.encoders.iter().any(|enc| !self.encoders.contains_key(enc)) {
            return Err(malformed("Connector refers to an unknown encoder"));
        }

        let changed = connector.update(info, &mut self.next_mode_id, |mode| device.verify_mode(id, mode));
        if changed {
            self.version += 1;
            debug!(state = ?connector.state(), modes = connector.modes().len(), "Connector changed");
        }
        Ok(changed)
    }

    /// Look up a property of an object by name
    pub fn property(&self, object: ObjectId, name: &str) -> Option<PropertyId> {
        match object {
            ObjectId::Connector(id) => self.connectors.get(&id)?.property(name),
            ObjectId::Crtc(id) => self.crtcs.get(&id)?.property(name),
            ObjectId::Plane(id) => self.planes.get(&id)?.property(name),
        }
    }

    /// Look up a connector
    pub fn connector(&self, id: ConnectorId) -> Option<&Connector> {
        self.connectors.get(&id)
    }

    /// Mutable access to a connector, e.g. to force a disconnect
    ///
    /// Bumps the topology version.
    pub fn connector_mut(&mut self, id: ConnectorId) -> Option<&mut Connector> {
        let connector = self.connectors.get_mut(&id)?;
        self.version += 1;
        Some(connector)
    }

    /// All connectors in enumeration order
    pub fn connectors(&self) -> impl Iterator<Item = &Connector> {
        self.connectors.values()
    }

    /// Look up an encoder
    pub fn encoder(&self, id: EncoderId) -> Option<&Encoder> {
        self.encoders.get(&id)
    }

    /// Look up a crtc
    pub fn crtc(&self, id: CrtcId) -> Option<&Crtc> {
        self.crtcs.get(&id)
    }

    /// Look up a plane
    pub fn plane(&self, id: PlaneId) -> Option<&Plane> {
        self.planes.get(&id)
    }

    /// All planes in enumeration order
    pub fn planes(&self) -> impl Iterator<Item = &Plane> {
        self.planes.values()
    }

    /// Encoders able to drive `connector`
    pub fn legal_encoders(&self, connector: ConnectorId) -> Result<&[EncoderId], Error> {
        self.connectors
            .get(&connector)
            .map(Connector::encoders)
            .ok_or(Error::UnknownConnector(connector))
    }

    /// Crtcs able to drive `encoder`
    pub fn legal_crtcs(&self, encoder: EncoderId) -> Result<&[CrtcId], Error> {
        self.encoders
            .get(&encoder)
            .map(Encoder::possible_crtcs)
            .ok_or(Error::UnknownEncoder(encoder))
    }

    /// Planes that can be attached to `crtc`
    pub fn legal_planes(&self, crtc: CrtcId) -> Result<&[PlaneId], Error> {
        self.crtcs.get(&crtc).map(Crtc::planes).ok_or(Error::UnknownCrtc(crtc))
    }

    /// Connector showing `display`
    pub fn connector_for_display(&self, display: DisplayId) -> Option<&Connector> {
        self.connectors.values().find(|conn| conn.display() == Some(display))
    }

    /// Give every connected connector without a display a display index
    ///
    /// Built-in panels are handled first, so display 0 is the primary built-in
    /// panel if there is one. Returns the newly assigned displays.
    pub fn assign_displays(&mut self) -> Vec<DisplayId> {
        let mut order: Vec<ConnectorId> = self
            .connectors
            .values()
            .filter(|conn| conn.connected() && conn.display().is_none())
            .map(Connector::id)
            .collect();
        // stable, so enumeration order is kept within each class
        order.sort_by_key(|id| self.connectors.get(id).map(Connector::external).unwrap_or(true));

        let mut assigned = Vec::new();
        for id in order {
            let used: Vec<DisplayId> = self.connectors.values().filter_map(Connector::display).collect();
            let Some(connector) = self.connectors.get_mut(&id) else {
                continue;
            };
            let mask = connector.possible_displays();
            let display = (0..32)
                .map(DisplayId)
                .filter(|display| mask == 0 || mask & (1 << display.0) != 0)
                .find(|display| !used.contains(display));
            match display {
                Some(display_id) => {
                    info!(connector = ?id, display = ?display_id, "Assigned display");
                    connector.set_display(Some(display_id));
                    assigned.push(display_id);
                }
                None => warn!(connector = ?id, "No display index left for connector"),
            }
        }

        if !assigned.is_empty() {
            self.version += 1;
        }
        assigned
    }

    /// Drop the display index of a connector, unbinding its pipeline
    pub fn release_display(&mut self, connector: ConnectorId) -> Option<DisplayId> {
        let display = self.connectors.get(&connector)?.display()?;
        self.unbind_display(display);
        if let Some(connector) = self.connectors.get_mut(&connector) {
            connector.set_display(None);
        }
        self.version += 1;
        Some(display)
    }

    /// The pipeline bound for `display`, if any
    pub fn pipeline(&self, display: DisplayId) -> Option<&Pipeline> {
        self.pipelines.get(&display)
    }

    /// Bind `display` to an encoder and crtc
    ///
    /// The connector's current encoder and crtc are kept if the crtc is free,
    /// otherwise the first legal encoder with a free legal crtc is picked.
    /// Each crtc drives at most one display.
    pub fn bind_display(&mut self, display: DisplayId) -> Result<Pipeline, Error> {
        if let Some(pipeline) = self.pipelines.get(&display) {
            return Ok(*pipeline);
        }

        let connector = self
            .connector_for_display(display)
            .ok_or(Error::UnknownDisplay(display))?;
        let connector_id = connector.id();
        if connector.encoders().is_empty() {
            return Err(Error::NoSuitableEncoder {
                connector: connector_id,
            });
        }

        let is_free = |crtc: &CrtcId| self.pipelines.values().all(|pipeline| pipeline.crtc != *crtc);

        let restored = connector
            .current_encoder()
            .filter(|encoder| connector.encoders().contains(encoder))
            .and_then(|encoder| self.encoders.get(&encoder))
            .and_then(|encoder| {
                encoder
                    .current_crtc()
                    .filter(|crtc| encoder.possible_crtcs().contains(crtc) && is_free(crtc))
                    .map(|crtc| (encoder.id(), crtc))
            });

        let picked = restored.or_else(|| {
            connector
                .encoders()
                .iter()
                .filter_map(|encoder| self.encoders.get(encoder))
                .find_map(|encoder| {
                    encoder
                        .possible_crtcs()
                        .iter()
                        .find(|crtc| is_free(crtc))
                        .map(|crtc| (encoder.id(), *crtc))
                })
        });

        let (encoder, crtc) = picked.ok_or(Error::NoSuitableCrtc {
            connector: connector_id,
        })?;

        let pipeline = Pipeline {
            display,
            connector: connector_id,
            encoder,
            crtc,
        };
        if let Some(connector) = self.connectors.get_mut(&connector_id) {
            connector.set_current_encoder(Some(encoder));
        }
        if let Some(encoder) = self.encoders.get_mut(&encoder) {
            encoder.set_current_crtc(Some(crtc));
        }
        if let Some(crtc) = self.crtcs.get_mut(&crtc) {
            crtc.set_display(Some(display));
        }
        self.pipelines.insert(display, pipeline);
        self.version += 1;

        info!(display = ?pipeline.display, connector = ?connector_id, ?encoder, ?crtc, "Bound display");
        Ok(pipeline)
    }

    /// Free the encoder and crtc bound for `display`
    pub fn unbind_display(&mut self, display: DisplayId) -> Option<Pipeline> {
        let pipeline = self.pipelines.shift_remove(&display)?;
        if let Some(crtc) = self.crtcs.get_mut(&pipeline.crtc) {
            crtc.set_display(None);
        }
        for plane in self.planes.values_mut() {
            if plane.crtc() == Some(pipeline.crtc) {
                plane.set_crtc(None);
            }
        }
        self.version += 1;
        info!(display = ?pipeline.display, crtc = ?pipeline.crtc, "Unbound display");
        Some(pipeline)
    }

    /// Record which planes `crtc` shows after a commit
    ///
    /// Planes previously attached to `crtc` but not in `planes` are detached.
    pub fn claim_planes(&mut self, crtc: CrtcId, planes: &[PlaneId]) {
        for plane in self.planes.values_mut() {
            if planes.contains(&plane.id()) {
                plane.set_crtc(Some(crtc));
            } else if plane.crtc() == Some(crtc) {
                plane.set_crtc(None);
            }
        }
    }

    /// Select the mode `display`'s connector scans out
    pub fn set_active_mode(&mut self, connector: ConnectorId, mode: ModeId) -> Result<(), Error> {
        let conn = self
            .connectors
            .get_mut(&connector)
            .ok_or(Error::UnknownConnector(connector))?;
        if !conn.set_active_mode(mode) {
            return Err(Error::UnknownMode(mode));
        }
        self.version += 1;
        Ok(())
    }

    /// Area of the crtc scanning out `display` in its active mode
    pub fn display_bounds(&self, display: DisplayId) -> Option<Rectangle<i32, Physical>> {
        let mode = self.connector_for_display(display)?.active_mode()?;
        let (w, h) = mode.info().size();
        Some(Rectangle::from_loc_and_size((0, 0), (w as i32, h as i32)))
    }

    /// Switch the power state of `display`'s connector
    pub fn set_power_mode(
        &self,
        device: &dyn DisplayDevice,
        display_id: DisplayId,
        mode: PowerMode,
    ) -> Result<(), Error> {
        let connector = self
            .connector_for_display(display_id)
            .ok_or(Error::UnknownDisplay(display_id))?;
        debug!(display = ?display_id, ?mode, "Setting power mode");
        device.set_property(
            ObjectId::Connector(connector.id()),
            connector.dpms_property(),
            mode.dpms_value(),
        )?;
        Ok(())
    }

    /// Write an optional colour property of a connector
    ///
    /// Returns [`Error::Unsupported`] if the connector lacks the property.
    pub fn set_color_property(
        &self,
        device: &dyn DisplayDevice,
        connector: ConnectorId,
        prop: ColorProperty,
        value: u64,
    ) -> Result<(), Error> {
        let conn = self
            .connectors
            .get(&connector)
            .ok_or(Error::UnknownConnector(connector))?;
        let handle = conn.color_property(prop).ok_or(Error::Unsupported {
            connector,
            name: prop.name(),
        })?;
        device.set_property(ObjectId::Connector(connector), handle, value)?;
        Ok(())
    }

    /// Write a human readable description of the topology
    pub fn dump(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "Connectors (version {}):", self.version)?;
        writeln!(out, "\tid\tencoder\tstatus\tname\tsize (mm)\tmodes\tencoders\tdisplay")?;
        for conn in self.connectors.values() {
            let status = match conn.state() {
                ConnectionState::Connected => "connected",
                ConnectionState::Disconnected => "disconnected",
                ConnectionState::Unknown => "unknown",
            };
            let size = conn
                .size()
                .map(|(w, h)| format!("{}x{}", w, h))
                .unwrap_or_else(|| "-".into());
            writeln!(
                out,
                "\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                conn.id(),
                opt(conn.current_encoder()),
                status,
                conn.name(),
                size,
                conn.modes().len(),
                list(conn.encoders()),
                opt(conn.display()),
            )?;

            if !conn.modes().is_empty() {
                writeln!(out, "\t  modes:")?;
                writeln!(out, "\t\tid\tname\trefresh (Hz)\thdisp\thss\thse\thtot\tvdisp\tvss\tvse\tvtot")?;
                let active = conn.active_mode().map(Mode::id);
                for mode in conn.modes() {
                    let info = mode.info();
                    writeln!(
                        out,
                        "\t\t{}{}\t{}\t{:.2}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                        mode.id(),
                        if Some(mode.id()) == active { "*" } else { "" },
                        info.name,
                        info.refresh_rate_millihz() as f64 / 1000.0,
                        info.hdisplay,
                        info.hsync_start,
                        info.hsync_end,
                        info.htotal,
                        info.vdisplay,
                        info.vsync_start,
                        info.vsync_end,
                        info.vtotal,
                    )?;
                }
            }

            let mut props: Vec<_> = conn.properties().iter().collect();
            props.sort_by_key(|(_, id)| **id);
            writeln!(out, "\t  props:")?;
            for (name, id) in props {
                writeln!(out, "\t\t{}\t{}", id, name)?;
            }
        }

        writeln!(out, "Encoders:")?;
        writeln!(out, "\tid\tcrtc\tpossible crtcs")?;
        for enc in self.encoders.values() {
            writeln!(
                out,
                "\t{}\t{}\t{}",
                enc.id(),
                opt(enc.current_crtc()),
                list(enc.possible_crtcs())
            )?;
        }

        writeln!(out, "CRTCs:")?;
        writeln!(out, "\tid\tpipe\tdisplay\tplanes")?;
        for crtc in self.crtcs.values() {
            writeln!(
                out,
                "\t{}\t{}\t{}\t{}",
                crtc.id(),
                crtc.pipe(),
                opt(crtc.display()),
                list(crtc.planes())
            )?;
        }

        writeln!(out, "Planes:")?;
        writeln!(out, "\tid\ttype\tcrtc\tcaps\tformats")?;
        for plane in self.planes.values() {
            writeln!(
                out,
                "\t{}\t{}\t{}\t{:?}\t{}",
                plane.id(),
                plane.kind(),
                opt(plane.crtc()),
                plane.caps(),
                plane
                    .formats()
                    .iter()
                    .map(|format| format!("{:?}", format))
                    .collect::<Vec<_>>()
                    .join(","),
            )?;
        }

        Ok(())
    }
}

fn opt<T: fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

fn list<T: fmt::Display>(values: &[T]) -> String {
    if values.is_empty() {
        return "-".into();
    }
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::device::test::TestDevice;

    #[test]
    fn initialize_builds_topology() {
        let device = TestDevice::single_display(2);
        let registry = ResourceRegistry::initialize(&device).unwrap();

        let connector = registry.connectors().next().unwrap();
        assert!(connector.connected());
        let encoders = registry.legal_encoders(connector.id()).unwrap();
        assert_eq!(encoders.len(), 1);
        let crtcs = registry.legal_crtcs(encoders[0]).unwrap();
        assert_eq!(crtcs.len(), 1);
        let planes = registry.legal_planes(crtcs[0]).unwrap();
        assert_eq!(planes.len(), 3);

        assert!(matches!(
            registry.legal_planes(CrtcId(9999)),
            Err(Error::UnknownCrtc(CrtcId(9999)))
        ));
    }

    #[test]
    fn missing_required_property_fails() {
        let device = TestDevice::single_display(1);
        device.remove_connector_property(device.connector(0), "DPMS");
        assert!(matches!(
            ResourceRegistry::initialize(&device),
            Err(Error::UnknownProperty { name: "DPMS", .. })
        ));
    }

    #[test]
    fn missing_optional_property_is_unsupported() {
        let device = TestDevice::single_display(1);
        let connector = device.connector(0);
        device.remove_connector_property(connector, "hue");
        let registry = ResourceRegistry::initialize(&device).unwrap();

        assert!(matches!(
            registry.set_color_property(&device, connector, ColorProperty::Hue, 5),
            Err(Error::Unsupported { name: "hue", .. })
        ));
        registry
            .set_color_property(&device, connector, ColorProperty::Brightness, 40)
            .unwrap();
        let brightness = registry.property(connector.into(), "brightness").unwrap();
        assert_eq!(device.property_value(connector.into(), brightness), Some(40));
    }

    #[test]
    fn enumeration_failure_is_device_query_error() {
        let device = TestDevice::single_display(1);
        device.fail_enumeration(true);
        assert!(matches!(
            ResourceRegistry::initialize(&device),
            Err(Error::DeviceQuery { .. })
        ));
    }

    #[test]
    fn refresh_keeps_mode_ids_for_unchanged_timings() {
        let device = TestDevice::single_display(1);
        let connector = device.connector(0);
        let mut registry = ResourceRegistry::initialize(&device).unwrap();
        let before: Vec<ModeId> = registry.connector(connector).unwrap().modes().iter().map(Mode::id).collect();
        let version = registry.version();

        let mut modes = device.connector_modes(connector);
        modes.push(ModeInfo::with_resolution(2560, 1440, 60));
        device.set_connector_modes(connector, modes);
        assert!(registry.refresh_connector(&device, connector).unwrap());
        assert!(registry.version() > version);

        let after: Vec<ModeId> = registry.connector(connector).unwrap().modes().iter().map(Mode::id).collect();
        assert_eq!(&after[..before.len()], &before[..]);
        assert!(!before.contains(&after[before.len()]));

        // nothing changed, nothing bumped
        let version = registry.version();
        assert!(!registry.refresh_connector(&device, connector).unwrap());
        assert_eq!(registry.version(), version);
    }

    #[test]
    fn duplicate_timings_get_one_mode() {
        let device = TestDevice::single_display(1);
        let connector = device.connector(0);
        device.set_connector_modes(
            connector,
            vec![
                ModeInfo::with_resolution(1920, 1080, 60).preferred(),
                ModeInfo::with_resolution(1280, 720, 60),
                ModeInfo::with_resolution(1280, 720, 60),
            ],
        );
        let mut registry = ResourceRegistry::initialize(&device).unwrap();

        let ids: Vec<ModeId> = registry.connector(connector).unwrap().modes().iter().map(Mode::id).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        let matching = registry
            .connector(connector)
            .unwrap()
            .modes()
            .iter()
            .filter(|mode| mode.info().size() == (1280, 720))
            .count();
        assert_eq!(matching, 1);

        // a repeated timing showing up later does not add a mode either
        let mut modes = device.connector_modes(connector);
        modes.push(ModeInfo::with_resolution(1920, 1080, 60));
        device.set_connector_modes(connector, modes);
        assert!(!registry.refresh_connector(&device, connector).unwrap());
        let after: Vec<ModeId> = registry.connector(connector).unwrap().modes().iter().map(Mode::id).collect();
        assert_eq!(after, ids);
    }

    #[test]
    fn connector_without_modes_is_disconnected() {
        let device = TestDevice::single_display(1);
        let connector = device.connector(0);
        let mut registry = ResourceRegistry::initialize(&device).unwrap();
        device.set_connector_modes(connector, Vec::new());
        registry.refresh_connector(&device, connector).unwrap();
        assert!(!registry.connector(connector).unwrap().connected());
    }

    #[test]
    fn forced_disconnect_wins() {
        let device = TestDevice::single_display(1);
        let connector = device.connector(0);
        let mut registry = ResourceRegistry::initialize(&device).unwrap();
        let conn = registry.connector_mut(connector).unwrap();
        conn.force_disconnect(true);
        conn.update_state(ConnectionState::Connected);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.force_disconnect(false);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn built_in_connectors_get_display_zero() {
        let device = TestDevice::builder()
            .connector(ConnectorInterface::HDMIA, true)
            .connector(ConnectorInterface::EmbeddedDisplayPort, true)
            .build();
        let hdmi = device.connector(0);
        let edp = device.connector(1);
        let mut registry = ResourceRegistry::initialize(&device).unwrap();

        let assigned = registry.assign_displays();
        assert_eq!(assigned, vec![DisplayId(0), DisplayId(1)]);
        assert_eq!(registry.connector(edp).unwrap().display(), Some(DisplayId(0)));
        assert_eq!(registry.connector(hdmi).unwrap().display(), Some(DisplayId(1)));
    }

    #[test]
    fn bind_display_uses_free_crtcs() {
        let device = TestDevice::builder()
            .connector(ConnectorInterface::EmbeddedDisplayPort, true)
            .connector(ConnectorInterface::HDMIA, true)
            .build();
        let mut registry = ResourceRegistry::initialize(&device).unwrap();
        registry.assign_displays();

        let first = registry.bind_display(DisplayId(0)).unwrap();
        let second = registry.bind_display(DisplayId(1)).unwrap();
        assert_ne!(first.crtc, second.crtc);
        assert_eq!(registry.crtc(first.crtc).unwrap().display(), Some(DisplayId(0)));

        // binding twice yields the same pipeline
        assert_eq!(registry.bind_display(DisplayId(0)).unwrap(), first);

        assert_eq!(registry.unbind_display(DisplayId(0)), Some(first));
        assert_eq!(registry.crtc(first.crtc).unwrap().display(), None);
        assert!(matches!(
            registry.bind_display(DisplayId(7)),
            Err(Error::UnknownDisplay(DisplayId(7)))
        ));
    }

    #[test]
    fn power_mode_writes_dpms() {
        let device = TestDevice::single_display(1);
        let connector = device.connector(0);
        let mut registry = ResourceRegistry::initialize(&device).unwrap();
        registry.assign_displays();
        registry
            .set_power_mode(&device, DisplayId(0), PowerMode::Off)
            .unwrap();
        let dpms = registry.connector(connector).unwrap().dpms_property();
        assert_eq!(device.property_value(connector.into(), dpms), Some(3));
    }

    #[test]
    fn dump_lists_all_objects() {
        let device = TestDevice::single_display(2);
        let registry = ResourceRegistry::initialize(&device).unwrap();
        let mut out = String::new();
        registry.dump(&mut out).unwrap();
        assert!(out.contains("Connectors"));
        assert!(out.contains("eDP-1"));
        assert!(out.contains("Planes:"));
        assert!(out.contains("overlay"));
    }
}
