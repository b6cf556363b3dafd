//! Composition of layer stacks using drm planes
//!
//! The [`DrmCompositor`] owns one [`DisplayCompositor`] per active display and
//! the [`Planner`] deciding which layers are scanned out by hardware planes.
//! Every frame the host builds a [`Composition`] from its layer list, lets the
//! compositor plan it, composes the layers reported by
//! [`Composition::client_layers`] itself and finally queues the composition.
//!
//! Layers the planner cannot place on a plane are never an error. They are
//! reported back for client composition, so partial offloading is the normal
//! case.
//!
//! # How to use it
//!
//! ```no_run
//! # use std::sync::Arc;
//! use hwcomposer::backend::{
//!     allocator::Importer,
//!     drm::{
//!         compositor::{CompositorConfig, DrmCompositor},
//!         layer::LayerDescription,
//!         AtomicDrmDevice, DrmDeviceFd, DrmImporter,
//!     },
//!     sync::FenceSlot,
//! };
//! use hwcomposer::utils::DeviceFd;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let buffer: hwcomposer::backend::allocator::BufferHandle = unimplemented!();
//!
//! let fd = DrmDeviceFd::new(DeviceFd::open("/dev/dri/card0")?);
//!
//! let device = Arc::new(AtomicDrmDevice::new(fd.clone())?);
//! let importer: Arc<dyn Importer> = Arc::new(DrmImporter::new(fd));
//! let mut compositor = DrmCompositor::new(device, CompositorConfig::from_env())?;
//!
//! let display = compositor.displays().next().expect("no display connected");
//! let (width, height) = compositor.display_size(display).expect("no mode");
//!
//! let retire = FenceSlot::new();
//! let mut composition = compositor.create_composition(importer);
//! composition.set_display(display);
//! composition.set_retire_fence(&retire);
//! composition.add_layer(LayerDescription::new(
//!     buffer,
//!     hwcomposer::utils::Rectangle::from_loc_and_size((0, 0), (width, height)),
//! ));
//!
//! compositor.prepare(&mut composition)?;
//! for layer in composition.client_layers() {
//!     // compose `layer` with the gpu
//! }
//! compositor.queue_composition(composition)?;
//! for (display, result) in compositor.composite() {
//!     result?;
//! }
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashSet,
    fmt::Write,
    sync::{Arc, RwLock, RwLockReadGuard},
};

use indexmap::IndexMap;
use tracing::{debug, info, info_span, instrument, warn};

use super::{
    device::DisplayDevice,
    error::Error,
    resources::{ColorProperty, PowerMode, ResourceRegistry},
    ConnectorId, DisplayId, ModeId,
};
use crate::backend::allocator::Importer;

mod composition;
mod config;
mod display;
mod planner;

pub use self::composition::Composition;
pub use self::config::{CompositorConfig, TieBreak};
pub use self::display::{DisplayCompositor, DisplayState};
pub use self::planner::{FallbackReason, LayerPlacement, PlaneAssignment, Planner};

use self::display::PlaneClaims;

/// Change of the set of active displays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotplugEvent {
    /// A display was connected and is ready for compositions
    Connected(DisplayId),
    /// A display was disconnected, its compositor is gone
    Disconnected(DisplayId),
}

/// Composition engine for all displays of one device
#[derive(Debug)]
pub struct DrmCompositor {
    device: Arc<dyn DisplayDevice>,
    registry: Arc<RwLock<ResourceRegistry>>,
    planner: Planner,
    config: CompositorConfig,
    claims: Arc<PlaneClaims>,
    displays: IndexMap<DisplayId, DisplayCompositor>,
    next_frame: u64,
    span: tracing::Span,
}

impl DrmCompositor {
    /// Enumerate `device` and start a display compositor for every connected display
    ///
    /// Fails if the device topology cannot be queried. Displays that cannot be
    /// bound to a crtc are skipped with a warning.
    pub fn new(device: Arc<dyn DisplayDevice>, config: CompositorConfig) -> Result<DrmCompositor, Error> {
        let span = info_span!("drm_compositor", device = ?device.dev_path());
        let _guard = span.enter();

        let mut registry = ResourceRegistry::initialize(&*device)?;
        let displays = registry.assign_displays();

        let mut compositor = DrmCompositor {
            device,
            registry: Arc::new(RwLock::new(registry)),
            planner: Planner::new(&config),
            config,
            claims: Arc::new(PlaneClaims::default()),
            displays: IndexMap::new(),
            next_frame: 1,
            span: span.clone(),
        };

        for display_id in displays {
            if let Err(err) = compositor.add_display(display_id) {
                warn!(display = ?display_id, "Failed to set up display: {}", err);
            }
        }
        info!(displays = compositor.displays.len(), "Compositor initialized");

        drop(_guard);
        Ok(compositor)
    }

    fn add_display(&mut self, display: DisplayId) -> Result<(), Error> {
        let pipeline = self.registry.write().unwrap().bind_display(display)?;
        let compositor = DisplayCompositor::new(
            pipeline,
            self.device.clone(),
            self.registry.clone(),
            self.claims.clone(),
            &self.config,
        );
        match compositor {
            Ok(compositor) => {
                self.displays.insert(display, compositor);
                Ok(())
            }
            Err(err) => {
                self.registry.write().unwrap().unbind_display(display);
                Err(err)
            }
        }
    }

    fn display_compositor(&self, display: DisplayId) -> Result<&DisplayCompositor, Error> {
        self.displays.get(&display).ok_or(Error::UnknownDisplay(display))
    }

    /// Active displays in the order they were set up
    pub fn displays(&self) -> impl Iterator<Item = DisplayId> + '_ {
        self.displays.keys().copied()
    }

    /// Compositor of one display
    pub fn display(&self, display: DisplayId) -> Option<&DisplayCompositor> {
        self.displays.get(&display)
    }

    /// Size of `display` in its active mode
    pub fn display_size(&self, display: DisplayId) -> Option<(i32, i32)> {
        self.registry
            .read()
            .unwrap()
            .display_bounds(display)
            .map(|bounds| (bounds.size.w, bounds.size.h))
    }

    /// Read access to the topology
    ///
    /// Do not hold the guard across calls into the compositor.
    pub fn registry(&self) -> RwLockReadGuard<'_, ResourceRegistry> {
        self.registry.read().unwrap()
    }

    /// Active configuration
    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    /// Start a new, empty composition importing buffers through `importer`
    ///
    /// The composition targets display 0 until
    /// [`set_display`](Composition::set_display) is called.
    pub fn create_composition(&mut self, importer: Arc<dyn Importer>) -> Composition {
        let frame = self.next_frame;
        self.next_frame += 1;
        Composition::new(frame, importer)
    }

    /// Plan the plane assignment of `composition`
    ///
    /// Afterwards [`Composition::client_layers`] lists the layers the host has
    /// to compose itself. Planes held by other displays are not used.
    #[instrument(level = "trace", skip_all, parent = &self.span, fields(frame = composition.frame()))]
    pub fn prepare(&self, composition: &mut Composition) -> Result<(), Error> {
        let display = composition.display();
        self.display_compositor(display)?;
        let others = self.claims.others(display);
        let assignment = self
            .planner
            .plan(composition.layers(), &self.registry.read().unwrap(), display, &others)?;
        composition.set_assignment(assignment);
        Ok(())
    }

    /// Hand `composition` to its display's compositor
    ///
    /// Plans the composition if it was not prepared or the topology changed
    /// since. Fails with [`Error::UnknownDisplay`] if the display has no
    /// compositor and with [`Error::Busy`] if a composition is already queued.
    pub fn queue_composition(&mut self, mut composition: Composition) -> Result<(), Error> {
        let _guard = self.span.enter();
        let display = composition.display();
        let compositor = self.display_compositor(display)?;

        let version = self.registry.read().unwrap().version();
        let planned = composition
            .assignment()
            .map(|assignment| assignment.topology_version() == version && assignment.display() == display)
            .unwrap_or(false);
        if !planned {
            debug!(frame = composition.frame(), "Planning composition");
            self.prepare(&mut composition)?;
        }

        compositor.queue_composition(composition)
    }

    /// Apply the queued compositions of all displays
    ///
    /// Displays are driven concurrently and independently, one failing commit
    /// does not keep the others from being applied. Displays without a queued
    /// composition are not reported. A display whose previous commit never
    /// completes reports [`Error::Stalled`] once
    /// [`stall_limit`](CompositorConfig::stall_limit) completion waits timed out.
    #[profiling::function]
    pub fn composite(&mut self) -> Vec<(DisplayId, Result<(), Error>)> {
        let _guard = self.span.enter();
        let waiting: Vec<_> = self
            .displays
            .iter()
            .filter_map(|(display, compositor)| compositor.begin_composite().map(|rx| (*display, rx)))
            .collect();

        waiting
            .into_iter()
            .map(|(display_id, rx)| {
                let result = rx.recv().unwrap_or(Err(Error::Discarded(display_id)));
                if let Err(err) = &result {
                    warn!(display = ?display_id, "Composite failed: {}", err);
                }
                (display_id, result)
            })
            .collect()
    }

    /// Blank `display`, discarding its queued and in-flight compositions
    pub fn clear_display(&mut self, display: DisplayId) -> Result<(), Error> {
        self.display_compositor(display)?.clear_display()
    }

    /// Re-probe all connectors and bring displays up or down accordingly
    ///
    /// Disconnected displays are cleared, switched off and their compositor is
    /// dropped. Newly connected connectors get a display index, a crtc and a
    /// compositor.
    #[instrument(level = "debug", skip_all, parent = &self.span)]
    pub fn handle_hotplug(&mut self) -> Result<Vec<HotplugEvent>, Error> {
        let connectors: Vec<ConnectorId> = self.registry.read().unwrap().connectors().map(|c| c.id()).collect();
        let mut events = Vec::new();

        for connector in connectors {
            let changed = self
                .registry
                .write()
                .unwrap()
                .refresh_connector(&*self.device, connector)?;
            if !changed {
                continue;
            }

            let (connected, display) = {
                let registry = self.registry.read().unwrap();
                match registry.connector(connector) {
                    Some(conn) => (conn.connected(), conn.display()),
                    None => continue,
                }
            };
            let Some(display_id) = display.filter(|_| !connected) else {
                continue;
            };

            info!(display = ?display_id, ?connector, "Display disconnected");
            if let Some(compositor) = self.displays.shift_remove(&display_id) {
                if let Err(err) = compositor.disable() {
                    warn!(display = ?display_id, "Failed to switch off display: {}", err);
                }
            }
            self.registry.write().unwrap().release_display(connector);
            self.claims.remove(display_id);
            events.push(HotplugEvent::Disconnected(display_id));
        }

        let assigned = self.registry.write().unwrap().assign_displays();
        for display_id in assigned {
            match self.add_display(display_id) {
                Ok(()) => {
                    info!(display = ?display_id, "Display connected");
                    events.push(HotplugEvent::Connected(display_id));
                }
                Err(err) => warn!(display = ?display_id, "Failed to set up display: {}", err),
            }
        }

        Ok(events)
    }

    /// Switch `display` to another of its connector's modes
    ///
    /// The change takes effect with the next composition.
    pub fn set_active_mode(&mut self, display_id: DisplayId, mode: ModeId) -> Result<(), Error> {
        let compositor = self.display_compositor(display_id)?;
        let connector = compositor.pipeline().connector;
        self.registry.write().unwrap().set_active_mode(connector, mode)?;
        compositor.request_modeset();
        info!(display = ?display_id, ?mode, "Active mode changed");
        Ok(())
    }

    /// Switch the power state of `display`
    pub fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> Result<(), Error> {
        self.display_compositor(display)?;
        self.registry
            .read()
            .unwrap()
            .set_power_mode(&*self.device, display, mode)
    }

    /// Write a colour property of `display`'s connector
    ///
    /// Returns [`Error::Unsupported`] if the connector lacks the property.
    pub fn set_color_property(&self, display: DisplayId, prop: ColorProperty, value: u64) -> Result<(), Error> {
        let connector = self.display_compositor(display)?.pipeline().connector;
        self.registry
            .read()
            .unwrap()
            .set_color_property(&*self.device, connector, prop, value)
    }

    /// Planes held by the un-retired compositions of every display
    pub fn claimed_planes(&self) -> HashSet<super::PlaneId> {
        self.displays
            .values()
            .flat_map(|compositor| compositor.claimed_planes())
            .collect()
    }

    /// Human readable description of the topology and all display compositors
    pub fn dump(&self) -> String {
        let mut out = String::new();
        // writing into a string cannot fail
        let _ = self.registry.read().unwrap().dump(&mut out);
        for compositor in self.displays.values() {
            let _ = compositor.dump(&mut out);
        }
        let _ = writeln!(out, "Tie break: {:?}", self.planner.tie_break());
        out
    }
}

impl Drop for DrmCompositor {
    fn drop(&mut self) {
        // stop the workers before the registry goes away
        self.displays.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::backend::{
        allocator::Fourcc,
        drm::{
            device::test::{test_buffer, TestDevice, TestImporter},
            layer::LayerDescription,
            resources::ConnectorInterface,
            PlaneId,
        },
        sync::FenceSlot,
    };
    use crate::utils::Rectangle;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn dual_display() -> (Arc<TestDevice>, DrmCompositor) {
        init_logging();
        let device = Arc::new(
            TestDevice::builder()
                .connector(ConnectorInterface::EmbeddedDisplayPort, true)
                .connector(ConnectorInterface::HDMIA, true)
                .overlays(2)
                .build(),
        );
        let compositor = DrmCompositor::new(device.clone(), CompositorConfig::default()).unwrap();
        (device, compositor)
    }

    fn composition(
        compositor: &mut DrmCompositor,
        importer: &Arc<TestImporter>,
        display: DisplayId,
        layers: usize,
    ) -> Composition {
        let importer: Arc<dyn Importer> = importer.clone();
        let mut composition = compositor.create_composition(importer);
        composition.set_display(display);
        for i in 0..layers {
            let side = 400 - i as i32 * 50;
            composition.add_layer(LayerDescription::new(
                test_buffer(Fourcc::Argb8888, side, side),
                Rectangle::from_loc_and_size((0, 0), (side, side)),
            ));
        }
        composition
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition never became true");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn init_creates_display_per_connector() {
        let (_device, compositor) = dual_display();
        let displays: Vec<_> = compositor.displays().collect();
        assert_eq!(displays, vec![DisplayId(0), DisplayId(1)]);
        assert_eq!(compositor.display_size(DisplayId(0)), Some((1920, 1080)));
    }

    #[test]
    fn unknown_display_is_reported() {
        let (_device, mut compositor) = dual_display();
        let importer = Arc::new(TestImporter::new());
        let composition = composition(&mut compositor, &importer, DisplayId(5), 1);
        assert!(matches!(
            compositor.queue_composition(composition),
            Err(Error::UnknownDisplay(DisplayId(5)))
        ));
    }

    #[test]
    fn displays_do_not_share_planes() {
        let (_device, mut compositor) = dual_display();
        let importer = Arc::new(TestImporter::new());

        let first = composition(&mut compositor, &importer, DisplayId(0), 3);
        compositor.queue_composition(first).unwrap();
        let mut second = composition(&mut compositor, &importer, DisplayId(1), 3);
        compositor.prepare(&mut second).unwrap();

        let first_planes = compositor.display(DisplayId(0)).unwrap().claimed_planes();
        let second_planes: HashSet<PlaneId> = second.assignment().unwrap().planes().map(|(_, p)| p).collect();
        assert_eq!(first_planes.len(), 3);
        assert!(first_planes.is_disjoint(&second_planes));
        // only the primary plane of the second crtc is left
        assert_eq!(second.client_layers().len(), 2);
    }

    #[test]
    fn composite_drives_all_displays() {
        let (device, mut compositor) = dual_display();
        let importer = Arc::new(TestImporter::new());
        let first = composition(&mut compositor, &importer, DisplayId(0), 1);
        let second = composition(&mut compositor, &importer, DisplayId(1), 1);
        compositor.queue_composition(first).unwrap();
        compositor.queue_composition(second).unwrap();

        let results = compositor.composite();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(device.commit_count(), 2);
    }

    #[test]
    fn stalled_display_does_not_block_others() {
        init_logging();
        let device = Arc::new(
            TestDevice::builder()
                .connector(ConnectorInterface::EmbeddedDisplayPort, true)
                .connector(ConnectorInterface::HDMIA, true)
                .build(),
        );
        device.set_auto_complete(false);
        let config = CompositorConfig {
            commit_timeout: Duration::from_millis(100),
            stall_limit: 3,
            ..Default::default()
        };
        let mut compositor = DrmCompositor::new(device.clone(), config).unwrap();
        let importer = Arc::new(TestImporter::new());

        for display in [DisplayId(0), DisplayId(1)] {
            let frame = composition(&mut compositor, &importer, display, 1);
            compositor.queue_composition(frame).unwrap();
        }
        assert!(compositor.composite().iter().all(|(_, result)| result.is_ok()));

        // only the second display's commit is ever shown
        let healthy = compositor.display(DisplayId(1)).unwrap().pipeline().crtc;
        assert!(device.complete(healthy));
        wait_until(|| compositor.display(DisplayId(1)).unwrap().frames_shown() == 1);

        for display in [DisplayId(0), DisplayId(1)] {
            let frame = composition(&mut compositor, &importer, display, 1);
            compositor.queue_composition(frame).unwrap();
        }
        let started = Instant::now();
        let results = compositor.composite();
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], (DisplayId(0), Err(Error::Stalled(DisplayId(0))))));
        assert!(matches!(results[1], (DisplayId(1), Ok(()))));
        let stalled = compositor.display(DisplayId(0)).unwrap();
        assert_eq!(stalled.state(), DisplayState::Idle);
        assert!(stalled.stalls() >= 3);
    }

    #[test]
    fn failing_display_does_not_block_others() {
        let (device, mut compositor) = dual_display();
        let importer = Arc::new(TestImporter::new());
        let first = composition(&mut compositor, &importer, DisplayId(0), 1);
        compositor.queue_composition(first).unwrap();
        device.reject_commits(1);
        assert!(compositor.composite()[0].1.is_err());

        let first = composition(&mut compositor, &importer, DisplayId(0), 1);
        let second = composition(&mut compositor, &importer, DisplayId(1), 1);
        compositor.queue_composition(first).unwrap();
        compositor.queue_composition(second).unwrap();
        device.reject_commits(1);
        let results = compositor.composite();
        assert_eq!(results.iter().filter(|(_, result)| result.is_ok()).count(), 1);
    }

    #[test]
    fn hotplug_brings_displays_down_and_up() {
        let (device, mut compositor) = dual_display();
        let importer = Arc::new(TestImporter::new());
        let hdmi = device.connector(1);

        let retire = FenceSlot::new();
        let mut frame = composition(&mut compositor, &importer, DisplayId(1), 1);
        frame.set_retire_fence(&retire);
        compositor.queue_composition(frame).unwrap();

        device.set_connected(hdmi, false);
        let events = compositor.handle_hotplug().unwrap();
        assert_eq!(events, vec![HotplugEvent::Disconnected(DisplayId(1))]);
        assert!(compositor.display(DisplayId(1)).is_none());
        assert_eq!(retire.signal_count(), 0);
        assert_eq!(importer.live_imports(), 0);

        device.set_connected(hdmi, true);
        let events = compositor.handle_hotplug().unwrap();
        assert_eq!(events, vec![HotplugEvent::Connected(DisplayId(1))]);
        let frame = composition(&mut compositor, &importer, DisplayId(1), 1);
        compositor.queue_composition(frame).unwrap();
        assert!(compositor.composite()[0].1.is_ok());
    }

    #[test]
    fn mode_change_triggers_modeset() {
        let (device, mut compositor) = dual_display();
        let importer = Arc::new(TestImporter::new());
        let frame = composition(&mut compositor, &importer, DisplayId(0), 1);
        compositor.queue_composition(frame).unwrap();
        compositor.composite();
        let display = compositor.display(DisplayId(0)).unwrap();
        wait_until(|| display.state() == DisplayState::Idle);

        let mode = compositor
            .registry()
            .connector_for_display(DisplayId(0))
            .unwrap()
            .modes()
            .iter()
            .find(|mode| mode.info().size() == (1280, 720))
            .unwrap()
            .id();
        compositor.set_active_mode(DisplayId(0), mode).unwrap();
        assert_eq!(compositor.display_size(DisplayId(0)), Some((1280, 720)));
        assert!(matches!(
            compositor.set_active_mode(DisplayId(0), ModeId(999)),
            Err(Error::UnknownMode(ModeId(999)))
        ));

        let frame = composition(&mut compositor, &importer, DisplayId(0), 1);
        compositor.queue_composition(frame).unwrap();
        compositor.composite();
        let commit = device.last_commit().unwrap();
        assert!(matches!(
            commit.modeset,
            Some(crate::backend::drm::device::test::RecordedModeset::Enable(ref mode)) if mode.size() == (1280, 720)
        ));
    }

    #[test]
    fn color_and_power_controls() {
        let (device, compositor) = dual_display();
        compositor
            .set_color_property(DisplayId(0), ColorProperty::Contrast, 7)
            .unwrap();
        compositor.set_power_mode(DisplayId(1), PowerMode::Standby).unwrap();

        let registry = compositor.registry();
        let edp = registry.connector_for_display(DisplayId(0)).unwrap();
        let contrast = edp.color_property(ColorProperty::Contrast).unwrap();
        assert_eq!(device.property_value(edp.id().into(), contrast), Some(7));
        let hdmi = registry.connector_for_display(DisplayId(1)).unwrap();
        assert_eq!(device.property_value(hdmi.id().into(), hdmi.dpms_property()), Some(1));
    }

    #[test]
    fn dump_contains_topology_and_displays() {
        let (_device, compositor) = dual_display();
        let dump = compositor.dump();
        assert!(dump.contains("Connectors"));
        assert!(dump.contains("Display 0"));
        assert!(dump.contains("Display 1"));
    }
}
