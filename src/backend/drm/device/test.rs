//! In-memory display device and importer
//!
//! [`TestDevice`] models a drm device with a configurable topology. It records
//! every commit, mirrors committed plane and crtc state into its property
//! values and hands out completion events either right away or when
//! [`TestDevice::complete`] is called.

#![allow(missing_docs)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use super::{
    CommitOutput, CommitRequest, ConnectionState, ConnectorInfo, CrtcInfo, DeviceResources, DisplayDevice,
    EncoderInfo, Modeset, PlaneInfo, PlaneType, PropertyMap,
};
use crate::backend::{
    allocator::{
        BufferHandle, BufferObject, BufferUsage, Fourcc, ImportError, Importer, Modifier, MAX_PLANES,
    },
    drm::{
        error::{AccessError, CommitError},
        resources::{ConnectorInterface, ModeInfo},
        ConnectorId, CrtcId, EncoderId, FramebufferId, ObjectId, PlaneId, PropertyId,
    },
    sync::signaled_fence,
};
use crate::utils::{Physical, Rectangle};

const CONNECTOR_PROPS: &[&str] = &["DPMS", "CRTC_ID", "brightness", "contrast", "saturation", "hue"];
const CRTC_PROPS: &[&str] = &["ACTIVE", "MODE_ID", "OUT_FENCE_PTR"];
const PLANE_PROPS: &[&str] = &[
    "FB_ID",
    "CRTC_ID",
    "SRC_X",
    "SRC_Y",
    "SRC_W",
    "SRC_H",
    "CRTC_X",
    "CRTC_Y",
    "CRTC_W",
    "CRTC_H",
    "rotation",
    "alpha",
    "pixel blend mode",
    "IN_FENCE_FD",
];

const FORMATS: &[Fourcc] = &[
    Fourcc::Argb8888,
    Fourcc::Xrgb8888,
    Fourcc::Abgr8888,
    Fourcc::Xbgr8888,
];

/// A commit as seen by the [`TestDevice`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommit {
    pub crtc: CrtcId,
    pub connector: ConnectorId,
    pub modeset: Option<RecordedModeset>,
    pub planes: Vec<RecordedPlane>,
    pub disabled: Vec<PlaneId>,
    pub event: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedModeset {
    Enable(ModeInfo),
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedPlane {
    pub plane: PlaneId,
    pub framebuffer: FramebufferId,
    pub dst: Rectangle<i32, Physical>,
    pub in_fence: bool,
}

#[derive(Debug, Default)]
struct TestState {
    resources: DeviceResources,
    values: HashMap<(ObjectId, PropertyId), u64>,
    fail_enumeration: bool,
    reject_commits: usize,
    auto_complete: bool,
    in_fences: bool,
    max_mode_width: Option<u16>,
    commits: Vec<RecordedCommit>,
    test_commits: usize,
    in_flight: HashMap<CrtcId, usize>,
    events: HashMap<CrtcId, VecDeque<super::CompletionEvent>>,
    frame: u32,
    started: Option<Instant>,
}

/// In-memory [`DisplayDevice`]
#[derive(Debug)]
pub struct TestDevice {
    state: Mutex<TestState>,
    events: Condvar,
}

/// Topology description of a [`TestDevice`]
#[derive(Debug, Default)]
pub struct TestDeviceBuilder {
    connectors: Vec<(ConnectorInterface, bool)>,
    overlays: usize,
    cursor: bool,
    zpos: bool,
}

struct Ids {
    next_property: u32,
}

impl Ids {
    fn props(&mut self, names: &[&str]) -> PropertyMap {
        names
            .iter()
            .map(|name| {
                let id = PropertyId(self.next_property);
                self.next_property += 1;
                (name.to_string(), id)
            })
            .collect()
    }
}

impl TestDeviceBuilder {
    /// Add a connector, each connector brings its own encoder, crtc and primary plane
    pub fn connector(mut self, interface: ConnectorInterface, connected: bool) -> Self {
        self.connectors.push((interface, connected));
        self
    }

    /// Overlay planes shared by all crtcs
    pub fn overlays(mut self, count: usize) -> Self {
        self.overlays = count;
        self
    }

    /// Add a cursor plane to every crtc
    pub fn cursor(mut self, cursor: bool) -> Self {
        self.cursor = cursor;
        self
    }

    /// Report explicit z-positions, overlays stacking in reverse id order
    pub fn zpos(mut self, zpos: bool) -> Self {
        self.zpos = zpos;
        self
    }

    pub fn build(self) -> TestDevice {
        let mut ids = Ids { next_property: 1 };
        let mut resources = DeviceResources {
            max_cursor_size: Some((64, 64)),
            ..Default::default()
        };

        let count = self.connectors.len() as u32;
        let crtcs: Vec<CrtcId> = (0..count).map(|i| CrtcId(300 + i)).collect();

        for (pipe, crtc) in crtcs.iter().enumerate() {
            resources.crtcs.push(CrtcInfo {
                id: *crtc,
                pipe,
                properties: ids.props(CRTC_PROPS),
            });
        }

        let mut next_plane = 400;
        let mut plane = |kind: PlaneType, possible_crtcs: Vec<CrtcId>, zpos: Option<u64>| {
            let id = PlaneId(next_plane);
            next_plane += 1;
            PlaneInfo {
                id,
                kind,
                possible_crtcs,
                formats: FORMATS.to_vec(),
                scaling: kind != PlaneType::Cursor,
                zpos,
                properties: ids.props(PLANE_PROPS),
            }
        };

        let mut planes = Vec::new();
        for crtc in &crtcs {
            planes.push(plane(PlaneType::Primary, vec![*crtc], self.zpos.then_some(0)));
        }
        for i in 0..self.overlays {
            let zpos = self.zpos.then_some((self.overlays - i) as u64);
            planes.push(plane(PlaneType::Overlay, crtcs.clone(), zpos));
        }
        if self.cursor {
            for crtc in &crtcs {
                let zpos = self.zpos.then_some(self.overlays as u64 + 1);
                planes.push(plane(PlaneType::Cursor, vec![*crtc], zpos));
            }
        }
        resources.planes = planes;

        let mut interface_ids: HashMap<ConnectorInterface, u32> = HashMap::new();
        for (i, (interface, connected)) in self.connectors.into_iter().enumerate() {
            let encoder = EncoderId(200 + i as u32);
            resources.encoders.push(EncoderInfo {
                id: encoder,
                possible_crtcs: crtcs.clone(),
                current_crtc: None,
            });

            let interface_id = interface_ids.entry(interface).or_insert(0);
            *interface_id += 1;
            resources.connectors.push(ConnectorInfo {
                id: ConnectorId(100 + i as u32),
                interface,
                interface_id: *interface_id,
                state: if connected {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                },
                size: Some((340, 190)),
                modes: if connected { default_modes() } else { Vec::new() },
                encoders: vec![encoder],
                current_encoder: None,
                properties: ids.props(CONNECTOR_PROPS),
            });
        }

        TestDevice {
            state: Mutex::new(TestState {
                resources,
                auto_complete: true,
                in_fences: true,
                ..Default::default()
            }),
            events: Condvar::new(),
        }
    }
}

fn default_modes() -> Vec<ModeInfo> {
    vec![
        ModeInfo::with_resolution(1920, 1080, 60).preferred(),
        ModeInfo::with_resolution(1280, 720, 60),
    ]
}

fn no_such_object(errmsg: &'static str) -> AccessError {
    AccessError {
        errmsg,
        dev: None,
        source: io::Error::from(io::ErrorKind::NotFound),
    }
}

impl TestDevice {
    pub fn builder() -> TestDeviceBuilder {
        TestDeviceBuilder::default()
    }

    /// One connected built-in panel with a primary plane and `overlays` overlay planes
    pub fn single_display(overlays: usize) -> TestDevice {
        TestDevice::builder()
            .connector(ConnectorInterface::EmbeddedDisplayPort, true)
            .overlays(overlays)
            .build()
    }

    fn state(&self) -> MutexGuard<'_, TestState> {
        self.state.lock().unwrap()
    }

    /// Id of the `idx`th connector
    pub fn connector(&self, idx: usize) -> ConnectorId {
        self.state().resources.connectors[idx].id
    }

    pub fn remove_connector_property(&self, connector: ConnectorId, name: &str) {
        let mut state = self.state();
        if let Some(info) = state.resources.connectors.iter_mut().find(|c| c.id == connector) {
            info.properties.remove(name);
        }
    }

    /// Last value written to a property
    pub fn property_value(&self, object: ObjectId, property: PropertyId) -> Option<u64> {
        self.state().values.get(&(object, property)).copied()
    }

    fn named_value(&self, object: ObjectId, name: &str) -> Option<u64> {
        let state = self.state();
        let props = match object {
            ObjectId::Connector(id) => &state.resources.connectors.iter().find(|c| c.id == id)?.properties,
            ObjectId::Crtc(id) => &state.resources.crtcs.iter().find(|c| c.id == id)?.properties,
            ObjectId::Plane(id) => &state.resources.planes.iter().find(|p| p.id == id)?.properties,
        };
        let property = props.get(name)?;
        state.values.get(&(object, *property)).copied()
    }

    /// Framebuffer currently shown by `plane`, if any
    pub fn plane_framebuffer(&self, plane: PlaneId) -> Option<FramebufferId> {
        self.named_value(plane.into(), "FB_ID")
            .filter(|fb| *fb != 0)
            .map(|fb| FramebufferId(fb as u32))
    }

    /// Whether `crtc` is switched on
    pub fn crtc_active(&self, crtc: CrtcId) -> bool {
        self.named_value(crtc.into(), "ACTIVE") == Some(1)
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.state().fail_enumeration = fail;
    }

    /// Reject the next `count` non-test commits
    pub fn reject_commits(&self, count: usize) {
        self.state().reject_commits = count;
    }

    /// Whether commits complete right away or only through [`TestDevice::complete`]
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state().auto_complete = auto_complete;
    }

    pub fn set_in_fences(&self, supported: bool) {
        self.state().in_fences = supported;
    }

    /// Let [`DisplayDevice::verify_mode`] fail for modes wider than `width`
    pub fn limit_mode_width(&self, width: Option<u16>) {
        self.state().max_mode_width = width;
    }

    /// Complete the oldest in-flight commit of `crtc`
    ///
    /// Returns `false` if nothing was in flight.
    pub fn complete(&self, crtc: CrtcId) -> bool {
        let mut state = self.state();
        let in_flight = state.in_flight.entry(crtc).or_default();
        if *in_flight == 0 {
            return false;
        }
        *in_flight -= 1;
        queue_event(&mut state, crtc);
        self.events.notify_all();
        true
    }

    /// Number of commits waiting for [`TestDevice::complete`]
    pub fn in_flight(&self, crtc: CrtcId) -> usize {
        self.state().in_flight.get(&crtc).copied().unwrap_or(0)
    }

    /// All applied commits in order
    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.state().commits.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.state().commits.len()
    }

    pub fn last_commit(&self) -> Option<RecordedCommit> {
        self.state().commits.last().cloned()
    }

    pub fn test_commit_count(&self) -> usize {
        self.state().test_commits
    }

    pub fn connector_modes(&self, connector: ConnectorId) -> Vec<ModeInfo> {
        self.state()
            .resources
            .connectors
            .iter()
            .find(|c| c.id == connector)
            .map(|c| c.modes.clone())
            .unwrap_or_default()
    }

    pub fn set_connector_modes(&self, connector: ConnectorId, modes: Vec<ModeInfo>) {
        let mut state = self.state();
        if let Some(info) = state.resources.connectors.iter_mut().find(|c| c.id == connector) {
            info.modes = modes;
        }
    }

    /// Plug or unplug the sink of `connector`
    pub fn set_connected(&self, connector: ConnectorId, connected: bool) {
        let mut state = self.state();
        if let Some(info) = state.resources.connectors.iter_mut().find(|c| c.id == connector) {
            if connected {
                info.state = ConnectionState::Connected;
                info.modes = default_modes();
            } else {
                info.state = ConnectionState::Disconnected;
                info.modes.clear();
            }
        }
    }
}

fn queue_event(state: &mut TestState, crtc: CrtcId) {
    state.frame += 1;
    let time = state.started.get_or_insert_with(Instant::now).elapsed();
    let frame = state.frame;
    state
        .events
        .entry(crtc)
        .or_default()
        .push_back(super::CompletionEvent { crtc, frame, time });
}

impl DisplayDevice for TestDevice {
    fn enumerate(&self) -> Result<DeviceResources, AccessError> {
        let state = self.state();
        if state.fail_enumeration {
            return Err(AccessError {
                errmsg: "Error loading resource handles",
                dev: None,
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        Ok(state.resources.clone())
    }

    fn probe_connector(&self, connector: ConnectorId) -> Result<ConnectorInfo, AccessError> {
        self.state()
            .resources
            .connectors
            .iter()
            .find(|c| c.id == connector)
            .cloned()
            .ok_or_else(|| no_such_object("Error loading connector info"))
    }

    fn set_property(&self, object: ObjectId, property: PropertyId, value: u64) -> Result<(), AccessError> {
        self.state().values.insert((object, property), value);
        Ok(())
    }

    fn commit(&self, request: &CommitRequest<'_>) -> Result<CommitOutput, CommitError> {
        let mut state = self.state();

        let crtc_props = state
            .resources
            .crtcs
            .iter()
            .find(|c| c.id == request.crtc)
            .map(|c| c.properties.clone())
            .ok_or_else(|| CommitError::Access(no_such_object("Unknown crtc")))?;
        let known_planes: HashSet<PlaneId> = state
            .resources
            .planes
            .iter()
            .filter(|p| p.possible_crtcs.contains(&request.crtc))
            .map(|p| p.id)
            .collect();
        if request
            .planes
            .iter()
            .map(|p| p.plane)
            .chain(request.disable.iter().copied())
            .any(|plane| !known_planes.contains(&plane))
        {
            return Err(CommitError::Rejected(io::Error::from(io::ErrorKind::InvalidInput)));
        }

        if request.test_only {
            state.test_commits += 1;
            return Ok(CommitOutput::default());
        }
        if state.reject_commits > 0 {
            state.reject_commits -= 1;
            return Err(CommitError::Rejected(io::Error::from(io::ErrorKind::InvalidInput)));
        }

        let crtc_object = ObjectId::Crtc(request.crtc);
        match request.modeset {
            Some(Modeset::Enable(_)) => {
                state.values.insert((crtc_object, crtc_props["ACTIVE"]), 1);
            }
            Some(Modeset::Disable) => {
                state.values.insert((crtc_object, crtc_props["ACTIVE"]), 0);
            }
            None => {}
        }

        let plane_props: HashMap<PlaneId, PropertyMap> = state
            .resources
            .planes
            .iter()
            .map(|p| (p.id, p.properties.clone()))
            .collect();
        for plane in &request.planes {
            let props = &plane_props[&plane.plane];
            let object = ObjectId::Plane(plane.plane);
            state.values.insert((object, props["FB_ID"]), plane.framebuffer.0 as u64);
            state.values.insert((object, props["CRTC_ID"]), request.crtc.0 as u64);
        }
        for plane in &request.disable {
            let props = &plane_props[plane];
            let object = ObjectId::Plane(*plane);
            state.values.insert((object, props["FB_ID"]), 0);
            state.values.insert((object, props["CRTC_ID"]), 0);
        }

        state.commits.push(RecordedCommit {
            crtc: request.crtc,
            connector: request.connector,
            modeset: request.modeset.map(|modeset| match modeset {
                Modeset::Enable(mode) => RecordedModeset::Enable(mode.clone()),
                Modeset::Disable => RecordedModeset::Disable,
            }),
            planes: request
                .planes
                .iter()
                .map(|plane| RecordedPlane {
                    plane: plane.plane,
                    framebuffer: plane.framebuffer,
                    dst: plane.dst,
                    in_fence: plane.in_fence.is_some(),
                })
                .collect(),
            disabled: request.disable.clone(),
            event: request.event,
        });

        if request.event {
            if state.auto_complete {
                queue_event(&mut state, request.crtc);
                self.events.notify_all();
            } else {
                *state.in_flight.entry(request.crtc).or_default() += 1;
            }
        }

        let out_fence = if crtc_props.contains_key("OUT_FENCE_PTR") {
            Some(signaled_fence().map_err(|source| AccessError {
                errmsg: "Failed to create out fence",
                dev: None,
                source,
            })?)
        } else {
            None
        };
        Ok(CommitOutput { out_fence })
    }

    fn wait_for_completion(
        &self,
        crtc: CrtcId,
        timeout: Duration,
    ) -> Result<Option<super::CompletionEvent>, AccessError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if let Some(event) = state.events.get_mut(&crtc).and_then(VecDeque::pop_front) {
                return Ok(Some(event));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self.events.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    fn verify_mode(&self, _connector: ConnectorId, mode: &ModeInfo) -> bool {
        self.state()
            .max_mode_width
            .map(|max| mode.hdisplay <= max)
            .unwrap_or(true)
    }

    fn supports_in_fences(&self) -> bool {
        self.state().in_fences
    }
}

#[derive(Debug, Default)]
struct ImporterState {
    rejected: Vec<Fourcc>,
    live: HashSet<FramebufferId>,
    next_framebuffer: u32,
    released: usize,
}

/// In-memory [`Importer`] handing out sequential framebuffer ids
#[derive(Debug, Default)]
pub struct TestImporter {
    state: Mutex<ImporterState>,
}

impl TestImporter {
    pub fn new() -> TestImporter {
        TestImporter::default()
    }

    /// Fail imports of `format` with [`ImportError::UnsupportedFormat`]
    pub fn reject_format(&self, format: Fourcc) {
        self.state.lock().unwrap().rejected.push(format);
    }

    /// Number of imported buffers not yet released
    pub fn live_imports(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn released(&self) -> usize {
        self.state.lock().unwrap().released
    }
}

impl Importer for TestImporter {
    fn import_buffer(&self, handle: &BufferHandle) -> Result<BufferObject, ImportError> {
        let mut state = self.state.lock().unwrap();
        if handle.planes().is_empty() {
            return Err(ImportError::NoPlanes);
        }
        if state.rejected.contains(&handle.format()) {
            return Err(ImportError::UnsupportedFormat(handle.format()));
        }
        if let Some((plane, stride)) = handle
            .planes()
            .iter()
            .enumerate()
            .find(|(_, plane)| plane.stride == 0)
            .map(|(idx, plane)| (idx, plane.stride))
        {
            return Err(ImportError::InvalidStride { plane, stride });
        }

        state.next_framebuffer += 1;
        let framebuffer = FramebufferId(1000 + state.next_framebuffer);
        state.live.insert(framebuffer);

        let mut bo = BufferObject {
            buffer_id: handle.id(),
            size: handle.size(),
            format: handle.format(),
            modifier: handle.modifier(),
            pitches: [0; MAX_PLANES],
            offsets: [0; MAX_PLANES],
            gem_handles: [0; MAX_PLANES],
            framebuffer,
        };
        for (idx, plane) in handle.planes().iter().enumerate() {
            bo.pitches[idx] = plane.stride;
            bo.offsets[idx] = plane.offset;
            bo.gem_handles[idx] = idx as u32 + 1;
        }
        Ok(bo)
    }

    fn release_buffer(&self, bo: BufferObject) -> Result<(), ImportError> {
        let mut state = self.state.lock().unwrap();
        state.live.remove(&bo.framebuffer);
        state.released += 1;
        Ok(())
    }
}

/// Single-plane linear buffer of `width`x`height` backed by an eventfd
pub fn test_buffer(format: Fourcc, width: i32, height: i32) -> BufferHandle {
    test_buffer_with_usage(format, width, height, BufferUsage::HW_COMPOSER)
}

pub fn test_buffer_with_usage(format: Fourcc, width: i32, height: i32, usage: BufferUsage) -> BufferHandle {
    let fd = rustix::event::eventfd(0, rustix::event::EventfdFlags::CLOEXEC).unwrap();
    let mut builder = BufferHandle::builder((width, height), format, Modifier::Linear);
    builder.add_plane(fd, 0, width as u32 * 4);
    builder.usage(usage).build().unwrap()
}
