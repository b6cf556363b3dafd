use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use drm::control::atomic::AtomicModeReq;
use drm::control::{
    connector, crtc, plane, property, AtomicCommitFlags, Device as ControlDevice, Event, PlaneType as DrmPlaneType,
    PropertyValueSet, ResourceHandle,
};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;

use super::{
    CommitOutput, CommitRequest, CompletionEvent, ConnectionState, ConnectorInfo, CrtcInfo, DeviceResources,
    DisplayDevice, DrmDeviceFd, EncoderInfo, Modeset, PlaneInfo, PlaneType, PropertyMap,
};
use crate::backend::allocator::Fourcc;
use crate::backend::drm::{
    error::{AccessError, CommitError, Error},
    resources::ModeInfo,
    ConnectorId, CrtcId, ObjectId, PropertyId,
};
use crate::utils::{DevPath, Transform};

use tracing::{debug, error, info_span, trace, warn};

/// Longest time a single poll on the device blocks while waiting for events
const POLL_SLICE: Duration = Duration::from_millis(16);

type OldState = (
    Vec<(connector::Handle, PropertyValueSet)>,
    Vec<(crtc::Handle, PropertyValueSet)>,
    Vec<(plane::Handle, PropertyValueSet)>,
);

#[derive(Clone, Debug, Default)]
struct PropMapping {
    connectors: HashMap<connector::Handle, HashMap<String, property::Handle>>,
    crtcs: HashMap<crtc::Handle, HashMap<String, property::Handle>>,
    planes: HashMap<plane::Handle, HashMap<String, property::Handle>>,
    blend_modes: HashMap<plane::Handle, HashMap<String, u64>>,
}

fn lookup<T: ResourceHandle + Eq + std::hash::Hash + std::fmt::Debug>(
    mapping: &HashMap<T, HashMap<String, property::Handle>>,
    handle: T,
    name: &'static str,
) -> Result<property::Handle, CommitError> {
    mapping
        .get(&handle)
        .and_then(|props| props.get(name))
        .copied()
        .ok_or_else(|| {
            CommitError::Rejected(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("object {:?} has no property '{}'", handle, name),
            ))
        })
}

fn to_property_map(props: Option<&HashMap<String, property::Handle>>) -> PropertyMap {
    props
        .map(|props| {
            props
                .iter()
                .map(|(name, handle)| (name.clone(), PropertyId::from(*handle)))
                .collect()
        })
        .unwrap_or_default()
}

fn raw_handle<I, H>(id: I) -> io::Result<H>
where
    I: std::fmt::Debug,
    H: TryFrom<I, Error = I>,
{
    H::try_from(id)
        .map_err(|id| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid object id {:?}", id)))
}

/// [`DisplayDevice`] driving a drm device node through the atomic api
///
/// The state the device was in on creation is restored when this is dropped,
/// so whatever was shown before (e.g. a console) becomes visible again.
#[derive(Debug)]
pub struct AtomicDrmDevice {
    fd: DrmDeviceFd,
    old_state: OldState,
    prop_mapping: RwLock<PropMapping>,
    events: Mutex<HashMap<CrtcId, VecDeque<CompletionEvent>>>,
    in_fences: bool,
    span: tracing::Span,
}

impl AtomicDrmDevice {
    /// Take over the device behind `fd`
    ///
    /// Fails if the device does not support atomic mode-setting.
    pub fn new(fd: DrmDeviceFd) -> Result<Self, Error> {
        let span = info_span!("drm_atomic", device = ?fd.dev_path());
        let _guard = span.enter();

        if let Err(source) = fd.set_client_capability(ClientCapability::UniversalPlanes, true) {
            warn!("Unable to enable universal planes: {}", source);
        }
        fd.set_client_capability(ClientCapability::Atomic, true)
            .map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Device does not support atomic mode-setting",
                    dev: fd.dev_path(),
                    source,
                })
            })?;

        // Enumerate (and save) the current device state.
        let res_handles = fd.resource_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading drm resources",
                dev: fd.dev_path(),
                source,
            })
        })?;
        let planes = fd.plane_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading planes",
                dev: fd.dev_path(),
                source,
            })
        })?;

        let mut old_state: OldState = (Vec::new(), Vec::new(), Vec::new());
        add_props(&fd, res_handles.connectors(), &mut old_state.0)?;
        add_props(&fd, res_handles.crtcs(), &mut old_state.1)?;
        add_props(&fd, &planes, &mut old_state.2)?;

        // The property ids differ between devices, so we look them up by name once.
        let mut mapping = PropMapping::default();
        map_props(&fd, res_handles.connectors(), &mut mapping.connectors)?;
        map_props(&fd, res_handles.crtcs(), &mut mapping.crtcs)?;
        map_props(&fd, &planes, &mut mapping.planes)?;
        map_blend_modes(&fd, &mapping.planes, &mut mapping.blend_modes);
        trace!("Mapping: {:#?}", mapping);

        let in_fences = !mapping.planes.is_empty()
            && mapping
                .planes
                .values()
                .all(|props| props.contains_key("IN_FENCE_FD"));
        debug!(in_fences, planes = planes.len(), "Atomic device initialized");

        drop(_guard);
        Ok(AtomicDrmDevice {
            fd,
            old_state,
            prop_mapping: RwLock::new(mapping),
            events: Mutex::new(HashMap::new()),
            in_fences,
            span,
        })
    }

    /// The underlying device file descriptor
    pub fn device_fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    fn access_error(&self, errmsg: &'static str, source: io::Error) -> AccessError {
        AccessError {
            errmsg,
            dev: self.fd.dev_path(),
            source,
        }
    }

    fn commit_error(&self, source: io::Error) -> CommitError {
        match source.raw_os_error() {
            Some(libc::EINVAL) | Some(libc::ERANGE) | Some(libc::ENOSPC) | Some(libc::E2BIG) => {
                CommitError::Rejected(source)
            }
            _ => CommitError::Access(self.access_error("Error committing atomic request", source)),
        }
    }

    fn connector_info(
        &self,
        handle: connector::Handle,
        force_probe: bool,
        mapping: &PropMapping,
    ) -> Result<ConnectorInfo, AccessError> {
        let info = self
            .fd
            .get_connector(handle, force_probe)
            .map_err(|source| self.access_error("Error loading connector info", source))?;
        Ok(ConnectorInfo {
            id: handle.into(),
            interface: info.interface().into(),
            interface_id: info.interface_id(),
            state: match info.state() {
                connector::State::Connected => ConnectionState::Connected,
                connector::State::Disconnected => ConnectionState::Disconnected,
                connector::State::Unknown => ConnectionState::Unknown,
            },
            size: info.size(),
            modes: info.modes().iter().copied().map(ModeInfo::from).collect(),
            encoders: info.encoders().iter().copied().map(Into::into).collect(),
            current_encoder: info.current_encoder().map(Into::into),
            properties: to_property_map(mapping.connectors.get(&handle)),
        })
    }

    fn plane_type_and_zpos(&self, handle: plane::Handle) -> Result<(PlaneType, Option<u64>), AccessError> {
        let props = self
            .fd
            .get_properties(handle)
            .map_err(|source| self.access_error("Error reading plane properties", source))?;
        let mut kind = PlaneType::Overlay;
        let mut zpos = None;
        let (ids, vals) = props.as_props_and_values();
        for (&id, &val) in ids.iter().zip(vals.iter()) {
            let Ok(info) = self.fd.get_property(id) else {
                continue;
            };
            match info.name().to_str() {
                Ok("type") => {
                    kind = if val == DrmPlaneType::Primary as u64 {
                        PlaneType::Primary
                    } else if val == DrmPlaneType::Cursor as u64 {
                        PlaneType::Cursor
                    } else {
                        PlaneType::Overlay
                    };
                }
                Ok("zpos") => zpos = Some(val),
                _ => {}
            }
        }
        Ok((kind, zpos))
    }

    fn add_plane_state(
        &self,
        req: &mut AtomicModeReq,
        mapping: &PropMapping,
        crtc: crtc::Handle,
        plane: &super::PlaneCommit<'_>,
        in_fences: &mut Vec<OwnedFd>,
    ) -> Result<(), CommitError> {
        let handle: plane::Handle = raw_handle(plane.plane).map_err(CommitError::Rejected)?;
        let framebuffer = raw_handle(plane.framebuffer).map_err(CommitError::Rejected)?;
        let props = &mapping.planes;

        req.add_property(handle, lookup(props, handle, "CRTC_ID")?, property::Value::CRTC(Some(crtc)));
        req.add_property(
            handle,
            lookup(props, handle, "FB_ID")?,
            property::Value::Framebuffer(Some(framebuffer)),
        );
        // these are 16.16. fixed point
        req.add_property(
            handle,
            lookup(props, handle, "SRC_X")?,
            property::Value::UnsignedRange(to_fixed(plane.src.loc.x)),
        );
        req.add_property(
            handle,
            lookup(props, handle, "SRC_Y")?,
            property::Value::UnsignedRange(to_fixed(plane.src.loc.y)),
        );
        req.add_property(
            handle,
            lookup(props, handle, "SRC_W")?,
            property::Value::UnsignedRange(to_fixed(plane.src.size.w)),
        );
        req.add_property(
            handle,
            lookup(props, handle, "SRC_H")?,
            property::Value::UnsignedRange(to_fixed(plane.src.size.h)),
        );
        req.add_property(
            handle,
            lookup(props, handle, "CRTC_X")?,
            property::Value::SignedRange(plane.dst.loc.x as i64),
        );
        req.add_property(
            handle,
            lookup(props, handle, "CRTC_Y")?,
            property::Value::SignedRange(plane.dst.loc.y as i64),
        );
        req.add_property(
            handle,
            lookup(props, handle, "CRTC_W")?,
            property::Value::UnsignedRange(plane.dst.size.w as u64),
        );
        req.add_property(
            handle,
            lookup(props, handle, "CRTC_H")?,
            property::Value::UnsignedRange(plane.dst.size.h as u64),
        );

        // Without the optional properties only the defaults can be guaranteed to work
        match lookup(props, handle, "rotation") {
            Ok(prop) => req.add_property(
                handle,
                prop,
                property::Value::Bitmask(DrmRotation::from(plane.transform).bits() as u64),
            ),
            Err(err) if plane.transform != Transform::Normal => return Err(err),
            Err(_) => {}
        }
        match lookup(props, handle, "alpha") {
            Ok(prop) => req.add_property(
                handle,
                prop,
                property::Value::UnsignedRange(plane.alpha as u64 * 0x101),
            ),
            Err(err) if plane.alpha != 0xff => return Err(err),
            Err(_) => {}
        }
        if let Ok(prop) = lookup(props, handle, "pixel blend mode") {
            let value = mapping
                .blend_modes
                .get(&handle)
                .and_then(|modes| modes.get(plane.blending.drm_name()));
            if let Some(value) = value {
                req.add_raw_property(handle.into(), prop, *value);
            }
        }
        if let Some(fence) = plane.in_fence {
            // the device closes its copy once the commit is done
            let fence = fence
                .try_clone_to_owned()
                .map_err(|source| CommitError::Access(self.access_error("Failed to duplicate fence", source)))?;
            req.add_property(
                handle,
                lookup(props, handle, "IN_FENCE_FD")?,
                property::Value::SignedRange(fence.as_raw_fd() as i64),
            );
            in_fences.push(fence);
        }
        Ok(())
    }

    fn read_events(&self, queues: &mut HashMap<CrtcId, VecDeque<CompletionEvent>>) -> Result<(), AccessError> {
        let events = self
            .fd
            .receive_events()
            .map_err(|source| self.access_error("Error processing drm events", source))?;
        for event in events {
            if let Event::PageFlip(event) = event {
                trace!("Got a page-flip event for crtc ({:?})", event.crtc);
                let crtc = CrtcId::from(event.crtc);
                queues.entry(crtc).or_default().push_back(CompletionEvent {
                    crtc,
                    frame: event.frame,
                    time: event.duration,
                });
            } else {
                trace!("Got a non-page-flip event of device '{:?}'.", self.fd.dev_path());
            }
        }
        Ok(())
    }

    fn readable(&self, timeout: Duration) -> Result<bool, AccessError> {
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        match poll(&mut fds, timeout.as_millis().min(i32::MAX as u128) as i32) {
            Ok(ready) => Ok(ready > 0),
            Err(Errno::INTR) => Ok(false),
            Err(err) => Err(self.access_error("Error polling drm device", err.into())),
        }
    }
}

impl DisplayDevice for AtomicDrmDevice {
    #[profiling::function]
    fn enumerate(&self) -> Result<DeviceResources, AccessError> {
        let _guard = self.span.enter();

        let res_handles = self
            .fd
            .resource_handles()
            .map_err(|source| self.access_error("Error loading drm resources", source))?;
        let planes = self
            .fd
            .plane_handles()
            .map_err(|source| self.access_error("Error loading planes", source))?;

        let mut mapping = PropMapping::default();
        map_props(&self.fd, res_handles.connectors(), &mut mapping.connectors)?;
        map_props(&self.fd, res_handles.crtcs(), &mut mapping.crtcs)?;
        map_props(&self.fd, &planes, &mut mapping.planes)?;
        map_blend_modes(&self.fd, &mapping.planes, &mut mapping.blend_modes);

        let mut resources = DeviceResources::default();
        for conn in res_handles.connectors() {
            resources.connectors.push(self.connector_info(*conn, false, &mapping)?);
        }
        for encoder in res_handles.encoders() {
            let info = self
                .fd
                .get_encoder(*encoder)
                .map_err(|source| self.access_error("Error loading encoder info", source))?;
            resources.encoders.push(EncoderInfo {
                id: (*encoder).into(),
                possible_crtcs: res_handles
                    .filter_crtcs(info.possible_crtcs())
                    .into_iter()
                    .map(Into::into)
                    .collect(),
                current_crtc: info.crtc().map(Into::into),
            });
        }
        for (pipe, crtc) in res_handles.crtcs().iter().enumerate() {
            resources.crtcs.push(CrtcInfo {
                id: (*crtc).into(),
                pipe,
                properties: to_property_map(mapping.crtcs.get(crtc)),
            });
        }
        for handle in &planes {
            let info = self
                .fd
                .get_plane(*handle)
                .map_err(|source| self.access_error("Error loading plane info", source))?;
            let (kind, zpos) = self.plane_type_and_zpos(*handle)?;
            resources.planes.push(PlaneInfo {
                id: (*handle).into(),
                kind,
                possible_crtcs: res_handles
                    .filter_crtcs(info.possible_crtcs())
                    .into_iter()
                    .map(Into::into)
                    .collect(),
                formats: info
                    .formats()
                    .iter()
                    .filter_map(|code| Fourcc::try_from(*code).ok())
                    .collect(),
                // drm has no scaling capability query, primary and cursor planes
                // commonly cannot scale
                scaling: kind == PlaneType::Overlay,
                zpos,
                properties: to_property_map(mapping.planes.get(handle)),
            });
        }

        let cursor_width = self.fd.get_driver_capability(DriverCapability::CursorWidth);
        let cursor_height = self.fd.get_driver_capability(DriverCapability::CursorHeight);
        if let (Ok(w), Ok(h)) = (cursor_width, cursor_height) {
            resources.max_cursor_size = Some((w as u32, h as u32));
        }

        *self.prop_mapping.write().unwrap() = mapping;
        Ok(resources)
    }

    fn probe_connector(&self, connector: ConnectorId) -> Result<ConnectorInfo, AccessError> {
        let handle: connector::Handle =
            raw_handle(connector).map_err(|source| self.access_error("Invalid connector", source))?;
        let mut mapping = self.prop_mapping.write().unwrap();
        mapping.connectors.remove(&handle);
        map_props(&self.fd, &[handle], &mut mapping.connectors)?;
        self.connector_info(handle, true, &mapping)
    }

    fn set_property(&self, object: ObjectId, property: PropertyId, value: u64) -> Result<(), AccessError> {
        let prop: property::Handle =
            raw_handle(property).map_err(|source| self.access_error("Invalid property", source))?;
        let result = match object {
            ObjectId::Connector(id) => raw_handle::<_, connector::Handle>(id)
                .and_then(|handle| self.fd.set_property(handle, prop, value)),
            ObjectId::Crtc(id) => {
                raw_handle::<_, crtc::Handle>(id).and_then(|handle| self.fd.set_property(handle, prop, value))
            }
            ObjectId::Plane(id) => {
                raw_handle::<_, plane::Handle>(id).and_then(|handle| self.fd.set_property(handle, prop, value))
            }
        };
        result.map_err(|source| self.access_error("Failed to set property", source))
    }

    #[profiling::function]
    fn commit(&self, request: &CommitRequest<'_>) -> Result<CommitOutput, CommitError> {
        let _guard = self.span.enter();
        let mapping = self.prop_mapping.read().unwrap();

        let crtc: crtc::Handle = raw_handle(request.crtc).map_err(CommitError::Rejected)?;
        let conn: connector::Handle = raw_handle(request.connector).map_err(CommitError::Rejected)?;

        let mut req = AtomicModeReq::new();
        let mut blob = None;
        match request.modeset {
            Some(Modeset::Enable(mode)) => {
                let drm_mode = drm::control::Mode::from(mode);
                let mode_blob = self
                    .fd
                    .create_property_blob(&drm_mode)
                    .map_err(|source| CommitError::Access(self.access_error("Failed to create blob for mode", source)))?;
                req.add_property(
                    conn,
                    lookup(&mapping.connectors, conn, "CRTC_ID")?,
                    property::Value::CRTC(Some(crtc)),
                );
                req.add_property(crtc, lookup(&mapping.crtcs, crtc, "MODE_ID")?, mode_blob);
                req.add_property(
                    crtc,
                    lookup(&mapping.crtcs, crtc, "ACTIVE")?,
                    property::Value::Boolean(true),
                );
                blob = Some(mode_blob);
            }
            Some(Modeset::Disable) => {
                req.add_property(
                    conn,
                    lookup(&mapping.connectors, conn, "CRTC_ID")?,
                    property::Value::CRTC(None),
                );
                req.add_property(
                    crtc,
                    lookup(&mapping.crtcs, crtc, "MODE_ID")?,
                    property::Value::Unknown(0),
                );
                req.add_property(
                    crtc,
                    lookup(&mapping.crtcs, crtc, "ACTIVE")?,
                    property::Value::Boolean(false),
                );
            }
            None => {}
        }

        let mut in_fences = Vec::new();
        for plane in &request.planes {
            self.add_plane_state(&mut req, &mapping, crtc, plane, &mut in_fences)?;
        }
        for plane in &request.disable {
            let handle: plane::Handle = raw_handle(*plane).map_err(CommitError::Rejected)?;
            req.add_property(
                handle,
                lookup(&mapping.planes, handle, "CRTC_ID")?,
                property::Value::CRTC(None),
            );
            req.add_property(
                handle,
                lookup(&mapping.planes, handle, "FB_ID")?,
                property::Value::Framebuffer(None),
            );
        }

        let mut out_fence: RawFd = -1;
        let want_out_fence = request.event && !request.test_only;
        if want_out_fence {
            if let Ok(prop) = lookup(&mapping.crtcs, crtc, "OUT_FENCE_PTR") {
                req.add_property(
                    crtc,
                    prop,
                    property::Value::UnsignedRange(std::ptr::addr_of_mut!(out_fence) as u64),
                );
            }
        }

        let mut flags = AtomicCommitFlags::empty();
        if request.modeset.is_some() {
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        }
        if request.test_only {
            flags |= AtomicCommitFlags::TEST_ONLY;
        } else if request.event {
            flags |= AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK;
        }

        trace!(?flags, "Committing {:?}", req);
        let result = self.fd.atomic_commit(flags, req);

        if let Some(property::Value::Blob(id)) = blob {
            if let Err(err) = self.fd.destroy_property_blob(id) {
                debug!("Failed to destroy mode blob: {}", err);
            }
        }
        drop(in_fences);
        result.map_err(|source| self.commit_error(source))?;

        let out_fence = if want_out_fence && out_fence >= 0 {
            // SAFETY: the kernel just created this fd for us and nothing else owns it
            Some(unsafe { OwnedFd::from_raw_fd(out_fence) })
        } else {
            None
        };
        Ok(CommitOutput { out_fence })
    }

    fn wait_for_completion(
        &self,
        crtc: CrtcId,
        timeout: Duration,
    ) -> Result<Option<CompletionEvent>, AccessError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut queues = self.events.lock().unwrap();
                if let Some(event) = queues.get_mut(&crtc).and_then(VecDeque::pop_front) {
                    return Ok(Some(event));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Other display threads may drain the events, so never block for long
            if self.readable((deadline - now).min(POLL_SLICE))? {
                let mut queues = self.events.lock().unwrap();
                if self.readable(Duration::ZERO)? {
                    self.read_events(&mut queues)?;
                }
            }
        }
    }

    fn verify_mode(&self, connector: ConnectorId, mode: &ModeInfo) -> bool {
        let Ok(handle) = raw_handle::<_, connector::Handle>(connector) else {
            return false;
        };
        self.fd
            .get_connector(handle, false)
            .map(|info| info.modes().iter().any(|m| ModeInfo::from(*m) == *mode))
            .unwrap_or(false)
    }

    fn supports_in_fences(&self) -> bool {
        self.in_fences
    }

    fn dev_path(&self) -> Option<PathBuf> {
        self.fd.dev_path()
    }
}

impl Drop for AtomicDrmDevice {
    fn drop(&mut self) {
        if !self.fd.is_privileged() {
            return;
        }
        let _guard = self.span.enter();

        // Restore the state the device had before we took over, e.g. so a
        // console running on the device becomes visible again.
        debug!("Trying to restore previous state");
        let mut req = AtomicModeReq::new();
        fn add_multiple_props<T: ResourceHandle>(req: &mut AtomicModeReq, old_state: &[(T, PropertyValueSet)]) {
            for (handle, set) in old_state {
                let (prop_handles, values) = set.as_props_and_values();
                for (&prop_handle, &val) in prop_handles.iter().zip(values.iter()) {
                    req.add_raw_property((*handle).into(), prop_handle, val);
                }
            }
        }

        add_multiple_props(&mut req, &self.old_state.0);
        add_multiple_props(&mut req, &self.old_state.1);
        add_multiple_props(&mut req, &self.old_state.2);

        trace!("Previous state: {:?}", req);
        if let Err(err) = self.fd.atomic_commit(AtomicCommitFlags::ALLOW_MODESET, req) {
            error!("Failed to restore previous state. Error: {}", err);
        }
    }
}

// Add all properties of given handles to a given drm resource type to state.
fn add_props<D, T>(fd: &D, handles: &[T], state: &mut Vec<(T, PropertyValueSet)>) -> Result<(), AccessError>
where
    D: DevPath + ControlDevice,
    T: ResourceHandle,
{
    state.reserve_exact(handles.len());
    handles
        .iter()
        .try_for_each(|handle| {
            let props = fd.get_properties(*handle)?;
            state.push((*handle, props));
            Ok(())
        })
        .map_err(|source| AccessError {
            errmsg: "Error reading properties",
            dev: fd.dev_path(),
            source,
        })
}

/// Create a mapping of property names and handles for given handles of a given drm resource type.
fn map_props<D, T>(
    fd: &D,
    handles: &[T],
    mapping: &mut HashMap<T, HashMap<String, property::Handle>>,
) -> Result<(), AccessError>
where
    D: DevPath + ControlDevice,
    T: ResourceHandle + Eq + std::hash::Hash,
{
    handles
        .iter()
        .map(|x| (x, fd.get_properties(*x)))
        .try_for_each(|(handle, props)| {
            let props = props?;
            let mut map = HashMap::new();
            let (prop_handles, _) = props.as_props_and_values();
            for prop in prop_handles {
                if let Ok(info) = fd.get_property(*prop) {
                    let name = info.name().to_string_lossy().into_owned();
                    map.insert(name, *prop);
                }
            }
            mapping.insert(*handle, map);
            Ok(())
        })
        .map_err(|source| AccessError {
            errmsg: "Error reading properties",
            dev: fd.dev_path(),
            source,
        })
}

/// Collect the values of each plane's `pixel blend mode` enum by name
fn map_blend_modes<D: ControlDevice>(
    fd: &D,
    planes: &HashMap<plane::Handle, HashMap<String, property::Handle>>,
    blend_modes: &mut HashMap<plane::Handle, HashMap<String, u64>>,
) {
    for (plane, props) in planes {
        let Some(prop) = props.get("pixel blend mode") else {
            continue;
        };
        let Ok(info) = fd.get_property(*prop) else {
            continue;
        };
        if let property::ValueType::Enum(values) = info.value_type() {
            let (_, values) = values.values();
            let modes = values
                .iter()
                .map(|value| (value.name().to_string_lossy().into_owned(), value.value()))
                .collect();
            blend_modes.insert(*plane, modes);
        }
    }
}

#[inline]
fn to_fixed(n: f64) -> u64 {
    f64::round(n * (1 << 16) as f64) as u64
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    struct DrmRotation: u8 {
        const ROTATE_0      =   0b00000001;
        const ROTATE_90     =   0b00000010;
        const ROTATE_180    =   0b00000100;
        const ROTATE_270    =   0b00001000;
        const REFLECT_X     =   0b00010000;
        const REFLECT_Y     =   0b00100000;
    }
}

impl From<Transform> for DrmRotation {
    fn from(transform: Transform) -> Self {
        match transform {
            Transform::Normal => DrmRotation::ROTATE_0,
            Transform::_90 => DrmRotation::ROTATE_90,
            Transform::_180 => DrmRotation::ROTATE_180,
            Transform::_270 => DrmRotation::ROTATE_270,
            Transform::Flipped => DrmRotation::REFLECT_X,
            Transform::Flipped90 => DrmRotation::REFLECT_X | DrmRotation::ROTATE_90,
            Transform::Flipped180 => DrmRotation::REFLECT_X | DrmRotation::ROTATE_180,
            Transform::Flipped270 => DrmRotation::REFLECT_X | DrmRotation::ROTATE_270,
        }
    }
}
