//! Per-display composition state machine
//!
//! A [`DisplayCompositor`] accepts at most one pending [`Composition`] at a time
//! and applies it on a dedicated worker thread:
//!
//! ```text
//! Idle --queue--> Queued --composite--> Applying --commit ok--> Committed --completion--> Idle
//! ```
//!
//! Once the device reports the commit as shown, the previously active
//! composition is retired (its retire and release fences are signaled, its
//! buffers released) and the new one becomes active. Clearing the display
//! blanks it right away and discards everything not yet shown.

use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Write},
    os::unix::io::{AsFd, OwnedFd},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Condvar, Mutex, MutexGuard, RwLock,
    },
    thread::JoinHandle,
};

use tracing::{debug, error, info, info_span, trace, warn};

use super::{composition::Composition, config::CompositorConfig};
use crate::backend::drm::{
    device::{CommitRequest, CompletionEvent, DisplayDevice, Modeset, PlaneCommit},
    error::{AccessError, Error},
    resources::{PlaneCaps, Pipeline, ResourceRegistry},
    DisplayId, PlaneId,
};

/// State of a [`DisplayCompositor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayState {
    /// Nothing pending, nothing in flight
    Idle,
    /// A composition was accepted and waits to be applied
    Queued,
    /// A commit is being issued to the device
    Applying,
    /// The device accepted the commit, waiting for it to be shown
    Committed,
}

impl fmt::Display for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            DisplayState::Idle => "idle",
            DisplayState::Queued => "queued",
            DisplayState::Applying => "applying",
            DisplayState::Committed => "committed",
        };
        f.write_str(state)
    }
}

/// Planes held by the un-retired compositions of every display
#[derive(Debug, Default)]
pub(super) struct PlaneClaims(Mutex<HashMap<DisplayId, HashSet<PlaneId>>>);

impl PlaneClaims {
    /// Planes held by displays other than `display`
    pub(super) fn others(&self, display: DisplayId) -> HashSet<PlaneId> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(owner, _)| **owner != display)
            .flat_map(|(_, planes)| planes.iter().copied())
            .collect()
    }

    fn set(&self, display: DisplayId, planes: HashSet<PlaneId>) {
        self.0.lock().unwrap().insert(display, planes);
    }

    pub(super) fn remove(&self, display: DisplayId) {
        self.0.lock().unwrap().remove(&display);
    }
}

type Reply = Sender<Result<(), Error>>;

#[derive(Debug)]
struct Pending {
    composition: Composition,
    reply: Option<Reply>,
}

#[derive(Debug)]
struct InFlight {
    composition: Composition,
    planes: Vec<PlaneId>,
    out_fence: Option<OwnedFd>,
}

#[derive(Debug)]
struct Inner {
    generation: u64,
    pending: Option<Pending>,
    applying: bool,
    in_flight: Option<InFlight>,
    active: Option<Composition>,
    // planes enabled on the crtc by the last applied commit
    used_planes: Vec<PlaneId>,
    // completion events of discarded commits still to be consumed
    stale_events: usize,
    needs_modeset: bool,
    enabled: bool,
    shutdown: bool,
    frames_committed: u64,
    frames_shown: u64,
    stalls: u64,
    // timeouts since the in-flight commit was issued
    consecutive_stalls: u32,
    last_event: Option<CompletionEvent>,
    last_error: Option<String>,
}

impl Inner {
    fn state(&self) -> DisplayState {
        if self.applying {
            DisplayState::Applying
        } else if self.pending.is_some() {
            DisplayState::Queued
        } else if self.in_flight.is_some() {
            DisplayState::Committed
        } else {
            DisplayState::Idle
        }
    }

    fn claimed_planes(&self) -> HashSet<PlaneId> {
        let assigned = |composition: &Composition| -> Vec<PlaneId> {
            composition
                .assignment()
                .map(|a| a.planes().map(|(_, plane)| plane).collect())
                .unwrap_or_default()
        };
        let mut planes: HashSet<PlaneId> = self.used_planes.iter().copied().collect();
        if let Some(pending) = &self.pending {
            planes.extend(assigned(&pending.composition));
        }
        if let Some(in_flight) = &self.in_flight {
            planes.extend(in_flight.planes.iter().copied());
        }
        if let Some(active) = &self.active {
            planes.extend(assigned(active));
        }
        planes
    }
}

#[derive(Debug)]
struct Shared {
    display: DisplayId,
    pipeline: Pipeline,
    config: CompositorConfig,
    device: Arc<dyn DisplayDevice>,
    registry: Arc<RwLock<ResourceRegistry>>,
    claims: Arc<PlaneClaims>,
    inner: Mutex<Inner>,
    wakeup: Condvar,
    span: tracing::Span,
}

/// Serializes and applies the compositions of one display
#[derive(Debug)]
pub struct DisplayCompositor {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DisplayCompositor {
    /// Create the compositor for a bound display and start its worker
    pub(super) fn new(
        pipeline: Pipeline,
        device: Arc<dyn DisplayDevice>,
        registry: Arc<RwLock<ResourceRegistry>>,
        claims: Arc<PlaneClaims>,
        config: &CompositorConfig,
    ) -> Result<DisplayCompositor, Error> {
        let display = pipeline.display;
        let span = info_span!("drm_display", display = ?pipeline.display, crtc = ?pipeline.crtc);
        let shared = Arc::new(Shared {
            display,
            pipeline,
            config: config.clone(),
            device: device.clone(),
            registry,
            claims,
            inner: Mutex::new(Inner {
                generation: 0,
                pending: None,
                applying: false,
                in_flight: None,
                active: None,
                used_planes: Vec::new(),
                stale_events: 0,
                needs_modeset: true,
                enabled: false,
                shutdown: false,
                frames_committed: 0,
                frames_shown: 0,
                stalls: 0,
                consecutive_stalls: 0,
                last_event: None,
                last_error: None,
            }),
            wakeup: Condvar::new(),
            span,
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("hwc-display-{}", display.0))
            .spawn(move || worker_shared.run())
            .map_err(|source| AccessError {
                errmsg: "Failed to spawn display worker",
                dev: device.dev_path(),
                source,
            })?;

        shared.span.in_scope(|| info!("Display compositor started"));
        Ok(DisplayCompositor {
            shared,
            worker: Some(worker),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap()
    }

    /// Display driven by this compositor
    pub fn display(&self) -> DisplayId {
        self.shared.display
    }

    /// Connector, encoder and crtc of the display
    pub fn pipeline(&self) -> Pipeline {
        self.shared.pipeline
    }

    /// Current state of the state machine
    pub fn state(&self) -> DisplayState {
        self.lock().state()
    }

    /// Planes held by this display's pending, in-flight and active compositions
    pub fn claimed_planes(&self) -> HashSet<PlaneId> {
        self.lock().claimed_planes()
    }

    /// Number of compositions shown so far
    pub fn frames_shown(&self) -> u64 {
        self.lock().frames_shown
    }

    /// Number of completion waits that timed out
    pub fn stalls(&self) -> u64 {
        self.lock().stalls
    }

    /// Accept `composition` as the next frame
    ///
    /// Fails with [`Error::Busy`] if a composition is already queued or being applied.
    pub fn queue_composition(&self, composition: Composition) -> Result<(), Error> {
        let _guard = self.shared.span.enter();
        let mut inner = self.lock();
        if inner.shutdown {
            return Err(Error::Discarded(self.shared.display));
        }
        if matches!(inner.state(), DisplayState::Queued | DisplayState::Applying) {
            debug!(frame = composition.frame(), "Display busy, rejecting composition");
            return Err(Error::Busy(self.shared.display));
        }

        trace!(frame = composition.frame(), "Queued composition");
        inner.pending = Some(Pending {
            composition,
            reply: None,
        });
        self.shared.claims.set(self.shared.display, inner.claimed_planes());
        Ok(())
    }

    /// Ask the worker to apply the queued composition
    ///
    /// Returns a receiver for the commit result, or `None` if nothing is queued.
    /// The result arrives once the commit was issued, which may require waiting
    /// for the previous commit to be shown first.
    pub fn begin_composite(&self) -> Option<Receiver<Result<(), Error>>> {
        let mut inner = self.lock();
        let pending = inner.pending.as_mut()?;
        let (tx, rx) = mpsc::channel();
        pending.reply = Some(tx);
        self.shared.wakeup.notify_all();
        Some(rx)
    }

    /// Apply the queued composition, blocking until the commit was issued
    ///
    /// Returns `Ok(())` if nothing was queued. A rejected commit discards the
    /// composition and returns [`Error::CommitRejected`].
    pub fn composite(&self) -> Result<(), Error> {
        match self.begin_composite() {
            Some(rx) => rx.recv().unwrap_or(Err(Error::Discarded(self.shared.display))),
            None => Ok(()),
        }
    }

    /// Mode-set on the next commit, e.g. after the active mode changed
    pub fn request_modeset(&self) {
        self.lock().needs_modeset = true;
    }

    /// Blank the display right away
    ///
    /// Queued and in-flight compositions are discarded without signaling their
    /// retire fences; the active composition is retired. The compositor is
    /// `Idle` afterwards.
    pub fn clear_display(&self) -> Result<(), Error> {
        let _guard = self.shared.span.enter();
        let mut inner = self.lock();
        self.shared.clear(&mut inner, None)
    }

    /// Clear the display and switch its crtc off
    pub fn disable(&self) -> Result<(), Error> {
        let _guard = self.shared.span.enter();
        let mut inner = self.lock();
        self.shared.clear(&mut inner, Some(Modeset::Disable))
    }

    /// Write the compositor's state in human readable form
    pub fn dump(&self, out: &mut impl Write) -> fmt::Result {
        let inner = self.lock();
        let pipeline = self.shared.pipeline;
        writeln!(
            out,
            "Display {} (connector {}, encoder {}, crtc {}):",
            self.shared.display, pipeline.connector, pipeline.encoder, pipeline.crtc
        )?;
        writeln!(out, "\tstate\tenabled\tcommitted\tshown\tstalls")?;
        writeln!(
            out,
            "\t{}\t{}\t{}\t{}\t{}",
            inner.state(),
            inner.enabled,
            inner.frames_committed,
            inner.frames_shown,
            inner.stalls
        )?;
        if let Some(event) = inner.last_event {
            writeln!(out, "\tlast completion: frame {} at {:?}", event.frame, event.time)?;
        }
        if let Some(err) = &inner.last_error {
            writeln!(out, "\tlast error: {}", err)?;
        }
        if let Some(active) = &inner.active {
            writeln!(out, "\tactive composition (frame {}):", active.frame())?;
            writeln!(out, "\t\tlayer\tplacement\tframe")?;
            for (idx, layer) in active.layers().iter().enumerate() {
                let placement = match active.assignment().and_then(|a| a.plane_for(idx)) {
                    Some(plane) => format!("plane {}", plane),
                    None => "client".into(),
                };
                writeln!(out, "\t\t{}\t{}\t{}", idx, placement, layer.display_frame())?;
            }
        }
        Ok(())
    }
}

impl Drop for DisplayCompositor {
    fn drop(&mut self) {
        {
            let mut inner = self.lock();
            inner.shutdown = true;
            self.shared.wakeup.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(display = ?self.shared.display, "Display worker panicked");
            }
        }

        let mut inner = self.lock();
        if let Some(pending) = inner.pending.take() {
            pending.composition.discard();
        }
        if let Some(in_flight) = inner.in_flight.take() {
            in_flight.composition.discard();
        }
        if let Some(active) = inner.active.take() {
            active.retire(None);
        }
        self.shared.claims.remove(self.shared.display);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn run(self: Arc<Self>) {
        let _guard = self.span.enter();
        debug!("Display worker running");

        loop {
            let mut inner = self.lock();
            loop {
                if inner.shutdown {
                    debug!("Display worker stopping");
                    return;
                }
                let ready = inner.pending.as_ref().map(|p| p.reply.is_some()).unwrap_or(false);
                if inner.in_flight.is_some() || inner.stale_events > 0 || ready {
                    break;
                }
                inner = self.wakeup.wait(inner).unwrap();
            }

            if inner.stale_events > 0 {
                drop(inner);
                self.consume_stale_event();
            } else if inner.in_flight.is_some() {
                drop(inner);
                self.wait_for_completion();
            } else {
                self.apply_pending(inner);
            }
        }
    }

    fn consume_stale_event(&self) {
        let result = self
            .device
            .wait_for_completion(self.pipeline.crtc, self.config.commit_timeout);
        let mut inner = self.lock();
        inner.stale_events = inner.stale_events.saturating_sub(1);
        match result {
            Ok(Some(event)) => trace!(frame = event.frame, "Dropped completion of a discarded commit"),
            Ok(None) => debug!("No completion for discarded commit"),
            Err(err) => warn!("Failed to wait for discarded commit: {}", err),
        }
    }

    fn wait_for_completion(&self) {
        let generation = self.lock().generation;
        let result = self
            .device
            .wait_for_completion(self.pipeline.crtc, self.config.commit_timeout);

        let mut inner = self.lock();
        if inner.generation != generation {
            // cleared while waiting, this completion belonged to the discarded commit
            if matches!(result, Ok(Some(_))) {
                inner.stale_events = inner.stale_events.saturating_sub(1);
            }
            return;
        }

        match result {
            Ok(Some(event)) => self.complete(&mut inner, event),
            Ok(None) => {
                inner.stalls += 1;
                inner.consecutive_stalls += 1;
                warn!(
                    timeout = ?self.config.commit_timeout,
                    stalls = inner.stalls,
                    "Commit did not complete in time, device may be stalled"
                );
                if inner.consecutive_stalls >= self.config.stall_limit {
                    self.give_up(&mut inner);
                }
            }
            Err(err) => {
                // without events we cannot tell when the frame is shown
                error!("Failed to wait for commit completion: {}", err);
                inner.last_error = Some(err.to_string());
                let event = CompletionEvent {
                    crtc: self.pipeline.crtc,
                    frame: 0,
                    time: Default::default(),
                };
                self.complete(&mut inner, event);
            }
        }
    }

    #[profiling::function]
    fn complete(&self, inner: &mut Inner, event: CompletionEvent) {
        let Some(in_flight) = inner.in_flight.take() else {
            return;
        };
        trace!(frame = in_flight.composition.frame(), vblank = event.frame, "Composition shown");
        inner.consecutive_stalls = 0;

        if let Some(previous) = inner.active.take() {
            previous.retire(in_flight.out_fence.as_ref().map(|fd| fd.as_fd()));
        }
        self.registry
            .write()
            .unwrap()
            .claim_planes(self.pipeline.crtc, &in_flight.planes);
        inner.active = Some(in_flight.composition);
        inner.frames_shown += 1;
        inner.last_event = Some(event);
        self.claims.set(self.display, inner.claimed_planes());
        self.wakeup.notify_all();
    }

    /// Drop the in-flight commit after `stall_limit` timeouts
    ///
    /// The composition waiting behind it fails with [`Error::Stalled`] and the
    /// next commit performs a full mode-set.
    fn give_up(&self, inner: &mut Inner) {
        let Some(in_flight) = inner.in_flight.take() else {
            return;
        };
        error!(
            frame = in_flight.composition.frame(),
            stalls = inner.consecutive_stalls,
            "Giving up on commit that never completed"
        );
        in_flight.composition.discard();
        // a completion may still arrive late
        inner.stale_events += 1;
        inner.consecutive_stalls = 0;
        inner.needs_modeset = true;
        inner.last_error = Some(Error::Stalled(self.display).to_string());

        if let Some(pending) = inner.pending.take() {
            debug!(frame = pending.composition.frame(), "Failing composition queued behind stalled commit");
            pending.composition.discard();
            respond(pending.reply, Err(Error::Stalled(self.display)));
        }
        self.claims.set(self.display, inner.claimed_planes());
        self.wakeup.notify_all();
    }

    #[profiling::function]
    fn apply_pending(&self, mut inner: MutexGuard<'_, Inner>) {
        let Some(Pending { mut composition, reply }) = inner.pending.take() else {
            return;
        };
        let generation = inner.generation;
        inner.applying = true;
        let others = self.claims.others(self.display);
        drop(inner);

        let mode = {
            let registry = self.registry.read().unwrap();
            let stale = composition
                .assignment()
                .filter(|assignment| assignment.topology_version() != registry.version())
                .cloned();
            if let Some(mut assignment) = stale {
                let demoted = assignment.revalidate(composition.layers(), &registry, &others);
                if demoted > 0 {
                    warn!(demoted, "Topology changed, layers moved to client composition");
                }
                composition.set_assignment(assignment);
            }
            registry
                .connector(self.pipeline.connector)
                .and_then(|conn| conn.active_mode())
                .map(|mode| mode.info().clone())
        };

        if !self.device.supports_in_fences() {
            self.wait_for_fences(&composition);
        }

        let mut inner = self.lock();
        inner.applying = false;
        if inner.generation != generation || inner.shutdown {
            debug!(frame = composition.frame(), "Display cleared, discarding composition");
            composition.discard();
            respond(reply, Err(Error::Discarded(self.display)));
            self.wakeup.notify_all();
            return;
        }

        let planes: Vec<PlaneId> = composition
            .assignment()
            .map(|a| a.planes().map(|(_, plane)| plane).collect())
            .unwrap_or_default();
        let disable: Vec<PlaneId> = inner
            .used_planes
            .iter()
            .copied()
            .filter(|plane| !planes.contains(plane))
            .collect();
        let modeset = match (&mode, inner.needs_modeset || !inner.enabled) {
            (Some(mode), true) => Some(Modeset::Enable(mode)),
            _ => None,
        };

        let result = {
            let request = self.build_request(&composition, modeset, disable);
            self.device.commit(&request)
        };

        match result {
            Ok(output) => {
                trace!(frame = composition.frame(), planes = planes.len(), "Committed composition");
                if modeset.is_some() {
                    inner.needs_modeset = false;
                    inner.enabled = true;
                }
                inner.used_planes = planes.clone();
                inner.frames_committed += 1;
                inner.in_flight = Some(InFlight {
                    composition,
                    planes,
                    out_fence: output.out_fence,
                });
                respond(reply, Ok(()));
            }
            Err(err) => {
                let err = Error::from_commit(self.pipeline.crtc, err);
                error!(frame = composition.frame(), "Commit failed: {}", err);
                inner.last_error = Some(err.to_string());
                composition.discard();
                respond(reply, Err(err));
            }
        }
        self.claims.set(self.display, inner.claimed_planes());
        self.wakeup.notify_all();
    }

    fn wait_for_fences(&self, composition: &Composition) {
        let Some(assignment) = composition.assignment() else {
            return;
        };
        for (idx, _) in assignment.planes() {
            let fence = composition.layers()[idx].acquire_fence();
            match fence.wait(self.config.fence_timeout) {
                Ok(true) => {}
                Ok(false) => warn!(layer = idx, "Acquire fence not signaled in time, committing anyway"),
                Err(err) => warn!(layer = idx, "Failed to wait for acquire fence: {}", err),
            }
        }
    }

    fn build_request<'a>(
        &self,
        composition: &'a Composition,
        modeset: Option<Modeset<'a>>,
        disable: Vec<PlaneId>,
    ) -> CommitRequest<'a> {
        let in_fences = self.device.supports_in_fences();
        let registry = self.registry.read().unwrap();
        let planes = composition
            .assignment()
            .into_iter()
            .flat_map(|assignment| assignment.planes())
            .filter_map(|(idx, plane)| {
                let layer = &composition.layers()[idx];
                let buffer = layer.buffer()?;
                let fence_cap = registry
                    .plane(plane)
                    .map(|p| p.caps().contains(PlaneCaps::IN_FENCE))
                    .unwrap_or(false);
                Some(PlaneCommit {
                    plane,
                    framebuffer: buffer.framebuffer(),
                    src: layer.source_crop(),
                    dst: layer.display_frame(),
                    transform: layer.transform(),
                    alpha: layer.alpha(),
                    blending: layer.blending(),
                    in_fence: layer.acquire_fence().as_fd().filter(|_| in_fences && fence_cap),
                })
            })
            .collect();

        CommitRequest {
            crtc: self.pipeline.crtc,
            connector: self.pipeline.connector,
            modeset,
            planes,
            disable,
            event: true,
            test_only: false,
        }
    }

    fn clear(&self, inner: &mut Inner, modeset: Option<Modeset<'static>>) -> Result<(), Error> {
        inner.generation += 1;
        // a running apply sees the new generation and discards its composition
        inner.applying = false;
        inner.consecutive_stalls = 0;
        let pending = inner.pending.take();
        let in_flight = inner.in_flight.take();
        if in_flight.is_some() {
            inner.stale_events += 1;
        }

        let result = if inner.enabled || !inner.used_planes.is_empty() {
            let request = CommitRequest {
                crtc: self.pipeline.crtc,
                connector: self.pipeline.connector,
                modeset,
                planes: Vec::new(),
                disable: inner.used_planes.clone(),
                event: false,
                test_only: false,
            };
            self.device.commit(&request)
        } else {
            Ok(Default::default())
        };

        if let Some(pending) = pending {
            debug!(frame = pending.composition.frame(), "Discarding queued composition");
            pending.composition.discard();
            respond(pending.reply, Err(Error::Discarded(self.display)));
        }
        if let Some(in_flight) = in_flight {
            debug!(frame = in_flight.composition.frame(), "Discarding in-flight composition");
            in_flight.composition.discard();
        }

        match result {
            Ok(_) => {
                if let Some(active) = inner.active.take() {
                    active.retire(None);
                }
                inner.used_planes.clear();
                if matches!(modeset, Some(Modeset::Disable)) {
                    inner.enabled = false;
                    inner.needs_modeset = true;
                }
                self.registry.write().unwrap().claim_planes(self.pipeline.crtc, &[]);
                self.claims.set(self.display, inner.claimed_planes());
                self.wakeup.notify_all();
                info!("Display cleared");
                Ok(())
            }
            Err(err) => {
                let err = Error::from_commit(self.pipeline.crtc, err);
                error!("Failed to blank display: {}", err);
                inner.last_error = Some(err.to_string());
                self.claims.set(self.display, inner.claimed_planes());
                self.wakeup.notify_all();
                Err(err)
            }
        }
    }
}

fn respond(reply: Option<Reply>, result: Result<(), Error>) {
    if let Some(reply) = reply {
        // the caller may have stopped waiting
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{
        allocator::{Fourcc, Importer},
        drm::{
            compositor::planner::Planner,
            device::test::{test_buffer, RecordedModeset, TestDevice, TestImporter},
            layer::LayerDescription,
        },
        sync::FenceSlot,
    };
    use crate::utils::Rectangle;

    struct Fixture {
        device: Arc<TestDevice>,
        registry: Arc<RwLock<ResourceRegistry>>,
        importer: Arc<TestImporter>,
        compositor: DisplayCompositor,
        frame: u64,
    }

    fn fixture(auto_complete: bool) -> Fixture {
        fixture_with(
            auto_complete,
            CompositorConfig {
                commit_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        )
    }

    fn fixture_with(auto_complete: bool, config: CompositorConfig) -> Fixture {
        let device = Arc::new(TestDevice::single_display(2));
        device.set_auto_complete(auto_complete);
        let mut registry = ResourceRegistry::initialize(&*device).unwrap();
        registry.assign_displays();
        let pipeline = registry.bind_display(DisplayId(0)).unwrap();
        let registry = Arc::new(RwLock::new(registry));
        let compositor = DisplayCompositor::new(
            pipeline,
            device.clone(),
            registry.clone(),
            Arc::new(PlaneClaims::default()),
            &config,
        )
        .unwrap();
        Fixture {
            device,
            registry,
            importer: Arc::new(TestImporter::new()),
            compositor,
            frame: 0,
        }
    }

    impl Fixture {
        fn composition(&mut self, retire: &FenceSlot) -> Composition {
            self.composition_with_fence(retire, None)
        }

        fn composition_with_fence(&mut self, retire: &FenceSlot, acquire: Option<OwnedFd>) -> Composition {
            self.frame += 1;
            let importer: Arc<dyn Importer> = self.importer.clone();
            let mut composition = Composition::new(self.frame, importer);
            composition.set_retire_fence(retire);
            let mut layer = LayerDescription::new(
                test_buffer(Fourcc::Xrgb8888, 1920, 1080),
                Rectangle::from_loc_and_size((0, 0), (1920, 1080)),
            );
            layer.acquire_fence = acquire;
            composition.add_layer(layer);
            let assignment = Planner::new(&CompositorConfig::default())
                .plan(
                    composition.layers(),
                    &self.registry.read().unwrap(),
                    DisplayId(0),
                    &HashSet::new(),
                )
                .unwrap();
            composition.set_assignment(assignment);
            composition
        }

        fn wait_for(&self, state: DisplayState) {
            for _ in 0..200 {
                if self.compositor.state() == state {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            panic!("display never reached {:?}", state);
        }
    }

    #[test]
    fn second_queue_is_busy() {
        let mut fixture = fixture(true);
        let retire = FenceSlot::new();
        let first = fixture.composition(&retire);
        let second = fixture.composition(&retire);
        fixture.compositor.queue_composition(first).unwrap();
        assert_eq!(fixture.compositor.state(), DisplayState::Queued);
        assert!(matches!(
            fixture.compositor.queue_composition(second),
            Err(Error::Busy(DisplayId(0)))
        ));
    }

    #[test]
    fn first_commit_is_a_modeset() {
        let mut fixture = fixture(true);
        let retire = FenceSlot::new();
        let composition = fixture.composition(&retire);
        fixture.compositor.queue_composition(composition).unwrap();
        fixture.compositor.composite().unwrap();
        fixture.wait_for(DisplayState::Idle);

        let commit = fixture.device.last_commit().unwrap();
        assert!(matches!(commit.modeset, Some(RecordedModeset::Enable(_))));
        assert_eq!(commit.planes.len(), 1);
        assert!(fixture.device.crtc_active(commit.crtc));

        let composition = fixture.composition(&retire);
        fixture.compositor.queue_composition(composition).unwrap();
        fixture.compositor.composite().unwrap();
        assert_eq!(fixture.device.last_commit().unwrap().modeset, None);
    }

    #[test]
    fn compositions_retire_in_order() {
        let mut fixture = fixture(false);
        let crtc = fixture.compositor.pipeline().crtc;
        let retire_a = FenceSlot::new();
        let retire_b = FenceSlot::new();

        let a = fixture.composition(&retire_a);
        fixture.compositor.queue_composition(a).unwrap();
        fixture.compositor.composite().unwrap();
        assert_eq!(fixture.compositor.state(), DisplayState::Committed);

        // accepted while the previous commit is in flight
        let b = fixture.composition(&retire_b);
        fixture.compositor.queue_composition(b).unwrap();
        let rx = fixture.compositor.begin_composite().unwrap();

        assert!(fixture.device.complete(crtc));
        rx.recv().unwrap().unwrap();
        // a is active now, nothing retired yet
        assert_eq!(retire_a.signal_count(), 0);
        assert_eq!(fixture.importer.live_imports(), 2);

        assert!(fixture.device.complete(crtc));
        fixture.wait_for(DisplayState::Idle);
        while fixture.compositor.frames_shown() < 2 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(retire_a.signal_count(), 1);
        assert_eq!(retire_b.signal_count(), 0);
        assert_eq!(fixture.importer.live_imports(), 1);
    }

    #[test]
    fn rejected_commit_discards_composition() {
        let mut fixture = fixture(true);
        fixture.device.reject_commits(1);
        let retire = FenceSlot::new();
        let composition = fixture.composition(&retire);
        fixture.compositor.queue_composition(composition).unwrap();
        assert!(matches!(
            fixture.compositor.composite(),
            Err(Error::CommitRejected { .. })
        ));
        assert_eq!(fixture.compositor.state(), DisplayState::Idle);
        assert_eq!(fixture.importer.live_imports(), 0);
        assert_eq!(retire.signal_count(), 0);

        // a replanned composition goes through
        let composition = fixture.composition(&retire);
        fixture.compositor.queue_composition(composition).unwrap();
        fixture.compositor.composite().unwrap();
    }

    #[test]
    fn clear_while_committed_discards() {
        let mut fixture = fixture(false);
        let retire = FenceSlot::new();
        let composition = fixture.composition(&retire);
        fixture.compositor.queue_composition(composition).unwrap();
        fixture.compositor.composite().unwrap();
        assert_eq!(fixture.compositor.state(), DisplayState::Committed);

        fixture.compositor.clear_display().unwrap();
        assert_eq!(fixture.compositor.state(), DisplayState::Idle);
        assert_eq!(fixture.importer.live_imports(), 0);
        assert!(fixture.compositor.claimed_planes().is_empty());

        // a late completion of the discarded commit changes nothing
        fixture.device.complete(fixture.compositor.pipeline().crtc);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(retire.signal_count(), 0);
        assert_eq!(fixture.compositor.frames_shown(), 0);

        let blank = fixture.device.last_commit().unwrap();
        assert!(blank.planes.is_empty());
        assert_eq!(blank.disabled.len(), 1);
    }

    #[test]
    fn clear_discards_queued_composition() {
        let mut fixture = fixture(true);
        let retire = FenceSlot::new();
        let composition = fixture.composition(&retire);
        fixture.compositor.queue_composition(composition).unwrap();
        fixture.compositor.clear_display().unwrap();
        assert_eq!(fixture.compositor.state(), DisplayState::Idle);
        assert_eq!(fixture.importer.live_imports(), 0);
        assert_eq!(retire.signal_count(), 0);
        // nothing was ever committed, so there was nothing to blank
        assert_eq!(fixture.device.commit_count(), 0);
    }

    #[test]
    fn clear_while_applying_returns_to_idle() {
        let mut fixture = fixture_with(
            true,
            CompositorConfig {
                fence_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );
        fixture.device.set_in_fences(false);
        let retire = FenceSlot::new();
        let fence = rustix::event::eventfd(0, rustix::event::EventfdFlags::CLOEXEC).unwrap();
        let signal = fence.try_clone().unwrap();
        let composition = fixture.composition_with_fence(&retire, Some(fence));
        fixture.compositor.queue_composition(composition).unwrap();
        let rx = fixture.compositor.begin_composite().unwrap();
        // the worker blocks on the unsignaled acquire fence
        fixture.wait_for(DisplayState::Applying);

        fixture.compositor.clear_display().unwrap();
        assert_eq!(fixture.compositor.state(), DisplayState::Idle);
        let next = fixture.composition(&retire);
        fixture.compositor.queue_composition(next).unwrap();
        assert_eq!(fixture.compositor.state(), DisplayState::Queued);

        rustix::io::write(&signal, &1u64.to_ne_bytes()).unwrap();
        assert!(matches!(rx.recv().unwrap(), Err(Error::Discarded(DisplayId(0)))));
        assert_eq!(fixture.device.commit_count(), 0);
        assert_eq!(fixture.compositor.state(), DisplayState::Queued);
        assert_eq!(retire.signal_count(), 0);
    }

    #[test]
    fn stalled_commit_is_given_up() {
        let mut fixture = fixture_with(
            false,
            CompositorConfig {
                commit_timeout: Duration::from_millis(20),
                stall_limit: 3,
                ..Default::default()
            },
        );
        let retire = FenceSlot::new();
        let composition = fixture.composition(&retire);
        fixture.compositor.queue_composition(composition).unwrap();
        fixture.compositor.composite().unwrap();
        assert_eq!(fixture.compositor.state(), DisplayState::Committed);

        fixture.wait_for(DisplayState::Idle);
        assert!(fixture.compositor.stalls() >= 3);
        assert_eq!(fixture.compositor.frames_shown(), 0);
        assert_eq!(fixture.importer.live_imports(), 0);
        assert_eq!(retire.signal_count(), 0);

        // the display is brought up again with a full mode-set
        let composition = fixture.composition(&retire);
        fixture.compositor.queue_composition(composition).unwrap();
        fixture.compositor.composite().unwrap();
        let commit = fixture.device.last_commit().unwrap();
        assert!(matches!(commit.modeset, Some(RecordedModeset::Enable(_))));
    }

    #[test]
    fn composition_behind_stalled_commit_fails() {
        let mut fixture = fixture_with(
            false,
            CompositorConfig {
                commit_timeout: Duration::from_millis(100),
                stall_limit: 3,
                ..Default::default()
            },
        );
        let retire = FenceSlot::new();
        let first = fixture.composition(&retire);
        fixture.compositor.queue_composition(first).unwrap();
        fixture.compositor.composite().unwrap();

        let second = fixture.composition(&retire);
        fixture.compositor.queue_composition(second).unwrap();
        assert!(matches!(
            fixture.compositor.composite(),
            Err(Error::Stalled(DisplayId(0)))
        ));
        assert_eq!(fixture.compositor.state(), DisplayState::Idle);
        assert_eq!(fixture.importer.live_imports(), 0);
        assert_eq!(fixture.device.commit_count(), 1);
    }

    #[test]
    fn dump_reports_state() {
        let mut fixture = fixture(true);
        let retire = FenceSlot::new();
        let composition = fixture.composition(&retire);
        fixture.compositor.queue_composition(composition).unwrap();
        fixture.compositor.composite().unwrap();
        fixture.wait_for(DisplayState::Idle);
        while fixture.compositor.frames_shown() < 1 {
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut out = String::new();
        fixture.compositor.dump(&mut out).unwrap();
        assert!(out.contains("Display 0"));
        assert!(out.contains("idle"));
        assert!(out.contains("plane"));
    }
}
