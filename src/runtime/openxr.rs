#[cfg(windows)]
pub mod native;

use super::{
    is_invalid_display_time, Eye, Hand, Matrices, RawProjection, RuntimeError, RuntimeKind,
    RuntimeResult, RuntimeState, VrRuntime,
};
use crate::{
    config::{ConfigProvider, RenderingMethod},
    convert::{
        apply_pitch_offset, apply_projection_overrides, mat4_to_pose, pose_to_mat4,
        projection_from_raw,
    },
    pipeline::{PipelineEntry, PipelineQueue},
    tracy_span,
};
use log::{debug, info, trace, warn};
use openxr as xr;
use std::sync::{atomic::Ordering, Arc, Mutex, MutexGuard, PoisonError};

pub type XrResult<T = ()> = Result<T, xr::sys::Result>;

slotmap::new_key_type! {
    pub struct SwapchainKey;
}

#[derive(Copy, Clone, Debug)]
pub struct FrameState {
    pub predicted_display_time: xr::Time,
    pub predicted_display_period: xr::Duration,
    pub should_render: bool,
}

impl Default for FrameState {
    fn default() -> Self {
        Self {
            predicted_display_time: xr::Time::from_nanos(0),
            predicted_display_period: xr::Duration::from_nanos(0),
            should_render: false,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct EyeView {
    pub pose: xr::Posef,
    pub fov: xr::Fovf,
}

impl Default for EyeView {
    fn default() -> Self {
        Self {
            pose: xr::Posef::IDENTITY,
            fov: xr::Fovf {
                angle_left: 0.0,
                angle_right: 0.0,
                angle_up: 0.0,
                angle_down: 0.0,
            },
        }
    }
}

/// Everything the game thread predicted for one frame.
#[derive(Copy, Clone, Debug)]
pub struct XrFrameData {
    pub frame_state: FrameState,
    pub view_space_location: xr::Posef,
    pub view_space_views: [EyeView; 2],
    pub stage_views: [EyeView; 2],
    /// Copied ahead from the previous frame so the partner eye shares its prediction.
    pub seeded: bool,
}

impl Default for XrFrameData {
    fn default() -> Self {
        Self {
            frame_state: FrameState::default(),
            view_space_location: xr::Posef::IDENTITY,
            view_space_views: Default::default(),
            stage_views: Default::default(),
            seeded: false,
        }
    }
}

pub type XrPipelineState = PipelineEntry<XrFrameData>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReferenceSpace {
    View,
    Stage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TrackedSpace {
    View,
    Aim(Hand),
    Grip(Hand),
}

#[derive(Copy, Clone, Debug)]
pub enum SessionEvent {
    StateChanged(xr::SessionState),
    InstanceLossPending,
    ReferenceSpaceChangePending,
    InteractionProfileChanged,
    EventsLost(u32),
}

/// A swapchain image as the graphics API sees it: an `ID3D11Texture2D*` or `ID3D12Resource*`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RawImage(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapchainUsage {
    Color,
    DepthStencil,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    /// `DXGI_FORMAT`
    pub format: u32,
    pub usage: SwapchainUsage,
    pub static_image: bool,
}

#[derive(Copy, Clone, Debug)]
pub struct DepthInfo {
    pub swapchain: SwapchainKey,
    pub rect: xr::Rect2Di,
    pub min_depth: f32,
    pub max_depth: f32,
    pub near_z: f32,
    pub far_z: f32,
}

#[derive(Copy, Clone, Debug)]
pub struct ProjectionView {
    pub swapchain: SwapchainKey,
    pub rect: xr::Rect2Di,
    pub pose: xr::Posef,
    pub fov: xr::Fovf,
    pub depth: Option<DepthInfo>,
}

#[derive(Copy, Clone, Debug)]
pub enum CompositionLayer {
    Projection {
        views: [ProjectionView; 2],
    },
    Quad {
        space: ReferenceSpace,
        swapchain: SwapchainKey,
        rect: xr::Rect2Di,
        pose: xr::Posef,
        size: xr::Extent2Df,
    },
    Cylinder {
        space: ReferenceSpace,
        swapchain: SwapchainKey,
        rect: xr::Rect2Di,
        pose: xr::Posef,
        radius: f32,
        central_angle: f32,
        aspect_ratio: f32,
    },
}

/// Blocks in `xrWaitFrame`. Kept apart from the session so a pending wait never holds the
/// locks the game thread needs.
pub trait FrameWaiter: Send {
    fn wait_frame(&mut self) -> XrResult<FrameState>;
}

/// The slice of an OpenXR session the presentation core drives. Projection layers are always
/// submitted in stage space.
pub trait XrSession: Send {
    /// Hands out the session's frame waiter. Only the first call returns it.
    fn take_frame_waiter(&mut self) -> Option<Box<dyn FrameWaiter>>;

    fn begin_frame(&mut self) -> XrResult;
    fn end_frame(&mut self, display_time: xr::Time, layers: &[CompositionLayer]) -> XrResult;

    fn locate_views(&mut self, time: xr::Time, space: ReferenceSpace) -> XrResult<[EyeView; 2]>;
    /// `None` when the runtime has no valid position and orientation for the space.
    fn locate(&mut self, space: TrackedSpace, time: xr::Time) -> XrResult<Option<xr::Posef>>;
    fn sync_actions(&mut self) -> XrResult;

    fn poll_event(&mut self) -> XrResult<Option<SessionEvent>>;

    fn recommended_resolution(&self) -> (u32, u32);
    fn supports_depth(&self) -> bool;
    fn color_format(&self) -> u32;
    fn depth_format(&self) -> u32;

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> XrResult<SwapchainKey>;
    fn destroy_swapchain(&mut self, key: SwapchainKey);
    fn swapchain_images(&self, key: SwapchainKey) -> XrResult<Vec<RawImage>>;
    fn acquire_image(&mut self, key: SwapchainKey) -> XrResult<u32>;
    fn wait_image(&mut self, key: SwapchainKey, timeout: xr::Duration) -> XrResult;
    fn release_image(&mut self, key: SwapchainKey) -> XrResult;

    fn begin_session(&mut self) -> XrResult;
    fn end_session(&mut self) -> XrResult;
    fn request_exit(&mut self) -> XrResult;
}

#[derive(Default)]
struct FrameLifecycle {
    running: bool,
    session_state: Option<xr::SessionState>,
    /// Waited on, not begun yet.
    synced: Option<FrameState>,
    begun: Option<FrameState>,
    /// The most recent wait, kept after the frame is begun so the game thread can predict with it.
    last_waited: Option<FrameState>,
}

impl FrameLifecycle {
    fn needs_wait(&self) -> RuntimeResult<bool> {
        if !self.running {
            return Err(RuntimeError::NoSession);
        }
        Ok(self.synced.is_none())
    }
}

pub struct OpenXrRuntime {
    state: RuntimeState,
    config: Arc<dyn ConfigProvider>,
    session: Mutex<Box<dyn XrSession>>,
    /// Lock order: `waiter` before `frame`, never while holding `frame` or `session`.
    waiter: Mutex<Option<Box<dyn FrameWaiter>>>,
    frame: Mutex<FrameLifecycle>,
    queue: PipelineQueue<XrFrameData>,
}

impl OpenXrRuntime {
    pub fn new(mut session: Box<dyn XrSession>, config: Arc<dyn ConfigProvider>) -> Self {
        let state = RuntimeState::default();
        let waiter = session.take_frame_waiter();
        if waiter.is_none() {
            warn!("OpenXR session has no frame waiter, frames will never be synchronized");
        }
        state.loaded.store(true, Ordering::Release);
        state.matrices.write().unwrap().resolution = session.recommended_resolution();

        Self {
            state,
            config,
            session: Mutex::new(session),
            waiter: Mutex::new(waiter),
            frame: Mutex::default(),
            queue: PipelineQueue::new(),
        }
    }

    #[inline]
    pub fn session(&self) -> MutexGuard<'_, Box<dyn XrSession>> {
        self.session.lock().unwrap()
    }

    pub fn session_running(&self) -> bool {
        self.frame.lock().unwrap().running
    }

    pub fn session_state(&self) -> Option<xr::SessionState> {
        self.frame.lock().unwrap().session_state
    }

    pub fn frame_synchronized(&self) -> bool {
        self.frame.lock().unwrap().synced.is_some()
    }

    pub fn frame_begun(&self) -> bool {
        self.frame.lock().unwrap().begun.is_some()
    }

    /// Starts the frame waited on by [`VrRuntime::synchronize_frame`]. A no-op while a frame is
    /// already begun.
    pub fn begin_frame(&self) -> RuntimeResult {
        tracy_span!("OpenXrRuntime::begin_frame");
        let mut frame = self.frame.lock().unwrap();
        if frame.begun.is_some() {
            return Ok(());
        }
        if !frame.running {
            return Err(RuntimeError::NoSession);
        }
        let Some(state) = frame.synced else {
            return Err(RuntimeError::NotReady);
        };

        self.session().begin_frame()?;
        frame.synced = None;
        frame.begun = Some(state);
        Ok(())
    }

    /// Ends the begun frame with the display time it was waited with. Layers are dropped when
    /// the runtime said the frame shouldn't be rendered.
    pub fn end_frame(&self, layers: &[CompositionLayer]) -> RuntimeResult {
        tracy_span!("OpenXrRuntime::end_frame");
        let mut frame = self.frame.lock().unwrap();
        let Some(state) = frame.begun.take() else {
            return Err(RuntimeError::NotReady);
        };

        let layers = if state.should_render { layers } else { &[] };
        self.session()
            .end_frame(state.predicted_display_time, layers)
            .map_err(|e| {
                warn!("xrEndFrame failed: {e:?}");
                RuntimeError::from(e)
            })
    }

    /// The prediction the render thread should submit with. `None` when nothing was queued for
    /// the current render frame.
    pub fn get_submit_state(&self) -> Option<XrPipelineState> {
        let frame_count = self.internal_render_frame_count();
        let state = self.queue.get(frame_count);
        if state.is_none() {
            crate::warn_once!("no predicted poses queued for render frame {}", frame_count);
        }
        state
    }

    pub fn get_current_stage_view(&self, eye: Eye) -> Option<EyeView> {
        self.get_submit_state()
            .map(|state| state.data.stage_views[eye as usize])
    }

    /// The eye's stage view rebuilt from the latest matrices, for render frames that have no
    /// predicted poses queued.
    pub fn latest_stage_view(&self, eye: Eye) -> EyeView {
        let matrices = self.state.matrices();
        EyeView {
            pose: mat4_to_pose(&(matrices.hmd * matrices.eyes[eye as usize])),
            fov: matrices.raw_projections[eye as usize].to_fov(),
        }
    }

    pub fn pipeline_state(&self, frame_count: u32) -> Option<XrPipelineState> {
        self.queue.get(frame_count)
    }

    pub fn supports_depth(&self) -> bool {
        self.session().supports_depth()
    }

    fn handle_state_change(&self, frame: &mut FrameLifecycle, state: xr::SessionState) {
        info!("OpenXR session state changed: {state:?}");
        frame.session_state = Some(state);

        match state {
            xr::SessionState::READY => match self.session().begin_session() {
                Ok(()) => {
                    info!("Began OpenXR session.");
                    frame.running = true;
                    self.state.hmd_active.store(true, Ordering::Release);
                }
                Err(e) => warn!("Failed to begin session: {e:?}"),
            },
            xr::SessionState::STOPPING => {
                if let Err(e) = self.session().end_session() {
                    warn!("Failed to end session: {e:?}");
                }
                frame.running = false;
                frame.synced = None;
                frame.begun = None;
                frame.last_waited = None;
                self.state.hmd_active.store(false, Ordering::Release);
            }
            xr::SessionState::EXITING | xr::SessionState::LOSS_PENDING => {
                self.state.wants_reinitialize.store(true, Ordering::Release);
                self.state.hmd_active.store(false, Ordering::Release);
            }
            _ => {}
        }
    }

    /// Aim then grip matrices for both hands, `None` where the runtime had no valid pose.
    fn locate_hands(
        &self,
        session: &mut dyn XrSession,
        time: xr::Time,
        pitch: f32,
    ) -> [[Option<glam::Mat4>; 2]; 2] {
        let mut out = [[None; 2]; 2];
        for hand in Hand::BOTH {
            for (i, space) in [TrackedSpace::Aim(hand), TrackedSpace::Grip(hand)]
                .into_iter()
                .enumerate()
            {
                match session.locate(space, time) {
                    Ok(pose) => {
                        out[i][hand as usize] =
                            pose.map(|p| apply_pitch_offset(pose_to_mat4(&p), pitch));
                    }
                    Err(e) => trace!("failed to locate {space:?}: {e:?}"),
                }
            }
        }
        out
    }
}

impl VrRuntime for OpenXrRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::OpenXr
    }

    fn state(&self) -> &RuntimeState {
        &self.state
    }

    fn synchronize_frame(&self, _frame_count: Option<u32>) -> RuntimeResult {
        tracy_span!("OpenXrRuntime::synchronize_frame");
        if !self.loaded() {
            return Err(RuntimeError::NotLoaded);
        }

        if !self.frame.lock().unwrap().needs_wait()? {
            return Ok(());
        }

        let mut waiter = self.waiter.lock().unwrap();
        // Another caller may have waited while we queued for the waiter.
        if !self.frame.lock().unwrap().needs_wait()? {
            return Ok(());
        }
        let Some(waiter) = waiter.as_mut() else {
            return Err(RuntimeError::NotReady);
        };
        let state = waiter.wait_frame()?;

        let mut frame = self.frame.lock().unwrap();
        if !frame.running {
            debug!("session stopped while waiting for a frame");
            return Err(RuntimeError::NoSession);
        }
        frame.synced = Some(state);
        frame.last_waited = Some(state);
        Ok(())
    }

    fn update_poses(&self, from_view_extensions: bool, frame_count: u32) -> RuntimeResult<u32> {
        tracy_span!("OpenXrRuntime::update_poses");
        if !self.loaded() {
            return Err(RuntimeError::NotLoaded);
        }

        let Some(frame_state) = self.frame.lock().unwrap().last_waited else {
            return Err(RuntimeError::NotReady);
        };
        if is_invalid_display_time(
            frame_state.predicted_display_time,
            frame_state.predicted_display_period,
        ) {
            crate::warn_once!(
                "runtime predicted display time {} with period {}, retrying",
                frame_state.predicted_display_time.as_nanos(),
                frame_state.predicted_display_period.as_nanos()
            );
            return Err(RuntimeError::InvalidDisplayTime);
        }

        let config = self.config.snapshot();
        let frame_count = if from_view_extensions && frame_count == 0 {
            self.state.next_frame_count(self.internal_render_frame_count().max(1))
        } else {
            self.state.next_frame_count(frame_count)
        };

        // The second tick of a synchronized frame renders with the first tick's prediction.
        if config.rendering_method == RenderingMethod::Synchronized {
            if let Some(seeded) = self.queue.get(frame_count).filter(|s| s.data.seeded) {
                trace!("frame {frame_count} reuses prediction of frame {}", seeded.prev_frame_count);
                return Ok(frame_count);
            }
        }

        let time = frame_state.predicted_display_time;
        let mut session = self.session();
        let view_space_views = session.locate_views(time, ReferenceSpace::View)?;
        let stage_views = session.locate_views(time, ReferenceSpace::Stage)?;
        let view_space_location = session.locate(TrackedSpace::View, time)?;

        if let Err(e) = session.sync_actions() {
            debug!("xrSyncActions failed: {e:?}");
        }
        let [aim, grip] =
            self.locate_hands(&mut **session, time, config.controller_pitch_offset);
        drop(session);

        self.state.got_first_poses.store(true, Ordering::Release);
        {
            let mut matrices = self.state.matrices.write().unwrap();
            if let Some(hmd) = view_space_location {
                matrices.hmd = pose_to_mat4(&hmd);
                self.state
                    .got_first_valid_poses
                    .store(true, Ordering::Release);
            }
            for hand in Hand::BOTH {
                let i = hand as usize;
                if let Some(aim) = aim[i] {
                    matrices.aim[i] = aim;
                }
                if let Some(grip) = grip[i] {
                    matrices.grip[i] = grip;
                }
            }
        }

        let data = XrFrameData {
            frame_state,
            view_space_location: view_space_location.unwrap_or(xr::Posef::IDENTITY),
            view_space_views,
            stage_views,
            seeded: false,
        };
        self.queue
            .enqueue(frame_count, data)
            .map_err(|e| RuntimeError::StaleFrame(e.attempted))?;

        // Only the left eye's tick predicts; the right eye's tick that follows reuses it.
        if config.rendering_method == RenderingMethod::Synchronized
            && frame_count % 2 == config.left_eye_interval
        {
            let seeded = XrFrameData {
                seeded: true,
                ..data
            };
            if self.queue.enqueue(frame_count + 1, seeded).is_err() {
                debug!("could not pre-seed frame {}", frame_count + 1);
            }
        }

        Ok(frame_count)
    }

    fn update_matrices(&self, near_z: f32, far_z: f32) -> RuntimeResult {
        tracy_span!("OpenXrRuntime::update_matrices");
        let Some(frame_state) = self.frame.lock().unwrap().last_waited else {
            return Err(RuntimeError::NotReady);
        };

        let config = self.config.snapshot();
        let mut session = self.session();
        let views = session.locate_views(frame_state.predicted_display_time, ReferenceSpace::View)?;
        let resolution = session.recommended_resolution();
        drop(session);

        let raw = apply_projection_overrides(
            [
                RawProjection::from_fov(views[0].fov),
                RawProjection::from_fov(views[1].fov),
            ],
            config.horizontal_projection_override,
            config.vertical_projection_override,
        );

        let mut matrices = self.state.matrices.write().unwrap();
        *matrices = Matrices {
            projections: raw.map(|r| projection_from_raw(&r, near_z, far_z)),
            raw_projections: raw,
            eyes: views.map(|v| pose_to_mat4(&v.pose)),
            resolution,
            ..matrices.clone()
        };
        Ok(())
    }

    fn consume_events(&self) -> RuntimeResult {
        loop {
            let event = self.session().poll_event()?;
            let Some(event) = event else {
                break;
            };

            match event {
                SessionEvent::StateChanged(state) => {
                    let mut frame = self.frame.lock().unwrap();
                    self.handle_state_change(&mut frame, state);
                }
                SessionEvent::InstanceLossPending => {
                    warn!("OpenXR instance loss pending");
                    self.state.wants_reinitialize.store(true, Ordering::Release);
                }
                SessionEvent::ReferenceSpaceChangePending => {
                    info!("reference space change pending");
                }
                SessionEvent::InteractionProfileChanged => {
                    info!("interaction profile changed");
                }
                SessionEvent::EventsLost(count) => warn!("lost {count} OpenXR events"),
            }
        }
        Ok(())
    }
}

impl Drop for OpenXrRuntime {
    fn drop(&mut self) {
        let frame = self.frame.get_mut().unwrap_or_else(PoisonError::into_inner);
        if frame.running {
            let session = self.session.get_mut().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = session.request_exit() {
                debug!("xrRequestExitSession failed during teardown: {e:?}");
            }
        }
    }
}
