use super::{
    Eye, Hand, RawProjection, RuntimeError, RuntimeKind, RuntimeResult, RuntimeState, VrRuntime,
};
use crate::{
    config::{ConfigProvider, HorizontalProjectionOverride, VerticalProjectionOverride},
    convert::{apply_pitch_offset, apply_projection_overrides, projection_from_raw},
    pipeline::{PipelineEntry, PipelineQueue},
    tracy_span,
};
use ::openvr as vr;
use glam::Mat4;
use log::{debug, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
};

/// Render poses returned by one `WaitGetPoses`.
#[derive(Clone, Debug, Default)]
pub struct VrPoses {
    pub poses: Vec<vr::TrackedDevicePose_t>,
}

impl VrPoses {
    pub fn hmd(&self) -> Option<&vr::TrackedDevicePose_t> {
        self.poses
            .get(vr::k_unTrackedDeviceIndex_Hmd as usize)
            .filter(|p| p.bPoseIsValid)
    }
}

pub type VrPoseState = PipelineEntry<VrPoses>;

/// Everything the cached matrices were built from besides the runtime's own eye data.
#[derive(Copy, Clone, Debug, PartialEq)]
struct MatrixInputs {
    near_z: f32,
    far_z: f32,
    horizontal: HorizontalProjectionOverride,
    vertical: VerticalProjectionOverride,
}

pub struct OpenVrRuntime {
    state: RuntimeState,
    config: Arc<dyn ConfigProvider>,
    api: Box<dyn vr::OpenVrApi>,
    queue: PipelineQueue<VrPoses>,
    render_poses: Mutex<Vec<vr::TrackedDevicePose_t>>,
    frame_synced: AtomicBool,
    matrices_dirty: AtomicBool,
    last_inputs: Mutex<Option<MatrixInputs>>,
    controllers: RwLock<[Option<vr::TrackedDeviceIndex_t>; 2]>,
}

impl OpenVrRuntime {
    pub fn new(api: Box<dyn vr::OpenVrApi>, config: Arc<dyn ConfigProvider>) -> Self {
        let state = RuntimeState::default();
        let present = api.is_hmd_present();
        state.loaded.store(present, Ordering::Release);
        state.hmd_active.store(present, Ordering::Release);
        state.matrices.write().unwrap().resolution = api.recommended_render_target_size();
        if !present {
            warn!("OpenVR reports no HMD present");
        }

        let runtime = Self {
            state,
            config,
            api,
            queue: PipelineQueue::new(),
            render_poses: Mutex::new(vec![
                Default::default();
                vr::k_unMaxTrackedDeviceCount as usize
            ]),
            frame_synced: false.into(),
            matrices_dirty: true.into(),
            last_inputs: Mutex::new(None),
            controllers: Default::default(),
        };
        runtime.refresh_controllers();
        runtime
    }

    pub fn frame_synchronized(&self) -> bool {
        self.frame_synced.load(Ordering::Acquire)
    }

    pub fn controller_index(&self, hand: Hand) -> Option<vr::TrackedDeviceIndex_t> {
        self.controllers.read().unwrap()[hand as usize]
    }

    pub fn pose_state(&self, frame_count: u32) -> Option<VrPoseState> {
        self.queue.get(frame_count)
    }

    /// Poses for the frame the render thread is working on. `None` when the game thread queued
    /// nothing under that frame count.
    pub fn get_submit_state(&self) -> Option<VrPoseState> {
        let frame = self.internal_render_frame_count();
        let state = self.queue.get(frame);
        if state.is_none() {
            crate::warn_once!("no render poses queued for frame {}", frame);
        }
        state
    }

    fn refresh_controllers(&self) {
        let mut found = [None; 2];
        for index in 1..vr::k_unMaxTrackedDeviceCount {
            if self.api.tracked_device_class(index) != vr::ETrackedDeviceClass::Controller {
                continue;
            }
            match self.api.controller_role(index) {
                vr::ETrackedControllerRole::LeftHand => found[Hand::Left as usize] = Some(index),
                vr::ETrackedControllerRole::RightHand => found[Hand::Right as usize] = Some(index),
                _ => {}
            }
        }
        debug!("controller indices: {found:?}");
        *self.controllers.write().unwrap() = found;
    }

    /// Submits one eye, stamped with the pose the frame was rendered with.
    pub fn submit_eye(
        &self,
        eye: Eye,
        texture: vr::Texture_t,
        bounds: &vr::VRTextureBounds_t,
    ) -> RuntimeResult {
        tracy_span!("OpenVrRuntime::submit_eye");
        let pose = self
            .get_submit_state()
            .and_then(|state| state.data.hmd().map(|p| p.mDeviceToAbsoluteTracking))
            .unwrap_or_else(|| glam::Affine3A::from_mat4(self.hmd_transform()).into());

        let texture = vr::VRTextureWithPose_t {
            _base: texture,
            mDeviceToAbsoluteTracking: pose,
        };

        match self.api.submit(
            eye.into(),
            &texture,
            bounds,
            vr::EVRSubmitFlags::TextureWithPose,
        ) {
            vr::EVRCompositorError::None => Ok(()),
            err => Err(err.into()),
        }
    }

    /// Hands the frame to the compositor. The next `synchronize_frame` waits again.
    pub fn end_frame(&self) {
        self.api.post_present_handoff();
        self.frame_synced.store(false, Ordering::Release);
    }
}

impl VrRuntime for OpenVrRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::OpenVr
    }

    fn state(&self) -> &RuntimeState {
        &self.state
    }

    fn synchronize_frame(&self, _frame_count: Option<u32>) -> RuntimeResult {
        tracy_span!("OpenVrRuntime::synchronize_frame");
        if !self.loaded() {
            return Err(RuntimeError::NotLoaded);
        }
        if self.frame_synced.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut poses = self.render_poses.lock().unwrap();
        match self.api.wait_get_poses(&mut poses) {
            vr::EVRCompositorError::None => {}
            err => {
                debug!("WaitGetPoses failed: {err:?}");
                return Err(err.into());
            }
        }

        self.frame_synced.store(true, Ordering::Release);
        self.state.got_first_poses.store(true, Ordering::Release);
        if poses[vr::k_unTrackedDeviceIndex_Hmd as usize].bPoseIsValid {
            self.state
                .got_first_valid_poses
                .store(true, Ordering::Release);
        }
        Ok(())
    }

    fn update_poses(&self, _from_view_extensions: bool, frame_count: u32) -> RuntimeResult<u32> {
        tracy_span!("OpenVrRuntime::update_poses");
        if !self.loaded() {
            return Err(RuntimeError::NotLoaded);
        }
        if !self.got_first_poses() {
            return Err(RuntimeError::NotReady);
        }

        let poses = self.render_poses.lock().unwrap().clone();
        let pitch = self.config.snapshot().controller_pitch_offset;
        let controllers = *self.controllers.read().unwrap();

        {
            let mut matrices = self.state.matrices.write().unwrap();
            let hmd = &poses[vr::k_unTrackedDeviceIndex_Hmd as usize];
            if hmd.bPoseIsValid {
                matrices.hmd = Mat4::from(hmd.mDeviceToAbsoluteTracking);
            }
            for hand in Hand::BOTH {
                let Some(pose) = controllers[hand as usize]
                    .and_then(|index| poses.get(index as usize))
                    .filter(|p| p.bPoseIsValid)
                else {
                    continue;
                };
                // OpenVR has a single controller pose; aim and grip share it.
                let mat = apply_pitch_offset(Mat4::from(pose.mDeviceToAbsoluteTracking), pitch);
                matrices.aim[hand as usize] = mat;
                matrices.grip[hand as usize] = mat;
            }
        }

        let frame_count = self.state.next_frame_count(frame_count);
        self.queue
            .enqueue(frame_count, VrPoses { poses })
            .map_err(|e| RuntimeError::StaleFrame(e.attempted))?;
        Ok(frame_count)
    }

    fn update_matrices(&self, near_z: f32, far_z: f32) -> RuntimeResult {
        tracy_span!("OpenVrRuntime::update_matrices");
        if !self.loaded() {
            return Err(RuntimeError::NotLoaded);
        }

        let config = self.config.snapshot();
        let inputs = MatrixInputs {
            near_z,
            far_z,
            horizontal: config.horizontal_projection_override,
            vertical: config.vertical_projection_override,
        };
        {
            let mut last = self.last_inputs.lock().unwrap();
            let dirty = self.matrices_dirty.swap(false, Ordering::AcqRel);
            if !dirty && *last == Some(inputs) {
                return Ok(());
            }
            *last = Some(inputs);
        }

        let raw = apply_projection_overrides(
            [vr::EVREye::Left, vr::EVREye::Right]
                .map(|eye| RawProjection::from_openvr(self.api.projection_raw(eye))),
            inputs.horizontal,
            inputs.vertical,
        );
        let eyes = [vr::EVREye::Left, vr::EVREye::Right]
            .map(|eye| Mat4::from(self.api.eye_to_head_transform(eye)));
        let resolution = self.api.recommended_render_target_size();

        let mut matrices = self.state.matrices.write().unwrap();
        matrices.raw_projections = raw;
        matrices.projections = raw.map(|r| projection_from_raw(&r, near_z, far_z));
        matrices.eyes = eyes;
        matrices.resolution = resolution;
        Ok(())
    }

    fn consume_events(&self) -> RuntimeResult {
        if !self.loaded() {
            return Err(RuntimeError::NotLoaded);
        }

        let mut refresh = false;
        while let Some(event) = self.api.poll_next_event() {
            match event.event_type() {
                vr::EVREventType::TrackedDeviceActivated
                | vr::EVREventType::TrackedDeviceDeactivated
                | vr::EVREventType::TrackedDeviceRoleChanged => refresh = true,
                vr::EVREventType::IpdChanged => {
                    info!("IPD changed");
                    self.matrices_dirty.store(true, Ordering::Release);
                }
                vr::EVREventType::Quit | vr::EVREventType::ProcessQuit => {
                    info!("OpenVR requested quit");
                    self.api.acknowledge_quit();
                    self.state.wants_reinitialize.store(true, Ordering::Release);
                    self.state.hmd_active.store(false, Ordering::Release);
                }
                vr::EVREventType::ChaperoneUniverseHasChanged => {
                    debug!("chaperone universe changed");
                }
                _ => {}
            }
        }

        if refresh {
            self.refresh_controllers();
        }

        if !self.wants_reinitialize() {
            self.state
                .hmd_active
                .store(self.api.is_hmd_present(), Ordering::Release);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SharedConfig};
    use crate::fake::FakeOpenVr;

    struct Fixture {
        runtime: OpenVrRuntime,
        api: FakeOpenVr,
        config: Arc<SharedConfig>,
    }

    impl Fixture {
        fn new() -> Self {
            crate::init_logging();
            let api = FakeOpenVr::new();
            let config = Arc::new(SharedConfig::new(Config::default()));
            let runtime = OpenVrRuntime::new(Box::new(api.clone()), config.clone());
            Self {
                runtime,
                api,
                config,
            }
        }
    }

    #[test]
    fn synchronize_frame_waits_once_per_frame() {
        let f = Fixture::new();
        f.runtime.synchronize_frame(None).unwrap();
        f.runtime.synchronize_frame(None).unwrap();
        assert_eq!(f.api.wait_get_poses_calls(), 1);
        assert!(f.runtime.ready());

        f.runtime.end_frame();
        assert_eq!(f.api.post_present_calls(), 1);
        f.runtime.synchronize_frame(None).unwrap();
        assert_eq!(f.api.wait_get_poses_calls(), 2);
    }

    #[test]
    fn wait_failure_is_reported_and_retried() {
        let f = Fixture::new();
        f.api
            .fail_next_wait(vr::EVRCompositorError::DoNotHaveFocus);
        assert_eq!(
            f.runtime.synchronize_frame(None),
            Err(RuntimeError::OpenVr(vr::EVRCompositorError::DoNotHaveFocus))
        );
        assert!(!f.runtime.frame_synchronized());
        f.runtime.synchronize_frame(None).unwrap();
        assert_eq!(f.api.wait_get_poses_calls(), 2);
    }

    #[test]
    fn update_poses_requires_first_sync() {
        let f = Fixture::new();
        assert_eq!(f.runtime.update_poses(false, 0), Err(RuntimeError::NotReady));
        f.runtime.synchronize_frame(None).unwrap();
        assert_eq!(f.runtime.update_poses(false, 0), Ok(1));

        let state = f.runtime.pose_state(1).unwrap();
        assert!(state.data.hmd().is_some());
        assert_eq!(
            f.runtime.hmd_transform().w_axis.y,
            FakeOpenVr::HMD_HEIGHT
        );
    }

    #[test]
    fn projections_flip_openvr_vertical_convention() {
        let f = Fixture::new();
        f.runtime.update_matrices(0.1, 100.0).unwrap();
        let raw = f.runtime.raw_projection(Eye::Left);
        let [l, r, t, b] = FakeOpenVr::PROJECTION_RAW;
        let expected = RawProjection {
            left: l,
            right: r,
            top: -t,
            bottom: -b,
        };
        assert_eq!(raw, expected);

        let back = crate::convert::raw_from_projection(&f.runtime.projection(Eye::Left));
        assert!((back.top - raw.top).abs() < 1e-5);
        assert!((back.left - raw.left).abs() < 1e-5);
    }

    #[test]
    fn update_matrices_skips_when_nothing_changed() {
        let f = Fixture::new();
        f.runtime.update_matrices(0.1, 100.0).unwrap();
        let calls = f.api.projection_calls();
        f.runtime.update_matrices(0.1, 100.0).unwrap();
        assert_eq!(f.api.projection_calls(), calls);

        f.api.push_event(vr::EVREventType::IpdChanged, 0);
        f.runtime.consume_events().unwrap();
        f.runtime.update_matrices(0.1, 100.0).unwrap();
        assert!(f.api.projection_calls() > calls);
    }

    #[test]
    fn override_change_between_frames_rebuilds_projections() {
        let f = Fixture::new();
        f.runtime.update_matrices(0.1, 100.0).unwrap();
        let before = f.runtime.raw_projection(Eye::Left);
        assert_ne!(before.left, -before.right);

        f.config.update(|c| {
            c.horizontal_projection_override = HorizontalProjectionOverride::Symmetrical
        });
        f.runtime.update_matrices(0.1, 100.0).unwrap();
        let after = f.runtime.raw_projection(Eye::Left);
        assert_eq!(after.left, -after.right);
        assert_ne!(after, before);

        // and back again
        f.config
            .update(|c| c.horizontal_projection_override = HorizontalProjectionOverride::None);
        f.runtime.update_matrices(0.1, 100.0).unwrap();
        assert_eq!(f.runtime.raw_projection(Eye::Left), before);
    }

    #[test]
    fn submit_state_is_none_for_an_unqueued_render_frame() {
        let f = Fixture::new();
        f.runtime.synchronize_frame(None).unwrap();
        let written = f.runtime.update_poses(false, 0).unwrap();
        assert_eq!(written, 1);

        // same slot, different frame
        f.runtime.on_render_frame(written + crate::pipeline::QUEUE_SIZE as u32);
        assert!(f.runtime.get_submit_state().is_none());

        f.runtime.on_render_frame(written);
        assert_eq!(f.runtime.get_submit_state().unwrap().frame_count, written);
    }

    #[test]
    fn controller_roles_refresh_on_events() {
        let f = Fixture::new();
        assert_eq!(f.runtime.controller_index(Hand::Left), None);

        f.api.add_controller(3, vr::ETrackedControllerRole::LeftHand);
        f.api.push_event(vr::EVREventType::TrackedDeviceActivated, 3);
        f.runtime.consume_events().unwrap();
        assert_eq!(f.runtime.controller_index(Hand::Left), Some(3));
        assert_eq!(f.runtime.controller_index(Hand::Right), None);
    }

    #[test]
    fn quit_acknowledges_and_requests_reinitialize() {
        let f = Fixture::new();
        f.api.push_event(vr::EVREventType::Quit, 0);
        f.runtime.consume_events().unwrap();
        assert!(f.api.quit_acknowledged());
        assert!(f.runtime.wants_reinitialize());
        assert!(!f.runtime.ready());
    }

    #[test]
    fn submit_stamps_render_pose() {
        let f = Fixture::new();
        f.runtime.synchronize_frame(None).unwrap();
        let frame = f.runtime.update_poses(false, 0).unwrap();
        f.runtime.on_render_frame(frame);

        let texture = vr::Texture_t {
            handle: std::ptr::null_mut(),
            eType: vr::ETextureType::DirectX,
            eColorSpace: vr::EColorSpace::Auto,
        };
        f.runtime
            .submit_eye(Eye::Left, texture, &Default::default())
            .unwrap();

        let submits = f.api.submits();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].eye, vr::EVREye::Left);
        assert_eq!(submits[0].flags, vr::EVRSubmitFlags::TextureWithPose);
        assert_eq!(submits[0].pose.m[1][3], FakeOpenVr::HMD_HEIGHT);
    }

    #[test]
    fn missing_hmd_is_not_loaded() {
        let api = FakeOpenVr::new();
        api.set_hmd_present(false);
        let runtime = OpenVrRuntime::new(
            Box::new(api.clone()),
            Arc::new(SharedConfig::default()),
        );
        assert!(!runtime.loaded());
        assert_eq!(
            runtime.synchronize_frame(None),
            Err(RuntimeError::NotLoaded)
        );
    }
}
