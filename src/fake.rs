//! In-memory stand-ins for the runtimes and graphics devices, for unit tests.

use crate::graphics_backends::{
    d3d11::{D3d11Device, HResult, ViewKind},
    d3d12::{D3d12Device, ResourceState},
    Region, TextureDesc,
};
use crate::runtime::{
    openxr::{
        CompositionLayer, EyeView, FrameState, FrameWaiter, RawImage, ReferenceSpace, SessionEvent,
        SwapchainDesc, SwapchainKey, TrackedSpace, XrResult, XrSession,
    },
    Hand,
};
use openvr as vr;
use openxr as xr;
use slotmap::SlotMap;
use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc, Arc, Mutex,
};

const R8G8B8A8_UNORM: u32 = 28;
const D32_FLOAT: u32 = 40;
const SWAPCHAIN_IMAGE_SIZE: u32 = 8192;

fn swapchain_texture(image: RawImage) -> FakeTexture {
    FakeTexture {
        id: image.0 as usize,
        desc: TextureDesc {
            width: SWAPCHAIN_IMAGE_SIZE,
            height: SWAPCHAIN_IMAGE_SIZE,
            format: R8G8B8A8_UNORM,
            shader_resource: true,
        },
    }
}

struct FakeSwapchain {
    desc: SwapchainDesc,
    images: Vec<RawImage>,
    next: u32,
    acquired: u32,
}

struct XrState {
    events: VecDeque<SessionEvent>,
    next_display_time: i64,
    last_display_time: i64,
    ended_frames: Vec<(xr::Time, Vec<CompositionLayer>)>,
    swapchains: SlotMap<SwapchainKey, FakeSwapchain>,
    created: Vec<SwapchainDesc>,
    destroyed: usize,
    next_image: u64,
    fail_next_acquire: Option<xr::sys::Result>,
    fail_next_release: Option<xr::sys::Result>,
    begin_session_calls: usize,
    end_session_calls: usize,
    exit_requests: usize,
    wait_frame_calls: usize,
    begin_frame_calls: usize,
    locate_views_calls: usize,
    /// Reports that a wait started, then blocks it until released.
    held_wait: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
}

impl Default for XrState {
    fn default() -> Self {
        Self {
            events: VecDeque::new(),
            next_display_time: FakeXrSession::FIRST_DISPLAY_TIME,
            last_display_time: 0,
            ended_frames: Vec::new(),
            swapchains: SlotMap::with_key(),
            created: Vec::new(),
            destroyed: 0,
            next_image: 100_000,
            fail_next_acquire: None,
            fail_next_release: None,
            begin_session_calls: 0,
            end_session_calls: 0,
            exit_requests: 0,
            wait_frame_calls: 0,
            begin_frame_calls: 0,
            locate_views_calls: 0,
            held_wait: None,
        }
    }
}

/// An OpenXR session with a stage space and a headset standing still in it. Clones share
/// state, so a test can keep one while the runtime owns another.
#[derive(Clone, Default)]
pub struct FakeXrSession(Arc<Mutex<XrState>>);

impl FakeXrSession {
    pub const IPD: f32 = 0.064;
    pub const HMD_HEIGHT: f32 = 1.6;
    pub const RESOLUTION: (u32, u32) = (1440, 1600);
    pub const PERIOD: i64 = 11_111_111;
    const FIRST_DISPLAY_TIME: i64 = 1_000_000_000;
    pub const FOV: xr::Fovf = xr::Fovf {
        angle_left: -0.8,
        angle_right: 0.75,
        angle_up: 0.7,
        angle_down: -0.85,
    };

    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, XrState> {
        self.0.lock().unwrap()
    }

    pub fn push_event(&self, event: SessionEvent) {
        self.state().events.push_back(event);
    }

    /// The display time the next `wait_frame` predicts. Later waits advance one period from it.
    pub fn set_next_display_time(&self, nanos: i64) {
        self.state().next_display_time = nanos;
    }

    pub fn last_display_time(&self) -> xr::Time {
        xr::Time::from_nanos(self.state().last_display_time)
    }

    pub fn ended_frames(&self) -> Vec<(xr::Time, Vec<CompositionLayer>)> {
        self.state().ended_frames.clone()
    }

    pub fn fail_next_acquire(&self, result: xr::sys::Result) {
        self.state().fail_next_acquire = Some(result);
    }

    pub fn fail_next_release(&self, result: xr::sys::Result) {
        self.state().fail_next_release = Some(result);
    }

    pub fn created_swapchains(&self) -> Vec<SwapchainDesc> {
        self.state().created.clone()
    }

    pub fn create_swapchain_calls(&self) -> usize {
        self.state().created.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.state().swapchains.len()
    }

    pub fn destroyed_swapchains(&self) -> usize {
        self.state().destroyed
    }

    /// Images acquired and not yet released, over every live swapchain.
    pub fn acquired_images(&self) -> u32 {
        self.state().swapchains.values().map(|s| s.acquired).sum()
    }

    pub fn begin_session_calls(&self) -> usize {
        self.state().begin_session_calls
    }

    pub fn end_session_calls(&self) -> usize {
        self.state().end_session_calls
    }

    pub fn exit_requests(&self) -> usize {
        self.state().exit_requests
    }

    pub fn wait_frame_calls(&self) -> usize {
        self.state().wait_frame_calls
    }

    pub fn begin_frame_calls(&self) -> usize {
        self.state().begin_frame_calls
    }

    pub fn locate_views_calls(&self) -> usize {
        self.state().locate_views_calls
    }

    /// Parks the next `wait_frame` until the returned sender fires. The receiver gets a message
    /// once the wait has started.
    pub fn hold_next_wait(&self) -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
        let (release_tx, release_rx) = mpsc::channel();
        let (started_tx, started_rx) = mpsc::channel();
        self.state().held_wait = Some((started_tx, release_rx));
        (release_tx, started_rx)
    }
}

impl FrameWaiter for FakeXrSession {
    fn wait_frame(&mut self) -> XrResult<FrameState> {
        let held = self.state().held_wait.take();
        if let Some((started, release)) = held {
            let _ = started.send(());
            let _ = release.recv();
        }

        let mut state = self.state();
        state.wait_frame_calls += 1;
        let time = state.next_display_time;
        state.last_display_time = time;
        state.next_display_time = time + Self::PERIOD;
        Ok(FrameState {
            predicted_display_time: xr::Time::from_nanos(time),
            predicted_display_period: xr::Duration::from_nanos(Self::PERIOD),
            should_render: true,
        })
    }
}

impl XrSession for FakeXrSession {
    fn take_frame_waiter(&mut self) -> Option<Box<dyn FrameWaiter>> {
        Some(Box::new(self.clone()))
    }

    fn begin_frame(&mut self) -> XrResult {
        self.state().begin_frame_calls += 1;
        Ok(())
    }

    fn end_frame(&mut self, display_time: xr::Time, layers: &[CompositionLayer]) -> XrResult {
        self.state()
            .ended_frames
            .push((display_time, layers.to_vec()));
        Ok(())
    }

    fn locate_views(&mut self, _time: xr::Time, space: ReferenceSpace) -> XrResult<[EyeView; 2]> {
        self.state().locate_views_calls += 1;
        let y = match space {
            ReferenceSpace::Stage => Self::HMD_HEIGHT,
            ReferenceSpace::View => 0.0,
        };
        let view = |x| EyeView {
            pose: xr::Posef {
                orientation: xr::Quaternionf::IDENTITY,
                position: xr::Vector3f { x, y, z: 0.0 },
            },
            fov: Self::FOV,
        };
        Ok([view(-Self::IPD / 2.0), view(Self::IPD / 2.0)])
    }

    fn locate(&mut self, space: TrackedSpace, _time: xr::Time) -> XrResult<Option<xr::Posef>> {
        let position = match space {
            TrackedSpace::View => xr::Vector3f {
                x: 0.0,
                y: Self::HMD_HEIGHT,
                z: 0.0,
            },
            TrackedSpace::Aim(hand) | TrackedSpace::Grip(hand) => xr::Vector3f {
                x: if hand == Hand::Left { -0.2 } else { 0.2 },
                y: 1.0,
                z: -0.3,
            },
        };
        Ok(Some(xr::Posef {
            orientation: xr::Quaternionf::IDENTITY,
            position,
        }))
    }

    fn sync_actions(&mut self) -> XrResult {
        Ok(())
    }

    fn poll_event(&mut self) -> XrResult<Option<SessionEvent>> {
        Ok(self.state().events.pop_front())
    }

    fn recommended_resolution(&self) -> (u32, u32) {
        Self::RESOLUTION
    }

    fn supports_depth(&self) -> bool {
        true
    }

    fn color_format(&self) -> u32 {
        R8G8B8A8_UNORM
    }

    fn depth_format(&self) -> u32 {
        D32_FLOAT
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> XrResult<SwapchainKey> {
        let mut state = self.state();
        state.created.push(*desc);
        let count = if desc.static_image { 1 } else { 3 };
        let first = state.next_image;
        state.next_image += count;
        let images = (first..first + count).map(RawImage).collect();
        Ok(state.swapchains.insert(FakeSwapchain {
            desc: *desc,
            images,
            next: 0,
            acquired: 0,
        }))
    }

    fn destroy_swapchain(&mut self, key: SwapchainKey) {
        let mut state = self.state();
        if state.swapchains.remove(key).is_some() {
            state.destroyed += 1;
        }
    }

    fn swapchain_images(&self, key: SwapchainKey) -> XrResult<Vec<RawImage>> {
        self.state()
            .swapchains
            .get(key)
            .map(|s| s.images.clone())
            .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)
    }

    fn acquire_image(&mut self, key: SwapchainKey) -> XrResult<u32> {
        let mut state = self.state();
        if let Some(err) = state.fail_next_acquire.take() {
            return Err(err);
        }
        let swapchain = state
            .swapchains
            .get_mut(key)
            .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)?;
        if swapchain.desc.static_image && swapchain.acquired > 0 {
            return Err(xr::sys::Result::ERROR_CALL_ORDER_INVALID);
        }
        let index = swapchain.next;
        swapchain.next = (index + 1) % swapchain.images.len() as u32;
        swapchain.acquired += 1;
        Ok(index)
    }

    fn wait_image(&mut self, key: SwapchainKey, _timeout: xr::Duration) -> XrResult {
        match self.state().swapchains.get(key) {
            Some(s) if s.acquired > 0 => Ok(()),
            Some(_) => Err(xr::sys::Result::ERROR_CALL_ORDER_INVALID),
            None => Err(xr::sys::Result::ERROR_HANDLE_INVALID),
        }
    }

    fn release_image(&mut self, key: SwapchainKey) -> XrResult {
        let mut state = self.state();
        if let Some(err) = state.fail_next_release.take() {
            return Err(err);
        }
        let swapchain = state
            .swapchains
            .get_mut(key)
            .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)?;
        swapchain.acquired = swapchain.acquired.saturating_sub(1);
        Ok(())
    }

    fn begin_session(&mut self) -> XrResult {
        self.state().begin_session_calls += 1;
        Ok(())
    }

    fn end_session(&mut self) -> XrResult {
        self.state().end_session_calls += 1;
        Ok(())
    }

    fn request_exit(&mut self) -> XrResult {
        self.state().exit_requests += 1;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Submit {
    pub eye: vr::EVREye,
    pub flags: vr::EVRSubmitFlags,
    pub pose: vr::HmdMatrix34_t,
    pub texture_type: vr::ETextureType,
}

struct VrState {
    hmd_present: bool,
    events: VecDeque<vr::VREvent_t>,
    controllers: HashMap<vr::TrackedDeviceIndex_t, vr::ETrackedControllerRole>,
    fail_next_wait: Option<vr::EVRCompositorError>,
    quit_acknowledged: bool,
    submits: Vec<Submit>,
    wait_get_poses_calls: usize,
    post_present_calls: usize,
    projection_calls: usize,
}

/// An OpenVR system and compositor. The HMD stands [`FakeOpenVr::HMD_HEIGHT`] above the origin.
#[derive(Clone)]
pub struct FakeOpenVr(Arc<Mutex<VrState>>);

impl Default for FakeOpenVr {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(VrState {
            hmd_present: true,
            events: VecDeque::new(),
            controllers: HashMap::new(),
            fail_next_wait: None,
            quit_acknowledged: false,
            submits: Vec::new(),
            wait_get_poses_calls: 0,
            post_present_calls: 0,
            projection_calls: 0,
        })))
    }
}

fn translation(x: f32, y: f32, z: f32) -> vr::HmdMatrix34_t {
    vr::HmdMatrix34_t {
        m: [[1.0, 0.0, 0.0, x], [0.0, 1.0, 0.0, y], [0.0, 0.0, 1.0, z]],
    }
}

fn valid_pose(matrix: vr::HmdMatrix34_t) -> vr::TrackedDevicePose_t {
    vr::TrackedDevicePose_t {
        mDeviceToAbsoluteTracking: matrix,
        eTrackingResult: vr::ETrackingResult::Running_OK,
        bPoseIsValid: true,
        bDeviceIsConnected: true,
        ..Default::default()
    }
}

impl FakeOpenVr {
    pub const HMD_HEIGHT: f32 = 1.7;
    pub const IPD: f32 = 0.064;
    pub const RECOMMENDED_SIZE: (u32, u32) = (1832, 1920);
    /// Left eye; the right eye is its mirror image.
    pub const PROJECTION_RAW: [f32; 4] = [-1.2, 1.0, -1.1, 1.05];

    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, VrState> {
        self.0.lock().unwrap()
    }

    pub fn set_hmd_present(&self, present: bool) {
        self.state().hmd_present = present;
    }

    pub fn push_event(&self, event: vr::EVREventType, index: vr::TrackedDeviceIndex_t) {
        self.state().events.push_back(vr::VREvent_t {
            eventType: event.as_raw(),
            trackedDeviceIndex: index,
            eventAgeSeconds: 0.0,
        });
    }

    pub fn add_controller(&self, index: vr::TrackedDeviceIndex_t, role: vr::ETrackedControllerRole) {
        self.state().controllers.insert(index, role);
    }

    pub fn fail_next_wait(&self, err: vr::EVRCompositorError) {
        self.state().fail_next_wait = Some(err);
    }

    pub fn quit_acknowledged(&self) -> bool {
        self.state().quit_acknowledged
    }

    pub fn submits(&self) -> Vec<Submit> {
        self.state().submits.clone()
    }

    pub fn wait_get_poses_calls(&self) -> usize {
        self.state().wait_get_poses_calls
    }

    pub fn post_present_calls(&self) -> usize {
        self.state().post_present_calls
    }

    pub fn projection_calls(&self) -> usize {
        self.state().projection_calls
    }
}

impl vr::OpenVrApi for FakeOpenVr {
    fn is_hmd_present(&self) -> bool {
        self.state().hmd_present
    }

    fn recommended_render_target_size(&self) -> (u32, u32) {
        Self::RECOMMENDED_SIZE
    }

    fn projection_raw(&self, eye: vr::EVREye) -> [f32; 4] {
        self.state().projection_calls += 1;
        let [l, r, t, b] = Self::PROJECTION_RAW;
        match eye {
            vr::EVREye::Left => [l, r, t, b],
            vr::EVREye::Right => [-r, -l, t, b],
        }
    }

    fn eye_to_head_transform(&self, eye: vr::EVREye) -> vr::HmdMatrix34_t {
        let x = Self::IPD / 2.0;
        match eye {
            vr::EVREye::Left => translation(-x, 0.0, 0.0),
            vr::EVREye::Right => translation(x, 0.0, 0.0),
        }
    }

    fn tracked_device_class(&self, index: vr::TrackedDeviceIndex_t) -> vr::ETrackedDeviceClass {
        if index == vr::k_unTrackedDeviceIndex_Hmd {
            vr::ETrackedDeviceClass::HMD
        } else if self.state().controllers.contains_key(&index) {
            vr::ETrackedDeviceClass::Controller
        } else {
            vr::ETrackedDeviceClass::Invalid
        }
    }

    fn controller_role(&self, index: vr::TrackedDeviceIndex_t) -> vr::ETrackedControllerRole {
        self.state()
            .controllers
            .get(&index)
            .copied()
            .unwrap_or(vr::ETrackedControllerRole::Invalid)
    }

    fn poll_next_event(&self) -> Option<vr::VREvent_t> {
        self.state().events.pop_front()
    }

    fn acknowledge_quit(&self) {
        self.state().quit_acknowledged = true;
    }

    fn wait_get_poses(&self, render_poses: &mut [vr::TrackedDevicePose_t]) -> vr::EVRCompositorError {
        let mut state = self.state();
        state.wait_get_poses_calls += 1;
        if let Some(err) = state.fail_next_wait.take() {
            return err;
        }

        for pose in render_poses.iter_mut() {
            *pose = Default::default();
        }
        if let Some(hmd) = render_poses.get_mut(vr::k_unTrackedDeviceIndex_Hmd as usize) {
            *hmd = valid_pose(translation(0.0, Self::HMD_HEIGHT, 0.0));
        }
        for (&index, role) in &state.controllers {
            let x = match role {
                vr::ETrackedControllerRole::LeftHand => -0.2,
                _ => 0.2,
            };
            if let Some(pose) = render_poses.get_mut(index as usize) {
                *pose = valid_pose(translation(x, 1.0, -0.3));
            }
        }
        vr::EVRCompositorError::None
    }

    fn submit(
        &self,
        eye: vr::EVREye,
        texture: &vr::VRTextureWithPose_t,
        _bounds: &vr::VRTextureBounds_t,
        flags: vr::EVRSubmitFlags,
    ) -> vr::EVRCompositorError {
        self.state().submits.push(Submit {
            eye,
            flags,
            pose: texture.mDeviceToAbsoluteTracking,
            texture_type: texture._base.eType,
        });
        vr::EVRCompositorError::None
    }

    fn post_present_handoff(&self) {
        self.state().post_present_calls += 1;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FakeTexture {
    pub id: usize,
    pub desc: TextureDesc,
}

impl FakeTexture {
    pub fn new(id: usize, width: u32, height: u32) -> Self {
        Self {
            id,
            desc: TextureDesc {
                width,
                height,
                format: R8G8B8A8_UNORM,
                shader_resource: true,
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FakeView {
    pub texture: usize,
    pub kind: ViewKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum D3d11Op {
    CreateTexture {
        id: usize,
        width: u32,
        height: u32,
    },
    CreateView {
        texture: usize,
        kind: ViewKind,
    },
    CopyRegion {
        dst: usize,
        dst_x: u32,
        dst_y: u32,
        src: usize,
        region: Region,
    },
    CopyResource {
        dst: usize,
        src: usize,
    },
    Clear {
        texture: usize,
    },
    Flush,
    CreatePipeline,
    Blit {
        src: usize,
        dst: usize,
        area: Region,
        blend: bool,
    },
    Backup,
    Restore,
}

/// Records every call instead of touching a GPU.
pub struct FakeD3d11Device {
    next_id: AtomicUsize,
    ops: Mutex<Vec<D3d11Op>>,
}

impl Default for FakeD3d11Device {
    fn default() -> Self {
        Self {
            next_id: AtomicUsize::new(10_000),
            ops: Mutex::default(),
        }
    }
}

impl FakeD3d11Device {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, op: D3d11Op) {
        self.ops.lock().unwrap().push(op);
    }

    pub fn ops(&self) -> Vec<D3d11Op> {
        self.ops.lock().unwrap().clone()
    }

    /// Destination and region of every region copy out of `src`, in order.
    pub fn copies_from(&self, src: usize) -> Vec<(usize, Region)> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match *op {
                D3d11Op::CopyRegion {
                    dst,
                    src: from,
                    region,
                    ..
                } if from == src => Some((dst, region)),
                _ => None,
            })
            .collect()
    }

    pub fn views_created(&self) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| matches!(op, D3d11Op::CreateView { .. }))
            .count()
    }

    /// `(src, dst, area, blend)` of every blit, in order.
    pub fn blits(&self) -> Vec<(usize, usize, Region, bool)> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match *op {
                D3d11Op::Blit {
                    src,
                    dst,
                    area,
                    blend,
                } => Some((src, dst, area, blend)),
                _ => None,
            })
            .collect()
    }
}

impl D3d11Device for FakeD3d11Device {
    type Texture = FakeTexture;
    type View = FakeView;
    type State = ();
    type Pipeline = ();

    fn describe(&self, texture: &FakeTexture) -> TextureDesc {
        texture.desc
    }

    fn identity(&self, texture: &FakeTexture) -> usize {
        texture.id
    }

    fn create_texture(&self, width: u32, height: u32, format: u32) -> HResult<FakeTexture> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.record(D3d11Op::CreateTexture { id, width, height });
        Ok(FakeTexture {
            id,
            desc: TextureDesc {
                width,
                height,
                format,
                shader_resource: true,
            },
        })
    }

    fn create_view(&self, texture: &FakeTexture, kind: ViewKind) -> HResult<FakeView> {
        self.record(D3d11Op::CreateView {
            texture: texture.id,
            kind,
        });
        Ok(FakeView {
            texture: texture.id,
            kind,
        })
    }

    fn swapchain_texture(&self, image: RawImage) -> Option<FakeTexture> {
        Some(swapchain_texture(image))
    }

    fn copy_region(&self, dst: &FakeTexture, dst_x: u32, dst_y: u32, src: &FakeTexture, region: Region) {
        self.record(D3d11Op::CopyRegion {
            dst: dst.id,
            dst_x,
            dst_y,
            src: src.id,
            region,
        });
    }

    fn copy_resource(&self, dst: &FakeTexture, src: &FakeTexture) {
        self.record(D3d11Op::CopyResource {
            dst: dst.id,
            src: src.id,
        });
    }

    fn clear(&self, rtv: &FakeView, _color: [f32; 4]) {
        self.record(D3d11Op::Clear {
            texture: rtv.texture,
        });
    }

    fn flush(&self) {
        self.record(D3d11Op::Flush);
    }

    fn create_blit_pipeline(&self) -> HResult {
        self.record(D3d11Op::CreatePipeline);
        Ok(())
    }

    fn blit(&self, _pipeline: &(), srv: &FakeView, rtv: &FakeView, area: Region, blend: bool) {
        self.record(D3d11Op::Blit {
            src: srv.texture,
            dst: rtv.texture,
            area,
            blend,
        });
    }

    fn openvr_handle(&self, texture: &FakeTexture) -> *mut c_void {
        texture.id as *mut c_void
    }

    fn backup_state(&self) {
        self.record(D3d11Op::Backup);
    }

    fn restore_state(&self, _state: ()) {
        self.record(D3d11Op::Restore);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum D3d12Op {
    CreateTexture {
        id: usize,
        width: u32,
        height: u32,
    },
    Transition(usize, ResourceState, ResourceState),
    CopyRegion {
        dst: usize,
        dst_x: u32,
        dst_y: u32,
        src: usize,
        region: Region,
    },
    CopyResource {
        dst: usize,
        src: usize,
    },
    Clear(usize),
    CreatePipeline(u32),
    Blit {
        src: usize,
        dst: usize,
        area: Region,
        blend: bool,
    },
    Execute,
    Signal(u64),
    Reset,
}

/// Records every command. Fences complete immediately unless [`FakeD3d12Device::hang_fences`]
/// says otherwise.
pub struct FakeD3d12Device {
    next_id: AtomicUsize,
    ops: Mutex<Vec<D3d12Op>>,
    waits: Mutex<Vec<u32>>,
    hang: AtomicBool,
}

impl Default for FakeD3d12Device {
    fn default() -> Self {
        Self {
            next_id: AtomicUsize::new(20_000),
            ops: Mutex::default(),
            waits: Mutex::default(),
            hang: AtomicBool::new(false),
        }
    }
}

impl FakeD3d12Device {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, op: D3d12Op) {
        self.ops.lock().unwrap().push(op);
    }

    pub fn hang_fences(&self, hang: bool) {
        self.hang.store(hang, Ordering::Relaxed);
    }

    pub fn ops(&self) -> Vec<D3d12Op> {
        self.ops.lock().unwrap().clone()
    }

    /// Timeouts of every fence wait, in order.
    pub fn waits(&self) -> Vec<u32> {
        self.waits.lock().unwrap().clone()
    }

    pub fn copies_from(&self, src: usize) -> Vec<(usize, Region)> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match *op {
                D3d12Op::CopyRegion {
                    dst,
                    src: from,
                    region,
                    ..
                } if from == src => Some((dst, region)),
                _ => None,
            })
            .collect()
    }

    /// Every `(before, after)` transition of `resource`, in order.
    pub fn transitions_of(&self, resource: usize) -> Vec<(ResourceState, ResourceState)> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match *op {
                D3d12Op::Transition(id, before, after) if id == resource => Some((before, after)),
                _ => None,
            })
            .collect()
    }

    /// `(src, dst, area, blend)` of every blit, in order.
    pub fn blits(&self) -> Vec<(usize, usize, Region, bool)> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match *op {
                D3d12Op::Blit {
                    src,
                    dst,
                    area,
                    blend,
                } => Some((src, dst, area, blend)),
                _ => None,
            })
            .collect()
    }
}

impl D3d12Device for FakeD3d12Device {
    type Resource = FakeTexture;
    type CommandList = ();
    type Fence = ();
    type Pipeline = ();

    fn describe(&self, resource: &FakeTexture) -> TextureDesc {
        resource.desc
    }

    fn identity(&self, resource: &FakeTexture) -> usize {
        resource.id
    }

    fn create_texture(
        &self,
        width: u32,
        height: u32,
        format: u32,
        _state: ResourceState,
    ) -> HResult<FakeTexture> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.record(D3d12Op::CreateTexture { id, width, height });
        Ok(FakeTexture {
            id,
            desc: TextureDesc {
                width,
                height,
                format,
                shader_resource: true,
            },
        })
    }

    fn swapchain_resource(&self, image: RawImage) -> Option<FakeTexture> {
        Some(swapchain_texture(image))
    }

    fn create_command_list(&self) -> HResult {
        Ok(())
    }

    fn create_fence(&self) -> HResult {
        Ok(())
    }

    fn transition(
        &self,
        _list: &(),
        resource: &FakeTexture,
        before: ResourceState,
        after: ResourceState,
    ) {
        self.record(D3d12Op::Transition(resource.id, before, after));
    }

    fn copy_region(
        &self,
        _list: &(),
        dst: &FakeTexture,
        dst_x: u32,
        dst_y: u32,
        src: &FakeTexture,
        region: Region,
    ) {
        self.record(D3d12Op::CopyRegion {
            dst: dst.id,
            dst_x,
            dst_y,
            src: src.id,
            region,
        });
    }

    fn copy_resource(&self, _list: &(), dst: &FakeTexture, src: &FakeTexture) {
        self.record(D3d12Op::CopyResource {
            dst: dst.id,
            src: src.id,
        });
    }

    fn clear(&self, _list: &(), resource: &FakeTexture, _color: [f32; 4]) -> HResult {
        self.record(D3d12Op::Clear(resource.id));
        Ok(())
    }

    fn create_blit_pipeline(&self, format: u32) -> HResult {
        self.record(D3d12Op::CreatePipeline(format));
        Ok(())
    }

    fn blit(
        &self,
        _list: &(),
        _pipeline: &(),
        src: &FakeTexture,
        dst: &FakeTexture,
        area: Region,
        blend: bool,
    ) {
        self.record(D3d12Op::Blit {
            src: src.id,
            dst: dst.id,
            area,
            blend,
        });
    }

    fn close_and_execute(&self, _list: &()) -> HResult {
        self.record(D3d12Op::Execute);
        Ok(())
    }

    fn signal(&self, _fence: &(), value: u64) -> HResult {
        self.record(D3d12Op::Signal(value));
        Ok(())
    }

    fn wait_for_fence(&self, _fence: &(), _value: u64, timeout_ms: u32) -> bool {
        self.waits.lock().unwrap().push(timeout_ms);
        !self.hang.load(Ordering::Relaxed)
    }

    fn reset_command_list(&self, _list: &()) -> HResult {
        self.record(D3d12Op::Reset);
        Ok(())
    }

    fn openvr_texture_data(&self, resource: &FakeTexture) -> vr::D3D12TextureData_t {
        vr::D3D12TextureData_t {
            m_pResource: resource.id as *mut c_void,
            m_pCommandQueue: std::ptr::null_mut(),
            m_nNodeMask: 0,
        }
    }
}
