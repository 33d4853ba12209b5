//! The VR runtimes the presentation core can drive.
//!
//! Both runtimes keep their matrices behind a lock they never hand out; everything else is
//! atomics, so the game and render threads can poll state without contending.

pub mod openvr;
pub mod openxr;

pub use self::openvr::OpenVrRuntime;
pub use self::openxr::OpenXrRuntime;
pub use crate::convert::RawProjection;

use ::openvr as vr;
use ::openxr as xr;
use derive_more::{From, TryInto};
use glam::Mat4;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    RwLock,
};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RuntimeKind {
    #[default]
    None,
    OpenVr,
    OpenXr,
}

#[repr(usize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Eye {
    Left = 0,
    Right = 1,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];
}

impl From<Eye> for vr::EVREye {
    fn from(eye: Eye) -> Self {
        match eye {
            Eye::Left => vr::EVREye::Left,
            Eye::Right => vr::EVREye::Right,
        }
    }
}

#[repr(usize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Hand {
    Left = 0,
    Right = 1,
}

impl Hand {
    pub const BOTH: [Hand; 2] = [Hand::Left, Hand::Right];
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, derive_more::Display)]
pub enum RuntimeError {
    #[display("OpenXR call failed: {_0:?}")]
    OpenXr(xr::sys::Result),
    #[display("OpenVR compositor error: {_0:?}")]
    OpenVr(vr::EVRCompositorError),
    #[display("runtime is not loaded")]
    NotLoaded,
    #[display("runtime is not ready")]
    NotReady,
    #[display("runtime predicted an invalid display time")]
    InvalidDisplayTime,
    #[display("no running session")]
    NoSession,
    #[display("pipeline slot already holds a newer frame than {_0}")]
    StaleFrame(u32),
}

impl From<xr::sys::Result> for RuntimeError {
    fn from(value: xr::sys::Result) -> Self {
        Self::OpenXr(value)
    }
}

impl From<vr::EVRCompositorError> for RuntimeError {
    fn from(value: vr::EVRCompositorError) -> Self {
        Self::OpenVr(value)
    }
}

impl RuntimeError {
    /// A runtime-agnostic, never zero code for this error. Native codes pass through.
    pub fn code(&self) -> i32 {
        let code = match self {
            Self::OpenXr(result) => result.into_raw(),
            Self::OpenVr(err) => *err as i32,
            Self::NotLoaded => -10_001,
            Self::NotReady => -10_002,
            Self::InvalidDisplayTime => -10_003,
            Self::NoSession => -10_004,
            Self::StaleFrame(_) => -10_005,
        };
        if code == 0 {
            -1
        } else {
            code
        }
    }

    /// Errors that mean the session or instance is gone and the runtime has to be rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OpenXr(
                xr::sys::Result::ERROR_INSTANCE_LOST
                    | xr::sys::Result::ERROR_SESSION_LOST
                    | xr::sys::Result::ERROR_RUNTIME_UNAVAILABLE
            )
        )
    }
}

pub type RuntimeResult<T = ()> = Result<T, RuntimeError>;

/// Why a runtime couldn't be brought up.
#[derive(Debug, derive_more::Display)]
pub enum InitError {
    #[display("no HMD present")]
    NoHmd,
    #[display("failed to load the OpenXR loader: {_0}")]
    Loader(String),
    #[display("OpenXR instance creation failed: {_0:?}")]
    InstanceCreationFailed(xr::sys::Result),
    #[display("OpenXR system lookup failed: {_0:?}")]
    SystemCreationFailed(xr::sys::Result),
    #[display("OpenXR session creation failed: {_0:?}")]
    SessionCreationFailed(xr::sys::Result),
    #[display("required OpenXR extension {_0} is unavailable")]
    MissingExtension(&'static str),
    #[display("no runtime could be initialized")]
    NoRuntime,
}

/// 0 on success, the error's code otherwise.
pub fn error_code<T>(result: &RuntimeResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

#[derive(Clone, Debug)]
pub struct Matrices {
    pub projections: [Mat4; 2],
    pub raw_projections: [RawProjection; 2],
    /// Eye to head.
    pub eyes: [Mat4; 2],
    pub hmd: Mat4,
    pub aim: [Mat4; 2],
    pub grip: [Mat4; 2],
    pub resolution: (u32, u32),
}

impl Default for Matrices {
    fn default() -> Self {
        Self {
            projections: [Mat4::IDENTITY; 2],
            raw_projections: Default::default(),
            eyes: [Mat4::IDENTITY; 2],
            hmd: Mat4::IDENTITY,
            aim: [Mat4::IDENTITY; 2],
            grip: [Mat4::IDENTITY; 2],
            resolution: (0, 0),
        }
    }
}

/// State both runtimes share.
#[derive(Default)]
pub struct RuntimeState {
    pub(crate) matrices: RwLock<Matrices>,
    pub(crate) loaded: AtomicBool,
    pub(crate) hmd_active: AtomicBool,
    pub(crate) got_first_poses: AtomicBool,
    pub(crate) got_first_valid_poses: AtomicBool,
    pub(crate) submitted: AtomicBool,
    pub(crate) wants_reinitialize: AtomicBool,
    pub(crate) internal_frame_count: AtomicU32,
    pub(crate) internal_render_frame_count: AtomicU32,
}

impl RuntimeState {
    /// The frame count a pose update targets. 0 means "the next internal frame".
    pub(crate) fn next_frame_count(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.internal_frame_count.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.internal_frame_count
                .fetch_max(requested, Ordering::AcqRel);
            requested
        }
    }

    pub(crate) fn matrices(&self) -> std::sync::RwLockReadGuard<'_, Matrices> {
        self.matrices.read().unwrap()
    }
}

pub trait VrRuntime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn state(&self) -> &RuntimeState;

    /// Waits until the compositor will take a new frame. Calling it again before the frame is
    /// consumed returns success without waiting again.
    fn synchronize_frame(&self, frame_count: Option<u32>) -> RuntimeResult;

    /// Predicts poses and queues them. Returns the frame count they were queued under.
    fn update_poses(&self, from_view_extensions: bool, frame_count: u32) -> RuntimeResult<u32>;

    fn update_matrices(&self, near_z: f32, far_z: f32) -> RuntimeResult;

    fn consume_events(&self) -> RuntimeResult;

    fn on_render_frame(&self, frame_count: u32) {
        self.state()
            .internal_render_frame_count
            .store(frame_count, Ordering::Release);
    }

    fn loaded(&self) -> bool {
        self.state().loaded.load(Ordering::Acquire)
    }

    fn ready(&self) -> bool {
        let state = self.state();
        self.loaded()
            && state.hmd_active.load(Ordering::Acquire)
            && state.got_first_valid_poses.load(Ordering::Acquire)
    }

    fn got_first_poses(&self) -> bool {
        self.state().got_first_poses.load(Ordering::Acquire)
    }

    fn projection(&self, eye: Eye) -> Mat4 {
        self.state().matrices().projections[eye as usize]
    }

    fn raw_projection(&self, eye: Eye) -> RawProjection {
        self.state().matrices().raw_projections[eye as usize]
    }

    fn eye_transform(&self, eye: Eye) -> Mat4 {
        self.state().matrices().eyes[eye as usize]
    }

    fn hmd_transform(&self) -> Mat4 {
        self.state().matrices().hmd
    }

    fn aim_matrix(&self, hand: Hand) -> Mat4 {
        self.state().matrices().aim[hand as usize]
    }

    fn grip_matrix(&self, hand: Hand) -> Mat4 {
        self.state().matrices().grip[hand as usize]
    }

    fn recommended_resolution(&self) -> (u32, u32) {
        self.state().matrices().resolution
    }

    fn submitted(&self) -> bool {
        self.state().submitted.load(Ordering::Acquire)
    }

    fn set_submitted(&self, submitted: bool) {
        self.state().submitted.store(submitted, Ordering::Release);
    }

    fn wants_reinitialize(&self) -> bool {
        self.state().wants_reinitialize.load(Ordering::Acquire)
    }

    fn internal_frame_count(&self) -> u32 {
        self.state().internal_frame_count.load(Ordering::Acquire)
    }

    fn internal_render_frame_count(&self) -> u32 {
        self.state()
            .internal_render_frame_count
            .load(Ordering::Acquire)
    }
}

#[derive(From, TryInto)]
#[try_into(owned, ref)]
pub enum AnyRuntime {
    OpenVr(OpenVrRuntime),
    OpenXr(OpenXrRuntime),
}

impl AnyRuntime {
    pub fn get(&self) -> &(dyn VrRuntime + 'static) {
        match self {
            Self::OpenVr(rt) => rt,
            Self::OpenXr(rt) => rt,
        }
    }

    pub fn as_openvr(&self) -> Option<&OpenVrRuntime> {
        <&OpenVrRuntime>::try_from(self).ok()
    }

    pub fn as_openxr(&self) -> Option<&OpenXrRuntime> {
        <&OpenXrRuntime>::try_from(self).ok()
    }
}

impl std::ops::Deref for AnyRuntime {
    type Target = dyn VrRuntime;

    fn deref(&self) -> &Self::Target {
        self.get()
    }
}

/// Display times the runtime hands out before it has real timing: the sentinel `1`, or a
/// value no larger than the frame period itself.
pub(crate) fn is_invalid_display_time(time: xr::Time, period: xr::Duration) -> bool {
    let time = time.as_nanos();
    time == 1 || time <= period.as_nanos()
}
