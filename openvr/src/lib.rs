//! The slice of the OpenVR C API that the stereo presentation core consumes.
//!
//! Layouts follow `openvr_api.h` (1.x/2.x, which agree for every type here). The functions
//! themselves are reached through [`OpenVrApi`], which the host implements on top of whatever
//! binding it already loaded `openvr_api.dll` with.
#![allow(non_camel_case_types, non_snake_case, non_upper_case_globals)]

mod convert;

use std::ffi::c_void;

pub type TrackedDeviceIndex_t = u32;

pub const k_unTrackedDeviceIndex_Hmd: TrackedDeviceIndex_t = 0;
pub const k_unMaxTrackedDeviceCount: u32 = 64;
pub const k_unTrackedDeviceIndexInvalid: TrackedDeviceIndex_t = 0xFFFF_FFFF;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct HmdMatrix34_t {
    pub m: [[f32; 4]; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct HmdMatrix44_t {
    pub m: [[f32; 4]; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct HmdVector3_t {
    pub v: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct HmdVector4_t {
    pub v: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct HmdQuaternionf_t {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[repr(i32)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ETrackingResult {
    #[default]
    Uninitialized = 1,
    Calibrating_InProgress = 100,
    Calibrating_OutOfRange = 101,
    Running_OK = 200,
    Running_OutOfRange = 201,
    Fallback_RotationOnly = 300,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TrackedDevicePose_t {
    pub mDeviceToAbsoluteTracking: HmdMatrix34_t,
    pub vVelocity: HmdVector3_t,
    pub vAngularVelocity: HmdVector3_t,
    pub eTrackingResult: ETrackingResult,
    pub bPoseIsValid: bool,
    pub bDeviceIsConnected: bool,
}

#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EVREye {
    Left = 0,
    Right = 1,
}

#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ETextureType {
    Invalid = -1,
    DirectX = 0,
    OpenGL = 1,
    Vulkan = 2,
    IOSurface = 3,
    DirectX12 = 4,
    DXGISharedHandle = 5,
    Metal = 6,
    Reserved = 7,
}

#[repr(i32)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EColorSpace {
    #[default]
    Auto = 0,
    Gamma = 1,
    Linear = 2,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Texture_t {
    pub handle: *mut c_void,
    pub eType: ETextureType,
    pub eColorSpace: EColorSpace,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct VRTextureWithPose_t {
    pub _base: Texture_t,
    pub mDeviceToAbsoluteTracking: HmdMatrix34_t,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct D3D12TextureData_t {
    pub m_pResource: *mut c_void,
    pub m_pCommandQueue: *mut c_void,
    pub m_nNodeMask: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VRTextureBounds_t {
    pub uMin: f32,
    pub vMin: f32,
    pub uMax: f32,
    pub vMax: f32,
}

impl Default for VRTextureBounds_t {
    fn default() -> Self {
        Self {
            uMin: 0.0,
            vMin: 0.0,
            uMax: 1.0,
            vMax: 1.0,
        }
    }
}

impl VRTextureBounds_t {
    #[inline]
    pub fn valid(&self) -> bool {
        matches!(
            self,
            VRTextureBounds_t {
                uMin: 0.0..=1.0,
                uMax: 0.0..=1.0,
                vMin: 0.0..=1.0,
                vMax: 0.0..=1.0
            }
        ) && self.vMin != self.vMax
            && self.uMin != self.uMax
    }

    #[inline]
    pub fn vertically_flipped(&self) -> bool {
        self.vMin > self.vMax
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EVRSubmitFlags(pub u32);

impl EVRSubmitFlags {
    pub const Default: Self = Self(0x00);
    pub const LensDistortionAlreadyApplied: Self = Self(0x01);
    pub const GlRenderBuffer: Self = Self(0x02);
    pub const TextureWithPose: Self = Self(0x08);
    pub const TextureWithDepth: Self = Self(0x10);
}

impl std::ops::BitOr for EVRSubmitFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EVRCompositorError {
    None = 0,
    RequestFailed = 1,
    IncompatibleVersion = 100,
    DoNotHaveFocus = 101,
    InvalidTexture = 102,
    IsNotSceneApplication = 103,
    TextureIsOnWrongDevice = 104,
    TextureUsesUnsupportedFormat = 105,
    SharedTexturesNotSupported = 106,
    IndexOutOfRange = 107,
    AlreadySubmitted = 108,
    InvalidBounds = 109,
    AlreadySet = 110,
}

#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ETrackedDeviceClass {
    Invalid = 0,
    HMD = 1,
    Controller = 2,
    GenericTracker = 3,
    TrackingReference = 4,
    DisplayRedirect = 5,
}

#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ETrackedControllerRole {
    Invalid = 0,
    LeftHand = 1,
    RightHand = 2,
    OptOut = 3,
    Treadmill = 4,
    Stylus = 5,
}

/// Event types the presentation core reacts to. Everything else is reported as
/// [`EVREventType::Other`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EVREventType {
    TrackedDeviceActivated,
    TrackedDeviceDeactivated,
    TrackedDeviceUpdated,
    TrackedDeviceUserInteractionStarted,
    TrackedDeviceUserInteractionEnded,
    IpdChanged,
    TrackedDeviceRoleChanged,
    ChaperoneUniverseHasChanged,
    Quit,
    ProcessQuit,
    Other(u32),
}

impl EVREventType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            100 => Self::TrackedDeviceActivated,
            101 => Self::TrackedDeviceDeactivated,
            102 => Self::TrackedDeviceUpdated,
            103 => Self::TrackedDeviceUserInteractionStarted,
            104 => Self::TrackedDeviceUserInteractionEnded,
            105 => Self::IpdChanged,
            108 => Self::TrackedDeviceRoleChanged,
            201 => Self::ChaperoneUniverseHasChanged,
            700 => Self::Quit,
            701 => Self::ProcessQuit,
            other => {
                log::trace!("unhandled OpenVR event type {other}");
                Self::Other(other)
            }
        }
    }

    pub fn as_raw(&self) -> u32 {
        match self {
            Self::TrackedDeviceActivated => 100,
            Self::TrackedDeviceDeactivated => 101,
            Self::TrackedDeviceUpdated => 102,
            Self::TrackedDeviceUserInteractionStarted => 103,
            Self::TrackedDeviceUserInteractionEnded => 104,
            Self::IpdChanged => 105,
            Self::TrackedDeviceRoleChanged => 108,
            Self::ChaperoneUniverseHasChanged => 201,
            Self::Quit => 700,
            Self::ProcessQuit => 701,
            Self::Other(raw) => *raw,
        }
    }
}

/// The fixed prefix of `VREvent_t`. The data union that follows it is never read here.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct VREvent_t {
    pub eventType: u32,
    pub trackedDeviceIndex: TrackedDeviceIndex_t,
    pub eventAgeSeconds: f32,
}

impl VREvent_t {
    #[inline]
    pub fn event_type(&self) -> EVREventType {
        EVREventType::from_raw(self.eventType)
    }
}

/// The OpenVR entry points the presentation core calls, mirroring `IVRSystem` and
/// `IVRCompositor`.
///
/// Implementations must be callable from both the game and the render thread; OpenVR itself
/// serializes these calls internally.
pub trait OpenVrApi: Send + Sync {
    fn is_hmd_present(&self) -> bool;

    /// `IVRSystem::GetRecommendedRenderTargetSize`
    fn recommended_render_target_size(&self) -> (u32, u32);

    /// `IVRSystem::GetProjectionRaw`, as `[left, right, top, bottom]` in OpenVR's y-down
    /// convention.
    fn projection_raw(&self, eye: EVREye) -> [f32; 4];

    /// `IVRSystem::GetEyeToHeadTransform`
    fn eye_to_head_transform(&self, eye: EVREye) -> HmdMatrix34_t;

    fn tracked_device_class(&self, index: TrackedDeviceIndex_t) -> ETrackedDeviceClass;

    fn controller_role(&self, index: TrackedDeviceIndex_t) -> ETrackedControllerRole;

    /// `IVRSystem::PollNextEvent`
    fn poll_next_event(&self) -> Option<VREvent_t>;

    /// `IVRSystem::AcknowledgeQuit_Exiting`
    fn acknowledge_quit(&self);

    /// `IVRCompositor::WaitGetPoses`, filling only the render pose array.
    fn wait_get_poses(&self, render_poses: &mut [TrackedDevicePose_t]) -> EVRCompositorError;

    /// `IVRCompositor::Submit`. When `flags` contains [`EVRSubmitFlags::TextureWithPose`], the
    /// binding must pass a pointer to the whole `texture` rather than just `_base`.
    fn submit(
        &self,
        eye: EVREye,
        texture: &VRTextureWithPose_t,
        bounds: &VRTextureBounds_t,
        flags: EVRSubmitFlags,
    ) -> EVRCompositorError;

    /// `IVRCompositor::PostPresentHandoff`
    fn post_present_handoff(&self);
}
