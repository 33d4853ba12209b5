//! [`XrSession`] on top of a real OpenXR session.

use super::{
    CompositionLayer, EyeView, FrameState, FrameWaiter, RawImage, ReferenceSpace, SessionEvent, SwapchainDesc,
    SwapchainKey, SwapchainUsage, TrackedSpace, XrResult, XrSession,
};
use crate::runtime::InitError;
use log::{debug, info, warn};
use openxr as xr;
use slotmap::SlotMap;

const VIEW_TYPE: xr::ViewConfigurationType = xr::ViewConfigurationType::PRIMARY_STEREO;

/// Conversion from a graphics API's swapchain image handle to an opaque [`RawImage`].
pub trait ImageHandle: Copy {
    fn raw(self) -> RawImage;
}

impl<T> ImageHandle for *mut T {
    #[inline]
    fn raw(self) -> RawImage {
        RawImage(self as usize as u64)
    }
}

/// Extensions we know about, filtered by what the runtime offers.
#[derive(Copy, Clone, Debug, Default)]
pub struct EnabledExtensions {
    pub d3d11: bool,
    pub d3d12: bool,
    pub depth: bool,
    pub cylinder: bool,
}

pub struct XrInstance {
    _entry: xr::Entry,
    pub instance: xr::Instance,
    pub system_id: xr::SystemId,
    pub extensions: EnabledExtensions,
}

impl XrInstance {
    pub fn new() -> Result<Self, InitError> {
        let entry =
            unsafe { xr::Entry::load() }.map_err(|e| InitError::Loader(format!("{e:?}")))?;

        let available = entry
            .enumerate_extensions()
            .map_err(InitError::InstanceCreationFailed)?;
        if !available.khr_d3d11_enable && !available.khr_d3d12_enable {
            return Err(InitError::MissingExtension("XR_KHR_D3D11_enable"));
        }

        let mut exts = xr::ExtensionSet::default();
        exts.khr_d3d11_enable = available.khr_d3d11_enable;
        exts.khr_d3d12_enable = available.khr_d3d12_enable;
        exts.khr_composition_layer_depth = available.khr_composition_layer_depth;
        exts.khr_composition_layer_cylinder = available.khr_composition_layer_cylinder;

        let instance = entry
            .create_instance(
                &xr::ApplicationInfo {
                    application_name: "xrstereo",
                    application_version: 0,
                    ..Default::default()
                },
                &exts,
                &[],
            )
            .map_err(InitError::InstanceCreationFailed)?;

        let props = instance
            .properties()
            .map_err(InitError::InstanceCreationFailed)?;
        info!(
            "OpenXR runtime: {} {}",
            props.runtime_name, props.runtime_version
        );

        let system_id = instance
            .system(xr::FormFactor::HEAD_MOUNTED_DISPLAY)
            .map_err(InitError::SystemCreationFailed)?;

        Ok(Self {
            _entry: entry,
            instance,
            system_id,
            extensions: EnabledExtensions {
                d3d11: exts.khr_d3d11_enable,
                d3d12: exts.khr_d3d12_enable,
                depth: exts.khr_composition_layer_depth,
                cylinder: exts.khr_composition_layer_cylinder,
            },
        })
    }
}

struct NativeSwapchain<G: xr::Graphics> {
    swapchain: xr::Swapchain<G>,
    images: Vec<RawImage>,
}

struct HandSpaces {
    aim: xr::Space,
    grip: xr::Space,
}

struct Actions {
    set: xr::ActionSet,
    hands: [HandSpaces; 2],
}

pub struct NativeSession<G: xr::Graphics> {
    session: xr::Session<G>,
    waiter: Option<xr::FrameWaiter>,
    stream: xr::FrameStream<G>,
    instance: xr::Instance,
    extensions: EnabledExtensions,
    view_space: xr::Space,
    stage_space: xr::Space,
    actions: Option<Actions>,
    swapchains: SlotMap<SwapchainKey, NativeSwapchain<G>>,
    resolution: (u32, u32),
    event_buffer: xr::EventDataBuffer,
}

// SAFETY: the session's handles are plain OpenXR handles, which may be used from any thread as
// long as calls are externally synchronized; the runtime wraps us in a Mutex.
unsafe impl<G: xr::Graphics> Send for NativeSession<G> {}

impl<G> NativeSession<G>
where
    G: xr::Graphics<Format = u32>,
    G::SwapchainImage: ImageHandle,
{
    /// # Safety
    /// `info` must reference a live device (and queue) the host keeps alive for the session's
    /// lifetime.
    pub unsafe fn new(xr: &XrInstance, info: &G::SessionCreateInfo) -> Result<Self, InitError> {
        // required to call
        let _ = xr
            .instance
            .graphics_requirements::<G>(xr.system_id)
            .map_err(InitError::SessionCreationFailed)?;

        let (session, waiter, stream) = xr
            .instance
            .create_session::<G>(xr.system_id, info)
            .map_err(InitError::SessionCreationFailed)?;
        info!("New session created!");

        let view_space = session
            .create_reference_space(xr::ReferenceSpaceType::VIEW, xr::Posef::IDENTITY)
            .map_err(InitError::SessionCreationFailed)?;

        let has_stage = session
            .enumerate_reference_spaces()
            .map(|spaces| spaces.contains(&xr::ReferenceSpaceType::STAGE))
            .unwrap_or(false);
        let stage_type = if has_stage {
            xr::ReferenceSpaceType::STAGE
        } else {
            warn!("runtime has no stage space, using local space");
            xr::ReferenceSpaceType::LOCAL
        };
        let stage_space = session
            .create_reference_space(stage_type, xr::Posef::IDENTITY)
            .map_err(InitError::SessionCreationFailed)?;

        let views = xr
            .instance
            .enumerate_view_configuration_views(xr.system_id, VIEW_TYPE)
            .map_err(InitError::SessionCreationFailed)?;
        let resolution = views
            .first()
            .map(|v| {
                (
                    v.recommended_image_rect_width,
                    v.recommended_image_rect_height,
                )
            })
            .unwrap_or_default();
        info!("recommended eye resolution: {}x{}", resolution.0, resolution.1);

        let actions = match Self::create_actions(&xr.instance, &session) {
            Ok(actions) => Some(actions),
            Err(e) => {
                warn!("controller poses unavailable: {e:?}");
                None
            }
        };

        Ok(Self {
            session,
            waiter: Some(waiter),
            stream,
            instance: xr.instance.clone(),
            extensions: xr.extensions,
            view_space,
            stage_space,
            actions,
            swapchains: SlotMap::with_key(),
            resolution,
            event_buffer: xr::EventDataBuffer::new(),
        })
    }

    fn create_actions(instance: &xr::Instance, session: &xr::Session<G>) -> XrResult<Actions> {
        let set = instance.create_action_set("xrstereo", "xrstereo poses", 0)?;
        let hand_paths = [
            instance.string_to_path("/user/hand/left")?,
            instance.string_to_path("/user/hand/right")?,
        ];
        let aim = set.create_action::<xr::Posef>("aim_pose", "Aim pose", &hand_paths)?;
        let grip = set.create_action::<xr::Posef>("grip_pose", "Grip pose", &hand_paths)?;

        let mut bindings = Vec::new();
        for side in ["left", "right"] {
            bindings.push(xr::Binding::new(
                &aim,
                instance.string_to_path(&format!("/user/hand/{side}/input/aim/pose"))?,
            ));
            bindings.push(xr::Binding::new(
                &grip,
                instance.string_to_path(&format!("/user/hand/{side}/input/grip/pose"))?,
            ));
        }
        for profile in [
            "/interaction_profiles/khr/simple_controller",
            "/interaction_profiles/oculus/touch_controller",
            "/interaction_profiles/valve/index_controller",
        ] {
            let path = instance.string_to_path(profile)?;
            if let Err(e) = instance.suggest_interaction_profile_bindings(path, &bindings) {
                debug!("bindings for {profile} rejected: {e:?}");
            }
        }

        session.attach_action_sets(&[&set])?;

        let space = |action: &xr::Action<xr::Posef>, path| {
            action.create_space(session.clone(), path, xr::Posef::IDENTITY)
        };
        let hands = [
            HandSpaces {
                aim: space(&aim, hand_paths[0])?,
                grip: space(&grip, hand_paths[0])?,
            },
            HandSpaces {
                aim: space(&aim, hand_paths[1])?,
                grip: space(&grip, hand_paths[1])?,
            },
        ];

        Ok(Actions { set, hands })
    }

    fn space(&self, space: ReferenceSpace) -> &xr::Space {
        match space {
            ReferenceSpace::View => &self.view_space,
            ReferenceSpace::Stage => &self.stage_space,
        }
    }

    fn sub_image(&self, key: SwapchainKey, rect: xr::Rect2Di) -> xr::sys::SwapchainSubImage {
        xr::sys::SwapchainSubImage {
            swapchain: self
                .swapchains
                .get(key)
                .map(|s| s.swapchain.as_raw())
                .unwrap_or(xr::sys::Swapchain::NULL),
            image_rect: rect,
            image_array_index: 0,
        }
    }
}

#[cfg(windows)]
impl NativeSession<xr::D3D11> {
    /// # Safety
    /// `device` must be a live `ID3D11Device`.
    pub unsafe fn d3d11(
        xr: &XrInstance,
        device: *mut std::ffi::c_void,
    ) -> Result<Self, InitError> {
        if !xr.extensions.d3d11 {
            return Err(InitError::MissingExtension("XR_KHR_D3D11_enable"));
        }
        Self::new(
            xr,
            &xr::d3d::SessionCreateInfoD3D11 {
                device: device as _,
            },
        )
    }
}

#[cfg(windows)]
impl NativeSession<xr::D3D12> {
    /// # Safety
    /// `device` and `queue` must be a live `ID3D12Device` and the `ID3D12CommandQueue` the host
    /// presents on.
    pub unsafe fn d3d12(
        xr: &XrInstance,
        device: *mut std::ffi::c_void,
        queue: *mut std::ffi::c_void,
    ) -> Result<Self, InitError> {
        if !xr.extensions.d3d12 {
            return Err(InitError::MissingExtension("XR_KHR_D3D12_enable"));
        }
        Self::new(
            xr,
            &xr::d3d::SessionCreateInfoD3D12 {
                device: device as _,
                queue: queue as _,
            },
        )
    }
}

struct NativeFrameWaiter(xr::FrameWaiter);

// SAFETY: xrWaitFrame may be called from any thread; the runtime serializes calls.
unsafe impl Send for NativeFrameWaiter {}

impl FrameWaiter for NativeFrameWaiter {
    fn wait_frame(&mut self) -> XrResult<FrameState> {
        let state = self.0.wait()?;
        Ok(FrameState {
            predicted_display_time: state.predicted_display_time,
            predicted_display_period: state.predicted_display_period,
            should_render: state.should_render,
        })
    }
}

fn views_from(views: Vec<xr::View>) -> XrResult<[EyeView; 2]> {
    match views.as_slice() {
        [l, r, ..] => Ok([
            EyeView {
                pose: l.pose,
                fov: l.fov,
            },
            EyeView {
                pose: r.pose,
                fov: r.fov,
            },
        ]),
        _ => Err(xr::sys::Result::ERROR_VALIDATION_FAILURE),
    }
}

impl<G> XrSession for NativeSession<G>
where
    G: xr::Graphics<Format = u32>,
    G::SwapchainImage: ImageHandle,
{
    fn take_frame_waiter(&mut self) -> Option<Box<dyn FrameWaiter>> {
        self.waiter
            .take()
            .map(|w| Box::new(NativeFrameWaiter(w)) as Box<dyn FrameWaiter>)
    }

    fn begin_frame(&mut self) -> XrResult {
        self.stream.begin().map(|_| ())
    }

    fn end_frame(&mut self, display_time: xr::Time, layers: &[CompositionLayer]) -> XrResult {
        // The high level frame stream can't chain depth info, so the layers are built raw.
        // Everything referenced by pointer lives in these vectors until xrEndFrame returns.
        let mut depth_infos = Vec::with_capacity(layers.len() * 2);
        let mut projection_views = Vec::with_capacity(layers.len() * 2);
        let mut projections = Vec::new();
        let mut quads = Vec::new();
        let mut cylinders = Vec::new();

        for layer in layers {
            if let CompositionLayer::Projection { views } = layer {
                for view in views {
                    if let Some(depth) = view.depth.filter(|_| self.extensions.depth) {
                        depth_infos.push(xr::sys::CompositionLayerDepthInfoKHR {
                            ty: xr::sys::CompositionLayerDepthInfoKHR::TYPE,
                            next: std::ptr::null(),
                            sub_image: self.sub_image(depth.swapchain, depth.rect),
                            min_depth: depth.min_depth,
                            max_depth: depth.max_depth,
                            near_z: depth.near_z,
                            far_z: depth.far_z,
                        });
                    }
                }
            }
        }

        let mut depth_iter = depth_infos.iter();
        for layer in layers {
            match *layer {
                CompositionLayer::Projection { views } => {
                    let first = projection_views.len();
                    for view in views {
                        let next = if view.depth.is_some() && self.extensions.depth {
                            depth_iter
                                .next()
                                .map(|d| d as *const _ as *const std::ffi::c_void)
                                .unwrap_or(std::ptr::null())
                        } else {
                            std::ptr::null()
                        };
                        projection_views.push(xr::sys::CompositionLayerProjectionView {
                            ty: xr::sys::CompositionLayerProjectionView::TYPE,
                            next,
                            pose: view.pose,
                            fov: view.fov,
                            sub_image: self.sub_image(view.swapchain, view.rect),
                        });
                    }
                    projections.push((first, views.len()));
                }
                CompositionLayer::Quad {
                    space,
                    swapchain,
                    rect,
                    pose,
                    size,
                } => quads.push(xr::sys::CompositionLayerQuad {
                    ty: xr::sys::CompositionLayerQuad::TYPE,
                    next: std::ptr::null(),
                    layer_flags: xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA,
                    space: self.space(space).as_raw(),
                    eye_visibility: xr::EyeVisibility::BOTH,
                    sub_image: self.sub_image(swapchain, rect),
                    pose,
                    size,
                }),
                CompositionLayer::Cylinder {
                    space,
                    swapchain,
                    rect,
                    pose,
                    radius,
                    central_angle,
                    aspect_ratio,
                } => {
                    if !self.extensions.cylinder {
                        crate::warn_once!("cylinder layers unsupported by runtime, skipping");
                        continue;
                    }
                    cylinders.push(xr::sys::CompositionLayerCylinderKHR {
                        ty: xr::sys::CompositionLayerCylinderKHR::TYPE,
                        next: std::ptr::null(),
                        layer_flags: xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA,
                        space: self.space(space).as_raw(),
                        eye_visibility: xr::EyeVisibility::BOTH,
                        sub_image: self.sub_image(swapchain, rect),
                        pose,
                        radius,
                        central_angle,
                        aspect_ratio,
                    })
                }
            }
        }

        let projection_layers: Vec<xr::sys::CompositionLayerProjection> = projections
            .iter()
            .map(|&(first, count)| xr::sys::CompositionLayerProjection {
                ty: xr::sys::CompositionLayerProjection::TYPE,
                next: std::ptr::null(),
                layer_flags: xr::CompositionLayerFlags::EMPTY,
                space: self.stage_space.as_raw(),
                view_count: count as u32,
                views: projection_views[first..].as_ptr(),
            })
            .collect();

        // Projection first, then UI on top.
        let headers: Vec<*const xr::sys::CompositionLayerBaseHeader> = projection_layers
            .iter()
            .map(|l| l as *const _ as *const _)
            .chain(quads.iter().map(|l| l as *const _ as *const _))
            .chain(cylinders.iter().map(|l| l as *const _ as *const _))
            .collect();

        let info = xr::sys::FrameEndInfo {
            ty: xr::sys::FrameEndInfo::TYPE,
            next: std::ptr::null(),
            display_time,
            environment_blend_mode: xr::EnvironmentBlendMode::OPAQUE,
            layer_count: headers.len() as u32,
            layers: headers.as_ptr(),
        };

        let result = unsafe { (self.instance.fp().end_frame)(self.session.as_raw(), &info) };
        if result.into_raw() < 0 {
            Err(result)
        } else {
            Ok(())
        }
    }

    fn locate_views(&mut self, time: xr::Time, space: ReferenceSpace) -> XrResult<[EyeView; 2]> {
        let (_, views) = self
            .session
            .locate_views(VIEW_TYPE, time, self.space(space))?;
        views_from(views)
    }

    fn locate(&mut self, space: TrackedSpace, time: xr::Time) -> XrResult<Option<xr::Posef>> {
        let target = match space {
            TrackedSpace::View => &self.view_space,
            TrackedSpace::Aim(hand) | TrackedSpace::Grip(hand) => {
                let Some(actions) = &self.actions else {
                    return Ok(None);
                };
                let spaces = &actions.hands[hand as usize];
                if matches!(space, TrackedSpace::Aim(_)) {
                    &spaces.aim
                } else {
                    &spaces.grip
                }
            }
        };

        let location = target.locate(&self.stage_space, time)?;
        Ok(crate::convert::is_pose_valid(&location).then_some(location.pose))
    }

    fn sync_actions(&mut self) -> XrResult {
        match &self.actions {
            Some(actions) => self
                .session
                .sync_actions(&[xr::ActiveActionSet::new(&actions.set)]),
            None => Ok(()),
        }
    }

    fn poll_event(&mut self) -> XrResult<Option<SessionEvent>> {
        loop {
            let Some(event) = self.instance.poll_event(&mut self.event_buffer)? else {
                return Ok(None);
            };
            let event = match event {
                xr::Event::SessionStateChanged(e) => SessionEvent::StateChanged(e.state()),
                xr::Event::InstanceLossPending(_) => SessionEvent::InstanceLossPending,
                xr::Event::ReferenceSpaceChangePending(_) => {
                    SessionEvent::ReferenceSpaceChangePending
                }
                xr::Event::InteractionProfileChanged(_) => SessionEvent::InteractionProfileChanged,
                xr::Event::EventsLost(e) => SessionEvent::EventsLost(e.lost_event_count()),
                _ => continue,
            };
            return Ok(Some(event));
        }
    }

    fn recommended_resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn supports_depth(&self) -> bool {
        self.extensions.depth
    }

    fn color_format(&self) -> u32 {
        // DXGI_FORMAT_R8G8B8A8_UNORM
        28
    }

    fn depth_format(&self) -> u32 {
        // DXGI_FORMAT_D32_FLOAT
        40
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> XrResult<SwapchainKey> {
        let usage_flags = match desc.usage {
            SwapchainUsage::Color => {
                xr::SwapchainUsageFlags::COLOR_ATTACHMENT
                    | xr::SwapchainUsageFlags::SAMPLED
                    | xr::SwapchainUsageFlags::TRANSFER_DST
            }
            SwapchainUsage::DepthStencil => {
                xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT
                    | xr::SwapchainUsageFlags::TRANSFER_DST
            }
        };
        let create_flags = if desc.static_image {
            xr::SwapchainCreateFlags::STATIC_IMAGE
        } else {
            xr::SwapchainCreateFlags::EMPTY
        };

        let swapchain = self.session.create_swapchain(&xr::SwapchainCreateInfo {
            create_flags,
            usage_flags,
            format: desc.format,
            sample_count: 1,
            width: desc.width,
            height: desc.height,
            face_count: 1,
            array_size: 1,
            mip_count: 1,
        })?;
        let images = swapchain
            .enumerate_images()?
            .into_iter()
            .map(ImageHandle::raw)
            .collect();

        Ok(self.swapchains.insert(NativeSwapchain { swapchain, images }))
    }

    fn destroy_swapchain(&mut self, key: SwapchainKey) {
        self.swapchains.remove(key);
    }

    fn swapchain_images(&self, key: SwapchainKey) -> XrResult<Vec<RawImage>> {
        self.swapchains
            .get(key)
            .map(|s| s.images.clone())
            .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)
    }

    fn acquire_image(&mut self, key: SwapchainKey) -> XrResult<u32> {
        self.swapchains
            .get_mut(key)
            .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)?
            .swapchain
            .acquire_image()
    }

    fn wait_image(&mut self, key: SwapchainKey, timeout: xr::Duration) -> XrResult {
        self.swapchains
            .get_mut(key)
            .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)?
            .swapchain
            .wait_image(timeout)
    }

    fn release_image(&mut self, key: SwapchainKey) -> XrResult {
        self.swapchains
            .get_mut(key)
            .ok_or(xr::sys::Result::ERROR_HANDLE_INVALID)?
            .swapchain
            .release_image()
    }

    fn begin_session(&mut self) -> XrResult {
        self.session.begin(VIEW_TYPE).map(|_| ())
    }

    fn end_session(&mut self) -> XrResult {
        self.session.end().map(|_| ())
    }

    fn request_exit(&mut self) -> XrResult {
        self.session.request_exit()
    }
}

impl<G: xr::Graphics> Drop for NativeSession<G> {
    fn drop(&mut self) {
        // Swapchains must go before the session.
        self.swapchains.clear();
        self.actions = None;
    }
}
