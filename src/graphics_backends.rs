//! Pieces of the stereo compositor shared by the D3D11 and D3D12 components.
//!
//! [`StereoComponent`] owns the frame flow: set up, pick the eyes this frame carries, copy them
//! out of the host's render target and hand them to whichever runtime is active. The graphics
//! API specific work sits behind [`GraphicsBackend`].

pub mod d3d11;
pub mod d3d12;
#[cfg(windows)]
mod shader;

pub use d3d11::{D3d11Backend, D3d11Component, D3d11Device};
pub use d3d12::{D3d12Backend, D3d12Component, D3d12Device};

use crate::{
    config::{Config, RenderingMethod, UiShape},
    runtime::{
        openxr::{CompositionLayer, DepthInfo, ProjectionView, RawImage, ReferenceSpace},
        AnyRuntime, Eye, OpenVrRuntime, OpenXrRuntime, RuntimeError, VrRuntime,
    },
    swapchains::{SwapchainError, SwapchainIndex, SwapchainManager, SwapchainParams},
    tracy_span,
};
use log::{debug, error, info, trace, warn};
use openvr as vr;
use openxr as xr;

pub const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// The host engine's current color targets.
pub trait RenderTargetProvider<T> {
    fn get_render_target(&self) -> Option<T>;
    fn get_ui_target(&self) -> Option<T>;
    fn get_depth_target(&self) -> Option<T> {
        None
    }
    fn get_backbuffer(&self) -> Option<T> {
        None
    }
    /// An overlay the host's mod framework draws on its own, layered above the game UI.
    fn get_framework_ui_target(&self) -> Option<T> {
        None
    }
}

type Lookup<T> = Box<dyn Fn() -> Option<T> + Send + Sync>;

/// A [`RenderTargetProvider`] assembled from lookups picked once the host engine is known.
pub struct StrategyProvider<T> {
    render_target: Lookup<T>,
    ui_target: Lookup<T>,
    depth_target: Option<Lookup<T>>,
    backbuffer: Option<Lookup<T>>,
    framework_ui: Option<Lookup<T>>,
}

impl<T> StrategyProvider<T> {
    pub fn new(
        render_target: impl Fn() -> Option<T> + Send + Sync + 'static,
        ui_target: impl Fn() -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            render_target: Box::new(render_target),
            ui_target: Box::new(ui_target),
            depth_target: None,
            backbuffer: None,
            framework_ui: None,
        }
    }

    pub fn with_depth_target(
        mut self,
        depth_target: impl Fn() -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        self.depth_target = Some(Box::new(depth_target));
        self
    }

    pub fn with_backbuffer(
        mut self,
        backbuffer: impl Fn() -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        self.backbuffer = Some(Box::new(backbuffer));
        self
    }

    pub fn with_framework_ui(
        mut self,
        framework_ui: impl Fn() -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        self.framework_ui = Some(Box::new(framework_ui));
        self
    }
}

impl<T> RenderTargetProvider<T> for StrategyProvider<T> {
    fn get_render_target(&self) -> Option<T> {
        (self.render_target)()
    }

    fn get_ui_target(&self) -> Option<T> {
        (self.ui_target)()
    }

    fn get_depth_target(&self) -> Option<T> {
        self.depth_target.as_ref().and_then(|f| f())
    }

    fn get_backbuffer(&self) -> Option<T> {
        self.backbuffer.as_ref().and_then(|f| f())
    }

    fn get_framework_ui_target(&self) -> Option<T> {
        self.framework_ui.as_ref().and_then(|f| f())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ComponentState {
    #[default]
    Uninitialized,
    Setup,
    Steady,
}

/// Where the desktop composite draws: the eyes side by side, the UI stretched over all of it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DesktopLayout {
    pub eyes: [Region; 2],
    pub ui: Region,
}

impl DesktopLayout {
    pub fn new(width: u32, height: u32) -> Self {
        let half = width / 2;
        Self {
            eyes: [
                Region::full(half, height),
                Region {
                    x: half,
                    y: 0,
                    width: width - half,
                    height,
                },
            ],
            ui: Region::full(width, height),
        }
    }
}

/// What an eye copy reads from, which decides the state the source sits in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// The host's scene render target, left in render target state.
    RenderTarget,
    /// The swapchain backbuffer, left in present state.
    Backbuffer,
    /// A copy made by [`GraphicsBackend::make_shader_readable`].
    Readable,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn to_rect(self) -> xr::Rect2Di {
        xr::Rect2Di {
            offset: xr::Offset2Di {
                x: self.x as i32,
                y: self.y as i32,
            },
            extent: xr::Extent2Di {
                width: self.width as i32,
                height: self.height as i32,
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    /// `DXGI_FORMAT`
    pub format: u32,
    /// Can be bound as a shader resource. Some backbuffers can't.
    pub shader_resource: bool,
}

#[derive(Debug, derive_more::Display, derive_more::From)]
pub enum SetupError {
    #[display("host has no render target")]
    #[from(ignore)]
    NoRenderTarget,
    #[display("component is not set up")]
    #[from(ignore)]
    NotSetUp,
    #[display("failed to create {_0}: {_1:#010x}")]
    #[from(ignore)]
    Device(&'static str, i32),
    #[display("swapchain image {_0:?} has no usable texture")]
    #[from(ignore)]
    UnknownImage(RawImage),
    Copier(d3d12::CopierError),
    Swapchain(SwapchainError),
    Runtime(RuntimeError),
}

impl SetupError {
    /// Whether retrying needs fresh resources rather than just another frame.
    pub fn is_stale_resource(&self) -> bool {
        matches!(
            self,
            Self::NotSetUp
                | Self::Device(..)
                | Self::UnknownImage(_)
                | Self::Copier(_)
                | Self::Swapchain(SwapchainError::Missing(_))
        )
    }
}

/// Which eyes a frame carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EyeSchedule {
    pub left: bool,
    pub right: bool,
}

impl EyeSchedule {
    pub fn contains(&self, eye: Eye) -> bool {
        match eye {
            Eye::Left => self.left,
            Eye::Right => self.right,
        }
    }

    pub fn eyes(self) -> impl Iterator<Item = Eye> {
        Eye::BOTH.into_iter().filter(move |e| self.contains(*e))
    }
}

/// Eyes for `render_frame_count`. Every frame carries both unless a frame-alternating method
/// is active.
pub fn eye_schedule(config: &Config, render_frame_count: u32) -> EyeSchedule {
    if !config.rendering_method.is_afr() {
        return EyeSchedule {
            left: true,
            right: true,
        };
    }
    let parity = render_frame_count % 2;
    EyeSchedule {
        left: parity == config.left_eye_interval,
        right: parity == config.right_eye_interval,
    }
}

/// True when `current` should be treated as a re-entry of the last presented frame.
pub fn is_same_frame(last: Option<u32>, current: u32, threshold: u32) -> bool {
    last.is_some_and(|last| current.abs_diff(last) <= threshold)
}

/// Size of one eye texture cut out of a host render target.
pub fn eye_texture_size(method: RenderingMethod, source: &TextureDesc) -> (u32, u32) {
    match method {
        RenderingMethod::NativeStereo | RenderingMethod::Synchronized => {
            ((source.width / 2).max(1), source.height)
        }
        RenderingMethod::Alternating => (source.width, source.height),
    }
}

/// Where an eye sits in the host render target.
pub fn source_region(method: RenderingMethod, eye: Eye, source: &TextureDesc) -> Region {
    match method {
        RenderingMethod::Alternating => Region::full(source.width, source.height),
        RenderingMethod::NativeStereo | RenderingMethod::Synchronized => {
            let width = source.width / 2;
            Region {
                x: width * eye as u32,
                y: 0,
                width,
                height: source.height,
            }
        }
    }
}

/// Where an eye sits in its swapchain image.
pub fn swapchain_region(index: SwapchainIndex, eye: Eye, width: u32, height: u32) -> Region {
    match index {
        SwapchainIndex::DoubleWide | SwapchainIndex::Depth => {
            let width = width / 2;
            Region {
                x: width * eye as u32,
                y: 0,
                width,
                height,
            }
        }
        _ => Region::full(width, height),
    }
}

/// What a compositor gets handed each present.
pub struct FrameContext<'a, T> {
    pub runtime: &'a AnyRuntime,
    pub config: &'a Config,
    pub render_frame_count: u32,
    pub provider: &'a dyn RenderTargetProvider<T>,
}

/// Graphics API work a [`StereoComponent`] delegates.
pub trait GraphicsBackend {
    type Texture: Clone;
    /// Held for the duration of a frame; restores whatever host state the frame disturbed.
    type StateGuard;

    const NAME: &'static str;

    fn describe(&self, texture: &Self::Texture) -> TextureDesc;
    fn state_guard(&self) -> Self::StateGuard;

    /// (Re)creates both eye textures and the blank texture.
    fn create_eye_textures(&mut self, size: (u32, u32), format: u32) -> Result<(), SetupError>;
    /// Lays out the desktop composite for a backbuffer of this size.
    fn create_compositing_pipeline(&mut self, backbuffer: &TextureDesc) -> Result<(), SetupError>;
    /// A copy of `texture` that can be read by shaders.
    fn make_shader_readable(&mut self, texture: &Self::Texture)
        -> Result<Self::Texture, SetupError>;
    /// Drops every GPU resource this backend created.
    fn release_resources(&mut self);
    fn has_resources(&self) -> bool;

    fn copy_to_eye(
        &mut self,
        eye: Eye,
        source: &Self::Texture,
        kind: SourceKind,
        region: Region,
    ) -> Result<(), SetupError>;
    fn clear_eye(&mut self, eye: Eye) -> Result<(), SetupError>;
    fn openvr_texture(&self, eye: Eye) -> Option<vr::Texture_t>;

    fn copy_eye_to_image(
        &mut self,
        eye: Eye,
        image: RawImage,
        region: Region,
    ) -> Result<(), SetupError>;
    fn copy_texture_to_image(
        &mut self,
        source: &Self::Texture,
        image: RawImage,
        depth: bool,
    ) -> Result<(), SetupError>;
    fn clear_image(&mut self, image: RawImage);
    /// Called when the runtime failed to hand out or take back a swapchain image.
    fn recover(&mut self);

    /// Redraws the backbuffer as both eyes side by side with `ui` centered on top.
    fn desktop_fix(
        &mut self,
        backbuffer: &Self::Texture,
        ui: Option<&Self::Texture>,
    ) -> Result<(), SetupError>;
}

/// The compositor state machine, generic over the graphics API.
pub struct StereoComponent<B: GraphicsBackend> {
    backend: B,
    state: ComponentState,
    force_reset: bool,
    method: Option<RenderingMethod>,
    source: Option<TextureDesc>,
    last_frame: Option<u32>,
    submitted_left_eye: bool,
    depth_copied: bool,
    compositing: bool,
    swapchains: SwapchainManager,
}

impl<B: GraphicsBackend> StereoComponent<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: ComponentState::Uninitialized,
            force_reset: false,
            method: None,
            source: None,
            last_frame: None,
            submitted_left_eye: false,
            depth_copied: false,
            compositing: false,
            swapchains: SwapchainManager::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> ComponentState {
        self.state
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn swapchains(&self) -> &SwapchainManager {
        &self.swapchains
    }

    #[inline]
    pub fn submitted_left_eye(&self) -> bool {
        self.submitted_left_eye
    }

    /// Forces the next frame through `setup`.
    pub fn force_reset(&mut self) {
        self.force_reset = true;
    }

    /// Tears down every GPU resource. The next frame sets up again before touching any texture.
    pub fn on_reset(&mut self) {
        info!("[{}] resetting", B::NAME);
        self.backend.release_resources();
        self.state = ComponentState::Uninitialized;
        self.source = None;
        self.method = None;
        self.last_frame = None;
        self.submitted_left_eye = false;
        self.depth_copied = false;
        self.compositing = false;
    }

    /// Destroys the OpenXR swapchains. They are recreated by the next setup.
    pub fn destroy_swapchains(&mut self, runtime: &OpenXrRuntime) {
        self.swapchains.destroy_swapchains(&mut **runtime.session());
        self.depth_copied = false;
        self.force_reset = true;
    }

    fn source_texture(&self, ctx: &FrameContext<'_, B::Texture>) -> Option<B::Texture> {
        if ctx.config.extreme_compatibility_mode {
            ctx.provider.get_backbuffer()
        } else {
            ctx.provider.get_render_target()
        }
    }

    fn swapchain_params(
        &self,
        ctx: &FrameContext<'_, B::Texture>,
        runtime: &OpenXrRuntime,
    ) -> SwapchainParams {
        let session = runtime.session();
        let backbuffer = ctx
            .provider
            .get_backbuffer()
            .or_else(|| ctx.provider.get_ui_target())
            .map(|t| {
                let desc = self.backend.describe(&t);
                (desc.width, desc.height)
            })
            .unwrap_or((0, 0));
        let depth_enabled = ctx.config.depth_enabled && session.supports_depth();
        let depth_size = ctx.provider.get_depth_target().map(|t| {
            let desc = self.backend.describe(&t);
            (desc.width, desc.height)
        });

        SwapchainParams {
            recommended: session.recommended_resolution(),
            resolution_scale: ctx.config.resolution_scale,
            rendering_method: ctx.config.rendering_method,
            backbuffer,
            color_format: session.color_format(),
            depth_enabled,
            depth_size: depth_size.filter(|_| depth_enabled),
        }
    }

    /// Builds everything a frame needs for the current render target and rendering method.
    pub fn setup(&mut self, ctx: &FrameContext<'_, B::Texture>) -> Result<(), SetupError> {
        tracy_span!("StereoComponent::setup");
        self.state = ComponentState::Setup;

        let source = self.source_texture(ctx).ok_or(SetupError::NoRenderTarget)?;
        let desc = self.backend.describe(&source);
        let method = ctx.config.rendering_method;
        let eye_size = eye_texture_size(method, &desc);
        info!(
            "[{}] setting up for {}x{} render target, {method:?}, eyes {}x{}",
            B::NAME,
            desc.width,
            desc.height,
            eye_size.0,
            eye_size.1
        );

        self.backend.create_eye_textures(eye_size, desc.format)?;

        self.compositing = false;
        if ctx.config.desktop_fix {
            if let Some(backbuffer) = ctx.provider.get_backbuffer() {
                let backbuffer = self.backend.describe(&backbuffer);
                self.backend.create_compositing_pipeline(&backbuffer)?;
                self.compositing = true;
            }
        }

        if let Some(runtime) = ctx.runtime.as_openxr() {
            let params = self.swapchain_params(ctx, runtime);
            let backend = &mut self.backend;
            self.swapchains.create_swapchains(
                &mut **runtime.session(),
                &params,
                &mut |image| backend.clear_image(image),
            )?;
            self.depth_copied = false;
        }

        self.source = Some(desc);
        self.method = Some(method);
        self.force_reset = false;
        self.submitted_left_eye = false;
        self.state = ComponentState::Steady;
        Ok(())
    }

    fn needs_setup(&self, ctx: &FrameContext<'_, B::Texture>) -> bool {
        if self.force_reset || self.state != ComponentState::Steady || !self.backend.has_resources()
        {
            return true;
        }
        let method = ctx.config.rendering_method;
        if self.method != Some(method) {
            debug!("[{}] rendering method changed to {method:?}", B::NAME);
            return true;
        }
        match (self.source_texture(ctx), &self.source) {
            (Some(texture), Some(current)) => {
                let desc = self.backend.describe(&texture);
                let changed = desc.width != current.width
                    || desc.height != current.height
                    || desc.format != current.format;
                if changed {
                    debug!(
                        "[{}] render target changed to {}x{}",
                        B::NAME,
                        desc.width,
                        desc.height
                    );
                }
                changed
            }
            _ => false,
        }
    }

    fn fail(&mut self, runtime: &AnyRuntime, what: &str, err: SetupError) -> SetupError {
        error!("[{}] {what}: {err}", B::NAME);
        runtime.set_submitted(false);
        if err.is_stale_resource() {
            self.force_reset = true;
        }
        err
    }

    /// Composites and submits one present's worth of eyes.
    pub fn on_frame(&mut self, ctx: &FrameContext<'_, B::Texture>) -> Result<(), SetupError> {
        tracy_span!("StereoComponent::on_frame");
        let runtime = ctx.runtime;
        if !runtime.loaded() {
            return Ok(());
        }
        let _guard = self.backend.state_guard();

        if self.needs_setup(ctx) {
            if let Err(e) = self.setup(ctx) {
                return Err(self.fail(runtime, "setup failed", e));
            }
        }

        let frame = ctx.render_frame_count;
        let schedule = eye_schedule(ctx.config, frame);
        if is_same_frame(self.last_frame, frame, ctx.config.duplicate_frame_threshold) {
            trace!("[{}] frame {frame} already presented", B::NAME);
            return Ok(());
        }
        self.last_frame = Some(frame);

        if let Err(e) = self.copy_eyes(ctx, schedule) {
            return Err(self.fail(runtime, "failed to copy eye textures", e));
        }

        let submitted = match runtime {
            AnyRuntime::OpenVr(rt) => self.submit_openvr(rt, schedule),
            AnyRuntime::OpenXr(rt) => self.submit_openxr(ctx, rt, schedule),
        };
        if let Err(e) = submitted {
            return Err(self.fail(runtime, "submission failed", e));
        }

        if self.compositing {
            if let Some(backbuffer) = ctx.provider.get_backbuffer() {
                let ui = ctx.provider.get_ui_target();
                if let Err(e) = self.backend.desktop_fix(&backbuffer, ui.as_ref()) {
                    crate::warn_once!("[{}] desktop fix failed: {}", B::NAME, e);
                }
            }
        }

        Ok(())
    }

    fn copy_eyes(
        &mut self,
        ctx: &FrameContext<'_, B::Texture>,
        schedule: EyeSchedule,
    ) -> Result<(), SetupError> {
        let Some(mut source) = self.source_texture(ctx) else {
            crate::warn_once!("[{}] no render target, presenting blank eyes", B::NAME);
            for eye in schedule.eyes() {
                self.backend.clear_eye(eye)?;
            }
            return Ok(());
        };

        let desc = self.backend.describe(&source);
        let mut kind = if ctx.config.extreme_compatibility_mode {
            SourceKind::Backbuffer
        } else {
            SourceKind::RenderTarget
        };
        if kind == SourceKind::Backbuffer && !desc.shader_resource {
            source = self.backend.make_shader_readable(&source)?;
            kind = SourceKind::Readable;
        }

        let method = ctx.config.rendering_method;
        for eye in schedule.eyes() {
            let region = source_region(method, eye, &desc);
            self.backend.copy_to_eye(eye, &source, kind, region)?;
        }
        Ok(())
    }

    fn submit_openvr(&mut self, rt: &OpenVrRuntime, schedule: EyeSchedule) -> Result<(), SetupError> {
        tracy_span!("StereoComponent::submit_openvr");
        let bounds = vr::VRTextureBounds_t::default();
        for eye in schedule.eyes() {
            let texture = self.backend.openvr_texture(eye).ok_or(SetupError::NotSetUp)?;
            rt.submit_eye(eye, texture, &bounds)?;
            match eye {
                Eye::Left => self.submitted_left_eye = true,
                Eye::Right => {
                    rt.end_frame();
                    self.submitted_left_eye = false;
                    rt.set_submitted(true);
                }
            }
        }
        Ok(())
    }

    fn submit_openxr(
        &mut self,
        ctx: &FrameContext<'_, B::Texture>,
        rt: &OpenXrRuntime,
        schedule: EyeSchedule,
    ) -> Result<(), SetupError> {
        tracy_span!("StereoComponent::submit_openxr");
        if !rt.session_running() {
            return Ok(());
        }

        let params = self.swapchain_params(ctx, rt);
        {
            let backend = &mut self.backend;
            if self.swapchains.prepare(
                &mut **rt.session(),
                &params,
                &mut |image| backend.clear_image(image),
            )? {
                self.depth_copied = false;
            }
        }

        rt.begin_frame()?;

        let method = ctx.config.rendering_method;
        {
            let mut session = rt.session();
            for eye in schedule.eyes() {
                let index = SwapchainIndex::for_eye(method, eye);
                let swapchain = self
                    .swapchains
                    .get(index)
                    .ok_or(SwapchainError::Missing(index))?;
                let region = swapchain_region(index, eye, swapchain.width, swapchain.height);
                let mut result = Ok(());
                self.swapchains.copy(
                    &mut **session,
                    index,
                    &mut self.backend,
                    B::recover,
                    |backend, _, image| result = backend.copy_eye_to_image(eye, image, region),
                )?;
                result?;
                if eye == Eye::Left {
                    self.submitted_left_eye = true;
                }
            }

            if params.depth_enabled {
                if let Some(depth) = ctx.provider.get_depth_target() {
                    let mut result = Ok(());
                    self.swapchains.copy(
                        &mut **session,
                        SwapchainIndex::Depth,
                        &mut self.backend,
                        B::recover,
                        |backend, _, image| {
                            result = backend.copy_texture_to_image(&depth, image, true)
                        },
                    )?;
                    result?;
                    self.depth_copied = true;
                }
            }
        }

        if !schedule.right {
            return Ok(());
        }

        let mut layers = vec![self.projection_layer(ctx, rt)?];
        let overlays = [
            (SwapchainIndex::Ui, ctx.provider.get_ui_target()),
            (
                SwapchainIndex::FrameworkUi,
                ctx.provider.get_framework_ui_target(),
            ),
        ];
        for (index, texture) in overlays {
            if let Some(texture) = texture {
                layers.extend(self.copy_overlay(ctx, rt, index, &texture)?);
            }
        }

        rt.end_frame(&layers)?;
        self.submitted_left_eye = false;
        rt.set_submitted(true);
        Ok(())
    }

    /// Copies a UI texture into its swapchain and builds the layer showing it.
    fn copy_overlay(
        &mut self,
        ctx: &FrameContext<'_, B::Texture>,
        rt: &OpenXrRuntime,
        index: SwapchainIndex,
        ui: &B::Texture,
    ) -> Result<Option<CompositionLayer>, SetupError> {
        let Some(swapchain) = self.swapchains.get(index) else {
            return Ok(None);
        };
        let (key, rect) = (swapchain.key, swapchain.rect());
        let aspect = swapchain.width as f32 / swapchain.height.max(1) as f32;

        let mut result = Ok(());
        self.swapchains.copy(
            &mut **rt.session(),
            index,
            &mut self.backend,
            B::recover,
            |backend, _, image| result = backend.copy_texture_to_image(ui, image, false),
        )?;
        result?;

        let layer = &ctx.config.ui_layer;
        let pose = xr::Posef {
            orientation: xr::Quaternionf::IDENTITY,
            position: xr::Vector3f {
                x: 0.0,
                y: 0.0,
                z: -layer.distance,
            },
        };
        Ok(Some(match layer.shape {
            UiShape::Quad => CompositionLayer::Quad {
                space: ReferenceSpace::View,
                swapchain: key,
                rect,
                pose,
                size: xr::Extent2Df {
                    width: layer.size,
                    height: layer.size / aspect,
                },
            },
            UiShape::Cylinder => CompositionLayer::Cylinder {
                space: ReferenceSpace::View,
                swapchain: key,
                rect,
                pose: xr::Posef::IDENTITY,
                radius: layer.distance,
                central_angle: layer.cylinder_angle,
                aspect_ratio: aspect,
            },
        }))
    }

    fn projection_view(
        &self,
        ctx: &FrameContext<'_, B::Texture>,
        rt: &OpenXrRuntime,
        eye: Eye,
    ) -> Result<ProjectionView, SetupError> {
        let method = ctx.config.rendering_method;
        let index = SwapchainIndex::for_eye(method, eye);
        let swapchain = self
            .swapchains
            .get(index)
            .ok_or(SwapchainError::Missing(index))?;
        let view = rt
            .get_current_stage_view(eye)
            .unwrap_or_else(|| rt.latest_stage_view(eye));

        let depth = self
            .swapchains
            .get(SwapchainIndex::Depth)
            .filter(|_| self.depth_copied)
            .map(|d| {
                // AFR eyes each fill the whole depth image.
                let region = if method.is_afr() {
                    Region::full(d.width, d.height)
                } else {
                    swapchain_region(SwapchainIndex::Depth, eye, d.width, d.height)
                };
                DepthInfo {
                    swapchain: d.key,
                    rect: region.to_rect(),
                    min_depth: 0.0,
                    max_depth: 1.0,
                    near_z: ctx.config.near_z,
                    far_z: ctx.config.far_z,
                }
            });

        Ok(ProjectionView {
            swapchain: swapchain.key,
            rect: swapchain_region(index, eye, swapchain.width, swapchain.height).to_rect(),
            pose: view.pose,
            fov: view.fov,
            depth,
        })
    }

    fn projection_layer(
        &self,
        ctx: &FrameContext<'_, B::Texture>,
        rt: &OpenXrRuntime,
    ) -> Result<CompositionLayer, SetupError> {
        Ok(CompositionLayer::Projection {
            views: [
                self.projection_view(ctx, rt, Eye::Left)?,
                self.projection_view(ctx, rt, Eye::Right)?,
            ],
        })
    }
}

impl<B: GraphicsBackend> Drop for StereoComponent<B> {
    fn drop(&mut self) {
        if self.swapchains.num_textures_acquired() != 0 {
            warn!(
                "[{}] dropped with {} swapchain images still acquired",
                B::NAME,
                self.swapchains.num_textures_acquired()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn afr_parity_with_default_intervals() {
        let config = Config {
            rendering_method: RenderingMethod::Alternating,
            ..Default::default()
        };
        assert_eq!(
            eye_schedule(&config, 0),
            EyeSchedule {
                left: true,
                right: false
            }
        );
        assert_eq!(
            eye_schedule(&config, 1),
            EyeSchedule {
                left: false,
                right: true
            }
        );
        assert_eq!(eye_schedule(&config, 2), eye_schedule(&config, 0));
    }

    #[test]
    fn swapped_intervals_swap_eyes() {
        let config = Config {
            rendering_method: RenderingMethod::Synchronized,
            left_eye_interval: 1,
            right_eye_interval: 0,
            ..Default::default()
        };
        assert!(eye_schedule(&config, 0).right);
        assert!(eye_schedule(&config, 1).left);
    }

    #[test]
    fn native_stereo_carries_both_eyes() {
        let config = Config::default();
        for frame in 0..3 {
            let schedule = eye_schedule(&config, frame);
            assert!(schedule.left && schedule.right);
            assert_eq!(schedule.eyes().count(), 2);
        }
    }

    #[test]
    fn same_frame_threshold() {
        assert!(!is_same_frame(None, 0, 0));
        assert!(is_same_frame(Some(5), 5, 0));
        assert!(!is_same_frame(Some(5), 6, 0));
        assert!(is_same_frame(Some(5), 6, 1));
        assert!(is_same_frame(Some(6), 5, 1));
    }

    #[test]
    fn double_wide_split() {
        let source = TextureDesc {
            width: 3840,
            height: 1080,
            format: 28,
            shader_resource: true,
        };
        assert_eq!(
            eye_texture_size(RenderingMethod::NativeStereo, &source),
            (1920, 1080)
        );
        assert_eq!(
            source_region(RenderingMethod::NativeStereo, Eye::Left, &source),
            Region {
                x: 0,
                y: 0,
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(
            source_region(RenderingMethod::NativeStereo, Eye::Right, &source),
            Region {
                x: 1920,
                y: 0,
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(
            eye_texture_size(RenderingMethod::Alternating, &source),
            (3840, 1080)
        );
        assert_eq!(
            source_region(RenderingMethod::Alternating, Eye::Right, &source),
            Region::full(3840, 1080)
        );
    }

    #[test]
    fn strategy_provider_defaults() {
        let provider = StrategyProvider::new(|| Some(1u32), || None);
        assert_eq!(provider.get_render_target(), Some(1));
        assert_eq!(provider.get_ui_target(), None);
        assert_eq!(provider.get_backbuffer(), None);

        let provider = provider
            .with_backbuffer(|| Some(3))
            .with_depth_target(|| Some(4));
        assert_eq!(provider.get_backbuffer(), Some(3));
        assert_eq!(provider.get_depth_target(), Some(4));
    }

    #[test]
    fn desktop_layout_covers_odd_widths() {
        let layout = DesktopLayout::new(1281, 720);
        let [left, right] = layout.eyes;
        assert_eq!(left, Region::full(640, 720));
        assert_eq!(right.x, 640);
        assert_eq!(left.width + right.width, 1281);
        assert_eq!(layout.ui, Region::full(1281, 720));
    }
}
