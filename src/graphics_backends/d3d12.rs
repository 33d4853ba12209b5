#[cfg(windows)]
pub mod native;

use super::{
    DesktopLayout, GraphicsBackend, Region, SetupError, SourceKind, StereoComponent, TextureDesc,
    BLACK,
};
use crate::runtime::{openxr::RawImage, Eye};
use log::{debug, trace, warn};
use openvr as vr;
use std::collections::{hash_map::Entry, HashMap};
use std::ffi::c_void;
use std::sync::Arc;

pub use super::d3d11::HResult;

pub type D3d12Component<D> = StereoComponent<D3d12Backend<D>>;

pub const INFINITE: u32 = u32::MAX;
/// How long a reset waits for in-flight copies before dropping them anyway.
pub const RESET_TIMEOUT_MS: u32 = 2000;
const RECOVER_TIMEOUT_MS: u32 = 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Also `PRESENT`.
    Common,
    RenderTarget,
    PixelShaderResource,
    CopySource,
    CopyDest,
    DepthWrite,
}

/// The slice of `ID3D12Device` and its command queue the compositor uses.
pub trait D3d12Device: Send + Sync + 'static {
    type Resource: Clone;
    /// A command allocator and the list recording into it.
    type CommandList;
    type Fence;
    /// Root signature and pipeline states for [`D3d12Device::blit`].
    type Pipeline;

    fn describe(&self, resource: &Self::Resource) -> TextureDesc;
    fn identity(&self, resource: &Self::Resource) -> usize;
    /// A committed 2D texture in `state`, usable as render target and shader resource.
    fn create_texture(
        &self,
        width: u32,
        height: u32,
        format: u32,
        state: ResourceState,
    ) -> HResult<Self::Resource>;
    /// The resource behind an OpenXR swapchain image.
    fn swapchain_resource(&self, image: RawImage) -> Option<Self::Resource>;

    /// Created open.
    fn create_command_list(&self) -> HResult<Self::CommandList>;
    fn create_fence(&self) -> HResult<Self::Fence>;

    fn transition(
        &self,
        list: &Self::CommandList,
        resource: &Self::Resource,
        before: ResourceState,
        after: ResourceState,
    );
    fn copy_region(
        &self,
        list: &Self::CommandList,
        dst: &Self::Resource,
        dst_x: u32,
        dst_y: u32,
        src: &Self::Resource,
        region: Region,
    );
    fn copy_resource(&self, list: &Self::CommandList, dst: &Self::Resource, src: &Self::Resource);
    /// `resource` is in `RenderTarget` state.
    fn clear(&self, list: &Self::CommandList, resource: &Self::Resource, color: [f32; 4]) -> HResult;

    /// Pipeline states drawing into render targets of `format`.
    fn create_blit_pipeline(&self, format: u32) -> HResult<Self::Pipeline>;
    /// Draws `src` stretched over `area` of `dst`, alpha blended when `blend`. `src` is in
    /// `PixelShaderResource` state and `dst` in `RenderTarget`.
    fn blit(
        &self,
        list: &Self::CommandList,
        pipeline: &Self::Pipeline,
        src: &Self::Resource,
        dst: &Self::Resource,
        area: Region,
        blend: bool,
    );

    fn close_and_execute(&self, list: &Self::CommandList) -> HResult;
    fn signal(&self, fence: &Self::Fence, value: u64) -> HResult;
    /// Whether the fence reached `value` within `timeout_ms`.
    fn wait_for_fence(&self, fence: &Self::Fence, value: u64, timeout_ms: u32) -> bool;
    /// Resets the allocator and reopens the list.
    fn reset_command_list(&self, list: &Self::CommandList) -> HResult;

    fn openvr_texture_data(&self, resource: &Self::Resource) -> vr::D3D12TextureData_t;
}

#[derive(Debug, derive_more::Display)]
pub enum CopierError {
    #[display("copier is waiting on its fence")]
    InFlight,
    #[display("{_0} failed: {_1:#010x}")]
    Device(&'static str, i32),
    #[display("fence not reached after {_0} ms")]
    Timeout(u32),
}

/// One texture drawn by [`ResourceCopier::composite`].
pub struct BlitLayer<'a, R> {
    pub src: &'a R,
    /// The state `src` is in before and after the draw.
    pub state: ResourceState,
    pub area: Region,
    pub blend: bool,
}

/// A command list that carries one batch of copies at a time.
pub struct ResourceCopier<D: D3d12Device> {
    device: Arc<D>,
    list: D::CommandList,
    fence: D::Fence,
    fence_value: u64,
    has_commands: bool,
    waiting_for_fence: bool,
}

impl<D: D3d12Device> ResourceCopier<D> {
    pub fn new(device: Arc<D>) -> Result<Self, CopierError> {
        let list = device
            .create_command_list()
            .map_err(|e| CopierError::Device("CreateCommandList", e))?;
        let fence = device
            .create_fence()
            .map_err(|e| CopierError::Device("CreateFence", e))?;
        Ok(Self {
            device,
            list,
            fence,
            fence_value: 0,
            has_commands: false,
            waiting_for_fence: false,
        })
    }

    #[inline]
    pub fn has_commands(&self) -> bool {
        self.has_commands
    }

    #[inline]
    pub fn waiting_for_fence(&self) -> bool {
        self.waiting_for_fence
    }

    fn record(&mut self) -> Result<&D::CommandList, CopierError> {
        if self.waiting_for_fence {
            return Err(CopierError::InFlight);
        }
        self.has_commands = true;
        Ok(&self.list)
    }

    pub fn copy(
        &mut self,
        src: &D::Resource,
        dst: &D::Resource,
        src_state: ResourceState,
        dst_state: ResourceState,
    ) -> Result<(), CopierError> {
        let device = self.device.clone();
        let list = self.record()?;
        device.transition(list, src, src_state, ResourceState::CopySource);
        device.transition(list, dst, dst_state, ResourceState::CopyDest);
        device.copy_resource(list, dst, src);
        device.transition(list, src, ResourceState::CopySource, src_state);
        device.transition(list, dst, ResourceState::CopyDest, dst_state);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_region(
        &mut self,
        src: &D::Resource,
        dst: &D::Resource,
        region: Region,
        dst_x: u32,
        dst_y: u32,
        src_state: ResourceState,
        dst_state: ResourceState,
    ) -> Result<(), CopierError> {
        let device = self.device.clone();
        let list = self.record()?;
        device.transition(list, src, src_state, ResourceState::CopySource);
        device.transition(list, dst, dst_state, ResourceState::CopyDest);
        device.copy_region(list, dst, dst_x, dst_y, src, region);
        device.transition(list, src, ResourceState::CopySource, src_state);
        device.transition(list, dst, ResourceState::CopyDest, dst_state);
        Ok(())
    }

    pub fn clear(
        &mut self,
        resource: &D::Resource,
        color: [f32; 4],
        state: ResourceState,
    ) -> Result<(), CopierError> {
        let device = self.device.clone();
        let list = self.record()?;
        if state != ResourceState::RenderTarget {
            device.transition(list, resource, state, ResourceState::RenderTarget);
        }
        device
            .clear(list, resource, color)
            .map_err(|e| CopierError::Device("ClearRenderTargetView", e))?;
        if state != ResourceState::RenderTarget {
            device.transition(list, resource, ResourceState::RenderTarget, state);
        }
        Ok(())
    }

    /// Clears `dst` and draws `layers` over it in order.
    pub fn composite(
        &mut self,
        pipeline: &D::Pipeline,
        dst: &D::Resource,
        dst_state: ResourceState,
        layers: &[BlitLayer<'_, D::Resource>],
    ) -> Result<(), CopierError> {
        let device = self.device.clone();
        let list = self.record()?;
        let shader_read = ResourceState::PixelShaderResource;
        device.transition(list, dst, dst_state, ResourceState::RenderTarget);
        device
            .clear(list, dst, BLACK)
            .map_err(|e| CopierError::Device("ClearRenderTargetView", e))?;
        for layer in layers {
            if layer.state != shader_read {
                device.transition(list, layer.src, layer.state, shader_read);
            }
            device.blit(list, pipeline, layer.src, dst, layer.area, layer.blend);
            if layer.state != shader_read {
                device.transition(list, layer.src, shader_read, layer.state);
            }
        }
        device.transition(list, dst, ResourceState::RenderTarget, dst_state);
        Ok(())
    }

    /// Submits everything recorded and signals the fence. A no-op without commands.
    pub fn execute(&mut self) -> Result<(), CopierError> {
        if !self.has_commands {
            return Ok(());
        }
        self.device
            .close_and_execute(&self.list)
            .map_err(|e| CopierError::Device("ExecuteCommandLists", e))?;
        self.has_commands = false;
        self.fence_value += 1;
        self.device
            .signal(&self.fence, self.fence_value)
            .map_err(|e| CopierError::Device("Signal", e))?;
        self.waiting_for_fence = true;
        Ok(())
    }

    /// Blocks until the last execution finished, then reopens the list.
    pub fn wait(&mut self, timeout_ms: u32) -> Result<(), CopierError> {
        if !self.waiting_for_fence {
            return Ok(());
        }
        if !self
            .device
            .wait_for_fence(&self.fence, self.fence_value, timeout_ms)
        {
            return Err(CopierError::Timeout(timeout_ms));
        }
        self.device
            .reset_command_list(&self.list)
            .map_err(|e| CopierError::Device("Reset", e))?;
        self.waiting_for_fence = false;
        Ok(())
    }

    /// Drops whatever is recorded or in flight without waiting.
    pub fn reset(&mut self) {
        if let Err(e) = self.device.reset_command_list(&self.list) {
            warn!("failed to reset copier command list: {e:#010x}");
        }
        self.has_commands = false;
        self.waiting_for_fence = false;
    }

    /// Waits up to `timeout_ms`, force resetting if the fence never arrives.
    pub fn wait_or_reset(&mut self, timeout_ms: u32) {
        if let Err(e) = self.wait(timeout_ms) {
            warn!("{e}, resetting copier");
            self.reset();
        }
    }
}

pub struct D3d12Backend<D: D3d12Device> {
    device: Arc<D>,
    eyes: [Option<D::Resource>; 2],
    blank: Option<D::Resource>,
    readable: Option<D::Resource>,
    eye_copiers: [Option<ResourceCopier<D>>; 2],
    /// Blank clears, readable copies and the desktop fix.
    copier: Option<ResourceCopier<D>>,
    /// Desktop composite pipeline and the backbuffer format it was built for.
    compositor: Option<(D::Pipeline, u32)>,
    image_copiers: HashMap<RawImage, ResourceCopier<D>>,
    openvr_data: [vr::D3D12TextureData_t; 2],
}

impl<D: D3d12Device> D3d12Backend<D> {
    pub fn new(device: Arc<D>) -> Self {
        let empty = vr::D3D12TextureData_t {
            m_pResource: std::ptr::null_mut(),
            m_pCommandQueue: std::ptr::null_mut(),
            m_nNodeMask: 0,
        };
        Self {
            device,
            eyes: [None, None],
            blank: None,
            readable: None,
            eye_copiers: [None, None],
            copier: None,
            compositor: None,
            image_copiers: HashMap::new(),
            openvr_data: [empty; 2],
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn eye_texture(&self, eye: Eye) -> Option<&D::Resource> {
        self.eyes[eye as usize].as_ref()
    }

    pub fn eye_copier(&self, eye: Eye) -> Option<&ResourceCopier<D>> {
        self.eye_copiers[eye as usize].as_ref()
    }

    pub fn image_copiers(&self) -> usize {
        self.image_copiers.len()
    }

    fn create(&self, (width, height): (u32, u32), format: u32, what: &'static str) -> Result<D::Resource, SetupError> {
        self.device
            .create_texture(width, height, format, ResourceState::PixelShaderResource)
            .map_err(|e| SetupError::Device(what, e))
    }

    fn image_copier(&mut self, image: RawImage) -> Result<&mut ResourceCopier<D>, SetupError> {
        let copier = match self.image_copiers.entry(image) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                trace!("new copier for swapchain image {image:?}");
                e.insert(ResourceCopier::new(self.device.clone())?)
            }
        };
        copier.wait(INFINITE)?;
        Ok(copier)
    }

    fn clipped(&self, src: &D::Resource, max: Region) -> Region {
        let desc = self.device.describe(src);
        Region::full(desc.width.min(max.width), desc.height.min(max.height))
    }

    fn all_copiers(&mut self) -> impl Iterator<Item = &mut ResourceCopier<D>> {
        self.eye_copiers
            .iter_mut()
            .flatten()
            .chain(self.copier.iter_mut())
            .chain(self.image_copiers.values_mut())
    }
}

impl<D: D3d12Device> GraphicsBackend for D3d12Backend<D> {
    type Texture = D::Resource;
    type StateGuard = ();

    const NAME: &'static str = "D3D12";

    fn describe(&self, texture: &Self::Texture) -> TextureDesc {
        self.device.describe(texture)
    }

    fn state_guard(&self) -> Self::StateGuard {}

    fn create_eye_textures(&mut self, size: (u32, u32), format: u32) -> Result<(), SetupError> {
        for copier in self.all_copiers() {
            copier.wait_or_reset(RESET_TIMEOUT_MS);
        }

        for eye in Eye::BOTH {
            let texture = self.create(size, format, "eye texture")?;
            self.openvr_data[eye as usize] = self.device.openvr_texture_data(&texture);
            self.eyes[eye as usize] = Some(texture);
            if self.eye_copiers[eye as usize].is_none() {
                self.eye_copiers[eye as usize] = Some(ResourceCopier::new(self.device.clone())?);
            }
        }
        let blank = self.create(size, format, "blank texture")?;
        if self.copier.is_none() {
            self.copier = Some(ResourceCopier::new(self.device.clone())?);
        }
        let copier = self.copier.as_mut().ok_or(SetupError::NotSetUp)?;
        for texture in self.eyes.iter().flatten().chain([&blank]) {
            copier.clear(texture, BLACK, ResourceState::PixelShaderResource)?;
        }
        copier.execute()?;
        self.blank = Some(blank);

        debug!("created {}x{} eye textures", size.0, size.1);
        Ok(())
    }

    fn create_compositing_pipeline(&mut self, backbuffer: &TextureDesc) -> Result<(), SetupError> {
        if self.compositor.as_ref().map(|(_, format)| *format) != Some(backbuffer.format) {
            let pipeline = self
                .device
                .create_blit_pipeline(backbuffer.format)
                .map_err(|e| SetupError::Device("blit pipeline", e))?;
            self.compositor = Some((pipeline, backbuffer.format));
        }
        debug!(
            "desktop fix enabled for {}x{} backbuffer",
            backbuffer.width, backbuffer.height
        );
        Ok(())
    }

    fn make_shader_readable(&mut self, texture: &Self::Texture) -> Result<Self::Texture, SetupError> {
        let desc = self.device.describe(texture);
        let stale = self.readable.as_ref().map_or(true, |r| {
            let current = self.device.describe(r);
            current.width != desc.width
                || current.height != desc.height
                || current.format != desc.format
        });
        if stale {
            self.readable = Some(self.create((desc.width, desc.height), desc.format, "readable copy")?);
        }

        let readable = self.readable.clone().ok_or(SetupError::NotSetUp)?;
        let copier = self.copier.as_mut().ok_or(SetupError::NotSetUp)?;
        copier.wait(INFINITE)?;
        copier.copy(
            texture,
            &readable,
            ResourceState::Common,
            ResourceState::PixelShaderResource,
        )?;
        copier.execute()?;
        Ok(readable)
    }

    fn release_resources(&mut self) {
        for copier in self.all_copiers() {
            copier.wait_or_reset(RESET_TIMEOUT_MS);
        }
        self.eye_copiers = [None, None];
        self.copier = None;
        self.compositor = None;
        self.image_copiers.clear();
        self.eyes = [None, None];
        self.blank = None;
        self.readable = None;
        for data in &mut self.openvr_data {
            data.m_pResource = std::ptr::null_mut();
        }
    }

    fn has_resources(&self) -> bool {
        self.eyes.iter().all(Option::is_some) && self.blank.is_some()
    }

    fn copy_to_eye(
        &mut self,
        eye: Eye,
        source: &Self::Texture,
        kind: SourceKind,
        region: Region,
    ) -> Result<(), SetupError> {
        let src_state = match kind {
            SourceKind::RenderTarget => ResourceState::RenderTarget,
            SourceKind::Backbuffer => ResourceState::Common,
            SourceKind::Readable => ResourceState::PixelShaderResource,
        };
        let dst = self.eyes[eye as usize].clone().ok_or(SetupError::NotSetUp)?;
        let copier = self.eye_copiers[eye as usize]
            .as_mut()
            .ok_or(SetupError::NotSetUp)?;
        copier.wait(INFINITE)?;
        copier.copy_region(
            source,
            &dst,
            region,
            0,
            0,
            src_state,
            ResourceState::PixelShaderResource,
        )?;
        copier.execute()?;
        Ok(())
    }

    fn clear_eye(&mut self, eye: Eye) -> Result<(), SetupError> {
        let dst = self.eyes[eye as usize].clone().ok_or(SetupError::NotSetUp)?;
        let copier = self.eye_copiers[eye as usize]
            .as_mut()
            .ok_or(SetupError::NotSetUp)?;
        copier.wait(INFINITE)?;
        copier.clear(&dst, BLACK, ResourceState::PixelShaderResource)?;
        copier.execute()?;
        Ok(())
    }

    fn openvr_texture(&self, eye: Eye) -> Option<vr::Texture_t> {
        self.eyes[eye as usize].as_ref()?;
        Some(vr::Texture_t {
            handle: &self.openvr_data[eye as usize] as *const vr::D3D12TextureData_t
                as *mut c_void,
            eType: vr::ETextureType::DirectX12,
            eColorSpace: vr::EColorSpace::Auto,
        })
    }

    fn copy_eye_to_image(&mut self, eye: Eye, image: RawImage, region: Region) -> Result<(), SetupError> {
        let dst = self
            .device
            .swapchain_resource(image)
            .ok_or(SetupError::UnknownImage(image))?;
        let src = self.eyes[eye as usize].clone().ok_or(SetupError::NotSetUp)?;
        let src_region = self.clipped(&src, region);

        let copier = self.image_copier(image)?;
        copier.copy_region(
            &src,
            &dst,
            src_region,
            region.x,
            region.y,
            ResourceState::PixelShaderResource,
            ResourceState::RenderTarget,
        )?;
        copier.execute()?;
        Ok(())
    }

    fn copy_texture_to_image(
        &mut self,
        source: &Self::Texture,
        image: RawImage,
        depth: bool,
    ) -> Result<(), SetupError> {
        let dst = self
            .device
            .swapchain_resource(image)
            .ok_or(SetupError::UnknownImage(image))?;
        let dst_desc = self.device.describe(&dst);
        let region = self.clipped(source, Region::full(dst_desc.width, dst_desc.height));
        let state = if depth {
            ResourceState::DepthWrite
        } else {
            ResourceState::RenderTarget
        };

        let copier = self.image_copier(image)?;
        copier.copy_region(source, &dst, region, 0, 0, state, state)?;
        copier.execute()?;
        Ok(())
    }

    fn clear_image(&mut self, image: RawImage) {
        let Some(dst) = self.device.swapchain_resource(image) else {
            warn!("no resource for swapchain image {image:?}");
            return;
        };
        let result = self.image_copier(image).and_then(|copier| {
            copier.clear(&dst, BLACK, ResourceState::RenderTarget)?;
            copier.execute()?;
            Ok(())
        });
        if let Err(e) = result {
            warn!("failed to clear swapchain image: {e}");
        }
    }

    fn recover(&mut self) {
        debug!("resetting in-flight swapchain copiers");
        for copier in self.image_copiers.values_mut() {
            copier.wait_or_reset(RECOVER_TIMEOUT_MS);
        }
    }

    fn desktop_fix(
        &mut self,
        backbuffer: &Self::Texture,
        ui: Option<&Self::Texture>,
    ) -> Result<(), SetupError> {
        let [left, right] = &self.eyes;
        let (Some(left), Some(right)) = (left, right) else {
            return Err(SetupError::NotSetUp);
        };
        let (pipeline, _) = self.compositor.as_ref().ok_or(SetupError::NotSetUp)?;
        let bb = self.device.describe(backbuffer);
        let layout = DesktopLayout::new(bb.width, bb.height);

        let eye_layer = |src, area| BlitLayer {
            src,
            state: ResourceState::PixelShaderResource,
            area,
            blend: false,
        };
        let mut layers = vec![
            eye_layer(left, layout.eyes[Eye::Left as usize]),
            eye_layer(right, layout.eyes[Eye::Right as usize]),
        ];
        match ui {
            Some(ui) if self.device.describe(ui).shader_resource => layers.push(BlitLayer {
                src: ui,
                state: ResourceState::RenderTarget,
                area: layout.ui,
                blend: true,
            }),
            Some(_) => {
                crate::warn_once!("UI texture can't be sampled, leaving it out of the desktop view")
            }
            None => {}
        }

        let copier = self.copier.as_mut().ok_or(SetupError::NotSetUp)?;
        copier.wait(INFINITE)?;
        copier.composite(pipeline, backbuffer, ResourceState::Common, &layers)?;
        copier.execute()?;
        Ok(())
    }
}
