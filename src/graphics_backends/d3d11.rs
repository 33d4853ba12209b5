#[cfg(windows)]
pub mod native;

use super::{
    DesktopLayout, GraphicsBackend, Region, SetupError, SourceKind, StereoComponent, TextureDesc,
    BLACK,
};
use crate::runtime::{openxr::RawImage, Eye};
use log::{debug, warn};
use openvr as vr;
use std::ffi::c_void;
use std::sync::Arc;

/// An `HRESULT` failure.
pub type HResult<T = ()> = Result<T, i32>;

pub type D3d11Component<D> = StereoComponent<D3d11Backend<D>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViewKind {
    RenderTarget,
    ShaderResource,
}

/// The slice of `ID3D11Device` and its immediate context the compositor uses.
pub trait D3d11Device: Send + Sync + 'static {
    type Texture: Clone;
    type View: Clone;
    /// Whatever pipeline state the compositor may disturb.
    type State;
    /// Shaders and fixed function state for [`D3d11Device::blit`].
    type Pipeline;

    fn describe(&self, texture: &Self::Texture) -> TextureDesc;
    /// Resource identity, the `ID3D11Texture2D*`.
    fn identity(&self, texture: &Self::Texture) -> usize;
    fn create_texture(&self, width: u32, height: u32, format: u32) -> HResult<Self::Texture>;
    fn create_view(&self, texture: &Self::Texture, kind: ViewKind) -> HResult<Self::View>;
    /// The texture behind an OpenXR swapchain image.
    fn swapchain_texture(&self, image: RawImage) -> Option<Self::Texture>;

    fn copy_region(
        &self,
        dst: &Self::Texture,
        dst_x: u32,
        dst_y: u32,
        src: &Self::Texture,
        region: Region,
    );
    fn copy_resource(&self, dst: &Self::Texture, src: &Self::Texture);
    fn clear(&self, rtv: &Self::View, color: [f32; 4]);
    fn flush(&self);

    fn create_blit_pipeline(&self) -> HResult<Self::Pipeline>;
    /// Draws `srv` stretched over `area` of `rtv`, alpha blended when `blend`.
    fn blit(
        &self,
        pipeline: &Self::Pipeline,
        srv: &Self::View,
        rtv: &Self::View,
        area: Region,
        blend: bool,
    );

    /// The handle OpenVR expects in `Texture_t` for a DirectX texture.
    fn openvr_handle(&self, texture: &Self::Texture) -> *mut c_void;

    fn backup_state(&self) -> Self::State;
    fn restore_state(&self, state: Self::State);
}

/// A texture plus the views created for it. Views are only rebuilt when the texture itself
/// changes.
pub struct TextureContext<D: D3d11Device> {
    texture: Option<D::Texture>,
    identity: Option<usize>,
    rtv: Option<D::View>,
    srv: Option<D::View>,
}

impl<D: D3d11Device> Default for TextureContext<D> {
    fn default() -> Self {
        Self {
            texture: None,
            identity: None,
            rtv: None,
            srv: None,
        }
    }
}

impl<D: D3d11Device> TextureContext<D> {
    /// Points this context at `texture`. Returns whether the views were rebuilt.
    pub fn set(
        &mut self,
        device: &D,
        texture: Option<D::Texture>,
        rtv: bool,
        srv: bool,
    ) -> Result<bool, SetupError> {
        let Some(texture) = texture else {
            let had_texture = self.texture.is_some();
            self.reset();
            return Ok(had_texture);
        };

        let identity = device.identity(&texture);
        if self.identity == Some(identity) {
            return Ok(false);
        }

        self.reset();
        let view = |kind, what| {
            device
                .create_view(&texture, kind)
                .map_err(|e| SetupError::Device(what, e))
        };
        let new_rtv = rtv
            .then(|| view(ViewKind::RenderTarget, "render target view"))
            .transpose()?;
        let new_srv = srv
            .then(|| view(ViewKind::ShaderResource, "shader resource view"))
            .transpose()?;

        self.rtv = new_rtv;
        self.srv = new_srv;
        self.identity = Some(identity);
        self.texture = Some(texture);
        Ok(true)
    }

    pub fn reset(&mut self) {
        self.texture = None;
        self.identity = None;
        self.rtv = None;
        self.srv = None;
    }

    #[inline]
    pub fn texture(&self) -> Option<&D::Texture> {
        self.texture.as_ref()
    }

    #[inline]
    pub fn rtv(&self) -> Option<&D::View> {
        self.rtv.as_ref()
    }

    #[inline]
    pub fn srv(&self) -> Option<&D::View> {
        self.srv.as_ref()
    }

    #[inline]
    pub fn has_texture(&self) -> bool {
        self.texture.is_some()
    }
}

/// Backs up the device's pipeline state on creation and puts it back on drop.
pub struct StateGuard<D: D3d11Device> {
    device: Arc<D>,
    state: Option<D::State>,
}

impl<D: D3d11Device> StateGuard<D> {
    pub fn new(device: Arc<D>) -> Self {
        let state = Some(device.backup_state());
        Self { device, state }
    }
}

impl<D: D3d11Device> Drop for StateGuard<D> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.device.restore_state(state);
        }
    }
}

pub struct D3d11Backend<D: D3d11Device> {
    device: Arc<D>,
    eyes: [TextureContext<D>; 2],
    blank: TextureContext<D>,
    /// Shader readable copy of a backbuffer that can't be sampled.
    readable: TextureContext<D>,
    /// Desktop fix render target, keyed on backbuffer identity.
    backbuffer: TextureContext<D>,
    /// The host UI as drawn into the desktop composite.
    ui: TextureContext<D>,
    compositor: Option<D::Pipeline>,
}

impl<D: D3d11Device> D3d11Backend<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            eyes: Default::default(),
            blank: TextureContext::default(),
            readable: TextureContext::default(),
            backbuffer: TextureContext::default(),
            ui: TextureContext::default(),
            compositor: None,
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn eye_texture(&self, eye: Eye) -> Option<&D::Texture> {
        self.eyes[eye as usize].texture()
    }

    fn eye(&self, eye: Eye) -> Result<&D::Texture, SetupError> {
        self.eye_texture(eye).ok_or(SetupError::NotSetUp)
    }

    fn create(&self, width: u32, height: u32, format: u32, what: &'static str) -> Result<D::Texture, SetupError> {
        self.device
            .create_texture(width, height, format)
            .map_err(|e| SetupError::Device(what, e))
    }

    /// Copies as much of `src` as fits into `dst` at `(x, y)`.
    fn copy_clipped(&self, dst: &D::Texture, x: u32, y: u32, src: &D::Texture, max: Region) {
        let src_desc = self.device.describe(src);
        let region = Region::full(
            src_desc.width.min(max.width),
            src_desc.height.min(max.height),
        );
        self.device.copy_region(dst, x, y, src, region);
    }
}

impl<D: D3d11Device> GraphicsBackend for D3d11Backend<D> {
    type Texture = D::Texture;
    type StateGuard = StateGuard<D>;

    const NAME: &'static str = "D3D11";

    fn describe(&self, texture: &Self::Texture) -> TextureDesc {
        self.device.describe(texture)
    }

    fn state_guard(&self) -> Self::StateGuard {
        StateGuard::new(self.device.clone())
    }

    fn create_eye_textures(&mut self, (width, height): (u32, u32), format: u32) -> Result<(), SetupError> {
        for eye in Eye::BOTH {
            let texture = self.create(width, height, format, "eye texture")?;
            self.eyes[eye as usize].reset();
            self.eyes[eye as usize].set(&self.device, Some(texture), true, true)?;
        }
        let blank = self.create(width, height, format, "blank texture")?;
        self.blank.reset();
        self.blank.set(&self.device, Some(blank), true, true)?;

        for ctx in self.eyes.iter().chain([&self.blank]) {
            if let Some(rtv) = ctx.rtv() {
                self.device.clear(rtv, BLACK);
            }
        }
        debug!("created {width}x{height} eye textures");
        Ok(())
    }

    fn create_compositing_pipeline(&mut self, backbuffer: &TextureDesc) -> Result<(), SetupError> {
        if self.compositor.is_none() {
            let pipeline = self
                .device
                .create_blit_pipeline()
                .map_err(|e| SetupError::Device("blit pipeline", e))?;
            self.compositor = Some(pipeline);
        }
        self.backbuffer.reset();
        self.ui.reset();
        debug!(
            "desktop fix enabled for {}x{} backbuffer",
            backbuffer.width, backbuffer.height
        );
        Ok(())
    }

    fn make_shader_readable(&mut self, texture: &Self::Texture) -> Result<Self::Texture, SetupError> {
        let desc = self.device.describe(texture);
        let stale = self
            .readable
            .texture()
            .map(|t| self.device.describe(t))
            .map_or(true, |current| {
                current.width != desc.width
                    || current.height != desc.height
                    || current.format != desc.format
            });
        if stale {
            let copy = self.create(desc.width, desc.height, desc.format, "readable copy")?;
            self.readable.set(&self.device, Some(copy), false, true)?;
        }

        let readable = self.readable.texture().ok_or(SetupError::NotSetUp)?;
        self.device.copy_resource(readable, texture);
        Ok(readable.clone())
    }

    fn release_resources(&mut self) {
        for ctx in &mut self.eyes {
            ctx.reset();
        }
        self.blank.reset();
        self.readable.reset();
        self.backbuffer.reset();
        self.ui.reset();
        self.compositor = None;
        self.device.flush();
    }

    fn has_resources(&self) -> bool {
        self.eyes.iter().all(TextureContext::has_texture) && self.blank.has_texture()
    }

    fn copy_to_eye(
        &mut self,
        eye: Eye,
        source: &Self::Texture,
        _kind: SourceKind,
        region: Region,
    ) -> Result<(), SetupError> {
        let dst = self.eye(eye)?;
        self.device.copy_region(dst, 0, 0, source, region);
        Ok(())
    }

    fn clear_eye(&mut self, eye: Eye) -> Result<(), SetupError> {
        let rtv = self.eyes[eye as usize].rtv().ok_or(SetupError::NotSetUp)?;
        self.device.clear(rtv, BLACK);
        Ok(())
    }

    fn openvr_texture(&self, eye: Eye) -> Option<vr::Texture_t> {
        let texture = self.eye_texture(eye)?;
        Some(vr::Texture_t {
            handle: self.device.openvr_handle(texture),
            eType: vr::ETextureType::DirectX,
            eColorSpace: vr::EColorSpace::Auto,
        })
    }

    fn copy_eye_to_image(&mut self, eye: Eye, image: RawImage, region: Region) -> Result<(), SetupError> {
        let dst = self
            .device
            .swapchain_texture(image)
            .ok_or(SetupError::UnknownImage(image))?;
        let src = self.eye(eye)?;
        self.copy_clipped(&dst, region.x, region.y, src, region);
        Ok(())
    }

    fn copy_texture_to_image(
        &mut self,
        source: &Self::Texture,
        image: RawImage,
        _depth: bool,
    ) -> Result<(), SetupError> {
        let dst = self
            .device
            .swapchain_texture(image)
            .ok_or(SetupError::UnknownImage(image))?;
        let (src_desc, dst_desc) = (self.device.describe(source), self.device.describe(&dst));
        if src_desc == dst_desc {
            self.device.copy_resource(&dst, source);
        } else {
            self.copy_clipped(&dst, 0, 0, source, Region::full(dst_desc.width, dst_desc.height));
        }
        Ok(())
    }

    fn clear_image(&mut self, image: RawImage) {
        let Some(texture) = self.device.swapchain_texture(image) else {
            warn!("no texture for swapchain image {image:?}");
            return;
        };
        match self.device.create_view(&texture, ViewKind::RenderTarget) {
            Ok(rtv) => self.device.clear(&rtv, BLACK),
            Err(e) => warn!("failed to clear swapchain image: {e:#010x}"),
        }
    }

    fn recover(&mut self) {
        self.device.flush();
    }

    fn desktop_fix(
        &mut self,
        backbuffer: &Self::Texture,
        ui: Option<&Self::Texture>,
    ) -> Result<(), SetupError> {
        self.backbuffer
            .set(&self.device, Some(backbuffer.clone()), true, false)?;
        let ui = ui.filter(|ui| {
            let readable = self.device.describe(ui).shader_resource;
            if !readable {
                crate::warn_once!("UI texture can't be sampled, leaving it out of the desktop view");
            }
            readable
        });
        self.ui.set(&self.device, ui.cloned(), false, true)?;

        let pipeline = self.compositor.as_ref().ok_or(SetupError::NotSetUp)?;
        let rtv = self.backbuffer.rtv().ok_or(SetupError::NotSetUp)?;
        self.device.clear(rtv, BLACK);

        let desc = self.device.describe(backbuffer);
        let layout = DesktopLayout::new(desc.width, desc.height);
        for eye in Eye::BOTH {
            let srv = self.eyes[eye as usize].srv().ok_or(SetupError::NotSetUp)?;
            self.device
                .blit(pipeline, srv, rtv, layout.eyes[eye as usize], false);
        }
        if let Some(srv) = self.ui.srv() {
            self.device.blit(pipeline, srv, rtv, layout.ui, true);
        }
        Ok(())
    }
}
