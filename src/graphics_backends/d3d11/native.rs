//! [`D3d11Device`] on the host's `ID3D11Device`.

use super::{D3d11Device, HResult, ViewKind};
use crate::graphics_backends::{
    shader::{bytes, BlitShaders},
    Region, TextureDesc,
};
use crate::runtime::openxr::RawImage;
use std::ffi::c_void;
use windows::core::Interface;
use windows::Win32::Foundation::{BOOL, E_POINTER, TRUE};
use windows::Win32::Graphics::Direct3D::{
    D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST, D3D_PRIMITIVE_TOPOLOGY,
};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};

const MAX_RENDER_TARGETS: usize = D3D11_SIMULTANEOUS_RENDER_TARGET_COUNT as usize;

#[derive(Clone)]
pub struct Texture(pub ID3D11Texture2D);

#[derive(Clone)]
pub enum View {
    RenderTarget(ID3D11RenderTargetView),
    ShaderResource(ID3D11ShaderResourceView),
}

pub struct State {
    rtvs: [Option<ID3D11RenderTargetView>; MAX_RENDER_TARGETS],
    dsv: Option<ID3D11DepthStencilView>,
    viewports: Vec<D3D11_VIEWPORT>,
    ps_srvs: [Option<ID3D11ShaderResourceView>; 1],
    ps_samplers: [Option<ID3D11SamplerState>; 1],
    vs: Option<ID3D11VertexShader>,
    ps: Option<ID3D11PixelShader>,
    input_layout: Option<ID3D11InputLayout>,
    topology: D3D_PRIMITIVE_TOPOLOGY,
    blend: Option<ID3D11BlendState>,
    blend_factor: [f32; 4],
    sample_mask: u32,
    depth_stencil: Option<ID3D11DepthStencilState>,
    stencil_ref: u32,
    rasterizer: Option<ID3D11RasterizerState>,
}

pub struct Pipeline {
    vs: ID3D11VertexShader,
    ps: ID3D11PixelShader,
    sampler: ID3D11SamplerState,
    rasterizer: ID3D11RasterizerState,
    opaque: ID3D11BlendState,
    alpha: ID3D11BlendState,
}

pub struct NativeD3d11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
}

// The immediate context is only touched from the render thread.
unsafe impl Send for NativeD3d11Device {}
unsafe impl Sync for NativeD3d11Device {}

impl NativeD3d11Device {
    /// # Safety
    /// `device` must point to a live `ID3D11Device`.
    pub unsafe fn from_raw(device: *mut c_void) -> Option<Self> {
        let device = ID3D11Device::from_raw_borrowed(&device)?.clone();
        let context = device.GetImmediateContext().ok()?;
        Some(Self { device, context })
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.device.as_raw()
    }
}

fn hresult(e: windows::core::Error) -> i32 {
    e.code().0
}

fn blend_desc(blend: bool) -> D3D11_BLEND_DESC {
    let mut desc = D3D11_BLEND_DESC::default();
    desc.RenderTarget[0] = D3D11_RENDER_TARGET_BLEND_DESC {
        BlendEnable: BOOL::from(blend),
        SrcBlend: D3D11_BLEND_SRC_ALPHA,
        DestBlend: D3D11_BLEND_INV_SRC_ALPHA,
        BlendOp: D3D11_BLEND_OP_ADD,
        SrcBlendAlpha: D3D11_BLEND_ONE,
        DestBlendAlpha: D3D11_BLEND_ZERO,
        BlendOpAlpha: D3D11_BLEND_OP_ADD,
        RenderTargetWriteMask: D3D11_COLOR_WRITE_ENABLE_ALL.0 as u8,
    };
    desc
}

impl D3d11Device for NativeD3d11Device {
    type Texture = Texture;
    type View = View;
    type State = State;
    type Pipeline = Pipeline;

    fn describe(&self, texture: &Texture) -> TextureDesc {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.0.GetDesc(&mut desc) };
        TextureDesc {
            width: desc.Width,
            height: desc.Height,
            format: desc.Format.0 as u32,
            shader_resource: desc.BindFlags & D3D11_BIND_SHADER_RESOURCE.0 as u32 != 0,
        }
    }

    fn identity(&self, texture: &Texture) -> usize {
        texture.0.as_raw() as usize
    }

    fn create_texture(&self, width: u32, height: u32, format: u32) -> HResult<Texture> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT(format as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: D3D11_RESOURCE_MISC_SHARED.0 as u32,
        };
        let mut texture = None;
        unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .map_err(hresult)?;
        texture.map(Texture).ok_or(E_POINTER.0)
    }

    fn create_view(&self, texture: &Texture, kind: ViewKind) -> HResult<View> {
        match kind {
            ViewKind::RenderTarget => {
                let mut rtv = None;
                unsafe {
                    self.device
                        .CreateRenderTargetView(&texture.0, None, Some(&mut rtv))
                }
                .map_err(hresult)?;
                rtv.map(View::RenderTarget).ok_or(E_POINTER.0)
            }
            ViewKind::ShaderResource => {
                let mut srv = None;
                unsafe {
                    self.device
                        .CreateShaderResourceView(&texture.0, None, Some(&mut srv))
                }
                .map_err(hresult)?;
                srv.map(View::ShaderResource).ok_or(E_POINTER.0)
            }
        }
    }

    fn swapchain_texture(&self, image: RawImage) -> Option<Texture> {
        let raw = image.0 as *mut c_void;
        unsafe { ID3D11Texture2D::from_raw_borrowed(&raw) }
            .cloned()
            .map(Texture)
    }

    fn copy_region(&self, dst: &Texture, dst_x: u32, dst_y: u32, src: &Texture, region: Region) {
        let src_box = D3D11_BOX {
            left: region.x,
            top: region.y,
            front: 0,
            right: region.x + region.width,
            bottom: region.y + region.height,
            back: 1,
        };
        unsafe {
            self.context.CopySubresourceRegion(
                &dst.0,
                0,
                dst_x,
                dst_y,
                0,
                &src.0,
                0,
                Some(&src_box),
            )
        };
    }

    fn copy_resource(&self, dst: &Texture, src: &Texture) {
        unsafe { self.context.CopyResource(&dst.0, &src.0) };
    }

    fn clear(&self, view: &View, color: [f32; 4]) {
        if let View::RenderTarget(rtv) = view {
            unsafe { self.context.ClearRenderTargetView(rtv, &color) };
        }
    }

    fn flush(&self) {
        unsafe { self.context.Flush() };
    }

    fn create_blit_pipeline(&self) -> HResult<Pipeline> {
        let shaders = BlitShaders::compile()?;
        let sampler_desc = D3D11_SAMPLER_DESC {
            Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
            AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
            MipLODBias: 0.0,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D11_COMPARISON_NEVER,
            BorderColor: [0.0; 4],
            MinLOD: 0.0,
            MaxLOD: D3D11_FLOAT32_MAX,
        };
        let rasterizer_desc = D3D11_RASTERIZER_DESC {
            FillMode: D3D11_FILL_SOLID,
            CullMode: D3D11_CULL_NONE,
            DepthClipEnable: TRUE,
            ..Default::default()
        };

        let (mut vs, mut ps, mut sampler, mut rasterizer) = (None, None, None, None);
        let (mut opaque, mut alpha) = (None, None);
        unsafe {
            self.device
                .CreateVertexShader(bytes(&shaders.vs), None, Some(&mut vs))
                .map_err(hresult)?;
            self.device
                .CreatePixelShader(bytes(&shaders.ps), None, Some(&mut ps))
                .map_err(hresult)?;
            self.device
                .CreateSamplerState(&sampler_desc, Some(&mut sampler))
                .map_err(hresult)?;
            self.device
                .CreateRasterizerState(&rasterizer_desc, Some(&mut rasterizer))
                .map_err(hresult)?;
            self.device
                .CreateBlendState(&blend_desc(false), Some(&mut opaque))
                .map_err(hresult)?;
            self.device
                .CreateBlendState(&blend_desc(true), Some(&mut alpha))
                .map_err(hresult)?;
        }
        Ok(Pipeline {
            vs: vs.ok_or(E_POINTER.0)?,
            ps: ps.ok_or(E_POINTER.0)?,
            sampler: sampler.ok_or(E_POINTER.0)?,
            rasterizer: rasterizer.ok_or(E_POINTER.0)?,
            opaque: opaque.ok_or(E_POINTER.0)?,
            alpha: alpha.ok_or(E_POINTER.0)?,
        })
    }

    fn blit(&self, pipeline: &Pipeline, srv: &View, rtv: &View, area: Region, blend: bool) {
        let (View::ShaderResource(srv), View::RenderTarget(rtv)) = (srv, rtv) else {
            return;
        };
        let viewport = D3D11_VIEWPORT {
            TopLeftX: area.x as f32,
            TopLeftY: area.y as f32,
            Width: area.width as f32,
            Height: area.height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        let blend_state = if blend { &pipeline.alpha } else { &pipeline.opaque };
        let ctx = &self.context;
        unsafe {
            ctx.OMSetRenderTargets(Some(&[Some(rtv.clone())]), None);
            ctx.OMSetBlendState(blend_state, None, u32::MAX);
            ctx.OMSetDepthStencilState(None::<&ID3D11DepthStencilState>, 0);
            ctx.RSSetViewports(Some(&[viewport]));
            ctx.RSSetState(&pipeline.rasterizer);
            ctx.IASetInputLayout(None::<&ID3D11InputLayout>);
            ctx.IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            ctx.VSSetShader(&pipeline.vs, None);
            ctx.PSSetShader(&pipeline.ps, None);
            ctx.PSSetSamplers(0, Some(&[Some(pipeline.sampler.clone())]));
            ctx.PSSetShaderResources(0, Some(&[Some(srv.clone())]));
            ctx.Draw(3, 0);
            ctx.PSSetShaderResources(0, Some(&[None]));
        }
    }

    fn openvr_handle(&self, texture: &Texture) -> *mut c_void {
        texture.0.as_raw()
    }

    fn backup_state(&self) -> State {
        let mut state = State {
            rtvs: Default::default(),
            dsv: None,
            viewports: vec![
                D3D11_VIEWPORT::default();
                D3D11_VIEWPORT_AND_SCISSORRECT_OBJECT_COUNT_PER_PIPELINE as usize
            ],
            ps_srvs: Default::default(),
            ps_samplers: Default::default(),
            vs: None,
            ps: None,
            input_layout: None,
            topology: D3D_PRIMITIVE_TOPOLOGY::default(),
            blend: None,
            blend_factor: [0.0; 4],
            sample_mask: 0,
            depth_stencil: None,
            stencil_ref: 0,
            rasterizer: None,
        };
        let ctx = &self.context;
        unsafe {
            ctx.OMGetRenderTargets(Some(&mut state.rtvs), Some(&mut state.dsv));
            let mut count = state.viewports.len() as u32;
            ctx.RSGetViewports(&mut count, Some(state.viewports.as_mut_ptr()));
            state.viewports.truncate(count as usize);
            ctx.PSGetShaderResources(0, Some(&mut state.ps_srvs));
            ctx.PSGetSamplers(0, Some(&mut state.ps_samplers));
            ctx.VSGetShader(&mut state.vs, None, None);
            ctx.PSGetShader(&mut state.ps, None, None);
            state.input_layout = ctx.IAGetInputLayout().ok();
            state.topology = ctx.IAGetPrimitiveTopology();
            ctx.OMGetBlendState(
                Some(&mut state.blend),
                Some(&mut state.blend_factor),
                Some(&mut state.sample_mask),
            );
            ctx.OMGetDepthStencilState(Some(&mut state.depth_stencil), Some(&mut state.stencil_ref));
            state.rasterizer = ctx.RSGetState().ok();
        }
        state
    }

    fn restore_state(&self, state: State) {
        let ctx = &self.context;
        unsafe {
            ctx.OMSetRenderTargets(Some(&state.rtvs), state.dsv.as_ref());
            ctx.RSSetViewports(Some(&state.viewports));
            ctx.PSSetShaderResources(0, Some(&state.ps_srvs));
            ctx.PSSetSamplers(0, Some(&state.ps_samplers));
            ctx.VSSetShader(state.vs.as_ref(), None);
            ctx.PSSetShader(state.ps.as_ref(), None);
            ctx.IASetInputLayout(state.input_layout.as_ref());
            ctx.IASetPrimitiveTopology(state.topology);
            ctx.OMSetBlendState(
                state.blend.as_ref(),
                Some(&state.blend_factor),
                state.sample_mask,
            );
            ctx.OMSetDepthStencilState(state.depth_stencil.as_ref(), state.stencil_ref);
            ctx.RSSetState(state.rasterizer.as_ref());
        }
    }
}
