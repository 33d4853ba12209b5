//! [`D3d12Device`] on the host's `ID3D12Device` and command queue.

use super::{D3d12Device, HResult, ResourceState};
use crate::graphics_backends::{
    shader::{bytes, BlitShaders},
    Region, TextureDesc,
};
use crate::runtime::openxr::RawImage;
use openvr as vr;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU32, Ordering};
use windows::core::Interface;
use windows::Win32::Foundation::{
    CloseHandle, BOOL, E_POINTER, FALSE, HANDLE, RECT, TRUE, WAIT_OBJECT_0,
};
use windows::Win32::Graphics::Direct3D::{ID3DBlob, D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject};

#[derive(Clone)]
pub struct Resource(pub ID3D12Resource);

pub struct CommandList {
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
}

pub struct Fence {
    fence: ID3D12Fence,
    event: HANDLE,
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.event);
        }
    }
}

/// Shader visible SRV slots handed out round robin, one per blit. A composite draws three and
/// the copier waits on its fence before recording the next one.
const SRV_SLOTS: u32 = 8;

pub struct Pipeline {
    root_signature: ID3D12RootSignature,
    opaque: ID3D12PipelineState,
    alpha: ID3D12PipelineState,
    srv_heap: ID3D12DescriptorHeap,
    srv_size: u32,
    next_srv: AtomicU32,
}

pub struct NativeD3d12Device {
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    /// One CPU-only RTV slot, consumed when a clear or blit is recorded.
    rtv_heap: ID3D12DescriptorHeap,
}

// Everything here is only recorded from the render thread.
unsafe impl Send for NativeD3d12Device {}
unsafe impl Sync for NativeD3d12Device {}

fn hresult(e: windows::core::Error) -> i32 {
    e.code().0
}

fn native_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::PixelShaderResource => D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::DepthWrite => D3D12_RESOURCE_STATE_DEPTH_WRITE,
    }
}

fn shader_bytecode(blob: &ID3DBlob) -> D3D12_SHADER_BYTECODE {
    let code = bytes(blob);
    D3D12_SHADER_BYTECODE {
        pShaderBytecode: code.as_ptr().cast(),
        BytecodeLength: code.len(),
    }
}

fn blend_desc(blend: bool) -> D3D12_BLEND_DESC {
    let mut desc = D3D12_BLEND_DESC::default();
    desc.RenderTarget[0] = D3D12_RENDER_TARGET_BLEND_DESC {
        BlendEnable: BOOL::from(blend),
        LogicOpEnable: FALSE,
        SrcBlend: D3D12_BLEND_SRC_ALPHA,
        DestBlend: D3D12_BLEND_INV_SRC_ALPHA,
        BlendOp: D3D12_BLEND_OP_ADD,
        SrcBlendAlpha: D3D12_BLEND_ONE,
        DestBlendAlpha: D3D12_BLEND_ZERO,
        BlendOpAlpha: D3D12_BLEND_OP_ADD,
        LogicOp: D3D12_LOGIC_OP_NOOP,
        RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
    };
    desc
}

fn copy_location(resource: &ID3D12Resource) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { std::mem::transmute_copy(resource) },
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            SubresourceIndex: 0,
        },
    }
}

impl NativeD3d12Device {
    /// # Safety
    /// `device` and `queue` must point to a live `ID3D12Device` and `ID3D12CommandQueue`.
    pub unsafe fn from_raw(device: *mut c_void, queue: *mut c_void) -> HResult<Self> {
        let device = ID3D12Device::from_raw_borrowed(&device)
            .ok_or(E_POINTER.0)?
            .clone();
        let queue = ID3D12CommandQueue::from_raw_borrowed(&queue)
            .ok_or(E_POINTER.0)?
            .clone();
        let rtv_heap = device
            .CreateDescriptorHeap::<ID3D12DescriptorHeap>(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
                NumDescriptors: 1,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
                NodeMask: 0,
            })
            .map_err(hresult)?;
        Ok(Self {
            device,
            queue,
            rtv_heap,
        })
    }

    pub fn device_raw(&self) -> *mut c_void {
        self.device.as_raw()
    }

    pub fn queue_raw(&self) -> *mut c_void {
        self.queue.as_raw()
    }
}

impl D3d12Device for NativeD3d12Device {
    type Resource = Resource;
    type CommandList = CommandList;
    type Fence = Fence;
    type Pipeline = Pipeline;

    fn describe(&self, resource: &Resource) -> TextureDesc {
        let desc = unsafe { resource.0.GetDesc() };
        TextureDesc {
            width: desc.Width as u32,
            height: desc.Height,
            format: desc.Format.0 as u32,
            shader_resource: (desc.Flags & D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE).0 == 0,
        }
    }

    fn identity(&self, resource: &Resource) -> usize {
        resource.0.as_raw() as usize
    }

    fn create_texture(
        &self,
        width: u32,
        height: u32,
        format: u32,
        state: ResourceState,
    ) -> HResult<Resource> {
        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: width as u64,
            Height: height,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT(format as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET,
        };
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                &desc,
                native_state(state),
                None,
                &mut resource,
            )
        }
        .map_err(hresult)?;
        resource.map(Resource).ok_or(E_POINTER.0)
    }

    fn swapchain_resource(&self, image: RawImage) -> Option<Resource> {
        let raw = image.0 as *mut c_void;
        unsafe { ID3D12Resource::from_raw_borrowed(&raw) }
            .cloned()
            .map(Resource)
    }

    fn create_command_list(&self) -> HResult<CommandList> {
        unsafe {
            let allocator: ID3D12CommandAllocator = self
                .device
                .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
                .map_err(hresult)?;
            let list: ID3D12GraphicsCommandList = self
                .device
                .CreateCommandList(
                    0,
                    D3D12_COMMAND_LIST_TYPE_DIRECT,
                    &allocator,
                    None::<&ID3D12PipelineState>,
                )
                .map_err(hresult)?;
            Ok(CommandList { allocator, list })
        }
    }

    fn create_fence(&self) -> HResult<Fence> {
        unsafe {
            let fence: ID3D12Fence = self
                .device
                .CreateFence(0, D3D12_FENCE_FLAG_NONE)
                .map_err(hresult)?;
            let event = CreateEventW(None, false, false, None).map_err(hresult)?;
            Ok(Fence { fence, event })
        }
    }

    fn transition(
        &self,
        list: &CommandList,
        resource: &Resource,
        before: ResourceState,
        after: ResourceState,
    ) {
        let barrier = D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                    pResource: unsafe { std::mem::transmute_copy(&resource.0) },
                    Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                    StateBefore: native_state(before),
                    StateAfter: native_state(after),
                }),
            },
        };
        unsafe { list.list.ResourceBarrier(&[barrier]) };
    }

    fn copy_region(
        &self,
        list: &CommandList,
        dst: &Resource,
        dst_x: u32,
        dst_y: u32,
        src: &Resource,
        region: Region,
    ) {
        let src_box = D3D12_BOX {
            left: region.x,
            top: region.y,
            front: 0,
            right: region.x + region.width,
            bottom: region.y + region.height,
            back: 1,
        };
        unsafe {
            list.list.CopyTextureRegion(
                &copy_location(&dst.0),
                dst_x,
                dst_y,
                0,
                &copy_location(&src.0),
                Some(&src_box),
            )
        };
    }

    fn copy_resource(&self, list: &CommandList, dst: &Resource, src: &Resource) {
        unsafe { list.list.CopyResource(&dst.0, &src.0) };
    }

    fn clear(&self, list: &CommandList, resource: &Resource, color: [f32; 4]) -> HResult {
        unsafe {
            let rtv = self.rtv_heap.GetCPUDescriptorHandleForHeapStart();
            self.device.CreateRenderTargetView(&resource.0, None, rtv);
            list.list.ClearRenderTargetView(rtv, color.as_ptr(), None);
        }
        Ok(())
    }

    fn create_blit_pipeline(&self, format: u32) -> HResult<Pipeline> {
        let shaders = BlitShaders::compile()?;

        let range = D3D12_DESCRIPTOR_RANGE {
            RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
            NumDescriptors: 1,
            BaseShaderRegister: 0,
            RegisterSpace: 0,
            OffsetInDescriptorsFromTableStart: 0,
        };
        let parameter = D3D12_ROOT_PARAMETER {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
            Anonymous: D3D12_ROOT_PARAMETER_0 {
                DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                    NumDescriptorRanges: 1,
                    pDescriptorRanges: &range,
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
        };
        let sampler = D3D12_STATIC_SAMPLER_DESC {
            Filter: D3D12_FILTER_MIN_MAG_MIP_LINEAR,
            AddressU: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
            AddressV: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
            AddressW: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
            MipLODBias: 0.0,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
            BorderColor: D3D12_STATIC_BORDER_COLOR_OPAQUE_BLACK,
            MinLOD: 0.0,
            MaxLOD: D3D12_FLOAT32_MAX,
            ShaderRegister: 0,
            RegisterSpace: 0,
            ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
        };
        let root_desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: 1,
            pParameters: &parameter,
            NumStaticSamplers: 1,
            pStaticSamplers: &sampler,
            Flags: D3D12_ROOT_SIGNATURE_FLAG_NONE,
        };

        unsafe {
            let mut blob = None;
            D3D12SerializeRootSignature(&root_desc, D3D_ROOT_SIGNATURE_VERSION_1, &mut blob, None)
                .map_err(hresult)?;
            let blob = blob.ok_or(E_POINTER.0)?;
            let root_signature: ID3D12RootSignature = self
                .device
                .CreateRootSignature(0, bytes(&blob))
                .map_err(hresult)?;

            let pipeline_state = |blend: bool| -> HResult<ID3D12PipelineState> {
                let mut desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
                    pRootSignature: std::mem::transmute_copy(&root_signature),
                    VS: shader_bytecode(&shaders.vs),
                    PS: shader_bytecode(&shaders.ps),
                    BlendState: blend_desc(blend),
                    SampleMask: u32::MAX,
                    RasterizerState: D3D12_RASTERIZER_DESC {
                        FillMode: D3D12_FILL_MODE_SOLID,
                        CullMode: D3D12_CULL_MODE_NONE,
                        DepthClipEnable: TRUE,
                        ..Default::default()
                    },
                    PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
                    NumRenderTargets: 1,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    ..Default::default()
                };
                desc.RTVFormats[0] = DXGI_FORMAT(format as i32);
                self.device
                    .CreateGraphicsPipelineState(&desc)
                    .map_err(hresult)
            };
            let opaque = pipeline_state(false)?;
            let alpha = pipeline_state(true)?;

            let srv_heap: ID3D12DescriptorHeap = self
                .device
                .CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                    Type: D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                    NumDescriptors: SRV_SLOTS,
                    Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
                    NodeMask: 0,
                })
                .map_err(hresult)?;
            let srv_size = self
                .device
                .GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV);

            Ok(Pipeline {
                root_signature,
                opaque,
                alpha,
                srv_heap,
                srv_size,
                next_srv: AtomicU32::new(0),
            })
        }
    }

    fn blit(
        &self,
        list: &CommandList,
        pipeline: &Pipeline,
        src: &Resource,
        dst: &Resource,
        area: Region,
        blend: bool,
    ) {
        let slot = pipeline.next_srv.fetch_add(1, Ordering::Relaxed) % SRV_SLOTS;
        let offset = slot * pipeline.srv_size;
        let viewport = D3D12_VIEWPORT {
            TopLeftX: area.x as f32,
            TopLeftY: area.y as f32,
            Width: area.width as f32,
            Height: area.height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        let scissor = RECT {
            left: area.x as i32,
            top: area.y as i32,
            right: (area.x + area.width) as i32,
            bottom: (area.y + area.height) as i32,
        };
        let state = if blend { &pipeline.alpha } else { &pipeline.opaque };

        unsafe {
            let mut srv = pipeline.srv_heap.GetCPUDescriptorHandleForHeapStart();
            srv.ptr += offset as usize;
            let mut srv_gpu = pipeline.srv_heap.GetGPUDescriptorHandleForHeapStart();
            srv_gpu.ptr += offset as u64;
            self.device.CreateShaderResourceView(&src.0, None, srv);
            let rtv = self.rtv_heap.GetCPUDescriptorHandleForHeapStart();
            self.device.CreateRenderTargetView(&dst.0, None, rtv);

            let list = &list.list;
            list.SetGraphicsRootSignature(&pipeline.root_signature);
            list.SetPipelineState(state);
            list.SetDescriptorHeaps(&[Some(pipeline.srv_heap.clone())]);
            list.SetGraphicsRootDescriptorTable(0, srv_gpu);
            list.OMSetRenderTargets(1, Some(&rtv), false, None);
            list.RSSetViewports(&[viewport]);
            list.RSSetScissorRects(&[scissor]);
            list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            list.DrawInstanced(3, 1, 0, 0);
        }
    }

    fn close_and_execute(&self, list: &CommandList) -> HResult {
        unsafe {
            list.list.Close().map_err(hresult)?;
            let lists = [Some(list.list.cast::<ID3D12CommandList>().map_err(hresult)?)];
            self.queue.ExecuteCommandLists(&lists);
        }
        Ok(())
    }

    fn signal(&self, fence: &Fence, value: u64) -> HResult {
        unsafe { self.queue.Signal(&fence.fence, value) }.map_err(hresult)
    }

    fn wait_for_fence(&self, fence: &Fence, value: u64, timeout_ms: u32) -> bool {
        unsafe {
            if fence.fence.GetCompletedValue() >= value {
                return true;
            }
            if fence.fence.SetEventOnCompletion(value, fence.event).is_err() {
                return false;
            }
            WaitForSingleObject(fence.event, timeout_ms) == WAIT_OBJECT_0
        }
    }

    fn reset_command_list(&self, list: &CommandList) -> HResult {
        unsafe {
            list.allocator.Reset().map_err(hresult)?;
            list.list
                .Reset(&list.allocator, None::<&ID3D12PipelineState>)
                .map_err(hresult)
        }
    }

    fn openvr_texture_data(&self, resource: &Resource) -> vr::D3D12TextureData_t {
        vr::D3D12TextureData_t {
            m_pResource: resource.0.as_raw(),
            m_pCommandQueue: self.queue.as_raw(),
            m_nNodeMask: 0,
        }
    }
}
