//! The desktop composite's blit shader, compiled at runtime for both APIs.

use log::error;
use windows::core::{s, PCSTR};
use windows::Win32::Foundation::E_POINTER;
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCompile, D3DCOMPILE_OPTIMIZATION_LEVEL3};
use windows::Win32::Graphics::Direct3D::{ID3DBlob, ID3DInclude};

const BLIT_HLSL: &str = include_str!("blit.hlsl");

pub struct BlitShaders {
    pub vs: ID3DBlob,
    pub ps: ID3DBlob,
}

impl BlitShaders {
    pub fn compile() -> Result<Self, i32> {
        Ok(Self {
            vs: compile(s!("vs_main"), s!("vs_5_0"))?,
            ps: compile(s!("ps_main"), s!("ps_5_0"))?,
        })
    }
}

fn compile(entry: PCSTR, target: PCSTR) -> Result<ID3DBlob, i32> {
    let mut code = None;
    let mut errors = None;
    let result = unsafe {
        D3DCompile(
            BLIT_HLSL.as_ptr().cast(),
            BLIT_HLSL.len(),
            PCSTR::null(),
            None,
            None::<&ID3DInclude>,
            entry,
            target,
            D3DCOMPILE_OPTIMIZATION_LEVEL3,
            0,
            &mut code,
            Some(&mut errors),
        )
    };
    if let Err(e) = result {
        if let Some(errors) = errors {
            error!(
                "blit shader failed to compile: {}",
                String::from_utf8_lossy(bytes(&errors))
            );
        }
        return Err(e.code().0);
    }
    code.ok_or(E_POINTER.0)
}

pub fn bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe { std::slice::from_raw_parts(blob.GetBufferPointer().cast::<u8>(), blob.GetBufferSize()) }
}
