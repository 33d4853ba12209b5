//! OpenXR swapchains owned by a compositor.

use crate::{
    config::RenderingMethod,
    runtime::{
        openxr::{RawImage, SwapchainDesc, SwapchainKey, SwapchainUsage, XrSession},
        Eye,
    },
    tracy_span,
};
use log::{debug, info, warn};
use openxr as xr;
use std::collections::HashMap;

const MAX_RETRIES: u32 = 3;
const DUMMY_SIZE: u32 = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SwapchainIndex {
    DoubleWide,
    AfrLeftEye,
    AfrRightEye,
    Depth,
    Ui,
    FrameworkUi,
    /// Never rewritten after creation; some runtimes misbehave without a second static layer.
    Dummy,
}

impl SwapchainIndex {
    /// The swapchain an eye's color lands in for a rendering method.
    pub fn for_eye(method: RenderingMethod, eye: Eye) -> Self {
        match (method.is_afr(), eye) {
            (false, _) => Self::DoubleWide,
            (true, Eye::Left) => Self::AfrLeftEye,
            (true, Eye::Right) => Self::AfrRightEye,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Swapchain {
    pub key: SwapchainKey,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub images: Vec<RawImage>,
}

impl Swapchain {
    pub fn rect(&self) -> xr::Rect2Di {
        xr::Rect2Di {
            offset: xr::Offset2Di { x: 0, y: 0 },
            extent: xr::Extent2Di {
                width: self.width as i32,
                height: self.height as i32,
            },
        }
    }
}

/// What the swapchains are sized and formatted from.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SwapchainParams {
    /// Per-eye size recommended by the runtime, before scaling.
    pub recommended: (u32, u32),
    pub resolution_scale: f32,
    pub rendering_method: RenderingMethod,
    pub backbuffer: (u32, u32),
    pub color_format: u32,
    /// Depth is enabled in config and the runtime can compose it.
    pub depth_enabled: bool,
    /// Size of the host's depth texture, if it has one yet.
    pub depth_size: Option<(u32, u32)>,
}

impl SwapchainParams {
    pub fn eye_size(&self) -> (u32, u32) {
        let scale = |v: u32| ((v as f32 * self.resolution_scale).round() as u32).max(1);
        (scale(self.recommended.0), scale(self.recommended.1))
    }

    fn layout_matches(&self, other: &Self) -> bool {
        self.eye_size() == other.eye_size()
            && self.rendering_method.is_afr() == other.rendering_method.is_afr()
            && self.backbuffer == other.backbuffer
            && self.color_format == other.color_format
            && self.depth_enabled == other.depth_enabled
    }
}

#[derive(Debug, derive_more::Display)]
pub enum SwapchainError {
    #[display("failed to create {_0:?} swapchain: {_1:?}")]
    Create(SwapchainIndex, xr::sys::Result),
    #[display("no {_0:?} swapchain")]
    Missing(SwapchainIndex),
    #[display("failed to acquire swapchain image: {_0:?}")]
    Acquire(xr::sys::Result),
    #[display("failed to wait for swapchain image: {_0:?}")]
    Wait(xr::sys::Result),
    #[display("failed to release swapchain image: {_0:?}")]
    Release(xr::sys::Result),
}

#[derive(Default)]
pub struct SwapchainManager {
    swapchains: HashMap<SwapchainIndex, Swapchain>,
    params: Option<SwapchainParams>,
    made_depth_with_null_defaults: bool,
    last_depth_size: Option<(u32, u32)>,
    num_textures_acquired: u32,
}

impl SwapchainManager {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, index: SwapchainIndex) -> Option<&Swapchain> {
        self.swapchains.get(&index)
    }

    #[inline]
    pub fn num_textures_acquired(&self) -> u32 {
        self.num_textures_acquired
    }

    #[inline]
    pub fn made_depth_with_null_defaults(&self) -> bool {
        self.made_depth_with_null_defaults
    }

    pub fn is_empty(&self) -> bool {
        self.swapchains.is_empty()
    }

    pub fn destroy_swapchains(&mut self, session: &mut dyn XrSession) {
        if self.swapchains.is_empty() {
            return;
        }
        debug!("destroying {} swapchains", self.swapchains.len());
        for (_, swapchain) in self.swapchains.drain() {
            session.destroy_swapchain(swapchain.key);
        }
        self.params = None;
        self.made_depth_with_null_defaults = false;
        self.last_depth_size = None;
        self.num_textures_acquired = 0;
    }

    /// Recreates every swapchain for `params`. `clear` is handed each image that has to start
    /// out blank (the dummy swapchain's).
    pub fn create_swapchains(
        &mut self,
        session: &mut dyn XrSession,
        params: &SwapchainParams,
        clear: &mut dyn FnMut(RawImage),
    ) -> Result<(), SwapchainError> {
        tracy_span!("SwapchainManager::create_swapchains");
        self.destroy_swapchains(session);

        let (w, h) = params.eye_size();
        info!(
            "creating swapchains: eye {w}x{h}, {:?}, backbuffer {:?}",
            params.rendering_method, params.backbuffer
        );

        let color = |width, height| SwapchainDesc {
            width,
            height,
            format: params.color_format,
            usage: SwapchainUsage::Color,
            static_image: false,
        };

        let mut descs = Vec::new();
        if params.rendering_method.is_afr() {
            descs.push((SwapchainIndex::AfrLeftEye, color(w, h)));
            descs.push((SwapchainIndex::AfrRightEye, color(w, h)));
        } else {
            descs.push((SwapchainIndex::DoubleWide, color(w * 2, h)));
        }

        let (bw, bh) = params.backbuffer;
        if bw > 0 && bh > 0 {
            descs.push((SwapchainIndex::Ui, color(bw, bh)));
            descs.push((SwapchainIndex::FrameworkUi, color(bw, bh)));
        }

        descs.push((
            SwapchainIndex::Dummy,
            SwapchainDesc {
                static_image: true,
                ..color(DUMMY_SIZE, DUMMY_SIZE)
            },
        ));

        if params.depth_enabled {
            let (dw, dh) = match params.depth_size {
                Some(size) => {
                    self.made_depth_with_null_defaults = false;
                    size
                }
                None => {
                    debug!("no depth texture yet, assuming double wide size");
                    self.made_depth_with_null_defaults = true;
                    (w * 2, h)
                }
            };
            self.last_depth_size = params.depth_size;
            descs.push((
                SwapchainIndex::Depth,
                SwapchainDesc {
                    width: dw,
                    height: dh,
                    format: session.depth_format(),
                    usage: SwapchainUsage::DepthStencil,
                    static_image: false,
                },
            ));
        }

        for (index, desc) in descs {
            let key = session
                .create_swapchain(&desc)
                .map_err(|e| SwapchainError::Create(index, e))?;
            let images = session
                .swapchain_images(key)
                .map_err(|e| SwapchainError::Create(index, e))?;
            self.swapchains.insert(
                index,
                Swapchain {
                    key,
                    width: desc.width,
                    height: desc.height,
                    format: desc.format,
                    images,
                },
            );
        }

        // Static images can be acquired exactly once.
        self.copy(
            session,
            SwapchainIndex::Dummy,
            clear,
            |_| {},
            |clear, _, image| clear(image),
        )?;

        self.params = Some(*params);
        Ok(())
    }

    /// True when the depth swapchain exists and no longer matches the host depth texture.
    pub fn needs_depth_resize(&self, depth_size: Option<(u32, u32)>) -> bool {
        if !self.swapchains.contains_key(&SwapchainIndex::Depth) {
            return false;
        }
        match depth_size {
            Some(_) if self.made_depth_with_null_defaults => true,
            Some(size) => Some(size) != self.last_depth_size,
            None => false,
        }
    }

    /// True when the layout changed in a way existing swapchains can't serve.
    pub fn needs_recreate(&self, params: &SwapchainParams) -> bool {
        match &self.params {
            None => true,
            Some(current) => !current.layout_matches(params),
        }
    }

    /// Recreates the swapchains if the layout or depth texture changed. Returns whether it did.
    pub fn prepare(
        &mut self,
        session: &mut dyn XrSession,
        params: &SwapchainParams,
        clear: &mut dyn FnMut(RawImage),
    ) -> Result<bool, SwapchainError> {
        if !self.needs_recreate(params) && !self.needs_depth_resize(params.depth_size) {
            return Ok(false);
        }
        if self.needs_depth_resize(params.depth_size) {
            info!(
                "depth texture changed ({:?} -> {:?}), recreating swapchains",
                self.last_depth_size, params.depth_size
            );
        }
        self.create_swapchains(session, params, clear)?;
        Ok(true)
    }

    /// Acquires an image of `index`, runs `f` on it and releases it. A runtime failure on
    /// acquire or release calls `recover` and retries. `ctx` is handed to both.
    pub fn copy<C: ?Sized>(
        &mut self,
        session: &mut dyn XrSession,
        index: SwapchainIndex,
        ctx: &mut C,
        mut recover: impl FnMut(&mut C),
        f: impl FnOnce(&mut C, u32, RawImage),
    ) -> Result<(), SwapchainError> {
        tracy_span!("SwapchainManager::copy");
        let swapchain = self
            .swapchains
            .get(&index)
            .ok_or(SwapchainError::Missing(index))?;
        let key = swapchain.key;

        let mut attempt = 0;
        let image_index = loop {
            match session.acquire_image(key) {
                Ok(i) => break i,
                Err(xr::sys::Result::ERROR_RUNTIME_FAILURE) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!("acquiring {index:?} image failed with a runtime failure, retrying ({attempt})");
                    recover(ctx);
                }
                Err(e) => return Err(SwapchainError::Acquire(e)),
            }
        };
        self.num_textures_acquired += 1;

        let result = session
            .wait_image(key, xr::Duration::INFINITE)
            .map_err(SwapchainError::Wait);

        if result.is_ok() {
            match swapchain.images.get(image_index as usize) {
                Some(&image) => f(ctx, image_index, image),
                None => warn!("{index:?} has no image {image_index}"),
            }
        }

        let mut attempt = 0;
        let released = loop {
            match session.release_image(key) {
                Ok(()) => break Ok(()),
                Err(xr::sys::Result::ERROR_RUNTIME_FAILURE) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!("releasing {index:?} image failed with a runtime failure, retrying ({attempt})");
                    recover(ctx);
                }
                Err(e) => break Err(SwapchainError::Release(e)),
            }
        };
        self.num_textures_acquired = self.num_textures_acquired.saturating_sub(1);

        result.and(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeXrSession;

    struct Fixture {
        session: FakeXrSession,
        manager: SwapchainManager,
        params: SwapchainParams,
        cleared: Vec<RawImage>,
    }

    impl Fixture {
        fn new() -> Self {
            crate::init_logging();
            Self {
                session: FakeXrSession::new(),
                manager: SwapchainManager::new(),
                params: SwapchainParams {
                    recommended: (1000, 1100),
                    resolution_scale: 1.0,
                    rendering_method: RenderingMethod::NativeStereo,
                    backbuffer: (1920, 1080),
                    color_format: 28,
                    depth_enabled: true,
                    depth_size: None,
                },
                cleared: Vec::new(),
            }
        }

        fn prepare(&mut self) -> bool {
            let cleared = &mut self.cleared;
            self.manager
                .prepare(&mut self.session, &self.params, &mut |image| {
                    cleared.push(image)
                })
                .unwrap()
        }
    }

    #[test]
    fn native_stereo_layout() {
        let mut f = Fixture::new();
        assert!(f.prepare());

        let wide = f.manager.get(SwapchainIndex::DoubleWide).unwrap();
        assert_eq!((wide.width, wide.height), (2000, 1100));
        assert!(f.manager.get(SwapchainIndex::AfrLeftEye).is_none());

        let ui = f.manager.get(SwapchainIndex::Ui).unwrap();
        assert_eq!((ui.width, ui.height), (1920, 1080));
        assert!(f.manager.get(SwapchainIndex::FrameworkUi).is_some());

        let dummy = f.manager.get(SwapchainIndex::Dummy).unwrap();
        assert_eq!((dummy.width, dummy.height), (4, 4));
        assert_eq!(f.cleared.len(), 1);
        assert!(f
            .session
            .created_swapchains()
            .iter()
            .any(|d| d.static_image && d.width == 4));

        let depth = f.manager.get(SwapchainIndex::Depth).unwrap();
        assert_eq!((depth.width, depth.height), (2000, 1100));
        assert!(f.manager.made_depth_with_null_defaults());
    }

    #[test]
    fn afr_layout_scales_eyes() {
        let mut f = Fixture::new();
        f.params.rendering_method = RenderingMethod::Alternating;
        f.params.resolution_scale = 1.5;
        f.params.depth_enabled = false;
        f.prepare();

        for index in [SwapchainIndex::AfrLeftEye, SwapchainIndex::AfrRightEye] {
            let eye = f.manager.get(index).unwrap();
            assert_eq!((eye.width, eye.height), (1500, 1650));
        }
        assert!(f.manager.get(SwapchainIndex::DoubleWide).is_none());
        assert!(f.manager.get(SwapchainIndex::Depth).is_none());
    }

    #[test]
    fn mode_change_destroys_before_recreating() {
        let mut f = Fixture::new();
        f.prepare();
        let first = f.session.live_swapchains();
        assert!(!f.prepare());

        f.params.rendering_method = RenderingMethod::Synchronized;
        assert!(f.prepare());
        assert_eq!(f.session.live_swapchains(), first + 1);
        assert_eq!(f.session.destroyed_swapchains(), first);
    }

    #[test]
    fn depth_resize_recreates_once() {
        let mut f = Fixture::new();
        f.params.depth_size = Some((1024, 1024));
        f.prepare();
        assert!(!f.manager.made_depth_with_null_defaults());
        let creates = f.session.create_swapchain_calls();

        f.params.depth_size = Some((2048, 2048));
        assert!(f.manager.needs_depth_resize(f.params.depth_size));
        assert!(f.prepare());
        let after_resize = f.session.create_swapchain_calls();
        assert!(after_resize > creates);

        for _ in 0..5 {
            assert!(!f.manager.needs_depth_resize(f.params.depth_size));
            assert!(!f.prepare());
        }
        assert_eq!(f.session.create_swapchain_calls(), after_resize);

        let depth = f.manager.get(SwapchainIndex::Depth).unwrap();
        assert_eq!((depth.width, depth.height), (2048, 2048));
    }

    #[test]
    fn depth_made_with_defaults_resizes_when_texture_appears() {
        let mut f = Fixture::new();
        f.prepare();
        assert!(!f.manager.needs_depth_resize(None));
        assert!(f.manager.needs_depth_resize(Some((2000, 1100))));

        f.params.depth_size = Some((2000, 1100));
        assert!(f.prepare());
        assert!(!f.manager.made_depth_with_null_defaults());
        assert!(!f.prepare());
    }

    #[test]
    fn acquire_runtime_failure_is_retried() {
        let mut f = Fixture::new();
        f.prepare();

        f.session
            .fail_next_acquire(xr::sys::Result::ERROR_RUNTIME_FAILURE);
        let mut recovered = 0;
        let mut copied = None;
        f.manager
            .copy(
                &mut f.session,
                SwapchainIndex::DoubleWide,
                &mut recovered,
                |r| *r += 1,
                |_, index, image| copied = Some((index, image)),
            )
            .unwrap();

        assert_eq!(recovered, 1);
        assert!(copied.is_some());
        assert_eq!(f.manager.num_textures_acquired(), 0);
        assert_eq!(f.session.acquired_images(), 0);
    }

    #[test]
    fn other_acquire_errors_abort_without_leaking() {
        let mut f = Fixture::new();
        f.prepare();

        f.session
            .fail_next_acquire(xr::sys::Result::ERROR_CALL_ORDER_INVALID);
        let result = f.manager.copy(
            &mut f.session,
            SwapchainIndex::DoubleWide,
            &mut (),
            |_| {},
            |_, _, _| panic!("copy ran without an image"),
        );
        assert!(matches!(result, Err(SwapchainError::Acquire(_))));
        assert_eq!(f.manager.num_textures_acquired(), 0);
    }

    #[test]
    fn release_runtime_failure_is_retried() {
        let mut f = Fixture::new();
        f.prepare();

        f.session
            .fail_next_release(xr::sys::Result::ERROR_RUNTIME_FAILURE);
        let mut recovered = 0;
        f.manager
            .copy(
                &mut f.session,
                SwapchainIndex::Ui,
                &mut recovered,
                |r| *r += 1,
                |_, _, _| {},
            )
            .unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(f.manager.num_textures_acquired(), 0);
        assert_eq!(f.session.acquired_images(), 0);
    }

    #[test]
    fn missing_swapchain() {
        let mut f = Fixture::new();
        let result = f.manager.copy(
            &mut f.session,
            SwapchainIndex::AfrLeftEye,
            &mut (),
            |_| {},
            |_, _, _| {},
        );
        assert!(matches!(
            result,
            Err(SwapchainError::Missing(SwapchainIndex::AfrLeftEye))
        ));
    }

    #[test]
    fn eye_swapchain_selection() {
        use RenderingMethod::*;
        assert_eq!(
            SwapchainIndex::for_eye(NativeStereo, Eye::Right),
            SwapchainIndex::DoubleWide
        );
        assert_eq!(
            SwapchainIndex::for_eye(Synchronized, Eye::Left),
            SwapchainIndex::AfrLeftEye
        );
        assert_eq!(
            SwapchainIndex::for_eye(Alternating, Eye::Right),
            SwapchainIndex::AfrRightEye
        );
    }
}
