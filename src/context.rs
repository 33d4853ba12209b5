//! The process-wide VR context.
//!
//! A host has exactly one VR session, but nothing here is a global: the hook layer creates a
//! [`VrContext`] once an HMD is detected and hands it to the engine callbacks. The game thread
//! drives it through [`EngineTickNotifier`], the render thread through
//! [`VrContext::on_begin_render`] and [`VrContext::on_present`].

use crate::{
    config::ConfigProvider,
    convert::to_row_major,
    graphics_backends::{
        FrameContext, GraphicsBackend, RenderTargetProvider, SetupError, StereoComponent,
    },
    runtime::{AnyRuntime, Eye, InitError, VrRuntime},
    tracy_span,
};
use glam::{Quat, Vec3};
use log::{debug, error, info, trace, warn};
use std::ffi::c_void;
use std::sync::{
    atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering},
    Arc, RwLock, RwLockReadGuard,
};

/// Opaque pointer to the host engine object a tick belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EngineHandle(*mut c_void);

// Never dereferenced here, only handed back to the host.
unsafe impl Send for EngineHandle {}
unsafe impl Sync for EngineHandle {}

impl EngineHandle {
    pub fn new(engine: *mut c_void) -> Self {
        Self(engine)
    }

    pub fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }
}

/// Called by the hook layer at the start of every engine tick, on the game thread.
pub trait EngineTickNotifier: Send + Sync {
    /// `frame_count` is the engine frame this tick prepares; the render thread later passes the
    /// same number to [`VrContext::on_begin_render`]. 0 lets the runtime pick the next frame.
    fn on_pre_engine_tick(&self, engine: EngineHandle, frame_count: u32, delta: f32);
}

/// Builds the runtime for a session attempt. Called again whenever the runtime is lost.
pub type RuntimeFactory =
    Box<dyn Fn(Arc<dyn ConfigProvider>) -> Result<AnyRuntime, InitError> + Send + Sync>;

/// Where an eye sits relative to the tracking origin, in world units.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ViewOffset {
    pub rotation: Quat,
    pub position: Vec3,
}

/// An eye's matrices in the row-major layout hosts consume.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EyeMatrices {
    pub projection: [[f32; 4]; 4],
    /// Eye to tracking origin, in tracking units.
    pub view: [[f32; 4]; 4],
}

pub struct VrContext {
    config: Arc<dyn ConfigProvider>,
    factory: RuntimeFactory,
    runtime: RwLock<Option<AnyRuntime>>,
    engine: AtomicPtr<c_void>,
    /// The frame the game thread last queued poses for.
    frame_count: AtomicU32,
    render_frame_count: AtomicU32,
    presented_frames: AtomicU32,
    reinitializations: AtomicU32,
    /// Poses are predicted on the render thread instead of at engine tick.
    view_extensions: AtomicBool,
}

impl VrContext {
    /// Brings up the first runtime. Fails when the factory does or no HMD is present.
    pub fn init(
        config: Arc<dyn ConfigProvider>,
        factory: RuntimeFactory,
    ) -> Result<Self, InitError> {
        crate::init_logging();
        let runtime = Self::create_runtime(&factory, &config)?;
        Ok(Self {
            config,
            factory,
            runtime: RwLock::new(Some(runtime)),
            engine: AtomicPtr::new(std::ptr::null_mut()),
            frame_count: 0.into(),
            render_frame_count: 0.into(),
            presented_frames: 0.into(),
            reinitializations: 0.into(),
            view_extensions: false.into(),
        })
    }

    fn create_runtime(
        factory: &RuntimeFactory,
        config: &Arc<dyn ConfigProvider>,
    ) -> Result<AnyRuntime, InitError> {
        let runtime = factory(config.clone())?;
        if !runtime.loaded() {
            return Err(InitError::NoHmd);
        }
        info!("Initialized {:?} runtime", runtime.kind());
        Ok(runtime)
    }

    /// Drops the runtime. Every callback is a no-op afterwards.
    pub fn teardown(&self) {
        if self.runtime.write().unwrap().take().is_some() {
            info!("VR context torn down");
        }
    }

    pub fn runtime(&self) -> RwLockReadGuard<'_, Option<AnyRuntime>> {
        self.runtime.read().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.runtime().is_some()
    }

    #[inline]
    pub fn frame_count(&self) -> u32 {
        self.frame_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn render_frame_count(&self) -> u32 {
        self.render_frame_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn presented_frames(&self) -> u32 {
        self.presented_frames.load(Ordering::Acquire)
    }

    #[inline]
    pub fn reinitializations(&self) -> u32 {
        self.reinitializations.load(Ordering::Acquire)
    }

    pub fn engine(&self) -> EngineHandle {
        EngineHandle(self.engine.load(Ordering::Relaxed))
    }

    pub fn use_view_extensions(&self, enabled: bool) {
        self.view_extensions.store(enabled, Ordering::Release);
    }

    /// Render thread, before the engine renders `frame_count`.
    pub fn on_begin_render(&self, frame_count: u32) {
        tracy_span!("VrContext::on_begin_render");
        self.render_frame_count.store(frame_count, Ordering::Release);

        let runtime = self.runtime();
        let Some(runtime) = runtime.as_ref() else {
            return;
        };
        runtime.on_render_frame(frame_count);

        if self.view_extensions.load(Ordering::Acquire) {
            match runtime.update_poses(true, frame_count) {
                Ok(frame) => self.frame_count.store(frame, Ordering::Release),
                Err(e) => trace!("failed to update poses for frame {frame_count}: {e}"),
            }
        }
    }

    /// Render thread, once per host present. Composites and submits, then waits for the
    /// runtime to take the next frame unless the current one still misses its right eye.
    pub fn on_present<B: GraphicsBackend>(
        &self,
        compositor: &mut StereoComponent<B>,
        provider: &dyn RenderTargetProvider<B::Texture>,
    ) -> Result<(), SetupError> {
        tracy_span!("VrContext::on_present");
        let lost = self
            .runtime()
            .as_ref()
            .is_some_and(|rt| rt.wants_reinitialize());
        if lost {
            if let Err(e) = self.reinitialize(compositor) {
                error!("Failed to reinitialize VR runtime: {e}");
            }
            return Ok(());
        }

        let runtime = self.runtime();
        let Some(runtime) = runtime.as_ref() else {
            return Ok(());
        };

        let config = self.config.snapshot();
        let render_frame_count = self.render_frame_count();
        let ctx = FrameContext {
            runtime,
            config: &config,
            render_frame_count,
            provider,
        };
        let result = compositor.on_frame(&ctx);
        self.presented_frames.fetch_add(1, Ordering::AcqRel);

        if !compositor.submitted_left_eye() {
            if let Err(e) = runtime.synchronize_frame(Some(render_frame_count.wrapping_add(1))) {
                debug!("failed to synchronize next frame: {e}");
            }
        }
        result
    }

    /// Replaces the runtime wholesale. The compositor gives up every resource tied to the old
    /// one first.
    pub fn reinitialize<B: GraphicsBackend>(
        &self,
        compositor: &mut StereoComponent<B>,
    ) -> Result<(), InitError> {
        warn!("VR runtime lost, reinitializing");
        let mut runtime = self.runtime.write().unwrap();

        compositor.on_reset();
        if let Some(AnyRuntime::OpenXr(rt)) = runtime.as_ref() {
            compositor.destroy_swapchains(rt);
        }
        // Only one session may exist at a time.
        *runtime = None;

        let new = Self::create_runtime(&self.factory, &self.config)?;
        *runtime = Some(new);
        self.frame_count.store(0, Ordering::Release);
        self.reinitializations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn eye_matrices(&self, eye: Eye) -> Option<EyeMatrices> {
        let runtime = self.runtime();
        let runtime = runtime.as_ref().filter(|rt| rt.ready())?;
        let view = runtime.hmd_transform() * runtime.eye_transform(eye);
        Some(EyeMatrices {
            projection: to_row_major(&runtime.projection(eye)),
            view: to_row_major(&view),
        })
    }

    /// The eye's pose in world units: the tracked eye position scaled by the world scale, plus
    /// the configured camera offsets (forward is -Z).
    pub fn eye_view_offset(&self, eye: Eye) -> Option<ViewOffset> {
        let runtime = self.runtime();
        let runtime = runtime.as_ref().filter(|rt| rt.ready())?;
        let config = self.config.snapshot();

        let view = runtime.hmd_transform() * runtime.eye_transform(eye);
        let (_, rotation, translation) = view.to_scale_rotation_translation();
        let offsets = config.camera_offsets;
        let camera = Vec3::new(offsets.right, offsets.up, -offsets.forward);
        Some(ViewOffset {
            rotation,
            position: translation * config.world_scale + camera,
        })
    }
}

impl EngineTickNotifier for VrContext {
    fn on_pre_engine_tick(&self, engine: EngineHandle, frame_count: u32, delta: f32) {
        tracy_span!("VrContext::on_pre_engine_tick");
        self.engine.store(engine.as_ptr(), Ordering::Relaxed);
        trace!("engine tick {frame_count} ({delta:.4}s)");

        let runtime = self.runtime();
        let Some(runtime) = runtime.as_ref() else {
            return;
        };

        if let Err(e) = runtime.consume_events() {
            warn!("failed to consume runtime events: {e}");
        }
        if runtime.wants_reinitialize() {
            debug!("runtime wants reinitialization, skipping tick");
            return;
        }

        // Later frames are waited on after each present.
        if !runtime.got_first_poses() {
            if let Err(e) = runtime.synchronize_frame(None) {
                trace!("waiting for first frame: {e}");
                return;
            }
        }

        let config = self.config.snapshot();
        if let Err(e) = runtime.update_matrices(config.near_z, config.far_z) {
            trace!("failed to update matrices: {e}");
        }

        if self.view_extensions.load(Ordering::Acquire) {
            return;
        }
        match runtime.update_poses(false, frame_count) {
            Ok(frame) => self.frame_count.store(frame, Ordering::Release),
            Err(e) => trace!("failed to update poses for frame {frame_count}: {e}"),
        }
    }
}

impl Drop for VrContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
