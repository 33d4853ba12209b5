use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// How the two eyes get produced from the host's rendering.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderingMethod {
    /// Both eyes are rendered in one engine tick into a double wide target.
    #[default]
    NativeStereo,
    /// One eye per tick, two ticks per presented frame, both sharing one pose prediction.
    Synchronized,
    /// One eye per tick with independent predictions (true AFR).
    Alternating,
}

impl RenderingMethod {
    #[inline]
    pub fn is_afr(self) -> bool {
        !matches!(self, Self::NativeStereo)
    }

    #[inline]
    pub fn is_synchronized(self) -> bool {
        matches!(self, Self::Synchronized)
    }
}

/// How the host produces the second tick of a synchronized frame. Only forwarded to the host.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncedAfrMethod {
    #[default]
    SkipTick,
    SkipDraw,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalProjectionOverride {
    #[default]
    None,
    Symmetrical,
    Mirrored,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalProjectionOverride {
    #[default]
    None,
    Symmetrical,
    Matched,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiShape {
    #[default]
    Quad,
    Cylinder,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraOffsets {
    pub forward: f32,
    pub right: f32,
    pub up: f32,
}

impl Default for CameraOffsets {
    fn default() -> Self {
        Self {
            forward: 0.0,
            right: 0.0,
            up: 0.0,
        }
    }
}

/// Placement of the UI layer in front of the user, in meters.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiLayer {
    pub shape: UiShape,
    pub distance: f32,
    pub size: f32,
    /// Central angle in radians when `shape` is a cylinder.
    pub cylinder_angle: f32,
}

impl Default for UiLayer {
    fn default() -> Self {
        Self {
            shape: UiShape::Quad,
            distance: 2.0,
            size: 2.0,
            cylinder_angle: std::f32::consts::FRAC_PI_2,
        }
    }
}

/// A snapshot of every option the presentation core reads.
///
/// The configuration layer owns persistence; this type only knows how to read its JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rendering_method: RenderingMethod,
    pub synced_afr_method: SyncedAfrMethod,
    pub world_scale: f32,
    pub depth_enabled: bool,
    pub desktop_fix: bool,
    pub resolution_scale: f32,
    pub camera_offsets: CameraOffsets,
    pub horizontal_projection_override: HorizontalProjectionOverride,
    pub vertical_projection_override: VerticalProjectionOverride,
    /// Degrees, applied about the controller's local X axis.
    pub controller_pitch_offset: f32,
    pub extreme_compatibility_mode: bool,
    pub left_eye_interval: u32,
    pub right_eye_interval: u32,
    /// How many render frames after the last one rendered still count as the same frame.
    pub duplicate_frame_threshold: u32,
    pub ui_layer: UiLayer,
    pub near_z: f32,
    pub far_z: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rendering_method: RenderingMethod::default(),
            synced_afr_method: SyncedAfrMethod::default(),
            world_scale: 1.0,
            depth_enabled: false,
            desktop_fix: true,
            resolution_scale: 1.0,
            camera_offsets: CameraOffsets::default(),
            horizontal_projection_override: HorizontalProjectionOverride::default(),
            vertical_projection_override: VerticalProjectionOverride::default(),
            controller_pitch_offset: 0.0,
            extreme_compatibility_mode: false,
            left_eye_interval: 0,
            right_eye_interval: 1,
            duplicate_frame_threshold: 0,
            ui_layer: UiLayer::default(),
            near_z: 0.1,
            far_z: 10000.0,
        }
    }
}

impl Config {
    /// Clamps values the configuration layer may hand us out of range.
    fn sanitized(mut self) -> Self {
        if !(self.resolution_scale > 0.0) {
            warn!(
                "invalid resolution scale {}, using 1.0",
                self.resolution_scale
            );
            self.resolution_scale = 1.0;
        }
        self.resolution_scale = self.resolution_scale.min(4.0);

        if !(self.world_scale > 0.0) {
            warn!("invalid world scale {}, using 1.0", self.world_scale);
            self.world_scale = 1.0;
        }

        self.left_eye_interval %= 2;
        self.right_eye_interval %= 2;
        if self.left_eye_interval == self.right_eye_interval {
            warn!("left and right eye intervals are equal, using 0/1");
            self.left_eye_interval = 0;
            self.right_eye_interval = 1;
        }

        if !(self.near_z > 0.0) {
            self.near_z = Self::default().near_z;
        }
        self
    }
}

#[derive(Debug, derive_more::Display, derive_more::From)]
pub enum ConfigError {
    #[display("failed to parse configuration: {_0}")]
    Parse(serde_json::Error),
}

/// Source of configuration values, read once per call.
pub trait ConfigProvider: Send + Sync {
    fn snapshot(&self) -> Config;
}

/// The default [`ConfigProvider`]: a config behind a lock that the configuration layer writes
/// and the presentation core reads.
#[derive(Default)]
pub struct SharedConfig(RwLock<Config>);

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self(RwLock::new(config.sanitized()))
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        Ok(Self::new(config))
    }

    /// Replaces the current values with the ones in `json`. On a parse failure the current
    /// values are kept.
    pub fn load_json(&self, json: &str) -> Result<(), ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        info!("configuration reloaded ({:?})", config.rendering_method);
        *self.0.write().unwrap() = config.sanitized();
        Ok(())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&*self.0.read().unwrap()).unwrap_or_default()
    }

    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        let mut guard = self.0.write().unwrap();
        f(&mut guard);
        *guard = guard.clone().sanitized();
    }
}

impl ConfigProvider for SharedConfig {
    fn snapshot(&self) -> Config {
        self.0.read().unwrap().clone()
    }
}
