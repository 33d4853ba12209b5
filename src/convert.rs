use crate::config::{HorizontalProjectionOverride, VerticalProjectionOverride};
use glam::{Mat4, Quat, Vec3};
use openxr as xr;

/// Tangents of the half angles of an eye's field of view. Y points up, so for a centred eye
/// `left` and `bottom` are negative.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RawProjection {
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

impl RawProjection {
    pub fn from_fov(fov: xr::Fovf) -> Self {
        Self {
            left: fov.angle_left.tan(),
            right: fov.angle_right.tan(),
            top: fov.angle_up.tan(),
            bottom: fov.angle_down.tan(),
        }
    }

    pub fn to_fov(self) -> xr::Fovf {
        xr::Fovf {
            angle_left: self.left.atan(),
            angle_right: self.right.atan(),
            angle_up: self.top.atan(),
            angle_down: self.bottom.atan(),
        }
    }

    /// OpenVR hands out `[left, right, top, bottom]` with top and bottom flipped.
    pub fn from_openvr([left, right, top, bottom]: [f32; 4]) -> Self {
        Self {
            left,
            right,
            top: -top,
            bottom: -bottom,
        }
    }
}

// https://github.com/ValveSoftware/openvr/wiki/IVRSystem::GetProjectionRaw
pub fn projection_from_raw(raw: &RawProjection, near_z: f32, far_z: f32) -> Mat4 {
    let idx = 1.0 / (raw.right - raw.left);
    let idy = 1.0 / (raw.top - raw.bottom);
    let idz = 1.0 / (far_z - near_z);
    let sx = raw.right + raw.left;
    let sy = raw.top + raw.bottom;

    // rows, transposed into glam's column major layout below
    let rows = [
        [2.0 * idx, 0.0, sx * idx, 0.0],
        [0.0, 2.0 * idy, sy * idy, 0.0],
        [0.0, 0.0, -far_z * idz, -far_z * near_z * idz],
        [0.0, 0.0, -1.0, 0.0],
    ];
    Mat4::from_cols_array_2d(&rows).transpose()
}

/// Recovers the tangent bounds a matrix from [`projection_from_raw`] was built from.
pub fn raw_from_projection(projection: &Mat4) -> RawProjection {
    let (x, y) = (projection.row(0), projection.row(1));
    RawProjection {
        left: (x.z - 1.0) / x.x,
        right: (x.z + 1.0) / x.x,
        top: (y.z + 1.0) / y.y,
        bottom: (y.z - 1.0) / y.y,
    }
}

/// Applies the configured override policies to both eyes' bounds, left eye first.
pub fn apply_projection_overrides(
    raw: [RawProjection; 2],
    horizontal: HorizontalProjectionOverride,
    vertical: VerticalProjectionOverride,
) -> [RawProjection; 2] {
    let [mut left, mut right] = raw;

    match horizontal {
        HorizontalProjectionOverride::None => {}
        HorizontalProjectionOverride::Symmetrical => {
            for eye in [&mut left, &mut right] {
                let extent = eye.left.abs().max(eye.right.abs());
                eye.left = -extent;
                eye.right = extent;
            }
        }
        HorizontalProjectionOverride::Mirrored => {
            // the right eye takes the left eye's bounds mirrored about the view axis
            right.left = -left.right;
            right.right = -left.left;
        }
    }

    match vertical {
        VerticalProjectionOverride::None => {}
        VerticalProjectionOverride::Symmetrical => {
            for eye in [&mut left, &mut right] {
                let extent = eye.top.abs().max(eye.bottom.abs());
                eye.top = extent;
                eye.bottom = -extent;
            }
        }
        VerticalProjectionOverride::Matched => {
            let top = left.top.max(right.top);
            let bottom = left.bottom.min(right.bottom);
            for eye in [&mut left, &mut right] {
                eye.top = top;
                eye.bottom = bottom;
            }
        }
    }

    [left, right]
}

pub fn pose_to_mat4(pose: &xr::Posef) -> Mat4 {
    let rot = Quat::from_xyzw(
        pose.orientation.x,
        pose.orientation.y,
        pose.orientation.z,
        pose.orientation.w,
    );
    let pos = Vec3::new(pose.position.x, pose.position.y, pose.position.z);
    Mat4::from_rotation_translation(rot, pos)
}

pub fn mat4_to_pose(mat: &Mat4) -> xr::Posef {
    let (_, rot, pos) = mat.to_scale_rotation_translation();
    xr::Posef {
        orientation: xr::Quaternionf {
            x: rot.x,
            y: rot.y,
            z: rot.z,
            w: rot.w,
        },
        position: xr::Vector3f {
            x: pos.x,
            y: pos.y,
            z: pos.z,
        },
    }
}

/// Rotates a controller transform about its own X axis.
#[inline]
pub fn apply_pitch_offset(mat: Mat4, degrees: f32) -> Mat4 {
    if degrees == 0.0 {
        return mat;
    }
    mat * Mat4::from_rotation_x(degrees.to_radians())
}

/// Row-major export of a transform, the layout hosts consume.
#[inline]
pub fn to_row_major(mat: &Mat4) -> [[f32; 4]; 4] {
    mat.transpose().to_cols_array_2d()
}

pub fn is_pose_valid(location: &xr::SpaceLocation) -> bool {
    location.location_flags.contains(
        xr::SpaceLocationFlags::POSITION_VALID | xr::SpaceLocationFlags::ORIENTATION_VALID,
    )
}
