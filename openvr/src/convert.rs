use super::*;
use glam::{Affine3A, Mat3, Mat4, Quat, Vec3};
use openxr as xr;

impl From<Mat4> for HmdMatrix44_t {
    fn from(value: Mat4) -> Self {
        // OpenVR wants data in row major order, so we transpose it
        Self {
            m: value.transpose().to_cols_array_2d(),
        }
    }
}

impl From<HmdMatrix44_t> for Mat4 {
    fn from(value: HmdMatrix44_t) -> Self {
        Mat4::from_cols_array_2d(&value.m).transpose()
    }
}

impl From<xr::Vector3f> for HmdVector3_t {
    fn from(value: xr::Vector3f) -> Self {
        Self {
            v: [value.x, value.y, value.z],
        }
    }
}

impl From<Vec3> for HmdVector3_t {
    fn from(value: Vec3) -> Self {
        Self {
            v: value.to_array(),
        }
    }
}

impl From<Quat> for HmdQuaternionf_t {
    fn from(value: Quat) -> Self {
        Self {
            x: value.x,
            y: value.y,
            z: value.z,
            w: value.w,
        }
    }
}

// https://github.com/ValveSoftware/openvr/wiki/Matrix-Usage-Example
impl From<xr::Posef> for HmdMatrix34_t {
    fn from(pose: xr::Posef) -> Self {
        // openvr matrices are row major, glam matrices are column major

        let rot = Mat3::from_quat(Quat::from_xyzw(
            pose.orientation.x,
            pose.orientation.y,
            pose.orientation.z,
            pose.orientation.w,
        ))
        .transpose();

        let gen_array = |translation, rot_axis: Vec3| {
            std::array::from_fn(|i| if i == 3 { translation } else { rot_axis[i] })
        };

        Self {
            m: [
                gen_array(pose.position.x, rot.x_axis),
                gen_array(pose.position.y, rot.y_axis),
                gen_array(pose.position.z, rot.z_axis),
            ],
        }
    }
}

impl From<HmdMatrix34_t> for xr::Posef {
    fn from(mat: HmdMatrix34_t) -> Self {
        let mat = mat.m;
        let pos = xr::Vector3f {
            x: mat[0][3],
            y: mat[1][3],
            z: mat[2][3],
        };
        let rot = Quat::from_mat3(
            &Mat3::from_cols(
                Vec3::from_slice(&mat[0][..3]),
                Vec3::from_slice(&mat[1][..3]),
                Vec3::from_slice(&mat[2][..3]),
            )
            .transpose(),
        );
        xr::Posef {
            position: pos,
            orientation: xr::Quaternionf {
                x: rot.x,
                y: rot.y,
                z: rot.z,
                w: rot.w,
            },
        }
    }
}

impl From<HmdMatrix34_t> for Affine3A {
    fn from(mat: HmdMatrix34_t) -> Self {
        let m = mat.m;
        Affine3A::from_cols_array(&[
            m[0][0], m[1][0], m[2][0], //
            m[0][1], m[1][1], m[2][1], //
            m[0][2], m[1][2], m[2][2], //
            m[0][3], m[1][3], m[2][3],
        ])
    }
}

impl From<Affine3A> for HmdMatrix34_t {
    fn from(value: Affine3A) -> Self {
        let cols = value.to_cols_array_2d();
        Self {
            m: std::array::from_fn(|row| std::array::from_fn(|col| cols[col][row])),
        }
    }
}

impl From<HmdMatrix34_t> for Mat4 {
    fn from(mat: HmdMatrix34_t) -> Self {
        Mat4::from(Affine3A::from(mat))
    }
}
