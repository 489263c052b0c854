use cgmath::{Matrix4, Quaternion, Rotation, SquareMatrix, Vector3};
use openxr as xr;

/// Rigid-body pose in tracking space. Orientation is stored `[w, x, y, z]`,
/// the layout the embedded engine consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: [f32; 3],
    pub orientation: [f32; 4],
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            orientation: [1.0, 0.0, 0.0, 0.0],
        }
    }
}

/// First and second pose derivatives. The runtime only reports velocities;
/// accelerations stay zero unless a source provides them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Motion {
    pub linear_velocity: [f32; 3],
    pub angular_velocity: [f32; 3],
    pub linear_acceleration: [f32; 3],
    pub angular_acceleration: [f32; 3],
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackedMotion {
    pub pose: Pose,
    pub motion: Motion,
}

impl Pose {
    pub fn from_xr(pose: &xr::Posef) -> Self {
        Self {
            position: [pose.position.x, pose.position.y, pose.position.z],
            orientation: [
                pose.orientation.w,
                pose.orientation.x,
                pose.orientation.y,
                pose.orientation.z,
            ],
        }
    }

    fn rotation(&self) -> Quaternion<f32> {
        Quaternion::new(
            self.orientation[0],
            self.orientation[1],
            self.orientation[2],
            self.orientation[3],
        )
    }

    pub fn world_matrix(&self) -> Matrix4<f32> {
        Matrix4::from_translation(Vector3::from(self.position)) * Matrix4::from(self.rotation())
    }

    /// Applies a child pose expressed in this pose's local space, yielding
    /// the child's pose in this pose's parent space.
    pub fn transform(&self, local: &Pose) -> Pose {
        let rotation = self.rotation() * local.rotation();
        let offset = self.rotation().rotate_vector(Vector3::from(local.position));
        Pose {
            position: [
                self.position[0] + offset.x,
                self.position[1] + offset.y,
                self.position[2] + offset.z,
            ],
            orientation: [rotation.s, rotation.v.x, rotation.v.y, rotation.v.z],
        }
    }
}

impl TrackedMotion {
    pub fn from_xr(pose: &xr::Posef, velocity: Option<&xr::SpaceVelocity>) -> Self {
        let mut motion = Motion::default();
        if let Some(velocity) = velocity {
            if velocity
                .velocity_flags
                .contains(xr::SpaceVelocityFlags::LINEAR_VALID)
            {
                let v = velocity.linear_velocity;
                motion.linear_velocity = [v.x, v.y, v.z];
            }
            if velocity
                .velocity_flags
                .contains(xr::SpaceVelocityFlags::ANGULAR_VALID)
            {
                let v = velocity.angular_velocity;
                motion.angular_velocity = [v.x, v.y, v.z];
            }
        }
        Self {
            pose: Pose::from_xr(pose),
            motion,
        }
    }
}

/// Column-major 4x4 matrix in the layout handed to the embedded engine.
pub type EngineMatrix = [[f32; 4]; 4];

/// Per-eye matrices passed to the engine's update callback. Plain-old-data
/// so a bridge can upload the block to a uniform buffer as-is.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct EyeMatrices {
    pub view: EngineMatrix,
    pub projection: EngineMatrix,
}

/// View matrix for an eye pose: the inverse of its world transform.
pub fn view_matrix(pose: &Pose) -> EngineMatrix {
    pose.world_matrix()
        .invert()
        .unwrap_or_else(Matrix4::identity)
        .into()
}

/// Projection from the compositor's tangent half-angles.
///
/// Math adapted from the Khronos xr_linear reference
/// (Apache-2.0, Copyright (c) 2017 The Khronos Group Inc.,
/// Copyright (c) 2016 Oculus VR, LLC).
pub fn projection_from_fov(fov: xr::Fovf, near_z: f32, far_z: f32) -> EngineMatrix {
    let tan_left = fov.angle_left.tan();
    let tan_right = fov.angle_right.tan();
    let tan_down = fov.angle_down.tan();
    let tan_up = fov.angle_up.tan();

    let tan_width = tan_right - tan_left;
    let tan_height = tan_up - tan_down;

    // [-1,1] Z clip space, positive Y up.
    let offset_z = near_z;

    let mut projection = Matrix4::new(
        2.0 / tan_width, 0.0, (tan_right + tan_left) / tan_width, 0.0,
        0.0, 2.0 / tan_height, (tan_up + tan_down) / tan_height, 0.0,
        0.0, 0.0, -(far_z + offset_z) / (far_z - near_z), -(far_z * (near_z + offset_z)) / (far_z - near_z),
        0.0, 0.0, -1.0, 0.0,
    );
    projection.transpose_self();
    projection.into()
}

#[cfg(test)]
mod test {
    use super::*;

    fn symmetric_fov(half_angle: f32) -> xr::Fovf {
        xr::Fovf {
            angle_left: -half_angle,
            angle_right: half_angle,
            angle_up: half_angle,
            angle_down: -half_angle,
        }
    }

    #[test]
    fn identity_pose_has_identity_view() {
        let view = view_matrix(&Pose::default());
        let identity: EngineMatrix = Matrix4::identity().into();
        assert_eq!(view, identity);
    }

    #[test]
    fn view_matrix_inverts_translation() {
        let pose = Pose {
            position: [1.0, 2.0, 3.0],
            orientation: [1.0, 0.0, 0.0, 0.0],
        };
        let view = view_matrix(&pose);
        // Column-major: the translation column negates the eye position.
        assert_eq!(view[3][0], -1.0);
        assert_eq!(view[3][1], -2.0);
        assert_eq!(view[3][2], -3.0);
    }

    #[test]
    fn projection_matches_tangent_angles() {
        let fov = symmetric_fov(std::f32::consts::FRAC_PI_4);
        let projection = projection_from_fov(fov, 0.1, 100.0);

        // Symmetric 90-degree fov: focal scale 1/tan(45) = 1.
        assert!((projection[0][0] - 1.0).abs() < 1e-5);
        assert!((projection[1][1] - 1.0).abs() < 1e-5);
        // Perspective divide row.
        assert_eq!(projection[2][3], -1.0);
        assert_eq!(projection[3][3], 0.0);
    }
}
