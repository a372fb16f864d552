//! Per-frame shader parameters.
//!
//! [`build`] turns the control state, pointer input and frame timing into the
//! [`UniformBlock`] uploaded before each frame is recorded. It performs no GPU
//! work; the only state it mutates is the sphere rotation integrated from the
//! virtual joystick.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::backend::Extent2d;
use crate::controls::ControlState;

/// Distance of the shadow camera from the scene center.
pub const LIGHT_STANDOFF_DISTANCE: f32 = 6.0;

/// Radians of rotation per frame at full joystick deflection.
pub const ROTATION_STEP: f32 = 0.02;

/// Shadow map gather radius. Each unit covers 2% of the map width.
pub const RSM_SAMPLE_RADIUS: f32 = 6.0;

/// Shadow map samples per shaded pixel.
pub const RSM_SAMPLE_COUNT: f32 = 32.0;

/// Above this `|dir.y|` the world up axis is too close to the light direction.
const UP_DEGENERACY_THRESHOLD: f32 = 0.95;

const KEY_LIGHT_COLOR: [f32; 4] = [0.95, 0.98, 1.0, 1.0];
const FILL_LIGHT_COLOR: [f32; 4] = [0.4, 0.6, 0.9, 0.6];
const RIM_LIGHT_COLOR: [f32; 4] = [0.6, 0.8, 1.0, 0.8];
const AMBIENT_COLOR: [f32; 3] = [0.08, 0.12, 0.22];

/// Shader-visible parameters, laid out like `Uniforms` in `shaders/common.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBlock {
    pub time: f32,
    pub _pad0: f32,
    pub resolution: [f32; 2],
    pub mouse: [f32; 2],
    pub frame: i32,
    pub _pad1: i32,
    /// xyz Euler angles, w animation phase.
    pub sphere_rotation: [f32; 4],
    pub sphere_color: [f32; 4],
    /// key, fill, rim, environment.
    pub enable_lights: [i32; 4],
    /// xyz direction toward the light, w key intensity.
    pub light_dir: [f32; 4],
    /// rgb color, a per-light scale.
    pub light_colors: [[f32; 4]; 3],
    /// rgb color, a strength.
    pub ambient_color: [f32; 4],
    /// quality, intensity, blue tint, metallic.
    pub shadow_params: [f32; 4],
    pub light_right: [f32; 4],
    pub light_up: [f32; 4],
    pub light_origin: [f32; 4],
    pub light_ortho_half_size: [f32; 4],
    pub rsm_resolution: [f32; 4],
    /// radius, samples, indirect enabled, shadow map enabled.
    pub rsm_params: [f32; 4],
    pub indirect_params: [f32; 4],
    /// show shadow map only, importance sampling, show indirect only.
    pub debug_params: [f32; 4],
    /// enabled, global roughness, global metallic.
    pub pbr_params: [f32; 4],
    /// textured roughness, colored roughness, textured metallic, colored metallic.
    pub material_params: [f32; 4],
    /// rgb tint, a intensity.
    pub base_color_factors: [f32; 4],
}

impl UniformBlock {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Whether the block tells the shaders to read the shadow map.
    pub fn rsm_enabled(&self) -> bool {
        self.rsm_params[3] > 0.5
    }
}

/// Orthonormal frame of the orthographic shadow camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightCameraBasis {
    pub dir: Vec3,
    pub right: Vec3,
    pub up: Vec3,
    pub origin: Vec3,
}

impl LightCameraBasis {
    /// Build the basis from elevation and azimuth in radians.
    pub fn from_angles(elevation: f32, azimuth: f32) -> Self {
        let cos_el = elevation.cos();
        let dir = Vec3::new(cos_el * azimuth.sin(), elevation.sin(), cos_el * azimuth.cos());
        let dir = dir / dir.length();

        let up_candidate = if dir.y.abs() > UP_DEGENERACY_THRESHOLD {
            Vec3::X
        } else {
            Vec3::Y
        };

        let right = up_candidate.cross(dir);
        let right = right / (right.length() + 1e-8);
        let up = dir.cross(right);

        Self {
            dir,
            right,
            up,
            origin: dir * -LIGHT_STANDOFF_DISTANCE,
        }
    }
}

/// Pointer position in window pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputState {
    pub pointer: [f32; 2],
}

impl InputState {
    pub fn on_pointer_moved(&mut self, x: f32, y: f32) {
        self.pointer = [x, y];
    }
}

/// Timing and target sizes for the frame being built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInputs {
    /// Seconds since start.
    pub time: f32,
    pub frame: i32,
    pub extent: Extent2d,
    pub rsm_size: u32,
}

fn flag(value: bool) -> f32 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Build this frame's uniform block.
///
/// Integrates the joystick into `controls.rotation` before snapshotting it.
pub fn build(inputs: &FrameInputs, controls: &mut ControlState, input: &InputState) -> UniformBlock {
    controls.rotation[0] += controls.stick[1] * ROTATION_STEP;
    controls.rotation[1] += controls.stick[0] * ROTATION_STEP;

    let c = &*controls;
    let basis = LightCameraBasis::from_angles(c.light_elevation, c.light_azimuth);
    let [width, height] = inputs.extent.as_vec();
    let mouse = [
        input.pointer[0].clamp(0.0, width),
        input.pointer[1].clamp(0.0, height),
    ];
    let rsm_size = inputs.rsm_size as f32;

    UniformBlock {
        time: inputs.time,
        _pad0: 0.0,
        resolution: [width, height],
        mouse,
        frame: inputs.frame,
        _pad1: 0,
        sphere_rotation: [
            c.rotation[0],
            c.rotation[1],
            c.rotation[2],
            inputs.time * c.rotation_anim_speed,
        ],
        sphere_color: [c.sphere_color[0], c.sphere_color[1], c.sphere_color[2], 1.0],
        enable_lights: [
            c.enable_key as i32,
            c.enable_fill as i32,
            c.enable_rim as i32,
            c.enable_env as i32,
        ],
        light_dir: basis.dir.extend(c.key_intensity).to_array(),
        light_colors: [KEY_LIGHT_COLOR, FILL_LIGHT_COLOR, RIM_LIGHT_COLOR],
        ambient_color: [
            AMBIENT_COLOR[0],
            AMBIENT_COLOR[1],
            AMBIENT_COLOR[2],
            c.ambient_strength,
        ],
        shadow_params: [c.shadow_quality, c.shadow_intensity, c.blue_tint, c.metallic],
        light_right: basis.right.extend(0.0).to_array(),
        light_up: basis.up.extend(0.0).to_array(),
        light_origin: basis.origin.extend(1.0).to_array(),
        light_ortho_half_size: [
            c.light_ortho_half_size[0],
            c.light_ortho_half_size[1],
            0.0,
            0.0,
        ],
        rsm_resolution: [rsm_size, rsm_size, 0.0, 0.0],
        rsm_params: [
            RSM_SAMPLE_RADIUS,
            RSM_SAMPLE_COUNT,
            flag(c.enable_rsm && c.enable_indirect),
            flag(c.enable_rsm),
        ],
        indirect_params: [c.indirect_intensity, 0.0, 0.0, 0.0],
        debug_params: [
            flag(c.show_rsm_only),
            flag(c.enable_importance_sampling),
            flag(c.show_indirect_only),
            0.0,
        ],
        pbr_params: [flag(c.enable_pbr), c.global_roughness, c.global_metallic, 0.0],
        material_params: [
            c.textured_material.roughness,
            c.colored_material.roughness,
            c.textured_material.metallic,
            c.colored_material.metallic,
        ],
        base_color_factors: [1.0, 1.0, 1.0, c.base_color_intensity],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::f32::consts::FRAC_PI_2;
    use std::mem::offset_of;

    fn inputs() -> FrameInputs {
        FrameInputs {
            time: 2.0,
            frame: 7,
            extent: Extent2d::new(800, 600),
            rsm_size: 1024,
        }
    }

    fn assert_orthonormal(basis: &LightCameraBasis) {
        assert!(basis.dir.dot(basis.right).abs() < 1e-5);
        assert!(basis.dir.dot(basis.up).abs() < 1e-5);
        assert!(basis.right.dot(basis.up).abs() < 1e-5);
        assert!((basis.dir.length() - 1.0).abs() < 1e-5);
        assert!((basis.right.length() - 1.0).abs() < 1e-5);
        assert!((basis.up.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_block_size_is_vec4_multiple() {
        assert_eq!(UniformBlock::SIZE, 352);
        assert_eq!(UniformBlock::SIZE % 16, 0);
    }

    #[test]
    fn test_block_offsets() {
        assert_eq!(offset_of!(UniformBlock, resolution), 8);
        assert_eq!(offset_of!(UniformBlock, mouse), 16);
        assert_eq!(offset_of!(UniformBlock, frame), 24);
        assert_eq!(offset_of!(UniformBlock, sphere_rotation), 32);
        assert_eq!(offset_of!(UniformBlock, light_colors), 96);
        assert_eq!(offset_of!(UniformBlock, ambient_color), 144);
        assert_eq!(offset_of!(UniformBlock, base_color_factors), 336);
    }

    #[test]
    fn test_block_matches_wgsl_layout() {
        let module = naga::front::wgsl::parse_str(crate::shader::COMMON_WGSL)
            .expect("prelude should parse");

        let (members, span) = module
            .types
            .iter()
            .find_map(|(_, ty)| match (&ty.name, &ty.inner) {
                (Some(name), naga::TypeInner::Struct { members, span }) if name == "Uniforms" => {
                    Some((members.clone(), *span))
                }
                _ => None,
            })
            .expect("Uniforms struct");

        assert_eq!(span as u64, UniformBlock::SIZE);

        let expected = [
            ("time", offset_of!(UniformBlock, time)),
            ("resolution", offset_of!(UniformBlock, resolution)),
            ("mouse", offset_of!(UniformBlock, mouse)),
            ("frame", offset_of!(UniformBlock, frame)),
            ("sphere_rotation", offset_of!(UniformBlock, sphere_rotation)),
            ("sphere_color", offset_of!(UniformBlock, sphere_color)),
            ("enable_lights", offset_of!(UniformBlock, enable_lights)),
            ("light_dir", offset_of!(UniformBlock, light_dir)),
            ("light_colors", offset_of!(UniformBlock, light_colors)),
            ("ambient_color", offset_of!(UniformBlock, ambient_color)),
            ("shadow_params", offset_of!(UniformBlock, shadow_params)),
            ("light_right", offset_of!(UniformBlock, light_right)),
            ("light_up", offset_of!(UniformBlock, light_up)),
            ("light_origin", offset_of!(UniformBlock, light_origin)),
            ("light_ortho_half_size", offset_of!(UniformBlock, light_ortho_half_size)),
            ("rsm_resolution", offset_of!(UniformBlock, rsm_resolution)),
            ("rsm_params", offset_of!(UniformBlock, rsm_params)),
            ("indirect_params", offset_of!(UniformBlock, indirect_params)),
            ("debug_params", offset_of!(UniformBlock, debug_params)),
            ("pbr_params", offset_of!(UniformBlock, pbr_params)),
            ("material_params", offset_of!(UniformBlock, material_params)),
            ("base_color_factors", offset_of!(UniformBlock, base_color_factors)),
        ];

        assert_eq!(members.len(), expected.len());
        for (member, (name, offset)) in members.iter().zip(expected) {
            assert_eq!(member.name.as_deref(), Some(name));
            assert_eq!(member.offset as usize, offset, "offset of {}", name);
        }
    }

    #[rstest]
    fn test_basis_orthonormal(
        #[values(-1.5, -0.8, 0.0, 0.3, 0.8, 1.2, 1.5)] elevation: f32,
        #[values(-3.1, -0.7, 0.0, 1.0, 2.5)] azimuth: f32,
    ) {
        let basis = LightCameraBasis::from_angles(elevation, azimuth);
        assert_orthonormal(&basis);
        assert!((basis.origin + basis.dir * LIGHT_STANDOFF_DISTANCE).length() < 1e-5);
    }

    #[rstest]
    #[case(FRAC_PI_2)]
    #[case(FRAC_PI_2 - 1e-4)]
    #[case(-FRAC_PI_2)]
    fn test_basis_near_vertical_uses_alternate_up(#[case] elevation: f32) {
        let basis = LightCameraBasis::from_angles(elevation, 0.3);
        assert!(basis.dir.y.abs() > UP_DEGENERACY_THRESHOLD);
        assert!(basis.right.is_finite() && basis.up.is_finite());
        assert!(basis.right.length() > 0.99);
        // right = X x dir lies in the plane orthogonal to X.
        assert!(basis.right.x.abs() < 1e-5);
        assert_orthonormal(&basis);
    }

    #[test]
    fn test_default_direction() {
        let basis = LightCameraBasis::from_angles(0.8, -0.7);
        let expected = Vec3::new(0.8f32.cos() * (-0.7f32).sin(), 0.8f32.sin(), 0.8f32.cos() * (-0.7f32).cos());
        assert!((basis.dir - expected).length() < 1e-6);
    }

    #[test]
    fn test_build_integrates_stick() {
        let mut controls = ControlState {
            stick: [0.5, -1.0],
            ..Default::default()
        };
        let input = InputState::default();

        for _ in 0..10 {
            build(&inputs(), &mut controls, &input);
        }

        assert!((controls.rotation[0] - (-1.0 * ROTATION_STEP * 10.0)).abs() < 1e-6);
        assert!((controls.rotation[1] - (0.5 * ROTATION_STEP * 10.0)).abs() < 1e-6);
        assert_eq!(controls.rotation[2], 0.0);
    }

    #[test]
    fn test_build_fields() {
        let mut controls = ControlState::default();
        let block = build(&inputs(), &mut controls, &InputState { pointer: [10.0, 20.0] });

        assert_eq!(block.time, 2.0);
        assert_eq!(block.frame, 7);
        assert_eq!(block.resolution, [800.0, 600.0]);
        assert_eq!(block.mouse, [10.0, 20.0]);
        assert!((block.sphere_rotation[3] - 2.0 * 0.6).abs() < 1e-6);
        assert_eq!(block.enable_lights, [1, 1, 1, 1]);
        assert_eq!(block.light_dir[3], 1.2);
        assert_eq!(block.ambient_color[3], 0.25);
        assert_eq!(block.rsm_resolution, [1024.0, 1024.0, 0.0, 0.0]);
        assert_eq!(block.rsm_params, [6.0, 32.0, 0.0, 0.0]);
        assert_eq!(block.debug_params, [0.0, 1.0, 0.0, 0.0]);
        assert_eq!(block.material_params, [0.4, 0.2, 0.1, 0.8]);
        assert_eq!(block.base_color_factors, [1.0, 1.0, 1.0, 1.0]);
        assert!(!block.rsm_enabled());
    }

    #[rstest]
    #[case(false, true, [0.0, 0.0])]
    #[case(true, false, [0.0, 1.0])]
    #[case(true, true, [1.0, 1.0])]
    fn test_rsm_flags(#[case] rsm: bool, #[case] indirect: bool, #[case] expected: [f32; 2]) {
        let mut controls = ControlState {
            enable_rsm: rsm,
            enable_indirect: indirect,
            ..Default::default()
        };
        let block = build(&inputs(), &mut controls, &InputState::default());
        assert_eq!([block.rsm_params[2], block.rsm_params[3]], expected);
        assert_eq!(block.rsm_enabled(), rsm);
    }

    #[rstest]
    #[case([-50.0, 30.0], [0.0, 30.0])]
    #[case([900.0, 700.0], [800.0, 600.0])]
    #[case([400.0, -1.0], [400.0, 0.0])]
    fn test_pointer_clamped_to_extent(#[case] pointer: [f32; 2], #[case] expected: [f32; 2]) {
        let mut controls = ControlState::default();
        let block = build(&inputs(), &mut controls, &InputState { pointer });
        assert_eq!(block.mouse, expected);
    }
}
