//! User-editable render parameters.
//!
//! [`ControlState`] is written by the control panel widgets and read once per
//! frame by the uniform builder and the frame plan.

/// Selectable shadow map resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RsmResolution {
    R512,
    #[default]
    R1024,
    R2048,
    R4096,
}

impl RsmResolution {
    pub const ALL: [RsmResolution; 4] = [
        RsmResolution::R512,
        RsmResolution::R1024,
        RsmResolution::R2048,
        RsmResolution::R4096,
    ];

    pub fn size(self) -> u32 {
        match self {
            RsmResolution::R512 => 512,
            RsmResolution::R1024 => 1024,
            RsmResolution::R2048 => 2048,
            RsmResolution::R4096 => 4096,
        }
    }

    /// Exact match of a pixel size to one of the presets.
    pub fn from_size(size: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.size() == size)
    }

    pub fn label(self) -> &'static str {
        match self {
            RsmResolution::R512 => "512",
            RsmResolution::R1024 => "1024",
            RsmResolution::R2048 => "2048",
            RsmResolution::R4096 => "4096",
        }
    }
}

/// Which sphere the PBR section edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaterialSlot {
    /// Textured sphere.
    #[default]
    Textured,
    /// Solid colored sphere.
    Colored,
}

/// Roughness and metallic of one sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialParams {
    pub roughness: f32,
    pub metallic: f32,
}

/// Everything the control panel can change.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    // Sphere
    pub rotation: [f32; 3],
    pub rotation_anim_speed: f32,
    /// Virtual joystick deflection, each axis in [-1, 1].
    pub stick: [f32; 2],
    pub sphere_color: [f32; 3],

    // Lighting
    pub enable_key: bool,
    pub enable_fill: bool,
    pub enable_rim: bool,
    pub enable_env: bool,
    pub key_intensity: f32,
    pub ambient_strength: f32,
    pub blue_tint: f32,
    pub shadow_quality: f32,
    pub shadow_intensity: f32,
    pub metallic: f32,
    /// Light pitch in radians.
    pub light_elevation: f32,
    /// Light yaw in radians.
    pub light_azimuth: f32,
    pub light_ortho_half_size: [f32; 2],

    // Reflective shadow map
    pub enable_rsm: bool,
    pub enable_indirect: bool,
    pub enable_importance_sampling: bool,
    pub rsm_resolution: RsmResolution,
    pub indirect_intensity: f32,
    pub show_rsm_only: bool,
    pub show_indirect_only: bool,

    // PBR
    pub enable_pbr: bool,
    pub global_roughness: f32,
    pub global_metallic: f32,
    pub textured_material: MaterialParams,
    pub colored_material: MaterialParams,
    pub base_color_intensity: f32,
    pub selected_material: MaterialSlot,
}

pub const DEFAULT_LIGHT_ELEVATION: f32 = 0.8;
pub const DEFAULT_LIGHT_AZIMUTH: f32 = -0.7;

impl Default for ControlState {
    fn default() -> Self {
        Self {
            rotation: [0.0; 3],
            rotation_anim_speed: 0.6,
            stick: [0.0; 2],
            sphere_color: [0.3, 0.7, 1.0],
            enable_key: true,
            enable_fill: true,
            enable_rim: true,
            enable_env: true,
            key_intensity: 1.2,
            ambient_strength: 0.25,
            blue_tint: 1.0,
            shadow_quality: 1.0,
            shadow_intensity: 0.9,
            metallic: 0.6,
            light_elevation: DEFAULT_LIGHT_ELEVATION,
            light_azimuth: DEFAULT_LIGHT_AZIMUTH,
            light_ortho_half_size: [8.0, 8.0],
            enable_rsm: false,
            enable_indirect: true,
            enable_importance_sampling: true,
            rsm_resolution: RsmResolution::default(),
            indirect_intensity: 1.0,
            show_rsm_only: false,
            show_indirect_only: false,
            enable_pbr: false,
            global_roughness: 0.5,
            global_metallic: 0.0,
            textured_material: MaterialParams {
                roughness: 0.4,
                metallic: 0.1,
            },
            colored_material: MaterialParams {
                roughness: 0.2,
                metallic: 0.8,
            },
            base_color_intensity: 1.0,
            selected_material: MaterialSlot::default(),
        }
    }
}

impl ControlState {
    /// Reset the sphere orientation and stop the joystick.
    pub fn reset_rotation(&mut self) {
        self.rotation = [0.0; 3];
        self.stick = [0.0; 2];
    }

    pub fn reset_light_direction(&mut self) {
        self.light_elevation = DEFAULT_LIGHT_ELEVATION;
        self.light_azimuth = DEFAULT_LIGHT_AZIMUTH;
    }

    pub fn selected_material_mut(&mut self) -> &mut MaterialParams {
        match self.selected_material {
            MaterialSlot::Textured => &mut self.textured_material,
            MaterialSlot::Colored => &mut self.colored_material,
        }
    }
}

/// Requests produced by the control panel in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PanelActions {
    /// New shadow map size picked in the resolution combo.
    pub requested_rsm_size: Option<u32>,
}

impl PanelActions {
    pub fn merge(&mut self, other: PanelActions) {
        if other.requested_rsm_size.is_some() {
            self.requested_rsm_size = other.requested_rsm_size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let state = ControlState::default();
        assert!(!state.enable_rsm);
        assert!(state.enable_indirect);
        assert_eq!(state.rsm_resolution.size(), 1024);
        assert_eq!(state.light_ortho_half_size, [8.0, 8.0]);
        assert_eq!(state.key_intensity, 1.2);
    }

    #[rstest]
    #[case(512, Some(RsmResolution::R512))]
    #[case(1024, Some(RsmResolution::R1024))]
    #[case(4096, Some(RsmResolution::R4096))]
    #[case(1000, None)]
    fn test_resolution_from_size(#[case] size: u32, #[case] expected: Option<RsmResolution>) {
        assert_eq!(RsmResolution::from_size(size), expected);
    }

    #[test]
    fn test_reset_helpers() {
        let mut state = ControlState {
            rotation: [1.0, 2.0, 3.0],
            stick: [0.5, -0.5],
            light_elevation: 0.1,
            light_azimuth: 2.0,
            ..Default::default()
        };
        state.reset_rotation();
        state.reset_light_direction();
        assert_eq!(state.rotation, [0.0; 3]);
        assert_eq!(state.stick, [0.0; 2]);
        assert_eq!(state.light_elevation, DEFAULT_LIGHT_ELEVATION);
        assert_eq!(state.light_azimuth, DEFAULT_LIGHT_AZIMUTH);
    }

    #[test]
    fn test_selected_material_mut() {
        let mut state = ControlState::default();
        state.selected_material = MaterialSlot::Colored;
        state.selected_material_mut().roughness = 0.9;
        assert_eq!(state.colored_material.roughness, 0.9);
        assert_eq!(state.textured_material.roughness, 0.4);
    }

    #[test]
    fn test_merge_keeps_latest_request() {
        let mut actions = PanelActions::default();
        actions.merge(PanelActions {
            requested_rsm_size: Some(2048),
        });
        actions.merge(PanelActions::default());
        assert_eq!(actions.requested_rsm_size, Some(2048));
    }
}
