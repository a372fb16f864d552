//! The "SDF Controls" window.

use std::f32::consts::{FRAC_PI_2, PI};

use crate::controls::{ControlState, MaterialSlot, PanelActions, RsmResolution};

/// Edge of the light direction and joystick pads, in points.
pub const PAD_SIZE: f32 = 120.0;
const PAD_RADIUS_FRACTION: f32 = 0.4;

/// Clamp a pad offset into the unit circle.
pub fn clamp_to_unit_circle(v: [f32; 2]) -> [f32; 2] {
    let len = (v[0] * v[0] + v[1] * v[1]).sqrt();
    if len > 1.0 {
        [v[0] / len, v[1] / len]
    } else {
        v
    }
}

/// Map a unit-circle pad offset (y up) to (elevation, azimuth).
pub fn pad_to_light_angles(offset: [f32; 2]) -> (f32, f32) {
    let [x, y] = clamp_to_unit_circle(offset);
    (y * FRAC_PI_2, x * PI)
}

/// Inverse of [`pad_to_light_angles`], for drawing the handle.
pub fn light_angles_to_pad(elevation: f32, azimuth: f32) -> [f32; 2] {
    clamp_to_unit_circle([azimuth / PI, elevation / FRAC_PI_2])
}

/// A circular drag pad. Returns the pointer offset (y up, unit circle) while
/// dragged, and draws a handle at `handle`.
fn drag_pad(ui: &mut egui::Ui, handle: [f32; 2]) -> Option<[f32; 2]> {
    let (response, painter) = ui.allocate_painter(egui::vec2(PAD_SIZE, PAD_SIZE), egui::Sense::drag());
    let rect = response.rect;
    let center = rect.center();
    let radius = PAD_SIZE * PAD_RADIUS_FRACTION;
    let visuals = ui.visuals();

    painter.rect_filled(rect, 4.0, visuals.extreme_bg_color);
    painter.circle_stroke(center, radius, visuals.widgets.noninteractive.fg_stroke);
    painter.line_segment(
        [center - egui::vec2(radius, 0.0), center + egui::vec2(radius, 0.0)],
        visuals.widgets.noninteractive.bg_stroke,
    );
    painter.line_segment(
        [center - egui::vec2(0.0, radius), center + egui::vec2(0.0, radius)],
        visuals.widgets.noninteractive.bg_stroke,
    );

    let dragged = if response.dragged() {
        response.interact_pointer_pos().map(|pos| {
            clamp_to_unit_circle([(pos.x - center.x) / radius, (center.y - pos.y) / radius])
        })
    } else {
        None
    };

    let shown = dragged.unwrap_or(handle);
    let handle_pos = center + egui::vec2(shown[0] * radius, -shown[1] * radius);
    painter.circle_filled(handle_pos, 5.0, visuals.selection.bg_fill);

    dragged
}

fn slider(ui: &mut egui::Ui, value: &mut f32, range: std::ops::RangeInclusive<f32>, text: &str) {
    ui.add(egui::Slider::new(value, range).text(text));
}

/// Draw the control window and apply edits to `controls`.
pub fn draw_panel(ctx: &egui::Context, controls: &mut ControlState) -> PanelActions {
    let mut actions = PanelActions::default();

    egui::Window::new("SDF Controls")
        .default_pos([10.0, 10.0])
        .resizable(false)
        .show(ctx, |ui| {
            ui.heading("Sphere");
            ui.separator();
            slider(ui, &mut controls.rotation[0], -PI..=PI, "Rotation X");
            slider(ui, &mut controls.rotation[1], -PI..=PI, "Rotation Y");
            slider(ui, &mut controls.rotation[2], -PI..=PI, "Rotation Z");
            slider(ui, &mut controls.rotation_anim_speed, 0.0..=3.0, "Spin Speed");

            ui.horizontal(|ui| {
                ui.label("Joystick");
                controls.stick = drag_pad(ui, controls.stick).unwrap_or([0.0, 0.0]);
            });
            if ui.button("Reset Rotation").clicked() {
                controls.reset_rotation();
            }
            ui.horizontal(|ui| {
                ui.label("Color");
                ui.color_edit_button_rgb(&mut controls.sphere_color);
            });

            ui.add_space(8.0);
            ui.heading("Lights");
            ui.separator();
            ui.horizontal(|ui| {
                ui.checkbox(&mut controls.enable_key, "Key");
                ui.checkbox(&mut controls.enable_fill, "Fill");
                ui.checkbox(&mut controls.enable_rim, "Rim");
                ui.checkbox(&mut controls.enable_env, "Env");
            });
            slider(ui, &mut controls.key_intensity, 0.0..=4.0, "Key Intensity");

            ui.horizontal(|ui| {
                let handle = light_angles_to_pad(controls.light_elevation, controls.light_azimuth);
                if let Some(offset) = drag_pad(ui, handle) {
                    let (elevation, azimuth) = pad_to_light_angles(offset);
                    controls.light_elevation = elevation;
                    controls.light_azimuth = azimuth;
                }
                ui.vertical(|ui| {
                    ui.label(format!("Elevation {:.2}", controls.light_elevation));
                    ui.label(format!("Azimuth {:.2}", controls.light_azimuth));
                    if ui.button("Reset Light").clicked() {
                        controls.reset_light_direction();
                    }
                });
            });

            slider(ui, &mut controls.ambient_strength, 0.0..=1.0, "Ambient");
            slider(ui, &mut controls.shadow_quality, 0.0..=1.0, "Shadow Softness");
            slider(ui, &mut controls.shadow_intensity, 0.0..=1.0, "Shadow Intensity");
            slider(ui, &mut controls.metallic, 0.0..=1.0, "Specular");
            slider(ui, &mut controls.blue_tint, 0.0..=2.0, "Blue Tint");
            slider(ui, &mut controls.light_ortho_half_size[0], 1.0..=16.0, "Light Extent X");
            slider(ui, &mut controls.light_ortho_half_size[1], 1.0..=16.0, "Light Extent Y");

            ui.add_space(8.0);
            ui.heading("Indirect Light");
            ui.separator();
            ui.checkbox(&mut controls.enable_rsm, "Reflective Shadow Map");
            ui.add_enabled_ui(controls.enable_rsm, |ui| {
                ui.checkbox(&mut controls.enable_indirect, "Indirect Bounce");
                ui.checkbox(&mut controls.enable_importance_sampling, "Importance Sampling");
                slider(ui, &mut controls.indirect_intensity, 0.0..=4.0, "Indirect Intensity");

                let mut selected = controls.rsm_resolution;
                egui::ComboBox::from_label("Resolution")
                    .selected_text(selected.label())
                    .show_ui(ui, |ui| {
                        for resolution in RsmResolution::ALL {
                            ui.selectable_value(&mut selected, resolution, resolution.label());
                        }
                    });
                if selected != controls.rsm_resolution {
                    controls.rsm_resolution = selected;
                    actions.requested_rsm_size = Some(selected.size());
                }

                ui.checkbox(&mut controls.show_rsm_only, "Show Shadow Map");
                ui.checkbox(&mut controls.show_indirect_only, "Show Indirect Only");
            });

            ui.add_space(8.0);
            ui.collapsing("PBR", |ui| {
                ui.checkbox(&mut controls.enable_pbr, "Enable PBR");
                slider(ui, &mut controls.global_roughness, 0.0..=1.0, "Wall Roughness");
                slider(ui, &mut controls.global_metallic, 0.0..=1.0, "Wall Metallic");
                slider(ui, &mut controls.base_color_intensity, 0.0..=2.0, "Base Color");

                ui.horizontal(|ui| {
                    ui.selectable_value(&mut controls.selected_material, MaterialSlot::Textured, "Textured");
                    ui.selectable_value(&mut controls.selected_material, MaterialSlot::Colored, "Colored");
                });
                let material = controls.selected_material_mut();
                slider(ui, &mut material.roughness, 0.0..=1.0, "Roughness");
                slider(ui, &mut material.metallic, 0.0..=1.0, "Metallic");
            });
        });

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case([0.0, 0.0], [0.0, 0.0])]
    #[case([0.5, 0.5], [0.5, 0.5])]
    #[case([3.0, 4.0], [0.6, 0.8])]
    #[case([-2.0, 0.0], [-1.0, 0.0])]
    fn test_clamp_to_unit_circle(#[case] input: [f32; 2], #[case] expected: [f32; 2]) {
        let out = clamp_to_unit_circle(input);
        assert!((out[0] - expected[0]).abs() < 1e-6);
        assert!((out[1] - expected[1]).abs() < 1e-6);
    }

    #[test]
    fn test_pad_edges() {
        let (el, az) = pad_to_light_angles([0.0, 1.0]);
        assert!((el - FRAC_PI_2).abs() < 1e-6);
        assert_eq!(az, 0.0);

        let (el, az) = pad_to_light_angles([-1.0, 0.0]);
        assert_eq!(el, 0.0);
        assert!((az + PI).abs() < 1e-6);
    }

    #[test]
    fn test_pad_roundtrip_inside_circle() {
        let (el, az) = pad_to_light_angles([0.3, -0.4]);
        let back = light_angles_to_pad(el, az);
        assert!((back[0] - 0.3).abs() < 1e-6);
        assert!((back[1] + 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_panel_runs_without_input() {
        let ctx = egui::Context::default();
        let mut controls = ControlState::default();
        let before = controls.clone();

        ctx.begin_frame(egui::RawInput::default());
        let actions = draw_panel(&ctx, &mut controls);
        let _ = ctx.end_frame();

        assert_eq!(actions, PanelActions::default());
        assert_eq!(controls, before);
    }
}
