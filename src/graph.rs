//! Per-frame pass plan and command recording.
//!
//! The shadow pass is the only optional pass. When it is skipped the main
//! pass still samples the three shadow map images, so they are moved to a
//! shader-readable layout with an explicit barrier instead.

use crate::backend::{BackendResult, Extent2d, GpuBackend, ImageLayout, PipelineHandle};
use crate::controls::{ControlState, PanelActions};
use crate::frame::ImageBinding;
use crate::offscreen::OffscreenTargetManager;
use crate::scene::{SceneResources, QUAD_VERTEX_COUNT};
use crate::ui::UiOverlay;

pub const MAIN_CLEAR_COLOR: [f32; 4] = [0.03, 0.05, 0.09, 1.0];
pub const RSM_CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 0.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStep {
    /// Render position, normal and flux from the light.
    ShadowPass,
    /// Move the unwritten shadow map images to a sampled layout.
    TransitionTargets,
    MainPass,
    /// Recorded inside the main pass's render pass instance.
    UiOverlay,
}

/// Ordered passes for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePlan {
    shadow_enabled: bool,
    steps: Vec<PassStep>,
}

impl FramePlan {
    pub fn new(shadow_enabled: bool) -> Self {
        let first = if shadow_enabled {
            PassStep::ShadowPass
        } else {
            PassStep::TransitionTargets
        };
        Self {
            shadow_enabled,
            steps: vec![first, PassStep::MainPass, PassStep::UiOverlay],
        }
    }

    pub fn shadow_enabled(&self) -> bool {
        self.shadow_enabled
    }

    pub fn steps(&self) -> &[PassStep] {
        &self.steps
    }
}

/// Objects the recorded commands refer to.
pub struct RecordContext<'a> {
    pub scene: &'a SceneResources,
    pub offscreen: &'a OffscreenTargetManager,
    pub binding: &'a ImageBinding,
    pub extent: Extent2d,
}

/// Records a [`FramePlan`] into the frame's command buffer.
pub struct PassSequencer;

impl PassSequencer {
    /// Record every step of `plan`, from `begin` to `end` of the command buffer.
    ///
    /// The overlay runs its widgets while the main pass is open, so control
    /// changes made this frame take effect in the next one.
    pub fn record<B, U>(
        backend: &mut B,
        plan: &FramePlan,
        ctx: &RecordContext<'_>,
        overlay: &mut U,
        controls: &mut ControlState,
    ) -> BackendResult<PanelActions>
    where
        B: GpuBackend,
        U: UiOverlay<B>,
    {
        let cmd = ctx.binding.command_buffer;
        let mut actions = PanelActions::default();
        let mut main_pass_open = false;

        backend.cmd_begin(cmd)?;

        for step in plan.steps() {
            match step {
                PassStep::ShadowPass => {
                    let extent = ctx.offscreen.extent();
                    backend.cmd_begin_render_pass(
                        cmd,
                        ctx.offscreen.render_pass(),
                        ctx.offscreen.framebuffer()?,
                        extent,
                        &[RSM_CLEAR_COLOR; 3],
                    );
                    draw_fullscreen(backend, ctx, ctx.scene.rsm_pipeline, extent);
                    backend.cmd_end_render_pass(cmd);
                }
                PassStep::TransitionTargets => {
                    for image in ctx.offscreen.images()? {
                        backend.cmd_transition_image(
                            cmd,
                            image,
                            ImageLayout::Undefined,
                            ImageLayout::ShaderReadOnly,
                        );
                    }
                }
                PassStep::MainPass => {
                    backend.cmd_begin_render_pass(
                        cmd,
                        ctx.scene.main_render_pass,
                        ctx.binding.framebuffer,
                        ctx.extent,
                        &[MAIN_CLEAR_COLOR],
                    );
                    main_pass_open = true;
                    draw_fullscreen(backend, ctx, ctx.scene.main_pipeline, ctx.extent);
                }
                PassStep::UiOverlay => {
                    overlay.begin_frame();
                    actions.merge(overlay.build(controls));
                    overlay.end_frame();
                    overlay.record(backend, cmd, ctx.extent)?;
                }
            }
        }

        if main_pass_open {
            backend.cmd_end_render_pass(cmd);
        }
        backend.cmd_end(cmd)?;
        Ok(actions)
    }
}

fn draw_fullscreen<B: GpuBackend>(
    backend: &mut B,
    ctx: &RecordContext<'_>,
    pipeline: PipelineHandle,
    extent: Extent2d,
) {
    let cmd = ctx.binding.command_buffer;
    backend.cmd_bind_pipeline(cmd, pipeline);
    backend.cmd_set_viewport_scissor(cmd, extent);
    backend.cmd_bind_descriptor_set(cmd, pipeline, ctx.binding.descriptor_set);
    backend.cmd_bind_vertex_buffer(cmd, ctx.scene.quad_buffer);
    backend.cmd_draw(cmd, QUAD_VERTEX_COUNT, 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, DummyBackend};
    use crate::frame::FrameResourceSet;
    use crate::shader::ShaderSet;
    use crate::texture::TextureData;
    use crate::ui::HeadlessOverlay;
    use rstest::rstest;

    #[rstest]
    #[case(true, [PassStep::ShadowPass, PassStep::MainPass, PassStep::UiOverlay])]
    #[case(false, [PassStep::TransitionTargets, PassStep::MainPass, PassStep::UiOverlay])]
    fn test_plan_steps(#[case] shadow: bool, #[case] expected: [PassStep; 3]) {
        let plan = FramePlan::new(shadow);
        assert_eq!(plan.steps(), &expected);
        assert_eq!(plan.shadow_enabled(), shadow);
    }

    struct Fixture {
        backend: DummyBackend,
        scene: SceneResources,
        offscreen: OffscreenTargetManager,
        frames: FrameResourceSet,
    }

    fn fixture() -> Fixture {
        let mut backend = DummyBackend::new(Extent2d::new(640, 360), 2);
        let offscreen = OffscreenTargetManager::new(&mut backend, 256).unwrap();
        let shaders = ShaderSet::compile().unwrap();
        let texture = TextureData::checkerboard(8, 2, [255; 4], [0, 0, 0, 255]);
        let scene = SceneResources::new(&mut backend, offscreen.render_pass(), &shaders, &texture).unwrap();
        let sources = scene.descriptor_sources(&offscreen).unwrap();
        let frames = FrameResourceSet::new(&mut backend, 2, scene.main_render_pass, &sources).unwrap();
        backend.take_events();
        Fixture {
            backend,
            scene,
            offscreen,
            frames,
        }
    }

    fn record(f: &mut Fixture, shadow: bool) -> Vec<BackendEvent> {
        let binding = *f.frames.binding(0).unwrap();
        let ctx = RecordContext {
            scene: &f.scene,
            offscreen: &f.offscreen,
            binding: &binding,
            extent: f.backend.swapchain_extent(),
        };
        let mut overlay = HeadlessOverlay::new();
        let mut controls = ControlState::default();
        PassSequencer::record(&mut f.backend, &FramePlan::new(shadow), &ctx, &mut overlay, &mut controls)
            .unwrap();
        f.backend.take_events()
    }

    #[test]
    fn test_shadow_pass_recorded_before_main() {
        let mut f = fixture();
        let events = record(&mut f, true);

        let passes: Vec<&BackendEvent> = events
            .iter()
            .filter(|e| matches!(e, BackendEvent::BeginRenderPass { .. }))
            .collect();
        assert_eq!(passes.len(), 2);
        match passes[0] {
            BackendEvent::BeginRenderPass {
                render_pass,
                extent,
                clear_colors,
                ..
            } => {
                assert_eq!(*render_pass, f.offscreen.render_pass());
                assert_eq!(*extent, Extent2d::square(256));
                assert_eq!(clear_colors, &vec![RSM_CLEAR_COLOR; 3]);
            }
            _ => unreachable!(),
        }
        match passes[1] {
            BackendEvent::BeginRenderPass {
                render_pass,
                clear_colors,
                ..
            } => {
                assert_eq!(*render_pass, f.scene.main_render_pass);
                assert_eq!(clear_colors, &vec![MAIN_CLEAR_COLOR]);
            }
            _ => unreachable!(),
        }

        let draws = events
            .iter()
            .filter(|e| matches!(e, BackendEvent::Draw { vertex_count: 4, instance_count: 1, .. }))
            .count();
        assert_eq!(draws, 2);
        let cmd = f.frames.binding(0).unwrap().command_buffer;
        assert_eq!(events.first(), Some(&BackendEvent::BeginCommandBuffer(cmd)));
        assert!(matches!(events.last(), Some(BackendEvent::EndCommandBuffer(_))));
        assert!(f.backend.validation_errors().is_empty());
    }

    #[test]
    fn test_disabled_shadow_transitions_targets() {
        let mut f = fixture();
        let events = record(&mut f, false);

        let transitions: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BackendEvent::TransitionImage {
                    image,
                    old_layout,
                    new_layout,
                } => Some((*image, *old_layout, *new_layout)),
                _ => None,
            })
            .collect();
        let expected: Vec<_> = f
            .offscreen
            .images()
            .unwrap()
            .iter()
            .map(|&i| (i, ImageLayout::Undefined, ImageLayout::ShaderReadOnly))
            .collect();
        assert_eq!(transitions, expected);

        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, BackendEvent::BeginRenderPass { .. }))
                .count(),
            1
        );

        let Some(BackendEvent::Draw { sampled_layouts, .. }) =
            events.iter().find(|e| matches!(e, BackendEvent::Draw { .. }))
        else {
            panic!("main pass did not draw");
        };
        assert!(sampled_layouts
            .iter()
            .all(|(_, layout)| *layout == ImageLayout::ShaderReadOnly));
    }

    #[test]
    fn test_rerecording_is_idempotent() {
        let mut f = fixture();
        let first = record(&mut f, true);
        let second = record(&mut f, true);
        assert_eq!(first, second);
        assert!(f.backend.validation_errors().is_empty());
    }
}
