//! SDF renderer executable

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sdf_renderer::frame::{MAX_FRAMES_IN_FLIGHT, MIN_FRAMES_IN_FLIGHT};
use sdf_renderer::RendererConfig;

/// Real-time SDF ray marcher with reflective shadow map indirect lighting.
#[derive(Parser, Debug)]
#[command(name = "sdf-renderer", version)]
struct Args {
    /// Initial window width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Disable vertical sync (may cause tearing).
    #[arg(long)]
    no_vsync: bool,

    /// Frames the CPU may record ahead of the GPU.
    #[arg(
        long,
        default_value = "3",
        value_parser = clap::value_parser!(u8).range(MIN_FRAMES_IN_FLIGHT as i64..=MAX_FRAMES_IN_FLIGHT as i64)
    )]
    frames_in_flight: u8,

    /// Initial shadow map edge length in texels.
    #[arg(long, default_value = "1024")]
    rsm_size: u32,

    /// Image applied to the textured sphere.
    #[arg(long, default_value = "assets/flower.png")]
    texture: PathBuf,

    /// Exit after rendering N frames.
    #[arg(long)]
    max_frames: Option<u64>,
}

impl From<Args> for RendererConfig {
    fn from(args: Args) -> Self {
        Self {
            width: args.width,
            height: args.height,
            vsync: !args.no_vsync,
            frames_in_flight: args.frames_in_flight as usize,
            rsm_size: args.rsm_size,
            texture_path: args.texture,
            max_frames: args.max_frames,
            ..Default::default()
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RendererConfig::from(Args::parse());
    log::info!("{:?}", config);

    match sdf_renderer::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
