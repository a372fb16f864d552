//! WGSL sources and their compilation to SPIR-V.
//!
//! Each program is the shared prelude, the scene SDF and the full-screen
//! vertex stage, followed by the program's own fragment stage.

use thiserror::Error;

use crate::backend::ShaderModuleSource;

pub const COMMON_WGSL: &str = include_str!("../shaders/common.wgsl");
pub const SDF_SCENE_WGSL: &str = include_str!("../shaders/sdf_scene.wgsl");
pub const FULLSCREEN_WGSL: &str = include_str!("../shaders/fullscreen.wgsl");
pub const RSM_WGSL: &str = include_str!("../shaders/rsm.wgsl");
pub const MAIN_WGSL: &str = include_str!("../shaders/main.wgsl");

pub const VERTEX_ENTRY: &str = "vs_main";
pub const MAIN_FRAGMENT_ENTRY: &str = "fs_main";
pub const RSM_FRAGMENT_ENTRY: &str = "fs_rsm";

#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("{label}: WGSL parse error: {message}")]
    Parse { label: String, message: String },
    #[error("{label}: validation error: {message}")]
    Validation { label: String, message: String },
    #[error("{label}: entry point '{entry_point}' not found for stage {stage:?}")]
    EntryPointNotFound {
        label: String,
        entry_point: String,
        stage: ShaderStage,
    },
    #[error("{label}: SPIR-V generation error: {message}")]
    SpirV { label: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

/// Concatenate the shared sources with a program's fragment stage.
pub fn compose(fragment_source: &str) -> String {
    [COMMON_WGSL, SDF_SCENE_WGSL, FULLSCREEN_WGSL, fragment_source].join("\n")
}

/// Compile one entry point of a WGSL module to SPIR-V.
pub fn compile_wgsl(
    label: &str,
    source: &str,
    stage: ShaderStage,
    entry_point: &str,
) -> Result<ShaderModuleSource, ShaderError> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| ShaderError::Parse {
        label: label.to_string(),
        message: e.emit_to_string(source),
    })?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator.validate(&module).map_err(|e| ShaderError::Validation {
        label: label.to_string(),
        message: e.emit_to_string(source),
    })?;

    let naga_stage = stage.to_naga();
    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == naga_stage)
    {
        return Err(ShaderError::EntryPointNotFound {
            label: label.to_string(),
            entry_point: entry_point.to_string(),
            stage,
        });
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 0),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };

    let spirv = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| ShaderError::SpirV {
            label: label.to_string(),
            message: e.to_string(),
        })?;

    log::debug!("Compiled {} ({:?} '{}'): {} words", label, stage, entry_point, spirv.len());

    Ok(ShaderModuleSource {
        spirv,
        entry_point: entry_point.to_string(),
    })
}

/// Vertex and fragment modules of one pipeline.
#[derive(Debug, Clone)]
pub struct ShaderProgram {
    pub vertex: ShaderModuleSource,
    pub fragment: ShaderModuleSource,
}

impl ShaderProgram {
    fn compile(label: &str, fragment_source: &str, fragment_entry: &str) -> Result<Self, ShaderError> {
        let source = compose(fragment_source);
        Ok(Self {
            vertex: compile_wgsl(label, &source, ShaderStage::Vertex, VERTEX_ENTRY)?,
            fragment: compile_wgsl(label, &source, ShaderStage::Fragment, fragment_entry)?,
        })
    }
}

/// Both programs the renderer draws with.
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub main: ShaderProgram,
    pub rsm: ShaderProgram,
}

impl ShaderSet {
    pub fn compile() -> Result<Self, ShaderError> {
        Ok(Self {
            main: ShaderProgram::compile("main", MAIN_WGSL, MAIN_FRAGMENT_ENTRY)?,
            rsm: ShaderProgram::compile("rsm", RSM_WGSL, RSM_FRAGMENT_ENTRY)?,
        })
    }
}
