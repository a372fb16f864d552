//! Material texture loading.

use std::path::Path;

use image::{DynamicImage, GenericImageView};

use crate::backend::{
    BackendResult, Extent2d, GpuBackend, ImageDescriptor, ImageHandle, ImageUsage, TextureFormat,
};

const CHECKER_SIZE: u32 = 256;
const CHECKER_CELL: u32 = 32;

/// Decoded RGBA8 pixels ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("texture")
            .to_string();

        let img = image::open(path).map_err(|e| e.to_string())?;
        Ok(Self::from_image(img, &name))
    }

    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, String> {
        let img = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
        Ok(Self::from_image(img, name))
    }

    fn from_image(img: DynamicImage, name: &str) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            data: img.to_rgba8().into_raw(),
            name: name.to_string(),
        }
    }

    pub fn checkerboard(size: u32, cell: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let cell = cell.max(1);
        let mut data = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let even = ((x / cell) + (y / cell)) % 2 == 0;
                data.extend_from_slice(if even { &color1 } else { &color2 });
            }
        }

        Self {
            width: size,
            height: size,
            format: TextureFormat::Rgba8UnormSrgb,
            data,
            name: "checkerboard".to_string(),
        }
    }

    /// Load the material texture, substituting a checkerboard if it can't be read.
    pub fn load_or_fallback<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::from_file(path) {
            Ok(texture) => {
                log::info!(
                    "Loaded material texture {} ({}x{})",
                    path.display(),
                    texture.width,
                    texture.height
                );
                texture
            }
            Err(e) => {
                log::warn!(
                    "Failed to load material texture {}: {}. Using a checkerboard instead",
                    path.display(),
                    e
                );
                Self::checkerboard(
                    CHECKER_SIZE,
                    CHECKER_CELL,
                    [235, 200, 90, 255],
                    [60, 45, 110, 255],
                )
            }
        }
    }

    pub fn extent(&self) -> Extent2d {
        Extent2d::new(self.width, self.height)
    }

    /// Create a sampled image and upload the pixels into it.
    pub fn upload<B: GpuBackend>(&self, backend: &mut B) -> BackendResult<ImageHandle> {
        let image = backend.create_image(&ImageDescriptor {
            label: Some(self.name.clone()),
            extent: self.extent(),
            format: self.format,
            usage: ImageUsage::SAMPLED | ImageUsage::COPY_DST,
        })?;
        if let Err(e) = backend.upload_image(image, &self.data) {
            backend.destroy_image(image);
            return Err(e);
        }
        Ok(image)
    }
}
