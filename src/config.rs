use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::constants::{cache, indirection};
use crate::error::{config_error, VtError, VtResult};

/// Block compression of one physical cache layer.
///
/// The codec itself runs outside this crate; only its block footprint matters
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCompression {
    Bc1Rgb,
    Bc5Rg,
}

/// One physical cache texture layer (albedo, normals, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTextureDescriptor {
    pub name: String,
    pub compression: CacheCompression,
}

/// Virtual texture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualTextureConfig {
    /// Indirection texture edge; also the atlas root size
    pub indirection_texture_size: u32,

    /// Physical cache is tile_count_wide x tile_count_wide pages
    pub tile_count_wide: u32,

    /// Page content size in texels, excluding the border
    pub tile_size: u32,

    /// Border texels on each side of a page (0, 4, 8 or 16)
    pub tile_border: u32,

    /// Hard cap on pages rendered per frame
    pub scratch_buffers_count: u32,

    /// Size of the virtual image table
    pub max_virtual_images: usize,

    /// Frames a mapped page stays protected from eviction after a touch
    pub min_eviction_age: u32,

    /// Feedback analysis shards (0 = derive from CPU count)
    pub feedback_workers: usize,

    /// Feedback target is the screen size shifted right by this amount
    pub feedback_downscale_shift: u32,

    /// Physical cache layers
    pub cache_textures: Vec<CacheTextureDescriptor>,
}

impl Default for VirtualTextureConfig {
    fn default() -> Self {
        Self {
            indirection_texture_size: 512,
            tile_count_wide: 16,
            tile_size: 256,
            tile_border: 8,
            scratch_buffers_count: 4,
            max_virtual_images: cache::MAX_VIRTUAL_IMAGES,
            min_eviction_age: cache::DEFAULT_MIN_EVICTION_AGE,
            feedback_workers: 0,
            feedback_downscale_shift: 3,
            cache_textures: vec![CacheTextureDescriptor {
                name: "_Albedo".to_string(),
                compression: CacheCompression::Bc1Rgb,
            }],
        }
    }
}

impl VirtualTextureConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> VtResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> VtResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| VtError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml_str(&source)?;
        log::info!("[VirtualTextureConfig::load] Loaded {:?}: {}x{} indirection, {}x{} cache pages",
                   path, config.indirection_texture_size, config.indirection_texture_size,
                   config.tile_count_wide, config.tile_count_wide);
        Ok(config)
    }

    pub fn validate(&self) -> VtResult<()> {
        let size = self.indirection_texture_size;
        if !size.is_power_of_two() || size < indirection::MIN_SIZE || size > indirection::MAX_SIZE {
            return Err(config_error(format!(
                "indirection_texture_size {} must be a power of two in {}..={}",
                size, indirection::MIN_SIZE, indirection::MAX_SIZE
            )));
        }

        if self.tile_count_wide == 0 || self.tile_count_wide > cache::MAX_TILE_COUNT_WIDE {
            return Err(config_error(format!(
                "tile_count_wide {} must be in 1..={}",
                self.tile_count_wide, cache::MAX_TILE_COUNT_WIDE
            )));
        }

        if !matches!(self.tile_border, 0 | 4 | 8 | 16) {
            return Err(config_error(format!("tile_border {} must be one of 0, 4, 8, 16", self.tile_border)));
        }

        if self.tile_size <= 2 * self.tile_border {
            return Err(config_error(format!(
                "tile_size {} leaves no content inside a {} texel border",
                self.tile_size, self.tile_border
            )));
        }

        if self.scratch_buffers_count == 0 {
            return Err(config_error("scratch_buffers_count must be at least 1"));
        }

        if self.max_virtual_images == 0 || self.max_virtual_images > cache::MAX_VIRTUAL_IMAGES {
            return Err(config_error(format!(
                "max_virtual_images {} must be in 1..={}",
                self.max_virtual_images, cache::MAX_VIRTUAL_IMAGES
            )));
        }

        if self.cache_textures.is_empty() {
            return Err(config_error("at least one cache texture layer is required"));
        }

        Ok(())
    }

    /// Page edge including border on both sides
    pub fn tile_size_with_border(&self) -> u32 {
        self.tile_size + 2 * self.tile_border
    }

    /// Physical cache texture edge in texels
    pub fn cache_texture_size(&self) -> u32 {
        self.tile_count_wide * self.tile_size_with_border()
    }

    pub fn indirection_mip_count(&self) -> u32 {
        self.indirection_texture_size.ilog2() + 1
    }

    pub fn page_count(&self) -> usize {
        (self.tile_count_wide * self.tile_count_wide) as usize
    }

    /// Number of feedback analysis shards actually used
    pub fn worker_count(&self) -> usize {
        if self.feedback_workers > 0 {
            self.feedback_workers
        } else {
            ((num_cpus::get() + 1) / 2).max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VirtualTextureConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tile_size_with_border(), 272);
        assert_eq!(config.cache_texture_size(), 16 * 272);
        assert_eq!(config.indirection_mip_count(), 10);
        assert_eq!(config.page_count(), 256);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = VirtualTextureConfig::from_toml_str(
            r#"
            indirection_texture_size = 1024
            tile_count_wide = 8

            [[cache_textures]]
            name = "_Normal"
            compression = "bc5_rg"
            "#,
        ).unwrap();

        assert_eq!(config.indirection_texture_size, 1024);
        assert_eq!(config.tile_count_wide, 8);
        assert_eq!(config.tile_size, 256);
        assert_eq!(config.cache_textures.len(), 1);
        assert_eq!(config.cache_textures[0].compression, CacheCompression::Bc5Rg);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_size = VirtualTextureConfig { indirection_texture_size: 300, ..Default::default() };
        assert!(matches!(bad_size.validate(), Err(VtError::InvalidConfig(_))));

        let bad_border = VirtualTextureConfig { tile_border: 5, ..Default::default() };
        assert!(bad_border.validate().is_err());

        let too_many_images = VirtualTextureConfig { max_virtual_images: 300, ..Default::default() };
        assert!(too_many_images.validate().is_err());

        let no_layers = VirtualTextureConfig { cache_textures: Vec::new(), ..Default::default() };
        assert!(no_layers.validate().is_err());
    }

    #[test]
    fn test_parse_error_is_typed() {
        let result = VirtualTextureConfig::from_toml_str("tile_size = \"big\"");
        assert!(matches!(result, Err(VtError::ConfigParse(_))));
    }

    #[test]
    fn test_explicit_worker_count() {
        let config = VirtualTextureConfig { feedback_workers: 3, ..Default::default() };
        assert_eq!(config.worker_count(), 3);
    }
}
