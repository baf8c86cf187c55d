// Adaptive Virtual Texture Constants - SINGLE SOURCE OF TRUTH
//
// Bit layouts shared between the CPU paging engine and the shaders that write
// feedback and sample the indirection texture. build.rs mirrors these values
// into the generated WGSL include; keep both in sync.

/// Feedback buffer sample layout (one i32 per feedback texel)
pub mod feedback {
    /// Bits [0..11]: absolute indirection-texture x
    pub const COORD_BITS: u32 = 12;
    pub const COORD_MASK: i32 = 0xFFF;
    pub const X_SHIFT: u32 = 0;
    pub const Y_SHIFT: u32 = 12;

    /// Bits [24..27]: requested mip + 1 (0 = not written)
    pub const MIP_SHIFT: u32 = 24;
    pub const MIP_MASK: i32 = 0xF;
    pub const MIP_BIAS: i32 = 1;

    /// Bit 31: written flag. Negative samples were written this frame.
    pub const WRITTEN_FLAG: u32 = 1 << 31;

    /// Mask applied to the frame number handed to the feedback shader
    pub const FRAME_DITHER_MASK: u32 = 63;
}

/// Page hash layout: x | y << 12 | mip << 24
pub mod page {
    pub const HASH_COORD_MASK: u32 = 0xFFF;
    pub const HASH_MIP_MASK: u32 = 0xF;
    pub const HASH_Y_SHIFT: u32 = 12;
    pub const HASH_MIP_SHIFT: u32 = 24;

    /// Priority key layout: (frame << 4) | mip
    pub const KEY_MIP_BITS: u32 = 4;
    pub const KEY_MIP_MASK: u32 = 0xF;

    /// Largest value of the 28-bit request count priority
    pub const COUNT_PRIORITY_MAX: u32 = 0xFFF_FFFF;
}

/// Indirection texture content flags
pub mod indirection {
    pub const USED_FLAG: u8 = 0b01;
    pub const RENDER_FLAG: u8 = 0b10;

    pub const MIN_SIZE: u32 = 256;
    pub const MAX_SIZE: u32 = 4096;

    /// Threads per group of the update write pass
    pub const WRITE_GROUP_SIZE: u32 = 64;
    /// Threads per axis of the missing-texel fill pass
    pub const FILL_GROUP_SIZE: u32 = 8;
}

/// Page cache and registry limits
pub mod cache {
    /// Owner ids travel as a byte in requests and remaps
    pub const MAX_VIRTUAL_IMAGES: usize = 256;
    /// Slot offsets travel as bytes in indirection texels
    pub const MAX_TILE_COUNT_WIDE: u32 = 256;
    /// Frames a mapped page must stay untouched before it may be evicted
    pub const DEFAULT_MIN_EVICTION_AGE: u32 = 3;
    /// Delta mip large enough to push every page out of range
    pub const UNMAP_ALL_DELTA_MIP: i32 = 20;
    /// First frame number handed out; key 0 is reserved for free slots
    pub const FIRST_FRAME: u32 = 1;
    /// Compressed block edge in texels (BC1/BC5)
    pub const BLOCK_SIZE: u32 = 4;
}

/// Generated shader include
pub mod shader {
    pub const VT_CONSTANTS_WGSL: &str = include_str!(concat!(env!("OUT_DIR"), "/vt_constants.wgsl"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_wgsl_matches_layout() {
        let wgsl = shader::VT_CONSTANTS_WGSL;
        assert!(wgsl.contains(&format!("AVT_FEEDBACK_MIP_SHIFT: u32 = {}u;", feedback::MIP_SHIFT)));
        assert!(wgsl.contains(&format!("AVT_FEEDBACK_Y_SHIFT: u32 = {}u;", feedback::Y_SHIFT)));
        assert!(wgsl.contains(&format!("AVT_RENDER_FLAG: u32 = {}u;", indirection::RENDER_FLAG)));
    }

    #[test]
    fn test_hash_fits_below_written_flag() {
        let top = (page::HASH_MIP_MASK << page::HASH_MIP_SHIFT) | page::HASH_COORD_MASK;
        assert!(top < feedback::WRITTEN_FLAG);
    }
}
