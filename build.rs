//! Build script for generating the WGSL include shared by the feedback and
//! indirection shaders

use std::{env, fs, path::Path};

// Mirrors src/constants.rs
const FEEDBACK_X_SHIFT: u32 = 0;
const FEEDBACK_Y_SHIFT: u32 = 12;
const FEEDBACK_MIP_SHIFT: u32 = 24;
const FEEDBACK_COORD_MASK: u32 = 0xFFF;
const FEEDBACK_MIP_MASK: u32 = 0xF;
const FEEDBACK_WRITTEN_FLAG: u32 = 1 << 31;
const FRAME_DITHER_MASK: u32 = 63;
const USED_FLAG: u32 = 0b01;
const RENDER_FLAG: u32 = 0b10;
const WRITE_GROUP_SIZE: u32 = 64;
const FILL_GROUP_SIZE: u32 = 8;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR is set by cargo");
    let constants_path = Path::new(&out_dir).join("vt_constants.wgsl");

    fs::write(&constants_path, generate_wgsl_constants())
        .expect("Failed to write generated virtual texture WGSL constants");
}

/// Generate WGSL constants
fn generate_wgsl_constants() -> String {
    format!(
        r#"// AUTO-GENERATED VIRTUAL TEXTURE CONSTANTS - DO NOT EDIT
// Generated from src/constants.rs by build.rs

// Feedback sample layout
const AVT_FEEDBACK_X_SHIFT: u32 = {}u;
const AVT_FEEDBACK_Y_SHIFT: u32 = {}u;
const AVT_FEEDBACK_MIP_SHIFT: u32 = {}u;
const AVT_FEEDBACK_COORD_MASK: u32 = {}u;
const AVT_FEEDBACK_MIP_MASK: u32 = {}u;
const AVT_FEEDBACK_WRITTEN_FLAG: u32 = {}u;
const AVT_FRAME_DITHER_MASK: u32 = {}u;

// Indirection texel flags
const AVT_USED_FLAG: u32 = {}u;
const AVT_RENDER_FLAG: u32 = {}u;

// Dispatch sizes
const AVT_WRITE_GROUP_SIZE: u32 = {}u;
const AVT_FILL_GROUP_SIZE: u32 = {}u;

fn avt_encode_feedback(x: u32, y: u32, mip: u32) -> u32 {{
    return AVT_FEEDBACK_WRITTEN_FLAG
        | ((x & AVT_FEEDBACK_COORD_MASK) << AVT_FEEDBACK_X_SHIFT)
        | ((y & AVT_FEEDBACK_COORD_MASK) << AVT_FEEDBACK_Y_SHIFT)
        | (((mip + 1u) & AVT_FEEDBACK_MIP_MASK) << AVT_FEEDBACK_MIP_SHIFT);
}}
"#,
        FEEDBACK_X_SHIFT,
        FEEDBACK_Y_SHIFT,
        FEEDBACK_MIP_SHIFT,
        FEEDBACK_COORD_MASK,
        FEEDBACK_MIP_MASK,
        FEEDBACK_WRITTEN_FLAG,
        FRAME_DITHER_MASK,
        USED_FLAG,
        RENDER_FLAG,
        WRITE_GROUP_SIZE,
        FILL_GROUP_SIZE,
    )
}
