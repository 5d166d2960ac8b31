//! Built-in operators and their WGSL generators.
//!
//! Generated shaders embed output shapes and broadcast strides as constants;
//! runtime values (the element bound) arrive through the uniform block. Every
//! shader uses the generalized flat index so a dispatch re-factored across
//! two or three grid dimensions still covers the same elements.

pub mod binary;
pub mod elementwise;

use crate::kernel::DataType;

/// Threads per workgroup in every generated shader.
pub(crate) const WORKGROUP_SIZE: u32 = 256;

pub(crate) fn workgroups_for(n: usize) -> [u32; 3] {
    [(n as u32).div_ceil(WORKGROUP_SIZE), 1, 1]
}

pub(crate) fn shader_prelude(dtype: DataType) -> &'static str {
    if dtype == DataType::F16 {
        "enable f16;\n\n"
    } else {
        ""
    }
}

/// Flat global index covering 1-D, 2-D, and 3-D dispatch grids alike.
pub(crate) fn flat_index() -> String {
    format!("gid.x + (nwg.x * {WORKGROUP_SIZE}u) * (gid.y + nwg.y * gid.z)")
}

pub(crate) fn fmt_shape(shape: &[usize]) -> String {
    if shape.is_empty() {
        "scalar".to_string()
    } else {
        shape
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("x")
    }
}
