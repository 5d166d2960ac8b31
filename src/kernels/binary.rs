//! Binary elementwise operators with broadcasting.
//!
//! Output shape and per-input broadcast strides are embedded in the generated
//! WGSL as constants, so each distinct shape pair compiles its own pipeline.
//! The shape hint carries both input shapes to keep those pipelines apart in
//! the program cache.

use crate::error::{GpuError, GpuResult};
use crate::kernel::{Kernel, KernelPlan, OutputSpec, TensorDesc};
use crate::program::{ProgramDescriptor, UniformSpec, UniformType, UniformValue, UniformValues};
use crate::shape::{broadcast_shapes, broadcast_strides, element_count};

use super::{flat_index, fmt_shape, shader_prelude, workgroups_for, WORKGROUP_SIZE};

fn binary_source(
    ty: &str,
    prelude: &str,
    op: &str,
    out_shape: &[usize],
    strides_a: &[usize],
    strides_b: &[usize],
) -> String {
    // Suffix products of the output shape decompose the flat index into
    // coordinates, outermost dimension first.
    let rank = out_shape.len();
    let mut index_math = String::new();
    if rank > 0 {
        index_math.push_str("    var rem = idx;\n");
        let mut suffix = vec![1usize; rank];
        for i in (0..rank.saturating_sub(1)).rev() {
            suffix[i] = suffix[i + 1] * out_shape[i + 1];
        }
        for i in 0..rank {
            let prod = suffix[i];
            if prod == 1 {
                index_math.push_str(&format!("    let c{i} = rem;\n"));
            } else {
                index_math.push_str(&format!("    let c{i} = rem / {prod}u;\n"));
                index_math.push_str(&format!("    rem = rem - c{i} * {prod}u;\n"));
            }
            index_math.push_str(&format!(
                "    off_a = off_a + c{i} * {}u;\n    off_b = off_b + c{i} * {}u;\n",
                strides_a[i], strides_b[i]
            ));
        }
    }
    let idx = flat_index();
    format!(
        "{prelude}@group(0) @binding(0) var<storage, read> a: array<{ty}>;
@group(0) @binding(1) var<storage, read> b: array<{ty}>;
@group(0) @binding(2) var<storage, read_write> output: array<{ty}>;

struct Params {{
    len: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}}

@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size({WORKGROUP_SIZE})
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {{
    let idx = {idx};
    if (idx >= params.len) {{
        return;
    }}
    var off_a = 0u;
    var off_b = 0u;
{index_math}    output[idx] = a[off_a] {op} b[off_b];
}}
"
    )
}

fn binary_plan(name: &'static str, op: &'static str, inputs: &[TensorDesc]) -> GpuResult<KernelPlan> {
    let [a, b] = inputs else {
        return Err(GpuError::InvalidInput(format!(
            "{name} expects exactly 2 inputs, got {}",
            inputs.len()
        )));
    };
    if a.dtype != b.dtype {
        return Err(GpuError::InvalidInput(format!(
            "{name}: mismatched input dtypes {:?} and {:?}",
            a.dtype, b.dtype
        )));
    }

    let out_shape = broadcast_shapes(&a.shape, &b.shape)?;
    let n = element_count(&out_shape);
    if n > u32::MAX as usize {
        return Err(GpuError::InvalidInput(format!(
            "{name}: tensor of {n} elements exceeds the 32-bit dispatch range"
        )));
    }
    let strides_a = broadcast_strides(&a.shape, &out_shape);
    let strides_b = broadcast_strides(&b.shape, &out_shape);

    let dtype = a.dtype;
    let shape_hint = format!("{}:{}|{}", dtype.wgsl(), fmt_shape(&a.shape), fmt_shape(&b.shape));
    let label = format!("{name}[{shape_hint}]");
    let shader_shape = out_shape.clone();
    Ok(KernelPlan {
        shape_hint,
        one_dim: true,
        shader: Box::new(move || ProgramDescriptor {
            label,
            wgsl: binary_source(
                dtype.wgsl(),
                shader_prelude(dtype),
                op,
                &shader_shape,
                &strides_a,
                &strides_b,
            ),
            entry_point: "main",
            inputs: 2,
            outputs: 1,
            uniforms: vec![UniformSpec { ty: UniformType::U32, len: 1 }],
        }),
        workgroups: workgroups_for(n),
        uniforms: UniformValues(vec![UniformValue::U32(vec![n as u32])]),
        outputs: vec![OutputSpec {
            dtype,
            shape: out_shape,
            alias_of: None,
        }],
    })
}

/// Elementwise addition with broadcasting.
pub struct Add;

impl Kernel for Add {
    fn name(&self) -> &'static str {
        "add"
    }

    fn plan(&self, inputs: &[TensorDesc]) -> GpuResult<KernelPlan> {
        binary_plan("add", "+", inputs)
    }
}

/// Elementwise multiplication with broadcasting.
pub struct Mul;

impl Kernel for Mul {
    fn name(&self) -> &'static str {
        "mul"
    }

    fn plan(&self, inputs: &[TensorDesc]) -> GpuResult<KernelPlan> {
        binary_plan("mul", "*", inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{DeviceBacking, UsageClass};
    use crate::kernel::DataType;
    use crate::pool::BufferPool;

    struct Null;
    impl DeviceBacking for Null {
        type Buffer = ();
        type Pipeline = ();
        fn create_buffer(&self, _s: u64, _c: UsageClass) -> GpuResult<()> {
            Ok(())
        }
        fn destroy_buffer(&self, _b: ()) {}
        fn compile(&self, _d: &ProgramDescriptor) -> GpuResult<()> {
            Ok(())
        }
    }

    fn desc(dtype: DataType, shape: &[usize]) -> TensorDesc {
        let mut pool = BufferPool::<Null>::new(1);
        TensorDesc {
            dtype,
            shape: shape.to_vec(),
            buffer: pool.alloc(&Null, 4, UsageClass::Storage).unwrap(),
        }
    }

    #[test]
    fn test_add_broadcast_output_shape() {
        let plan = Add
            .plan(&[desc(DataType::F32, &[3, 1]), desc(DataType::F32, &[3, 4])])
            .unwrap();
        assert_eq!(plan.outputs[0].shape, vec![3, 4]);
        assert_eq!(plan.shape_hint, "f32:3x1|3x4");
        assert_eq!(plan.uniforms.specs(), vec![UniformSpec { ty: UniformType::U32, len: 1 }]);
    }

    #[test]
    fn test_add_shader_embeds_strides() {
        let plan = Add
            .plan(&[desc(DataType::F32, &[3, 1]), desc(DataType::F32, &[3, 4])])
            .unwrap();
        let program = (plan.shader)();
        // [3,1] against [3,4]: row stride 1, broadcast column stride 0.
        assert!(program.wgsl.contains("off_a = off_a + c0 * 1u;"));
        assert!(program.wgsl.contains("off_a = off_a + c1 * 0u;"));
        assert!(program.wgsl.contains("a[off_a] + b[off_b]"));
    }

    #[test]
    fn test_mul_scalar_broadcast() {
        let plan = Mul
            .plan(&[desc(DataType::F32, &[2, 2]), desc(DataType::F32, &[])])
            .unwrap();
        assert_eq!(plan.outputs[0].shape, vec![2, 2]);
        let program = (plan.shader)();
        assert!(program.wgsl.contains("off_b = off_b + c0 * 0u;"));
        assert!(program.wgsl.contains("a[off_a] * b[off_b]"));
    }

    #[test]
    fn test_incompatible_shapes_fail_before_planning_outputs() {
        let err = Add
            .plan(&[desc(DataType::F32, &[2, 3]), desc(DataType::F32, &[2, 4])])
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidInput(_)));
    }

    #[test]
    fn test_mixed_dtypes_fail() {
        let err = Add
            .plan(&[desc(DataType::F32, &[4]), desc(DataType::U32, &[4])])
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidInput(_)));
    }
}
