//! Unary elementwise operators.

use crate::error::{GpuError, GpuResult};
use crate::kernel::{DataType, Kernel, KernelPlan, OutputSpec, TensorDesc};
use crate::program::{ProgramDescriptor, UniformSpec, UniformType, UniformValue, UniformValues};

use super::{flat_index, shader_prelude, workgroups_for, WORKGROUP_SIZE};

fn unary_source(dtype: DataType, expr: &str) -> String {
    let ty = dtype.wgsl();
    let prelude = shader_prelude(dtype);
    let idx = flat_index();
    format!(
        "{prelude}@group(0) @binding(0) var<storage, read> input: array<{ty}>;
@group(0) @binding(1) var<storage, read_write> output: array<{ty}>;

struct Params {{
    len: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}}

@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size({WORKGROUP_SIZE})
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {{
    let idx = {idx};
    if (idx >= params.len) {{
        return;
    }}
    let x = input[idx];
    output[idx] = {expr};
}}
"
    )
}

fn unary_plan(
    name: &'static str,
    inputs: &[TensorDesc],
    allowed: impl Fn(DataType) -> bool,
    expr: impl Fn(DataType) -> String,
) -> GpuResult<KernelPlan> {
    let [input] = inputs else {
        return Err(GpuError::InvalidInput(format!(
            "{name} expects exactly 1 input, got {}",
            inputs.len()
        )));
    };
    if !allowed(input.dtype) {
        return Err(GpuError::InvalidInput(format!(
            "{name} does not support {:?} inputs",
            input.dtype
        )));
    }
    let n = input.element_count();
    if n > u32::MAX as usize {
        return Err(GpuError::InvalidInput(format!(
            "{name}: tensor of {n} elements exceeds the 32-bit dispatch range"
        )));
    }

    let dtype = input.dtype;
    let shape_hint = dtype.wgsl().to_string();
    let label = format!("{name}[{shape_hint}]");
    let expr = expr(dtype);
    Ok(KernelPlan {
        shape_hint,
        one_dim: true,
        shader: Box::new(move || ProgramDescriptor {
            label,
            wgsl: unary_source(dtype, &expr),
            entry_point: "main",
            inputs: 1,
            outputs: 1,
            uniforms: vec![UniformSpec { ty: UniformType::U32, len: 1 }],
        }),
        workgroups: workgroups_for(n),
        uniforms: UniformValues(vec![UniformValue::U32(vec![n as u32])]),
        outputs: vec![OutputSpec {
            dtype,
            shape: input.shape.clone(),
            alias_of: None,
        }],
    })
}

/// Elementwise identity.
pub struct Copy;

impl Kernel for Copy {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn plan(&self, inputs: &[TensorDesc]) -> GpuResult<KernelPlan> {
        unary_plan("copy", inputs, |_| true, |_| "x".to_string())
    }
}

/// Elementwise negation for signed types.
pub struct Neg;

impl Kernel for Neg {
    fn name(&self) -> &'static str {
        "neg"
    }

    fn plan(&self, inputs: &[TensorDesc]) -> GpuResult<KernelPlan> {
        unary_plan(
            "neg",
            inputs,
            |d| matches!(d, DataType::F32 | DataType::F16 | DataType::I32),
            |_| "-x".to_string(),
        )
    }
}

/// Elementwise `max(x, 0)` for float types.
pub struct Relu;

impl Kernel for Relu {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn plan(&self, inputs: &[TensorDesc]) -> GpuResult<KernelPlan> {
        unary_plan(
            "relu",
            inputs,
            DataType::is_float,
            |d| {
                let zero = if d == DataType::F16 { "0.0h" } else { "0.0" };
                format!("max(x, {zero})")
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferHandle;

    fn desc(dtype: DataType, shape: &[usize]) -> TensorDesc {
        TensorDesc {
            dtype,
            shape: shape.to_vec(),
            // Handles are opaque to kernels; any value works for planning.
            buffer: fake_handle(),
        }
    }

    fn fake_handle() -> BufferHandle {
        // Planning never dereferences the handle, so a transmuted id is not
        // needed; grab one from a throwaway pool instead.
        use crate::backing::{DeviceBacking, UsageClass};
        use crate::pool::BufferPool;
        use crate::program::ProgramDescriptor;

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
        let mut pool = BufferPool::<Null>::new(1);
        pool.alloc(&Null, 4, UsageClass::Storage).unwrap()
    }

    #[test]
    fn test_copy_plan_shapes_and_uniforms() {
        let plan = Copy.plan(&[desc(DataType::F32, &[4, 8])]).unwrap();
        assert_eq!(plan.workgroups, [1, 1, 1]);
        assert_eq!(plan.outputs.len(), 1);
        assert_eq!(plan.outputs[0].shape, vec![4, 8]);
        assert!(plan.one_dim);
        let specs = plan.uniforms.specs();
        assert_eq!(specs, vec![UniformSpec { ty: UniformType::U32, len: 1 }]);

        let program = (plan.shader)();
        assert!(program.wgsl.contains("output[idx] = x;"));
        assert!(!program.wgsl.contains("enable f16"));
    }

    #[test]
    fn test_relu_rejects_integer_input() {
        let err = Relu.plan(&[desc(DataType::U32, &[4])]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidInput(_)));
    }

    #[test]
    fn test_neg_rejects_unsigned_input() {
        let err = Neg.plan(&[desc(DataType::U32, &[4])]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidInput(_)));
    }

    #[test]
    fn test_f16_shader_enables_extension() {
        let plan = Relu.plan(&[desc(DataType::F16, &[16])]).unwrap();
        let program = (plan.shader)();
        assert!(program.wgsl.starts_with("enable f16;"));
        assert!(program.wgsl.contains("max(x, 0.0h)"));
    }

    #[test]
    fn test_wrong_arity_fails() {
        let err = Copy.plan(&[]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidInput(_)));
    }

    #[test]
    fn test_large_tensor_spans_workgroups() {
        let plan = Copy.plan(&[desc(DataType::F32, &[1000])]).unwrap();
        assert_eq!(plan.workgroups, [4, 1, 1]);
    }
}
