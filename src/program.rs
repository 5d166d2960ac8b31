//! Compute program cache: compile once per (kernel, shape hint, 1-D flag)
//! key, retain the pipeline plus its expected uniform layout for the lifetime
//! of the context.
//!
//! The cached uniform layout is checked against the values actually supplied
//! at dispatch time. A mismatch means a kernel's shader generation and its
//! uniform-data generation have drifted apart, which is unrecoverable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::backing::DeviceBacking;
use crate::error::{GpuError, GpuResult};

/// Scalar type of one uniform entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformType {
    U32,
    I32,
    F32,
}

impl fmt::Display for UniformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U32 => write!(f, "u32"),
            Self::I32 => write!(f, "i32"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// Expected shape of one uniform entry: scalar type and element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformSpec {
    pub ty: UniformType,
    pub len: usize,
}

impl fmt::Display for UniformSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.ty, self.len)
    }
}

/// One uniform value as supplied by a kernel at dispatch time.
#[derive(Debug, Clone)]
pub enum UniformValue {
    U32(Vec<u32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
}

impl UniformValue {
    pub fn spec(&self) -> UniformSpec {
        match self {
            Self::U32(v) => UniformSpec { ty: UniformType::U32, len: v.len() },
            Self::I32(v) => UniformSpec { ty: UniformType::I32, len: v.len() },
            Self::F32(v) => UniformSpec { ty: UniformType::F32, len: v.len() },
        }
    }
}

/// Ordered uniform values for one dispatch.
#[derive(Debug, Clone, Default)]
pub struct UniformValues(pub Vec<UniformValue>);

impl UniformValues {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn specs(&self) -> Vec<UniformSpec> {
        self.0.iter().map(UniformValue::spec).collect()
    }

    /// Pack entries as consecutive 4-byte words, padded to a 16-byte multiple.
    /// Generated shaders declare their parameter structs with matching
    /// explicit padding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for value in &self.0 {
            match value {
                UniformValue::U32(v) => bytes.extend_from_slice(bytemuck::cast_slice(v)),
                UniformValue::I32(v) => bytes.extend_from_slice(bytemuck::cast_slice(v)),
                UniformValue::F32(v) => bytes.extend_from_slice(bytemuck::cast_slice(v)),
            }
        }
        while bytes.len() % 16 != 0 {
            bytes.push(0);
        }
        bytes
    }
}

/// Everything needed to compile one compute pipeline.
///
/// Bindings are laid out as: `inputs` read-only storage buffers, then
/// `outputs` read-write storage buffers, then one uniform block when
/// `uniforms` is non-empty.
pub struct ProgramDescriptor {
    pub label: String,
    pub wgsl: String,
    pub entry_point: &'static str,
    pub inputs: usize,
    pub outputs: usize,
    pub uniforms: Vec<UniformSpec>,
}

/// A compiled pipeline plus the uniform layout it expects.
pub struct ProgramArtifact<P> {
    pub key: String,
    pub pipeline: P,
    pub inputs: usize,
    pub outputs: usize,
    pub uniforms: Vec<UniformSpec>,
}

impl<P> ProgramArtifact<P> {
    /// Verify supplied uniform values against the expected layout.
    /// Runs before any device call is made for the dispatch.
    pub fn check_uniforms(&self, actual: &UniformValues) -> GpuResult<()> {
        if actual.0.len() != self.uniforms.len() {
            return Err(GpuError::UniformLayoutMismatch {
                program: self.key.clone(),
                reason: format!(
                    "expected {} uniform entries, got {}",
                    self.uniforms.len(),
                    actual.0.len()
                ),
            });
        }
        for (i, (expected, value)) in self.uniforms.iter().zip(&actual.0).enumerate() {
            let got = value.spec();
            if got != *expected {
                return Err(GpuError::UniformLayoutMismatch {
                    program: self.key.clone(),
                    reason: format!("entry {i}: expected {expected}, got {got}"),
                });
            }
        }
        Ok(())
    }
}

/// Build the cache key for a program.
pub fn program_key(name: &str, shape_hint: &str, one_dim: bool) -> String {
    if one_dim {
        format!("{name}[{shape_hint}]:d1")
    } else {
        format!("{name}[{shape_hint}]")
    }
}

/// Process-lifetime cache of compiled programs. Entries are never evicted;
/// the key space is bounded by the set of (operator, shape) pairs a model
/// actually uses.
pub struct ProgramCache<D: DeviceBacking> {
    programs: HashMap<String, Arc<ProgramArtifact<D::Pipeline>>>,
}

impl<D: DeviceBacking> ProgramCache<D> {
    pub fn new() -> Self {
        Self {
            programs: HashMap::new(),
        }
    }

    /// Fetch the program for `key`, invoking `build` and compiling through
    /// the backing exactly once per distinct key.
    pub fn get_or_build<F>(
        &mut self,
        backing: &D,
        key: &str,
        build: F,
    ) -> GpuResult<Arc<ProgramArtifact<D::Pipeline>>>
    where
        F: FnOnce() -> ProgramDescriptor,
    {
        if let Some(artifact) = self.programs.get(key) {
            return Ok(Arc::clone(artifact));
        }
        let desc = build();
        log::debug!("program cache miss, compiling `{key}`");
        let pipeline = backing.compile(&desc)?;
        let artifact = Arc::new(ProgramArtifact {
            key: key.to_string(),
            pipeline,
            inputs: desc.inputs,
            outputs: desc.outputs,
            uniforms: desc.uniforms,
        });
        self.programs.insert(key.to_string(), Arc::clone(&artifact));
        Ok(artifact)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

impl<D: DeviceBacking> Default for ProgramCache<D> {
    fn default() -> Self {
        Self::new()
    }
}
