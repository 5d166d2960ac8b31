//! GPU device and queue acquisition via wgpu, plus the wgpu implementation
//! of the device seam used by the pool and program cache.

use crate::backing::{DeviceBacking, UsageClass};
use crate::error::{GpuError, GpuResult};
use crate::program::ProgramDescriptor;

/// Owns the wgpu device/queue and the limits dispatch normalization needs.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    max_workgroups_per_dim: u32,
}

impl GpuContext {
    /// Acquire a high-performance adapter and device. Requests `SHADER_F16`
    /// when the adapter offers it so f16 tensors can run where supported.
    pub async fn new() -> GpuResult<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| GpuError::NoAdapter)?;

        let mut features = wgpu::Features::empty();
        if adapter.features().contains(wgpu::Features::SHADER_F16) {
            features |= wgpu::Features::SHADER_F16;
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("gpurt"),
                required_features: features,
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| GpuError::Device(e.to_string()))?;

        let max_workgroups_per_dim = device.limits().max_compute_workgroups_per_dimension;

        Ok(Self {
            device,
            queue,
            max_workgroups_per_dim,
        })
    }

    /// Acquire a device synchronously (blocks on async).
    pub fn new_sync() -> GpuResult<Self> {
        pollster::block_on(Self::new())
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn max_workgroups_per_dim(&self) -> u32 {
        self.max_workgroups_per_dim
    }

    pub fn supports_f16(&self) -> bool {
        self.device.features().contains(wgpu::Features::SHADER_F16)
    }
}

fn usages_for(class: UsageClass) -> wgpu::BufferUsages {
    match class {
        UsageClass::Storage => {
            wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST
        }
        UsageClass::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        UsageClass::Upload => wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
    }
}

fn label_for(class: UsageClass) -> &'static str {
    match class {
        UsageClass::Storage => "gpurt storage",
        UsageClass::Uniform => "gpurt uniform",
        UsageClass::Upload => "gpurt upload staging",
    }
}

/// A compiled pipeline and its bind group layout.
pub struct WgpuProgram {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl DeviceBacking for GpuContext {
    type Buffer = wgpu::Buffer;
    type Pipeline = WgpuProgram;

    fn create_buffer(&self, size: u64, class: UsageClass) -> GpuResult<wgpu::Buffer> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label_for(class)),
            size,
            usage: usages_for(class),
            mapped_at_creation: false,
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(GpuError::OutOfMemory { requested: size });
        }
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: wgpu::Buffer) {
        buffer.destroy();
    }

    fn compile(&self, desc: &ProgramDescriptor) -> GpuResult<WgpuProgram> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(desc.label.as_str()),
            source: wgpu::ShaderSource::Wgsl(desc.wgsl.as_str().into()),
        });

        let mut entries = Vec::with_capacity(desc.inputs + desc.outputs + 1);
        for i in 0..desc.inputs {
            entries.push(storage_entry(i as u32, true));
        }
        for i in 0..desc.outputs {
            entries.push(storage_entry((desc.inputs + i) as u32, false));
        }
        if !desc.uniforms.is_empty() {
            entries.push(uniform_entry((desc.inputs + desc.outputs) as u32));
        }

        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(desc.label.as_str()),
                    entries: &entries,
                });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label.as_str()),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(desc.label.as_str()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(desc.entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::Device(format!(
                "pipeline compilation failed for `{}`: {err}",
                desc.label
            )));
        }

        Ok(WgpuProgram {
            pipeline,
            bind_group_layout,
        })
    }
}
