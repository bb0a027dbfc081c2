//! Headless GPU context using wgpu

use crate::core::error::Error;

/// GPU device without a surface, enough to own and fill storage buffers.
pub struct HeadlessContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl HeadlessContext {
    /// Create a context on the highest-performance adapter available
    pub async fn new() -> Result<Self, Error> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::Gpu(format!("No suitable adapter found: {:?}", e)))?;

        let adapter_limits = adapter.limits();

        let device_desc = wgpu::DeviceDescriptor {
            label: Some("sdotree_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits {
                max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
                max_buffer_size: adapter_limits.max_buffer_size,
                ..Default::default()
            },
            memory_hints: wgpu::MemoryHints::Performance,
            experimental_features: Default::default(),
            trace: Default::default(),
        };

        let (device, queue) = adapter
            .request_device(&device_desc)
            .await
            .map_err(|e| Error::Gpu(e.to_string()))?;

        log::info!(
            "GPU adapter {:?}: max_buffer_size={}MB, max_storage_binding={}MB",
            adapter.get_info().name,
            adapter_limits.max_buffer_size / 1024 / 1024,
            adapter_limits.max_storage_buffer_binding_size / 1024 / 1024
        );

        Ok(Self { instance, adapter, device, queue })
    }

    /// Blocking variant of [`HeadlessContext::new`]
    pub fn new_blocking() -> Result<Self, Error> {
        pollster::block_on(Self::new())
    }

    /// Context for tests, or `None` (logged) on machines without a GPU
    pub fn for_tests() -> Option<Self> {
        match Self::new_blocking() {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                log::warn!("Skipping GPU test: {}", e);
                None
            }
        }
    }
}
