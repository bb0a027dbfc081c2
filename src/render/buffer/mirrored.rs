//! Device-local storage buffer fed through a host-visible staging buffer
//!
//! Every mutating operation maps the staging window it needs, copies the host
//! data in, records a staging-to-device copy and waits for that submission to
//! complete, so the device has observed the write when the call returns.
//!
//! The staging buffer is a transfer window: only the range written by the
//! current operation is meaningful. The device buffer is never read back
//! except by [`MirroredBuffer::read_back`], which tests and tools use.

use std::marker::PhantomData;
use std::ops::Range;

use bytemuck::Pod;

use crate::core::error::Error;

/// A `T`-typed storage buffer with a staging buffer of equal capacity.
pub struct MirroredBuffer<T: Pod> {
    label: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    device_buffer: Option<wgpu::Buffer>,
    staging_buffer: Option<wgpu::Buffer>,
    /// Capacity in elements
    capacity: usize,
    /// Highest element written so far
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> MirroredBuffer<T> {
    const ELEMENT_SIZE: u64 = std::mem::size_of::<T>() as u64;

    /// Bind the mirror to a device and queue. No GPU memory is allocated yet.
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, label: &str) -> Self {
        assert!(
            Self::ELEMENT_SIZE % wgpu::COPY_BUFFER_ALIGNMENT == 0 && Self::ELEMENT_SIZE > 0,
            "element size {} must be a non-zero multiple of {}",
            Self::ELEMENT_SIZE,
            wgpu::COPY_BUFFER_ALIGNMENT
        );
        Self {
            label: label.to_string(),
            device: device.clone(),
            queue: queue.clone(),
            device_buffer: None,
            staging_buffer: None,
            capacity: 0,
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Allocate buffers sized for `initial` and upload it.
    pub fn create(&mut self, initial: &[T]) -> Result<(), Error> {
        self.allocate(initial.len())?;
        if !initial.is_empty() {
            self.write(0, initial)?;
        }
        self.len = initial.len();
        log::debug!(
            "{}: uploaded {} elements ({} KB)",
            self.label,
            initial.len(),
            initial.len() as u64 * Self::ELEMENT_SIZE / 1024
        );
        Ok(())
    }

    /// Allocate zero-filled buffers holding `capacity` elements.
    pub fn create_empty(&mut self, capacity: usize) -> Result<(), Error> {
        self.allocate(capacity)?;
        self.len = 0;
        Ok(())
    }

    /// Reallocate at `new_capacity`, keeping the valid prefix on the device.
    pub fn resize(&mut self, new_capacity: usize) -> Result<(), Error> {
        let old_device = self.device_buffer.take();
        let old_staging = self.staging_buffer.take();
        let keep = self.len.min(new_capacity);

        let (device_buffer, staging_buffer) = self.create_buffers(new_capacity)?;
        if let Some(old) = &old_device {
            if keep > 0 {
                let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("mirror_resize"),
                });
                encoder.copy_buffer_to_buffer(old, 0, &device_buffer, 0, keep as u64 * Self::ELEMENT_SIZE);
                self.submit_and_wait(encoder)?;
            }
        }
        if let Some(old) = old_device {
            old.destroy();
        }
        if let Some(old) = old_staging {
            old.destroy();
        }

        log::info!(
            "{}: resized {} -> {} elements ({} KB)",
            self.label,
            self.capacity,
            new_capacity,
            new_capacity as u64 * Self::ELEMENT_SIZE / 1024
        );
        self.device_buffer = Some(device_buffer);
        self.staging_buffer = Some(staging_buffer);
        self.capacity = new_capacity;
        self.len = keep;
        Ok(())
    }

    /// Overwrite elements `start..start + src.len()`.
    pub fn update_range(&mut self, start: usize, src: &[T]) -> Result<(), Error> {
        if src.is_empty() {
            return Ok(());
        }
        if start + src.len() > self.capacity {
            return Err(Error::Gpu(format!(
                "{}: update {}..{} exceeds capacity {}",
                self.label,
                start,
                start + src.len(),
                self.capacity
            )));
        }
        self.write(start, src)?;
        self.len = self.len.max(start + src.len());
        Ok(())
    }

    /// Overwrite a single element.
    pub fn update_element(&mut self, index: usize, value: T) -> Result<(), Error> {
        self.update_range(index, std::slice::from_ref(&value))
    }

    /// Copy the first `len()` elements back from the device. Blocks.
    pub fn read_back(&self) -> Result<Vec<T>, Error> {
        let Some(device_buffer) = &self.device_buffer else {
            return Ok(Vec::new());
        };
        if self.len == 0 {
            return Ok(Vec::new());
        }
        let size = self.len as u64 * Self::ELEMENT_SIZE;
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mirror_readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("mirror_readback"),
        });
        encoder.copy_buffer_to_buffer(device_buffer, 0, &readback, 0, size);
        self.submit_and_wait(encoder)?;

        let slice = readback.slice(..);
        self.map_blocking(&slice, wgpu::MapMode::Read)?;
        let data = slice.get_mapped_range();
        let out = bytemuck::cast_slice::<u8, T>(&data).to_vec();
        drop(data);
        readback.unmap();
        readback.destroy();
        Ok(out)
    }

    /// Release both buffers. Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(buffer) = self.device_buffer.take() {
            buffer.destroy();
        }
        if let Some(buffer) = self.staging_buffer.take() {
            buffer.destroy();
        }
        self.capacity = 0;
        self.len = 0;
    }

    /// Device buffer for descriptor binding
    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        self.device_buffer.as_ref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn allocate(&mut self, capacity: usize) -> Result<(), Error> {
        self.destroy();
        let (device_buffer, staging_buffer) = self.create_buffers(capacity)?;
        self.device_buffer = Some(device_buffer);
        self.staging_buffer = Some(staging_buffer);
        self.capacity = capacity;
        Ok(())
    }

    fn create_buffers(&self, capacity: usize) -> Result<(wgpu::Buffer, wgpu::Buffer), Error> {
        // Storage bindings must not be empty
        let size = capacity.max(1) as u64 * Self::ELEMENT_SIZE;
        let max = self.device.limits().max_buffer_size;
        if size > max {
            return Err(Error::Gpu(format!(
                "{}: {} bytes exceeds max_buffer_size {}",
                self.label, size, max
            )));
        }
        let device_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&self.label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let staging_label = format!("{}_staging", self.label);
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&staging_label),
            size,
            usage: wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Ok((device_buffer, staging_buffer))
    }

    /// Stage `src` at element `start` and copy it to the device.
    fn write(&self, start: usize, src: &[T]) -> Result<(), Error> {
        let (Some(device_buffer), Some(staging)) = (&self.device_buffer, &self.staging_buffer) else {
            return Err(Error::Gpu(format!("{}: write before create", self.label)));
        };
        let bytes: &[u8] = bytemuck::cast_slice(src);
        let offset = start as u64 * Self::ELEMENT_SIZE;
        let end = offset + bytes.len() as u64;

        // Map offsets must be MAP_ALIGNMENT aligned; widen the window down.
        let window = map_window(offset..end);
        let slice = staging.slice(window.clone());
        self.map_blocking(&slice, wgpu::MapMode::Write)?;
        {
            let mut view = slice.get_mapped_range_mut();
            let at = (offset - window.start) as usize;
            view[at..at + bytes.len()].copy_from_slice(bytes);
        }
        staging.unmap();

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("mirror_upload"),
        });
        encoder.copy_buffer_to_buffer(staging, offset, device_buffer, offset, bytes.len() as u64);
        self.submit_and_wait(encoder)?;
        log::trace!("{}: wrote bytes {}..{}", self.label, offset, end);
        Ok(())
    }

    fn map_blocking(&self, slice: &wgpu::BufferSlice<'_>, mode: wgpu::MapMode) -> Result<(), Error> {
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(mode, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map_err(|e| Error::Gpu(format!("{}: poll failed: {:?}", self.label, e)))?;
        rx.recv()
            .map_err(|_| Error::Gpu(format!("{}: map callback dropped", self.label)))?
            .map_err(|e| Error::Gpu(format!("{}: map failed: {}", self.label, e)))
    }

    fn submit_and_wait(&self, encoder: wgpu::CommandEncoder) -> Result<(), Error> {
        let index = self.queue.submit(Some(encoder.finish()));
        self.device
            .poll(wgpu::PollType::Wait { submission_index: Some(index), timeout: None })
            .map_err(|e| Error::Gpu(format!("{}: wait failed: {:?}", self.label, e)))?;
        Ok(())
    }
}

/// Smallest mappable window covering `bytes`.
fn map_window(bytes: Range<u64>) -> Range<u64> {
    let start = bytes.start - bytes.start % wgpu::MAP_ALIGNMENT;
    start..bytes.end
}
