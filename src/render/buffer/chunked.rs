//! Fixed-capacity mirrored buffer split into equal slots
//!
//! Used for streaming per-region payloads: each slot holds up to
//! `slot_size` records and can be loaded, patched and unloaded on its own.

use bytemuck::Pod;

use super::mirrored::MirroredBuffer;
use crate::core::error::Error;

/// Bookkeeping for one slot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotInfo {
    /// First element of the slot in the shared buffer
    pub start: usize,
    /// Records currently loaded
    pub count: usize,
    pub occupied: bool,
}

pub struct ChunkedMirror<T: Pod> {
    buffer: MirroredBuffer<T>,
    slots: Vec<SlotInfo>,
    slot_size: usize,
}

impl<T: Pod> ChunkedMirror<T> {
    /// Allocate `slot_count * slot_size` zeroed records on the device.
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        label: &str,
        slot_count: usize,
        slot_size: usize,
    ) -> Result<Self, Error> {
        let mut buffer = MirroredBuffer::new(device, queue, label);
        buffer.create_empty(slot_count * slot_size)?;
        let slots = (0..slot_count)
            .map(|i| SlotInfo { start: i * slot_size, count: 0, occupied: false })
            .collect();
        log::info!("{}: {} slots of {} records", label, slot_count, slot_size);
        Ok(Self { buffer, slots, slot_size })
    }

    /// Load `data` into `slot`, replacing whatever was there.
    pub fn load(&mut self, slot: usize, data: &[T]) -> Result<(), Error> {
        let info = self.slot_checked(slot)?;
        if data.len() > self.slot_size {
            return Err(Error::Gpu(format!(
                "slot payload of {} records exceeds slot size {}",
                data.len(),
                self.slot_size
            )));
        }
        let previous = info.count;
        self.buffer.update_range(info.start, data)?;
        if previous > data.len() {
            let zeros = vec![T::zeroed(); previous - data.len()];
            self.buffer.update_range(info.start + data.len(), &zeros)?;
        }
        self.slots[slot] = SlotInfo { start: info.start, count: data.len(), occupied: true };
        Ok(())
    }

    /// Mark `slot` free; with `clear`, zero its records on the device too.
    pub fn unload(&mut self, slot: usize, clear: bool) -> Result<(), Error> {
        let info = self.slot_checked(slot)?;
        if clear && info.count > 0 {
            let zeros = vec![T::zeroed(); info.count];
            self.buffer.update_range(info.start, &zeros)?;
        }
        self.slots[slot] = SlotInfo { start: info.start, count: 0, occupied: false };
        Ok(())
    }

    /// Patch records `offset..offset + data.len()` inside an occupied slot.
    pub fn update(&mut self, slot: usize, offset: usize, data: &[T]) -> Result<(), Error> {
        let info = self.slot_checked(slot)?;
        if !info.occupied {
            return Err(Error::Gpu(format!("slot {} is not loaded", slot)));
        }
        if offset + data.len() > self.slot_size {
            return Err(Error::Gpu(format!(
                "update {}..{} outside slot of {} records",
                offset,
                offset + data.len(),
                self.slot_size
            )));
        }
        self.buffer.update_range(info.start + offset, data)?;
        self.slots[slot].count = info.count.max(offset + data.len());
        Ok(())
    }

    /// First unoccupied slot, if any
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.occupied)
    }

    pub fn slot(&self, slot: usize) -> Option<&SlotInfo> {
        self.slots.get(slot)
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn total_capacity(&self) -> usize {
        self.slots.len() * self.slot_size
    }

    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffer.buffer()
    }

    /// Device contents of the whole buffer up to the highest write
    pub fn read_back(&self) -> Result<Vec<T>, Error> {
        self.buffer.read_back()
    }

    pub fn destroy(&mut self) {
        self.buffer.destroy();
        self.slots.clear();
    }

    fn slot_checked(&self, slot: usize) -> Result<SlotInfo, Error> {
        self.slots
            .get(slot)
            .copied()
            .ok_or_else(|| Error::Gpu(format!("slot {} out of range ({} slots)", slot, self.slots.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::context::HeadlessContext;

    #[test]
    fn test_slot_lifecycle() {
        let Some(ctx) = HeadlessContext::for_tests() else { return };
        let mut chunked = ChunkedMirror::<u32>::new(&ctx.device, &ctx.queue, "test_chunks", 4, 16).unwrap();
        assert_eq!(chunked.total_capacity(), 64);
        assert_eq!(chunked.free_slot(), Some(0));

        chunked.load(1, &[1, 2, 3, 4]).unwrap();
        chunked.load(3, &[9; 16]).unwrap();
        assert_eq!(chunked.slot(1), Some(&SlotInfo { start: 16, count: 4, occupied: true }));
        assert!(chunked.load(0, &[0; 17]).is_err());
        assert!(chunked.update(2, 0, &[1]).is_err());

        chunked.update(1, 2, &[7, 8, 9]).unwrap();
        assert_eq!(chunked.slot(1).unwrap().count, 5);

        chunked.unload(3, true).unwrap();
        assert_eq!(chunked.free_slot(), Some(0));
        assert!(!chunked.slot(3).unwrap().occupied);

        let back = chunked.read_back().unwrap();
        assert_eq!(&back[16..21], &[1, 2, 7, 8, 9]);
        assert!(back[48..64].iter().all(|v| *v == 0));
    }

    #[test]
    fn test_reload_shorter_payload_clears_tail() {
        let Some(ctx) = HeadlessContext::for_tests() else { return };
        let mut chunked = ChunkedMirror::<u32>::new(&ctx.device, &ctx.queue, "test_reload", 2, 8).unwrap();
        chunked.load(0, &[5; 8]).unwrap();
        chunked.load(0, &[6; 3]).unwrap();
        let back = chunked.read_back().unwrap();
        assert_eq!(&back[..8], &[6, 6, 6, 0, 0, 0, 0, 0]);
    }
}
