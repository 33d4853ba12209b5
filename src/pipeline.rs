//! Per-frame predictions handed from the game thread to the render thread.
//!
//! The game thread predicts a display time and device poses when the engine ticks; the render
//! thread consumes that prediction one or more stages later. Slots are addressed by
//! `frame_count % QUEUE_SIZE`, so both sides agree on the slot for a frame without talking to
//! each other.

use log::warn;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Mutex, RwLock,
};

pub const QUEUE_SIZE: usize = 8;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineEntry<T> {
    pub frame_count: u32,
    /// The frame count this slot held before the current write.
    pub prev_frame_count: u32,
    pub data: T,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, derive_more::Display)]
#[display("refusing to overwrite slot holding frame {current} with older frame {attempted}")]
pub struct StaleWrite {
    pub current: u32,
    pub attempted: u32,
}

pub struct PipelineQueue<T> {
    slots: [RwLock<Option<PipelineEntry<T>>>; QUEUE_SIZE],
    // Orders producers only. Readers never take it, so a slow read can't stall a write.
    sync_assignment: Mutex<()>,
    latest: AtomicU32,
    any_written: AtomicBool,
}

impl<T> Default for PipelineQueue<T> {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| RwLock::new(None)),
            sync_assignment: Mutex::new(()),
            latest: AtomicU32::new(0),
            any_written: AtomicBool::new(false),
        }
    }
}

#[inline]
pub fn slot_index(frame_count: u32) -> usize {
    frame_count as usize % QUEUE_SIZE
}

impl<T: Clone> PipelineQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `data` for `frame_count`. Writing the same frame again replaces it; writing a frame
    /// older than the one the slot currently holds is rejected.
    pub fn enqueue(&self, frame_count: u32, data: T) -> Result<(), StaleWrite> {
        let _assignment = self.sync_assignment.lock().unwrap();
        let mut slot = self.slots[slot_index(frame_count)].write().unwrap();

        let prev_frame_count = match slot.as_ref() {
            Some(entry) if frame_count < entry.frame_count => {
                let err = StaleWrite {
                    current: entry.frame_count,
                    attempted: frame_count,
                };
                warn!("{err}");
                return Err(err);
            }
            Some(entry) => entry.frame_count,
            None => frame_count,
        };

        *slot = Some(PipelineEntry {
            frame_count,
            prev_frame_count,
            data,
        });

        if !self.any_written.swap(true, Ordering::AcqRel)
            || frame_count >= self.latest.load(Ordering::Acquire)
        {
            self.latest.store(frame_count, Ordering::Release);
        }
        Ok(())
    }

    /// The entry written for exactly `frame_count`, if its slot hasn't been reused since.
    pub fn get(&self, frame_count: u32) -> Option<PipelineEntry<T>> {
        let slot = self.slots[slot_index(frame_count)].read().unwrap();
        slot.as_ref()
            .filter(|entry| entry.frame_count == frame_count)
            .cloned()
    }

    pub fn latest_frame_count(&self) -> Option<u32> {
        self.any_written
            .load(Ordering::Acquire)
            .then(|| self.latest.load(Ordering::Acquire))
    }

    pub fn clear(&self) {
        let _assignment = self.sync_assignment.lock().unwrap();
        for slot in &self.slots {
            *slot.write().unwrap() = None;
        }
        self.any_written.store(false, Ordering::Release);
        self.latest.store(0, Ordering::Release);
    }
}
