//! GPU timestamp query slot coordination.
//!
//! Multiple consumers (profilers, the capacity tracker) share one query
//! pool per frame in flight. Each consumer allocates a
//! [`QuerySlotHandle`] naming a start+end timestamp pair; physical
//! query indices are derived from the slot.
//!
//! Results are only valid after the caller has waited on the frame's
//! fence; [`GpuQueryManager::elapsed_ns`] returns `None` until results
//! for that frame have been recorded.

/// Opaque handle to a consumer's query slot pair. `INVALID_QUERY_SLOT`
/// denotes no slot.
pub type QuerySlotHandle = u32;

/// Sentinel for an unallocated or failed slot.
pub const INVALID_QUERY_SLOT: QuerySlotHandle = u32::MAX;

#[derive(Debug, Clone)]
struct SlotState {
    consumer: String,
    in_use: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotResult {
    start_ticks: u64,
    end_ticks: u64,
    available: bool,
}

/// Coordinates timestamp query slots across consumers and frames.
#[derive(Debug)]
pub struct GpuQueryManager {
    timestamp_period_ns: f32,
    timestamp_valid_bits: u32,
    frames_in_flight: u32,
    slots: Vec<SlotState>,
    /// `results[frame][slot]`
    results: Vec<Vec<SlotResult>>,
}

impl GpuQueryManager {
    /// `timestamp_period_ns` and `timestamp_valid_bits` come from the
    /// device capability snapshot.
    pub fn new(
        timestamp_period_ns: f32,
        timestamp_valid_bits: u32,
        frames_in_flight: u32,
        max_consumers: u32,
    ) -> Self {
        let slots = (0..max_consumers)
            .map(|_| SlotState {
                consumer: String::new(),
                in_use: false,
            })
            .collect::<Vec<_>>();
        let results = (0..frames_in_flight)
            .map(|_| vec![SlotResult::default(); max_consumers as usize])
            .collect();
        Self {
            timestamp_period_ns,
            timestamp_valid_bits,
            frames_in_flight,
            slots,
            results,
        }
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    pub fn timestamp_period_ns(&self) -> f32 {
        self.timestamp_period_ns
    }

    /// Whether the device reports usable timestamps.
    pub fn is_timestamp_supported(&self) -> bool {
        self.timestamp_valid_bits > 0
    }

    /// Allocate a slot for a consumer. Call once at initialization, not
    /// per frame. Returns [`INVALID_QUERY_SLOT`] when all slots are
    /// taken.
    pub fn allocate_slot(&mut self, consumer_name: &str) -> QuerySlotHandle {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.in_use {
                slot.in_use = true;
                slot.consumer = consumer_name.to_string();
                log::debug!("query slot {index} allocated to '{consumer_name}'");
                return index as QuerySlotHandle;
            }
        }
        log::warn!("no free query slots for '{consumer_name}'");
        INVALID_QUERY_SLOT
    }

    /// Free a slot for reuse.
    pub fn free_slot(&mut self, slot: QuerySlotHandle) {
        if let Some(state) = self.slots.get_mut(slot as usize) {
            state.in_use = false;
            state.consumer.clear();
        }
    }

    pub fn allocated_count(&self) -> u32 {
        self.slots.iter().filter(|s| s.in_use).count() as u32
    }

    /// Physical query index of the slot's start timestamp. Each slot
    /// reserves two consecutive indices (start, end).
    pub fn start_query_index(&self, slot: QuerySlotHandle) -> u32 {
        slot * 2
    }

    /// Physical query index of the slot's end timestamp.
    pub fn end_query_index(&self, slot: QuerySlotHandle) -> u32 {
        slot * 2 + 1
    }

    /// Number of physical queries one frame's pool must hold.
    pub fn queries_per_frame(&self) -> u32 {
        self.slots.len() as u32 * 2
    }

    /// Invalidate a frame's results at the start of its reuse.
    pub fn begin_frame(&mut self, frame_index: u32) {
        if let Some(frame) = self.results.get_mut(frame_index as usize) {
            for result in frame.iter_mut() {
                *result = SlotResult::default();
            }
        }
    }

    /// Record raw timestamp ticks read back from the query pool.
    ///
    /// Callers must have synchronized with the GPU (fence wait) before
    /// reading the pool; this manager only converts and stores.
    pub fn record_results(
        &mut self,
        frame_index: u32,
        slot: QuerySlotHandle,
        start_ticks: u64,
        end_ticks: u64,
    ) {
        let mask = self.tick_mask();
        if let Some(result) = self
            .results
            .get_mut(frame_index as usize)
            .and_then(|frame| frame.get_mut(slot as usize))
        {
            *result = SlotResult {
                start_ticks: start_ticks & mask,
                end_ticks: end_ticks & mask,
                available: true,
            };
        }
    }

    /// Elapsed time for a slot in a frame, or `None` if no results have
    /// been recorded for it yet.
    pub fn elapsed_ns(&self, frame_index: u32, slot: QuerySlotHandle) -> Option<u64> {
        let result = self
            .results
            .get(frame_index as usize)?
            .get(slot as usize)?;
        if !result.available {
            return None;
        }
        let ticks = result.end_ticks.wrapping_sub(result.start_ticks) & self.tick_mask();
        Some((ticks as f64 * self.timestamp_period_ns as f64) as u64)
    }

    fn tick_mask(&self) -> u64 {
        if self.timestamp_valid_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.timestamp_valid_bits) - 1
        }
    }
}
