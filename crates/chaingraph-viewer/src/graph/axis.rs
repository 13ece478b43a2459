use chaingraph_core::ChunkId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeAxis {
    pub pixels_per_second: f64,
    pub seconds_per_slot: f64,
    pub chunk_width: f64,
}

impl Default for TimeAxis {
    fn default() -> Self {
        Self {
            pixels_per_second: 10.0,
            seconds_per_slot: 6.0,
            chunk_width: 600.0 * 10.0,
        }
    }
}

impl TimeAxis {
    pub fn pixels_per_slot(&self) -> f64 {
        self.seconds_per_slot * self.pixels_per_second
    }

    pub fn slot_x(&self, slot: u64) -> f64 {
        slot as f64 * self.pixels_per_slot()
    }

    pub fn chunk_of_slot(&self, slot: u64) -> Option<ChunkId> {
        ChunkId::containing(self.slot_x(slot), self.chunk_width)
    }

    pub fn chunk_x(&self, chunk: ChunkId) -> f64 {
        chunk.left_edge(self.chunk_width)
    }
}
