//! Statistics snapshots for sinks and sources

/// Sink-level statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Units accepted but not yet completed by the write hook
    pub buffered_units: usize,
    /// Write requests waiting behind the one in flight
    pub buffered_requests: usize,
    /// Chunks accepted by `write`
    pub chunks_written: u64,
    /// Units accepted by `write`
    pub units_written: u64,
    /// Number of `drain` events emitted
    pub drains: u64,
}

impl SinkStats {
    /// Average chunk size in units
    pub fn average_chunk(&self) -> u64 {
        if self.chunks_written > 0 {
            self.units_written / self.chunks_written
        } else {
            0
        }
    }
}

/// Source-level statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Units currently queued
    pub buffered_units: usize,
    /// Chunks currently queued
    pub buffered_chunks: usize,
    /// Chunks accepted by `push` / `unshift`
    pub chunks_pushed: u64,
    /// Units accepted by `push` / `unshift`
    pub units_pushed: u64,
    /// Chunks handed to consumers, through `data` or `read`
    pub chunks_delivered: u64,
    /// Units handed to consumers
    pub units_delivered: u64,
    /// Current high-water mark, after any growth
    pub high_water_mark: usize,
}

impl SourceStats {
    /// Units pushed but not yet delivered
    pub fn in_transit(&self) -> u64 {
        self.units_pushed.saturating_sub(self.units_delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_chunk() {
        let stats = SinkStats {
            chunks_written: 4,
            units_written: 10,
            ..Default::default()
        };
        assert_eq!(stats.average_chunk(), 2);
        assert_eq!(SinkStats::default().average_chunk(), 0);
    }

    #[test]
    fn test_in_transit() {
        let stats = SourceStats {
            units_pushed: 12,
            units_delivered: 5,
            ..Default::default()
        };
        assert_eq!(stats.in_transit(), 7);
    }
}
