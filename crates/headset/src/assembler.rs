//! Stream assembly: device data frames in, fixed-size sample chunks out.

use headproto::DataFrame;
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Half the 16-bit sequence space; deltas at or above this are "behind".
const SEQUENCE_HALF: u16 = 0x8000;

/// A block of `sample_count` timesteps for every streamed channel.
///
/// Channel `i` is the channel whose `channel_index` is `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    samples: Vec<Vec<f32>>,
    len: usize,
}

impl Chunk {
    fn with_capacity(channels: usize, timesteps: usize) -> Self {
        Self {
            samples: (0..channels).map(|_| Vec::with_capacity(timesteps)).collect(),
            len: 0,
        }
    }

    /// Samples of the channel at `index`, oldest first.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.samples.get(index).map(Vec::as_slice)
    }

    pub fn channel_count(&self) -> usize {
        self.samples.len()
    }

    /// Timesteps in this chunk
    pub fn sample_count(&self) -> usize {
        self.len
    }

    /// Sample of every channel at one timestep, in channel index order.
    pub fn timestep(&self, step: usize) -> Option<Vec<f32>> {
        (step < self.len).then(|| self.samples.iter().map(|ch| ch[step]).collect())
    }
}

/// Counters describing the health of the current stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub frames_accepted: u64,
    /// Wrong channel count, short body or undecodable
    pub frames_malformed: u64,
    /// Sequence behind the expected one (late or duplicate)
    pub frames_late: u64,
    /// Forward jumps in the sequence
    pub gaps: u64,
    /// Frames skipped over by those jumps
    pub frames_missing: u64,
    pub chunks_delivered: u64,
}

/// Converts data frames into chunks of `chunk_size` timesteps
#[derive(Debug)]
pub struct StreamAssembler {
    channels: usize,
    chunk_size: usize,
    current: Chunk,
    expected: Option<u16>,
    stats: StreamStats,
}

impl StreamAssembler {
    pub fn new(channels: usize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            channels,
            chunk_size,
            current: Chunk::with_capacity(channels, chunk_size),
            expected: None,
            stats: StreamStats::default(),
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Count a frame that could not be decoded at all.
    pub fn record_malformed(&mut self) {
        self.stats.frames_malformed += 1;
    }

    /// Feed one frame; returns every chunk it completed.
    pub fn push(&mut self, frame: &DataFrame) -> Vec<Chunk> {
        let timesteps = frame.timesteps as usize;
        if frame.channels as usize != self.channels || frame.values.len() != self.channels * timesteps {
            warn!(
                "dropping malformed data frame {}: {} channels, {} values, expected {} channels",
                frame.sequence,
                frame.channels,
                frame.values.len(),
                self.channels
            );
            self.stats.frames_malformed += 1;
            return Vec::new();
        }

        if let Some(expected) = self.expected {
            let delta = frame.sequence.wrapping_sub(expected);
            if delta >= SEQUENCE_HALF {
                debug!(
                    "dropping late data frame {} (expected {})",
                    frame.sequence, expected
                );
                self.stats.frames_late += 1;
                return Vec::new();
            }
            if delta > 0 {
                debug!("sequence gap: {} frames before {}", delta, frame.sequence);
                self.stats.gaps += 1;
                self.stats.frames_missing += delta as u64;
            }
        }
        self.expected = Some(frame.sequence.wrapping_add(1));
        self.stats.frames_accepted += 1;

        let mut done = Vec::new();
        for step in 0..timesteps {
            let row = &frame.values[step * self.channels..(step + 1) * self.channels];
            for (channel, value) in self.current.samples.iter_mut().zip(row) {
                channel.push(*value);
            }
            self.current.len += 1;

            if self.current.len == self.chunk_size {
                let next = Chunk::with_capacity(self.channels, self.chunk_size);
                done.push(std::mem::replace(&mut self.current, next));
            }
        }

        self.stats.chunks_delivered += done.len() as u64;
        if !done.is_empty() {
            trace!("assembled {} chunk(s)", done.len());
        }
        done
    }
}
