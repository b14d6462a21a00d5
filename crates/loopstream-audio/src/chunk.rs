//! Immutable blocks of decoded audio.

use std::sync::Arc;

/// Interleaved channel count of every chunk.
pub const CHANNELS: usize = 2;

/// One decoded block of interleaved stereo samples.
///
/// A chunk is never mutated after it is built. Whether a chunk is the last one
/// before end-of-stream is tracked by the render side next to the chunk,
/// because that is only known once the decoder reports end-of-stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    samples: Box<[f32]>,
}

/// Chunks are shared between the loop cache and the playback queue.
pub type SharedChunk = Arc<Chunk>;

impl Chunk {
    /// Build a chunk from interleaved stereo samples.
    ///
    /// A trailing half frame is dropped.
    pub fn from_interleaved(samples: &[f32]) -> Self {
        let whole = samples.len() - samples.len() % CHANNELS;
        Self {
            samples: samples[..whole].into(),
        }
    }

    /// Build a shared chunk from interleaved stereo samples.
    pub fn shared(samples: &[f32]) -> SharedChunk {
        Arc::new(Self::from_interleaved(samples))
    }

    /// Number of frames (sample pairs).
    pub fn frames(&self) -> usize {
        self.samples.len() / CHANNELS
    }

    /// Number of individual samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The sample pair at `index`, or `None` past the end.
    #[inline]
    pub fn frame(&self, index: usize) -> Option<[f32; CHANNELS]> {
        let start = index.checked_mul(CHANNELS)?;
        match self.samples.get(start..start + CHANNELS) {
            Some(&[left, right]) => Some([left, right]),
            _ => None,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_frame_access() {
        let chunk = Chunk::from_interleaved(&[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(chunk.frames(), 2);
        assert_eq!(chunk.frame(0), Some([0.1, 0.2]));
        assert_eq!(chunk.frame(1), Some([0.3, 0.4]));
        assert_eq!(chunk.frame(2), None);
    }

    #[test]
    fn test_half_frame_dropped() {
        let chunk = Chunk::from_interleaved(&[1.0, 1.0, 1.0]);
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.frames(), 1);
    }

    #[test]
    fn test_empty_chunk() {
        let chunk = Chunk::from_interleaved(&[]);
        assert!(chunk.is_empty());
        assert_eq!(chunk.frame(0), None);
    }
}
