//! Decoded-sample readers and the format registry that produces them
//!
//! A reader turns an encoded byte stream into interleaved `f32` frames. The
//! player never decodes anything itself: it asks a [`FormatRegistry`] for a
//! reader and hands that reader to the streaming stage, which drives it from
//! a background thread.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::domain::audio::{AudioError, Result};

/// Errors raised by a reader while opening, seeking or reading
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Seek to frame {requested} is past the end ({total} frames)")]
    SeekOutOfRange { requested: u64, total: u64 },

    #[error("Unsupported stream: {0}")]
    Unsupported(String),
}

/// Byte source a format resolver can sniff and decode
pub trait MediaStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> MediaStream for T {}

/// Sequential, seekable producer of decoded frames
///
/// Calls may block for as long as the underlying I/O takes; readers are only
/// ever driven from the background worker, never from the audio callback.
pub trait AudioReader: Send {
    /// Channels per frame in the blocks returned by `read_frames`
    fn channels(&self) -> u16;

    /// Native sample rate of the decoded stream
    fn sample_rate(&self) -> u32;

    /// Total length in frames, `None` for streams of unknown length
    fn total_frames(&self) -> Option<u64>;

    /// Move the next read to `frame`
    fn seek(&mut self, frame: u64) -> std::result::Result<(), ReaderError>;

    /// Read up to `buffer.len() / channels` interleaved frames
    ///
    /// Returns the number of frames written; zero means end of stream.
    fn read_frames(&mut self, buffer: &mut [f32]) -> std::result::Result<usize, ReaderError>;
}

/// Reader over interleaved samples already held in memory
#[derive(Debug, Clone)]
pub struct MemoryReader {
    samples: Arc<[f32]>,
    channels: u16,
    sample_rate: u32,
    position: u64,
}

impl MemoryReader {
    /// Create a reader over interleaved `samples`
    ///
    /// A trailing partial frame is ignored.
    pub fn new(samples: impl Into<Arc<[f32]>>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            channels: channels.max(1),
            sample_rate,
            position: 0,
        }
    }

    /// Frame that the next `read_frames` call starts at
    pub fn position(&self) -> u64 {
        self.position
    }

    fn frames(&self) -> u64 {
        (self.samples.len() / self.channels as usize) as u64
    }
}

impl AudioReader for MemoryReader {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.frames())
    }

    fn seek(&mut self, frame: u64) -> std::result::Result<(), ReaderError> {
        let total = self.frames();
        if frame > total {
            return Err(ReaderError::SeekOutOfRange {
                requested: frame,
                total,
            });
        }
        self.position = frame;
        Ok(())
    }

    fn read_frames(&mut self, buffer: &mut [f32]) -> std::result::Result<usize, ReaderError> {
        let channels = self.channels as usize;
        let wanted = (buffer.len() / channels) as u64;
        let frames = wanted.min(self.frames() - self.position) as usize;

        let start = self.position as usize * channels;
        let len = frames * channels;
        buffer[..len].copy_from_slice(&self.samples[start..start + len]);

        self.position += frames as u64;
        Ok(frames)
    }
}

/// Decoder plug-in that recognises one container format
pub trait FormatResolver: Send + Sync {
    /// Short format name used in logs
    fn name(&self) -> &str;

    /// Inspect the start of `stream` and report whether `open` would succeed
    ///
    /// The registry rewinds the stream before and after calling this.
    fn can_read(&self, stream: &mut dyn MediaStream) -> bool;

    /// Build a reader that takes ownership of `stream`
    fn open(
        &self,
        stream: Box<dyn MediaStream>,
    ) -> std::result::Result<Box<dyn AudioReader>, ReaderError>;
}

/// Ordered set of format resolvers
///
/// Resolvers are tried in registration order; the first one that claims the
/// stream opens it.
#[derive(Default)]
pub struct FormatRegistry {
    resolvers: Vec<Box<dyn FormatResolver>>,
}

impl FormatRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            resolvers: Vec::new(),
        }
    }

    /// Add a resolver after the existing ones
    pub fn register(&mut self, resolver: Box<dyn FormatResolver>) {
        debug!(format = resolver.name(), "Registered format resolver");
        self.resolvers.push(resolver);
    }

    /// Names of the registered formats in lookup order
    pub fn formats(&self) -> Vec<&str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Find a resolver for `stream` and open a reader over it
    pub fn create_reader(&self, mut stream: Box<dyn MediaStream>) -> Result<Box<dyn AudioReader>> {
        for resolver in &self.resolvers {
            stream.seek(SeekFrom::Start(0))?;
            let claimed = resolver.can_read(stream.as_mut());
            stream.seek(SeekFrom::Start(0))?;

            trace!(format = resolver.name(), claimed, "Probed stream");
            if claimed {
                return resolver.open(stream).map_err(AudioError::from);
            }
        }

        Err(AudioError::UnsupportedFormat(format!(
            "none of {} registered formats recognised the stream",
            self.resolvers.len()
        )))
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("formats", &self.formats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Accepts streams starting with `RAW1`, followed by little-endian f32 mono samples
    struct RawResolver;

    impl FormatResolver for RawResolver {
        fn name(&self) -> &str {
            "raw"
        }

        fn can_read(&self, stream: &mut dyn MediaStream) -> bool {
            let mut magic = [0u8; 4];
            stream.read_exact(&mut magic).is_ok() && &magic == b"RAW1"
        }

        fn open(
            &self,
            mut stream: Box<dyn MediaStream>,
        ) -> std::result::Result<Box<dyn AudioReader>, ReaderError> {
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes)?;
            let samples: Vec<f32> = bytes[4..]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Ok(Box::new(MemoryReader::new(samples, 1, 8000)))
        }
    }

    fn raw_bytes(samples: &[f32]) -> Vec<u8> {
        let mut bytes = b"RAW1".to_vec();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_memory_reader_reads_in_blocks() {
        let mut reader = MemoryReader::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 44100);
        assert_eq!(reader.total_frames(), Some(3));

        let mut block = vec![0.0; 4];
        assert_eq!(reader.read_frames(&mut block).unwrap(), 2);
        assert_eq!(block, vec![1.0, 2.0, 3.0, 4.0]);

        assert_eq!(reader.read_frames(&mut block).unwrap(), 1);
        assert_eq!(&block[..2], &[5.0, 6.0]);

        // End of stream
        assert_eq!(reader.read_frames(&mut block).unwrap(), 0);
    }

    #[test]
    fn test_memory_reader_seek() {
        let mut reader = MemoryReader::new(vec![0.0, 1.0, 2.0, 3.0], 1, 44100);
        reader.seek(2).unwrap();

        let mut block = vec![0.0; 4];
        assert_eq!(reader.read_frames(&mut block).unwrap(), 2);
        assert_eq!(&block[..2], &[2.0, 3.0]);

        assert!(matches!(
            reader.seek(5),
            Err(ReaderError::SeekOutOfRange { requested: 5, total: 4 })
        ));
    }

    #[test]
    fn test_registry_opens_known_format() {
        let mut registry = FormatRegistry::new();
        registry.register(Box::new(RawResolver));
        assert_eq!(registry.formats(), vec!["raw"]);

        let stream = Cursor::new(raw_bytes(&[0.5, -0.5, 0.25]));
        let mut reader = registry.create_reader(Box::new(stream)).unwrap();
        assert_eq!(reader.total_frames(), Some(3));

        let mut block = vec![0.0; 3];
        reader.read_frames(&mut block).unwrap();
        assert_eq!(block, vec![0.5, -0.5, 0.25]);
    }

    #[test]
    fn test_registry_rejects_unknown_format() {
        let mut registry = FormatRegistry::new();
        registry.register(Box::new(RawResolver));

        let stream = Cursor::new(b"OggS....".to_vec());
        let result = registry.create_reader(Box::new(stream));
        assert!(matches!(result, Err(AudioError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_empty_registry_rejects_everything() {
        let registry = FormatRegistry::new();
        assert!(registry.is_empty());
        let result = registry.create_reader(Box::new(Cursor::new(raw_bytes(&[0.0]))));
        assert!(result.is_err());
    }
}
