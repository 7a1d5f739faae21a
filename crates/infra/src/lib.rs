//! Ballad infrastructure
//!
//! Everything that owns a thread or a device: the prefetching streaming
//! source and its worker, the playback controller, CPAL output and the WAV
//! reader.

pub mod audio;
pub mod playback;

pub use audio::{AudioOutput, BasicFormats, CpalEnumerator, WavResolver};
pub use playback::{BufferedStreamingSource, PlaybackController, PrefetchWorker, StreamState};
