//! Playback pipeline: prefetch ring, background worker, streaming source
//! and the controller that ties them together

pub mod controller;
pub mod ring;
pub mod streaming;
pub mod worker;

pub use controller::PlaybackController;
pub use ring::PrefetchRing;
pub use streaming::{BufferedStreamingSource, StreamState, StreamStats, StreamingHandle};
pub use worker::{ClientId, PrefetchWorker, TimeSliceClient, WorkerWaker};
