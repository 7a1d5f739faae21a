//! Buffered streaming source
//!
//! Bridges a blocking [`AudioReader`] to the real-time callback. A prefetch
//! task running on a [`PrefetchWorker`] keeps a [`PrefetchRing`] filled ahead
//! of the playback position; the callback only ever copies out of the ring.
//!
//! Seeks and reader swaps are applied under the task lock, which the prefetch
//! task takes once per chunk. Each one opens a new segment: a marker naming
//! the ring frame where the new data begins, so the callback can drop stale
//! frames and rebase its position without ever waiting. The end of stream is
//! published through the same queue, tagged with its segment, so the callback
//! always applies an end to the data it belongs to.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use ballad_core::domain::audio::{AudioError, BlockProducer, PlaybackSpec, Result};
use ballad_core::domain::config::StreamingConfig;
use ballad_core::domain::reader::AudioReader;

use super::ring::PrefetchRing;
use super::worker::{ClientId, PrefetchWorker, TimeSliceClient, WorkerWaker};

/// Sentinel for "no frame" in atomic frame slots
const NONE: u64 = u64::MAX;

/// Pending markers the callback has not consumed yet
const MARKER_CAPACITY: usize = 64;

/// Chunks read per time slice before yielding to other clients
const MAX_CHUNKS_PER_SLICE: usize = 4;

/// Re-check delay once the buffer is above the low-water mark
const FILL_DELAY: Duration = Duration::from_millis(5);

/// Re-check delay with nothing to read (no reader or end of stream)
const IDLE_DELAY: Duration = Duration::from_millis(50);

/// Observable state of a streaming source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No reader installed
    Empty,
    /// Reader installed, never started
    Loaded,
    Playing,
    Paused,
    /// Reached end of stream without looping
    Finished,
}

/// Diagnostics readable from any thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Callbacks that were short of data before end of stream
    pub underruns: u64,
    /// Reader failures during prefetch
    pub read_errors: u64,
    /// Frames currently waiting in the ring
    pub frames_buffered: usize,
    /// Frames delivered to the callback since creation
    pub frames_played: u64,
}

/// Notices from the prefetch task, consumed by the callback in order
#[derive(Debug, Clone, Copy)]
enum Marker {
    /// Segment `id` starts at ring frame `at` with reader frame `position`
    Segment {
        id: u64,
        at: u64,
        position: u64,
        total: Option<u64>,
    },
    /// Segment `id` ends at ring frame `at`
    End { id: u64, at: u64 },
}

/// State touched only by the prefetch task and control calls
struct PrefetchTask {
    reader: Option<Box<dyn AudioReader>>,
    reader_channels: usize,
    read_buf: Vec<f32>,
    mapped: Vec<f32>,
    /// Next frame the reader will produce
    reader_frame: u64,
    eos: bool,
}

struct StreamShared {
    task: Mutex<PrefetchTask>,
    ring: PrefetchRing,
    config: StreamingConfig,
    markers: ArrayQueue<Marker>,

    pending_seek: AtomicU64,
    /// Latest segment opened by a seek or reader swap
    segment: AtomicU64,
    /// Segment whose end the callback has played through
    finished_segment: AtomicU64,
    /// Control threads waiting to swap the reader
    swap_waiters: AtomicUsize,

    looping: AtomicBool,
    playing: AtomicBool,
    started: AtomicBool,
    has_reader: AtomicBool,
    closed: AtomicBool,

    play_position: AtomicU64,
    total_frames: AtomicU64,
    reader_sample_rate: AtomicU32,
    output_sample_rate: AtomicU32,

    underruns: AtomicU64,
    read_errors: AtomicU64,
    frames_played: AtomicU64,

    waker: OnceLock<WorkerWaker>,
}

impl StreamShared {
    fn lock_task(&self) -> std::sync::MutexGuard<'_, PrefetchTask> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.get() {
            waker.wake();
        }
    }

    fn total(&self) -> Option<u64> {
        match self.total_frames.load(Ordering::Acquire) {
            NONE => None,
            total => Some(total),
        }
    }

    /// Open a segment at the current write position (task lock held)
    fn publish_segment(&self, position: u64, total: Option<u64>) {
        let id = self.segment.load(Ordering::Relaxed) + 1;
        self.markers.force_push(Marker::Segment {
            id,
            at: self.ring.write_position(),
            position,
            total,
        });
        self.segment.store(id, Ordering::Release);
    }

    fn mark_end(&self, task: &mut PrefetchTask) {
        task.eos = true;
        self.markers.force_push(Marker::End {
            id: self.segment.load(Ordering::Relaxed),
            at: self.ring.write_position(),
        });
    }

    /// The reader ran dry or failed; a pending seek restarts it instead
    fn reached_eof(&self, task: &mut PrefetchTask) {
        if self.pending_seek.load(Ordering::Acquire) != NONE {
            task.eos = true;
            return;
        }
        self.mark_end(task);
    }

    fn install_reader(&self, reader: Option<Box<dyn AudioReader>>) -> Option<Box<dyn AudioReader>> {
        let mut task = self.lock_task();
        let total = reader.as_ref().and_then(|r| r.total_frames());
        let rate = reader.as_ref().map_or(0, |r| r.sample_rate());
        let reader_channels = reader.as_ref().map_or(1, |r| r.channels().max(1) as usize);

        let chunk = self.config.read_chunk_frames;
        task.read_buf.resize(chunk * reader_channels, 0.0);
        task.reader_channels = reader_channels;
        task.reader_frame = 0;
        task.eos = false;

        self.has_reader.store(reader.is_some(), Ordering::Release);
        self.total_frames.store(total.unwrap_or(NONE), Ordering::Release);
        self.reader_sample_rate.store(rate, Ordering::Release);
        self.pending_seek.store(NONE, Ordering::Release);
        self.started.store(false, Ordering::Release);
        self.publish_segment(0, total);
        // After the marker, so a callback that sees 0 also sees the segment
        self.play_position.store(0, Ordering::Release);

        let output_rate = self.output_sample_rate.load(Ordering::Acquire);
        if reader.is_some() && output_rate != 0 && rate != output_rate {
            warn!(
                reader_rate = rate,
                output_rate, "Reader sample rate differs from output, playing without resampling"
            );
        }

        std::mem::replace(&mut task.reader, reader)
    }

    fn apply_pending_seek(&self, task: &mut PrefetchTask) {
        let requested = self.pending_seek.load(Ordering::Acquire);
        if requested == NONE {
            return;
        }

        if let Some(reader) = task.reader.as_mut() {
            let total = reader.total_frames();
            let frame = total.map_or(requested, |t| requested.min(t));

            task.eos = false;
            self.publish_segment(frame, total);

            match reader.seek(frame) {
                Ok(()) => {
                    task.reader_frame = frame;
                    debug!(frame, "Seek applied");
                }
                Err(e) => {
                    warn!(frame, error = %e, "Seek failed, treating as end of stream");
                    self.read_errors.fetch_add(1, Ordering::Relaxed);
                    self.mark_end(task);
                }
            }
        }

        // A newer request stays pending for the next slice
        let _ = self.pending_seek.compare_exchange(
            requested,
            NONE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Read one chunk and append it to the ring
    fn fill_chunk(&self, task: &mut PrefetchTask) {
        let chunk = self.config.read_chunk_frames;
        let in_channels = task.reader_channels;
        let out_channels = self.ring.channels();

        let Some(reader) = task.reader.as_mut() else {
            task.eos = true;
            return;
        };

        match reader.read_frames(&mut task.read_buf[..chunk * in_channels]) {
            Ok(0) => {
                if self.looping.load(Ordering::Acquire) && task.reader_frame > 0 {
                    match reader.seek(0) {
                        Ok(()) => {
                            trace!("End of stream, wrapping to start");
                            task.reader_frame = 0;
                        }
                        Err(e) => {
                            warn!(error = %e, "Rewind failed, treating as end of stream");
                            self.read_errors.fetch_add(1, Ordering::Relaxed);
                            self.reached_eof(task);
                        }
                    }
                } else {
                    debug!(frame = task.reader_frame, "End of stream");
                    self.reached_eof(task);
                }
            }
            Ok(frames) => {
                let frames = frames.min(chunk);
                let mapped = &mut task.mapped[..frames * out_channels];
                map_channels(&task.read_buf[..frames * in_channels], in_channels, mapped, out_channels);
                let pushed = self.ring.push(mapped);
                debug_assert_eq!(pushed, frames);
                task.reader_frame += frames as u64;
            }
            Err(e) => {
                warn!(frame = task.reader_frame, error = %e, "Read failed, treating as end of stream");
                self.read_errors.fetch_add(1, Ordering::Relaxed);
                self.reached_eof(task);
            }
        }
    }
}

impl TimeSliceClient for StreamShared {
    fn use_time_slice(&self) -> Option<Duration> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let chunk = self.config.read_chunk_frames;
        let mut idle = false;

        // One read per lock, so seeks and swaps wait for at most one read
        for _ in 0..MAX_CHUNKS_PER_SLICE {
            if self.swap_waiters.load(Ordering::Acquire) > 0 {
                break;
            }

            let mut task = self.lock_task();
            self.apply_pending_seek(&mut task);
            idle = task.reader.is_none() || task.eos;
            if idle || self.ring.free() < chunk {
                break;
            }
            self.fill_chunk(&mut task);
            idle = task.eos;
        }

        if idle {
            Some(IDLE_DELAY)
        } else if self.ring.buffered() < self.config.low_water_frames && self.ring.free() >= chunk {
            Some(Duration::ZERO)
        } else {
            Some(FILL_DELAY)
        }
    }

    fn name(&self) -> &str {
        "streaming-source"
    }
}

/// Convert interleaved frames between channel layouts
///
/// Mono is duplicated, downmix to mono averages, anything else copies the
/// shared channels and silences the rest.
fn map_channels(input: &[f32], in_channels: usize, output: &mut [f32], out_channels: usize) {
    if in_channels == out_channels {
        output.copy_from_slice(input);
        return;
    }

    let frames = input.chunks_exact(in_channels).zip(output.chunks_exact_mut(out_channels));
    if in_channels == 1 {
        for (src, dst) in frames {
            dst.fill(src[0]);
        }
    } else if out_channels == 1 {
        let scale = 1.0 / in_channels as f32;
        for (src, dst) in frames {
            dst[0] = src.iter().sum::<f32>() * scale;
        }
    } else {
        let shared = in_channels.min(out_channels);
        for (src, dst) in frames {
            dst[..shared].copy_from_slice(&src[..shared]);
            dst[shared..].fill(0.0);
        }
    }
}

// ============================================================================
// CALLBACK SIDE
// ============================================================================

/// Block producer that plays a reader through a prefetch ring
pub struct BufferedStreamingSource {
    shared: Arc<StreamShared>,
    /// Segment being played
    segment: u64,
    /// Ring frame where the current segment starts
    segment_start: u64,
    /// Reader frame at `segment_start`
    segment_position: u64,
    segment_total: Option<u64>,
    /// Ring frame where the current segment ends, `NONE` while unknown
    segment_end: u64,
}

impl BufferedStreamingSource {
    /// Create a source producing `channels` interleaved channels
    pub fn new(config: &StreamingConfig, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        let chunk = config.read_chunk_frames.max(1);
        let config = StreamingConfig {
            read_chunk_frames: chunk,
            ..config.clone()
        };
        let ring = PrefetchRing::with_capacity(config.ring_capacity_frames.max(chunk), channels);

        debug!(
            capacity = ring.capacity(),
            channels,
            chunk,
            "Creating streaming source"
        );

        let shared = Arc::new(StreamShared {
            task: Mutex::new(PrefetchTask {
                reader: None,
                reader_channels: 1,
                read_buf: vec![0.0; chunk],
                mapped: vec![0.0; chunk * channels],
                reader_frame: 0,
                eos: false,
            }),
            ring,
            config,
            markers: ArrayQueue::new(MARKER_CAPACITY),
            pending_seek: AtomicU64::new(NONE),
            segment: AtomicU64::new(0),
            finished_segment: AtomicU64::new(NONE),
            swap_waiters: AtomicUsize::new(0),
            looping: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            started: AtomicBool::new(false),
            has_reader: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            play_position: AtomicU64::new(0),
            total_frames: AtomicU64::new(NONE),
            reader_sample_rate: AtomicU32::new(0),
            output_sample_rate: AtomicU32::new(0),
            underruns: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
            waker: OnceLock::new(),
        });

        Self {
            shared,
            segment: 0,
            segment_start: 0,
            segment_position: 0,
            segment_total: None,
            segment_end: NONE,
        }
    }

    /// Register the prefetch task with a worker
    ///
    /// A source is attached to at most one worker; later calls only return
    /// a new id without changing the waker.
    pub fn attach(&self, worker: &PrefetchWorker) -> ClientId {
        let client: Arc<dyn TimeSliceClient> = self.shared.clone();
        let id = worker.register(client);
        if self.shared.waker.set(worker.waker(id)).is_err() {
            warn!(?id, "Streaming source already attached to a worker");
        }
        id
    }

    /// Control handle usable from any non-real-time thread
    pub fn handle(&self) -> StreamingHandle {
        StreamingHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn channels(&self) -> usize {
        self.shared.ring.channels()
    }

    /// Fill `buffer` and return the number of frames taken from the ring
    ///
    /// The rest of the buffer is silence.
    pub fn pull_frames(&mut self, buffer: &mut [f32]) -> usize {
        // Loaded before the markers so a newer seek or swap wins over this block
        let seen = self.shared.play_position.load(Ordering::Acquire);
        let seeking = self.shared.pending_seek.load(Ordering::Acquire) != NONE;
        self.drain_markers();

        let shared = &*self.shared;
        let ring = &shared.ring;
        debug_assert_eq!(buffer.len() % ring.channels(), 0);

        if !shared.playing.load(Ordering::Acquire) {
            buffer.fill(0.0);
            self.publish_position(seen, seeking, false);
            return 0;
        }

        let end = self.segment_end;
        let frames = ring.pop_until(buffer, end);
        let produced = frames * ring.channels();
        buffer[produced..].fill(0.0);

        let at_end = end != NONE && ring.read_position() >= end;
        if at_end {
            shared.finished_segment.store(self.segment, Ordering::Release);
        } else if produced < buffer.len() && shared.has_reader.load(Ordering::Acquire) {
            shared.underruns.fetch_add(1, Ordering::Relaxed);
        }

        shared.frames_played.fetch_add(frames as u64, Ordering::Relaxed);
        self.publish_position(seen, seeking, at_end);
        frames
    }

    fn drain_markers(&mut self) {
        while let Some(marker) = self.shared.markers.pop() {
            match marker {
                Marker::Segment {
                    id,
                    at,
                    position,
                    total,
                } => {
                    self.shared.ring.skip_to(at);
                    self.segment = id;
                    self.segment_start = at;
                    self.segment_position = position;
                    self.segment_total = total;
                    self.segment_end = NONE;
                }
                Marker::End { id, at } if id == self.segment => self.segment_end = at,
                Marker::End { .. } => {}
            }
        }
    }

    /// Report the position reached by this block
    ///
    /// Skipped while a seek is pending, and lost to any position stored by
    /// a control thread since `seen` was loaded.
    fn publish_position(&self, seen: u64, seeking: bool, finished: bool) {
        if seeking || self.shared.pending_seek.load(Ordering::Acquire) != NONE {
            return;
        }

        let read = self.shared.ring.read_position();
        let mut position = self.segment_position + read.saturating_sub(self.segment_start);

        if let Some(total) = self.segment_total.filter(|&t| t > 0) {
            position = if position >= total && !finished {
                position % total
            } else {
                position.min(total - 1)
            };
        }

        let _ = self.shared.play_position.compare_exchange(
            seen,
            position,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

impl BlockProducer for BufferedStreamingSource {
    fn prepare(&mut self, spec: PlaybackSpec) -> Result<()> {
        if spec.stride() != self.channels() {
            return Err(AudioError::InvalidConfiguration(format!(
                "streaming source produces {} channels, output wants {}",
                self.channels(),
                spec.stride()
            )));
        }

        let rate = spec.sample_rate.hz();
        self.shared.output_sample_rate.store(rate, Ordering::Release);

        let reader_rate = self.shared.reader_sample_rate.load(Ordering::Acquire);
        if self.shared.has_reader.load(Ordering::Acquire) && reader_rate != rate {
            warn!(
                reader_rate,
                output_rate = rate,
                "Reader sample rate differs from output, playing without resampling"
            );
        }

        info!(
            sample_rate = rate,
            channels = spec.stride(),
            block_frames = spec.block_frames,
            "Streaming source prepared"
        );
        Ok(())
    }

    fn release(&mut self) {
        debug!("Streaming source released");
    }

    fn pull_block(&mut self, buffer: &mut [f32]) {
        self.pull_frames(buffer);
    }
}

impl std::fmt::Debug for BufferedStreamingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedStreamingSource")
            .field("ring", &self.shared.ring)
            .field("segment", &self.segment)
            .field("segment_start", &self.segment_start)
            .field("segment_position", &self.segment_position)
            .finish()
    }
}

// ============================================================================
// CONTROL HANDLE
// ============================================================================

/// Cloneable control surface of a [`BufferedStreamingSource`]
#[derive(Clone)]
pub struct StreamingHandle {
    shared: Arc<StreamShared>,
}

impl StreamingHandle {
    /// Swap the reader, or clear it with `None`
    ///
    /// Buffered data of the old reader is discarded by the callback. Waits for
    /// at most one in-flight read; the old reader is dropped after the swap,
    /// outside the task lock.
    pub fn set_reader(&self, reader: Option<Box<dyn AudioReader>>) {
        let installed = reader.is_some();
        self.shared.swap_waiters.fetch_add(1, Ordering::AcqRel);
        let old = self.shared.install_reader(reader);
        self.shared.swap_waiters.fetch_sub(1, Ordering::AcqRel);
        drop(old);

        debug!(installed, "Reader swapped");
        self.shared.wake();
    }

    pub fn set_looping(&self, looping: bool) {
        self.shared.looping.store(looping, Ordering::Release);
        // A stream parked at its end may now continue
        self.shared.wake();
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    /// Request a seek to reader frame `frame`
    ///
    /// Positions past a known end are clamped to the end. The stream leaves
    /// Finished right away and reports the target until the seek is applied.
    pub fn set_position(&self, frame: u64) {
        let frame = frame.min(NONE - 1);
        self.shared.pending_seek.store(frame, Ordering::Release);

        let shown = match self.shared.total() {
            Some(total) if total > 0 => frame.min(total - 1),
            _ => frame,
        };
        self.shared.play_position.store(shown, Ordering::Release);
        self.shared.wake();
    }

    /// Whether a seek request has not been applied yet
    pub fn is_seeking(&self) -> bool {
        self.shared.pending_seek.load(Ordering::Acquire) != NONE
    }

    pub fn start(&self) {
        self.shared.started.store(true, Ordering::Release);
        self.shared.playing.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.shared.playing.store(false, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    /// Playback position in reader frames
    pub fn position(&self) -> u64 {
        self.shared.play_position.load(Ordering::Acquire)
    }

    /// Reader length in frames, `None` when unknown or without a reader
    pub fn total_frames(&self) -> Option<u64> {
        self.shared.total()
    }

    /// Sample rate of the installed reader
    pub fn sample_rate(&self) -> Option<u32> {
        match self.shared.reader_sample_rate.load(Ordering::Acquire) {
            0 => None,
            rate => Some(rate),
        }
    }

    pub fn has_reader(&self) -> bool {
        self.shared.has_reader.load(Ordering::Acquire)
    }

    /// Whether the latest segment has played to its end
    pub fn has_finished(&self) -> bool {
        let shared = &*self.shared;
        !self.is_seeking()
            && shared.finished_segment.load(Ordering::Acquire) == shared.segment.load(Ordering::Acquire)
    }

    pub fn state(&self) -> StreamState {
        let shared = &*self.shared;
        if !shared.has_reader.load(Ordering::Acquire) {
            StreamState::Empty
        } else if self.has_finished() {
            StreamState::Finished
        } else if shared.playing.load(Ordering::Acquire) {
            StreamState::Playing
        } else if shared.started.load(Ordering::Acquire) {
            StreamState::Paused
        } else {
            StreamState::Loaded
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            underruns: self.shared.underruns.load(Ordering::Relaxed),
            read_errors: self.shared.read_errors.load(Ordering::Relaxed),
            frames_buffered: self.shared.ring.buffered(),
            frames_played: self.shared.frames_played.load(Ordering::Relaxed),
        }
    }

    /// Stop prefetching; the worker drops the task on its next slice
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake();
    }
}

impl std::fmt::Debug for StreamingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingHandle")
            .field("state", &self.state())
            .field("position", &self.position())
            .field("total_frames", &self.total_frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballad_core::domain::reader::{MemoryReader, ReaderError};
    use crossbeam::channel::{unbounded, Receiver, Sender};
    use std::thread;
    use std::time::Instant;

    fn config() -> StreamingConfig {
        StreamingConfig {
            ring_capacity_frames: 4096,
            low_water_frames: 1024,
            read_chunk_frames: 256,
        }
    }

    /// Mono ramp: sample `n` is `n / len`
    fn ramp(frames: usize) -> Vec<f32> {
        (0..frames).map(|n| n as f32 / frames as f32).collect()
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Pull blocks until `count` real frames were collected
    fn collect_frames(source: &mut BufferedStreamingSource, count: usize, block: usize) -> Vec<f32> {
        let channels = source.channels();
        let mut out = Vec::with_capacity(count * channels);
        let mut buffer = vec![0.0; block * channels];
        let deadline = Instant::now() + Duration::from_secs(5);

        while out.len() < count * channels && Instant::now() < deadline {
            let frames = source.pull_frames(&mut buffer);
            out.extend_from_slice(&buffer[..frames * channels]);
            if frames == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        out.truncate(count * channels);
        out
    }

    struct FailingReader;

    impl AudioReader for FailingReader {
        fn channels(&self) -> u16 {
            1
        }

        fn sample_rate(&self) -> u32 {
            44100
        }

        fn total_frames(&self) -> Option<u64> {
            None
        }

        fn seek(&mut self, _frame: u64) -> std::result::Result<(), ReaderError> {
            Ok(())
        }

        fn read_frames(&mut self, _buffer: &mut [f32]) -> std::result::Result<usize, ReaderError> {
            Err(ReaderError::Decode("corrupt block".to_string()))
        }
    }

    /// Endless reader that takes `delay` per read and counts its reads
    struct SlowReader {
        reads: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl AudioReader for SlowReader {
        fn channels(&self) -> u16 {
            1
        }

        fn sample_rate(&self) -> u32 {
            44100
        }

        fn total_frames(&self) -> Option<u64> {
            None
        }

        fn seek(&mut self, _frame: u64) -> std::result::Result<(), ReaderError> {
            Ok(())
        }

        fn read_frames(&mut self, buffer: &mut [f32]) -> std::result::Result<usize, ReaderError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            buffer.fill(0.1);
            Ok(buffer.len())
        }
    }

    /// Reader whose every read parks until released, then reports end of stream
    struct GatedReader {
        entered: Sender<()>,
        gate: Receiver<()>,
    }

    impl AudioReader for GatedReader {
        fn channels(&self) -> u16 {
            1
        }

        fn sample_rate(&self) -> u32 {
            44100
        }

        fn total_frames(&self) -> Option<u64> {
            Some(1_000)
        }

        fn seek(&mut self, _frame: u64) -> std::result::Result<(), ReaderError> {
            Ok(())
        }

        fn read_frames(&mut self, _buffer: &mut [f32]) -> std::result::Result<usize, ReaderError> {
            let _ = self.entered.send(());
            let _ = self.gate.recv();
            Ok(0)
        }
    }

    #[test]
    fn test_map_channels() {
        let mut out = [0.0; 4];
        map_channels(&[0.5, -0.5], 1, &mut out, 2);
        assert_eq!(out, [0.5, 0.5, -0.5, -0.5]);

        let mut out = [0.0; 2];
        map_channels(&[1.0, 0.0, 0.5, 0.5], 2, &mut out, 1);
        assert_eq!(out, [0.5, 0.5]);

        let mut out = [9.0; 3];
        map_channels(&[0.1, 0.2], 2, &mut out, 3);
        assert_eq!(out, [0.1, 0.2, 0.0]);
    }

    #[test]
    fn test_empty_source_is_silent() {
        let mut source = BufferedStreamingSource::new(&config(), 2);
        let handle = source.handle();
        assert_eq!(handle.state(), StreamState::Empty);

        handle.start();
        let mut buffer = vec![1.0; 64];
        assert_eq!(source.pull_frames(&mut buffer), 0);
        assert!(buffer.iter().all(|&s| s == 0.0));
        assert_eq!(handle.stats().underruns, 0);
    }

    #[test]
    fn test_stopped_source_does_not_advance() {
        let worker = PrefetchWorker::spawn("test-prefetch").unwrap();
        let mut source = BufferedStreamingSource::new(&config(), 1);
        source.attach(&worker);
        let handle = source.handle();
        handle.set_reader(Some(Box::new(MemoryReader::new(ramp(1000), 1, 44100))));
        assert_eq!(handle.state(), StreamState::Loaded);
        assert!(wait_for(|| handle.stats().frames_buffered == 1000));

        let mut buffer = vec![1.0; 128];
        assert_eq!(source.pull_frames(&mut buffer), 0);
        assert!(buffer.iter().all(|&s| s == 0.0));
        assert_eq!(handle.stats().frames_buffered, 1000);
        assert_eq!(handle.position(), 0);
    }

    #[test]
    fn test_plays_reader_to_end_exactly() {
        let worker = PrefetchWorker::spawn("test-prefetch").unwrap();
        let mut source = BufferedStreamingSource::new(&config(), 1);
        source.attach(&worker);
        let handle = source.handle();

        let data = ramp(10_000);
        handle.set_reader(Some(Box::new(MemoryReader::new(data.clone(), 1, 44100))));
        handle.start();

        let mut played = Vec::new();
        let mut buffer = vec![0.0; 512];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.has_finished() && Instant::now() < deadline {
            let frames = source.pull_frames(&mut buffer);
            assert!(frames <= 512);
            played.extend_from_slice(&buffer[..frames]);
        }

        assert!(handle.has_finished());
        assert_eq!(handle.state(), StreamState::Finished);
        assert_eq!(played, data);
        assert_eq!(handle.stats().frames_played, 10_000);
        assert_eq!(handle.position(), 9_999);
    }

    #[test]
    fn test_looping_repeats_identically() {
        let worker = PrefetchWorker::spawn("test-prefetch").unwrap();
        let mut source = BufferedStreamingSource::new(&config(), 1);
        source.attach(&worker);
        let handle = source.handle();

        let data = ramp(3_000);
        handle.set_looping(true);
        handle.set_reader(Some(Box::new(MemoryReader::new(data.clone(), 1, 44100))));
        handle.start();

        let played = collect_frames(&mut source, 9_000, 512);
        assert_eq!(played.len(), 9_000);
        for repetition in played.chunks(3_000) {
            assert_eq!(repetition, data.as_slice());
        }
        assert!(!handle.has_finished());
        assert!(handle.position() < 3_000);
    }

    #[test]
    fn test_seek_serves_data_from_new_position() {
        let worker = PrefetchWorker::spawn("test-prefetch").unwrap();
        let mut source = BufferedStreamingSource::new(&config(), 1);
        source.attach(&worker);
        let handle = source.handle();

        let data = ramp(20_000);
        handle.set_reader(Some(Box::new(MemoryReader::new(data.clone(), 1, 44100))));
        assert!(wait_for(|| handle.stats().frames_buffered > 0));

        handle.set_position(12_345);
        assert!(wait_for(|| !handle.is_seeking()));
        handle.start();

        let played = collect_frames(&mut source, 1_000, 250);
        assert_eq!(played.as_slice(), &data[12_345..13_345]);
        let position = handle.position();
        assert!((13_345..13_345 + 250).contains(&position), "position {position}");
    }

    #[test]
    fn test_seek_from_finished_resumes() {
        let worker = PrefetchWorker::spawn("test-prefetch").unwrap();
        let mut source = BufferedStreamingSource::new(&config(), 1);
        source.attach(&worker);
        let handle = source.handle();

        let data = ramp(2_000);
        handle.set_reader(Some(Box::new(MemoryReader::new(data.clone(), 1, 44100))));
        handle.start();
        collect_frames(&mut source, 2_000, 512);
        let mut buffer = vec![0.0; 64];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.has_finished() && Instant::now() < deadline {
            source.pull_frames(&mut buffer);
        }
        assert_eq!(handle.state(), StreamState::Finished);

        handle.set_position(0);
        assert!(wait_for(|| !handle.is_seeking()));
        let played = collect_frames(&mut source, 2_000, 512);
        assert_eq!(played, data);
    }

    #[test]
    fn test_reader_swap_discards_old_data() {
        let worker = PrefetchWorker::spawn("test-prefetch").unwrap();
        let mut source = BufferedStreamingSource::new(&config(), 1);
        source.attach(&worker);
        let handle = source.handle();

        handle.set_reader(Some(Box::new(MemoryReader::new(vec![0.25; 8_000], 1, 44100))));
        assert!(wait_for(|| handle.stats().frames_buffered > 0));

        handle.set_looping(true);
        handle.set_reader(Some(Box::new(MemoryReader::new(vec![0.75; 500], 1, 44100))));
        assert!(handle.is_looping());
        handle.start();

        let played = collect_frames(&mut source, 1_500, 128);
        assert!(played.iter().all(|&s| s == 0.75));
    }

    #[test]
    fn test_mono_reader_fills_stereo_output() {
        let worker = PrefetchWorker::spawn("test-prefetch").unwrap();
        let mut source = BufferedStreamingSource::new(&config(), 2);
        source.attach(&worker);
        let handle = source.handle();

        handle.set_reader(Some(Box::new(MemoryReader::new(ramp(600), 1, 44100))));
        handle.start();

        let played = collect_frames(&mut source, 600, 100);
        for frame in played.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
        assert_eq!(played[2 * 300], 0.5);
    }

    #[test]
    fn test_read_error_ends_stream() {
        let worker = PrefetchWorker::spawn("test-prefetch").unwrap();
        let mut source = BufferedStreamingSource::new(&config(), 1);
        source.attach(&worker);
        let handle = source.handle();

        handle.set_reader(Some(Box::new(FailingReader)));
        handle.start();
        assert!(wait_for(|| handle.stats().read_errors == 1));

        let mut buffer = vec![1.0; 64];
        assert_eq!(source.pull_frames(&mut buffer), 0);
        assert!(buffer.iter().all(|&s| s == 0.0));
        assert!(handle.has_finished());
        assert_eq!(handle.stats().underruns, 0);
    }

    #[test]
    fn test_prepare_rejects_channel_mismatch() {
        let mut source = BufferedStreamingSource::new(&config(), 2);
        assert!(source.prepare(PlaybackSpec::new(44100, 2, 256)).is_ok());
        assert!(matches!(
            source.prepare(PlaybackSpec::new(44100, 1, 256)),
            Err(AudioError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_transport_states() {
        let source = BufferedStreamingSource::new(&config(), 1);
        let handle = source.handle();
        handle.set_reader(Some(Box::new(MemoryReader::new(ramp(100), 1, 44100))));

        assert_eq!(handle.state(), StreamState::Loaded);
        handle.start();
        assert_eq!(handle.state(), StreamState::Playing);
        handle.stop();
        assert_eq!(handle.state(), StreamState::Paused);
        handle.set_reader(None);
        assert_eq!(handle.state(), StreamState::Empty);
        assert_eq!(handle.total_frames(), None);
    }

    #[test]
    fn test_full_ring_below_low_water_waits() {
        let config = StreamingConfig {
            ring_capacity_frames: 4096,
            low_water_frames: 3000,
            read_chunk_frames: 2048,
        };
        let mut source = BufferedStreamingSource::new(&config, 1);
        let handle = source.handle();
        handle.set_reader(Some(Box::new(MemoryReader::new(ramp(10_000), 1, 44100))));

        assert_eq!(source.shared.use_time_slice(), Some(FILL_DELAY));
        assert_eq!(handle.stats().frames_buffered, 4096);

        handle.start();
        let mut buffer = vec![0.0; 1500];
        assert_eq!(source.pull_frames(&mut buffer), 1500);
        handle.stop();

        // Below low water, but a chunk no longer fits
        for _ in 0..10 {
            assert_eq!(source.shared.use_time_slice(), Some(FILL_DELAY));
        }
        assert_eq!(handle.stats().frames_buffered, 2596);
    }

    #[test]
    fn test_reader_swap_waits_for_at_most_one_read() {
        let worker = PrefetchWorker::spawn("test-prefetch").unwrap();
        let source = BufferedStreamingSource::new(&config(), 1);
        source.attach(&worker);
        let handle = source.handle();

        let reads = Arc::new(AtomicUsize::new(0));
        handle.set_reader(Some(Box::new(SlowReader {
            reads: Arc::clone(&reads),
            delay: Duration::from_millis(100),
        })));
        assert!(wait_for(|| reads.load(Ordering::SeqCst) >= 1));

        let before = reads.load(Ordering::SeqCst);
        let started = Instant::now();
        handle.set_reader(None);
        let waited = started.elapsed();

        assert!(reads.load(Ordering::SeqCst) - before <= 1);
        assert!(waited < Duration::from_millis(250), "swap waited {waited:?}");

        let after = reads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(reads.load(Ordering::SeqCst), after);
        assert_eq!(handle.state(), StreamState::Empty);
    }

    #[test]
    fn test_seek_is_applied_after_at_most_one_read() {
        let worker = PrefetchWorker::spawn("test-prefetch").unwrap();
        let source = BufferedStreamingSource::new(&config(), 1);
        source.attach(&worker);
        let handle = source.handle();

        let reads = Arc::new(AtomicUsize::new(0));
        handle.set_reader(Some(Box::new(SlowReader {
            reads: Arc::clone(&reads),
            delay: Duration::from_millis(100),
        })));
        assert!(wait_for(|| reads.load(Ordering::SeqCst) >= 1));

        let started = Instant::now();
        handle.set_position(5_000);
        assert!(wait_for(|| !handle.is_seeking()));
        let waited = started.elapsed();
        assert!(waited < Duration::from_millis(250), "seek waited {waited:?}");
    }

    #[test]
    fn test_seek_during_end_of_stream_read_does_not_finish() {
        let mut source = BufferedStreamingSource::new(&config(), 1);
        let handle = source.handle();
        let (entered_tx, entered_rx) = unbounded();
        let (gate_tx, gate_rx) = unbounded();
        handle.set_reader(Some(Box::new(GatedReader {
            entered: entered_tx,
            gate: gate_rx,
        })));
        handle.start();

        let shared = Arc::clone(&source.shared);
        let slice = thread::spawn(move || shared.use_time_slice());

        // The seek lands while the read that hits end of stream is in flight
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.set_position(500);
        assert!(!handle.has_finished());
        gate_tx.send(()).unwrap();

        // The next read starts from the sought position
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!handle.is_seeking());
        let mut buffer = vec![0.0; 64];
        source.pull_frames(&mut buffer);
        assert!(!handle.has_finished());
        assert_ne!(handle.state(), StreamState::Finished);
        assert_eq!(handle.position(), 500);

        gate_tx.send(()).unwrap();
        slice.join().unwrap();
        source.pull_frames(&mut buffer);
        assert!(handle.has_finished());
        assert_eq!(handle.state(), StreamState::Finished);
        assert_eq!(handle.position(), 500);
    }

    #[test]
    fn test_segment_end_applies_to_its_own_segment() {
        let mut source = BufferedStreamingSource::new(&config(), 1);
        let handle = source.handle();
        let data = ramp(1_000);
        handle.set_reader(Some(Box::new(MemoryReader::new(data.clone(), 1, 44100))));

        // Four chunks, then end of stream on the next slice
        source.shared.use_time_slice();
        source.shared.use_time_slice();
        assert_eq!(handle.stats().frames_buffered, 1_000);

        handle.start();
        let mut buffer = vec![0.0; 200];
        assert_eq!(source.pull_frames(&mut buffer), 200);

        handle.set_position(900);
        source.shared.use_time_slice();

        let mut buffer = vec![1.0; 512];
        assert_eq!(source.pull_frames(&mut buffer), 100);
        assert_eq!(&buffer[..100], &data[900..]);
        assert!(buffer[100..].iter().all(|&s| s == 0.0));
        assert!(handle.has_finished());
        assert_eq!(handle.position(), 999);
    }

    #[test]
    fn test_underrun_pads_with_silence() {
        let mut source = BufferedStreamingSource::new(&config(), 1);
        let handle = source.handle();
        handle.set_reader(Some(Box::new(MemoryReader::new(ramp(10_000), 1, 44100))));
        source.shared.use_time_slice();
        assert_eq!(handle.stats().frames_buffered, 1024);

        handle.start();
        let mut buffer = vec![1.0; 768];
        assert_eq!(source.pull_frames(&mut buffer), 768);
        assert_eq!(source.pull_frames(&mut buffer), 256);
        assert!(buffer[256..].iter().all(|&s| s == 0.0));

        let stats = handle.stats();
        assert_eq!(stats.underruns, 1);
        assert_eq!(stats.frames_played, 1024);
        assert!(!handle.has_finished());
        assert_eq!(handle.state(), StreamState::Playing);
    }

    #[test]
    fn test_position_holds_seek_target_until_applied() {
        let mut source = BufferedStreamingSource::new(&config(), 1);
        let handle = source.handle();
        handle.set_reader(Some(Box::new(MemoryReader::new(ramp(10_000), 1, 44100))));
        source.shared.use_time_slice();

        handle.start();
        let mut buffer = vec![0.0; 512];
        source.pull_frames(&mut buffer);
        assert_eq!(handle.position(), 512);

        handle.set_position(5_000);
        assert_eq!(handle.position(), 5_000);
        source.pull_frames(&mut buffer);
        assert_eq!(handle.position(), 5_000);

        source.shared.use_time_slice();
        source.pull_frames(&mut buffer);
        assert_eq!(handle.position(), 5_512);
    }
}
