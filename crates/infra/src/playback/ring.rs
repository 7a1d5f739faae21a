//! Lock-free prefetch ring for real-time playback
//!
//! Single producer (the prefetch worker) and single consumer (the audio
//! callback). Samples are stored as `f32` bit patterns in `AtomicU32` slots,
//! so the structure needs no `unsafe`.
//!
//! Cursors count frames since creation and never wrap in practice, which
//! keeps "how far apart are they" a plain subtraction and lets the whole
//! capacity be used (no empty slot is reserved).

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Fixed-capacity circular store of interleaved frames
pub struct PrefetchRing {
    /// `capacity * channels` sample slots
    slots: Box<[AtomicU32]>,

    /// Next frame the producer writes (cache-padded to prevent false sharing)
    write_pos: CachePadded<AtomicU64>,

    /// Next frame the consumer reads
    read_pos: CachePadded<AtomicU64>,

    channels: usize,

    /// Capacity in frames (power of 2)
    capacity: usize,

    /// Mask for fast modulo operation (capacity - 1)
    mask: u64,
}

impl PrefetchRing {
    /// Create a ring holding `capacity` frames of `channels` samples
    ///
    /// Capacity will be rounded up to the next power of 2.
    pub fn with_capacity(capacity: usize, channels: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let channels = channels.max(1);

        let slots = (0..capacity * channels)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            write_pos: CachePadded::new(AtomicU64::new(0)),
            read_pos: CachePadded::new(AtomicU64::new(0)),
            channels,
            capacity,
            mask: capacity as u64 - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frame index the producer writes next
    #[inline]
    pub fn write_position(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Frame index the consumer reads next
    #[inline]
    pub fn read_position(&self) -> u64 {
        self.read_pos.load(Ordering::Acquire)
    }

    /// Frames written but not yet consumed
    pub fn buffered(&self) -> usize {
        let read = self.read_position();
        let write = self.write_position();
        write.saturating_sub(read) as usize
    }

    /// Frames the producer can write without overtaking the consumer
    pub fn free(&self) -> usize {
        self.capacity - self.buffered()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered() == 0
    }

    #[inline]
    fn slot(&self, frame: u64, channel: usize) -> &AtomicU32 {
        &self.slots[(frame & self.mask) as usize * self.channels + channel]
    }

    /// Append interleaved frames (producer)
    ///
    /// Returns the number of frames actually written.
    pub fn push(&self, samples: &[f32]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let free = self.capacity - (write - read) as usize;
        let frames = (samples.len() / self.channels).min(free);

        for (i, frame) in samples.chunks_exact(self.channels).take(frames).enumerate() {
            for (ch, sample) in frame.iter().enumerate() {
                self.slot(write + i as u64, ch).store(sample.to_bits(), Ordering::Relaxed);
            }
        }

        // Release publishes the slot stores before the cursor moves
        self.write_pos.store(write + frames as u64, Ordering::Release);
        frames
    }

    /// Consume interleaved frames into `out` (consumer)
    pub fn pop(&self, out: &mut [f32]) -> usize {
        self.pop_until(out, u64::MAX)
    }

    /// Consume frames, never reading at or past frame index `limit`
    pub fn pop_until(&self, out: &mut [f32], limit: u64) -> usize {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire).min(limit);

        let available = write.saturating_sub(read) as usize;
        let frames = (out.len() / self.channels).min(available);

        for (i, frame) in out.chunks_exact_mut(self.channels).take(frames).enumerate() {
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = f32::from_bits(self.slot(read + i as u64, ch).load(Ordering::Relaxed));
            }
        }

        // Release hands the slots back to the producer
        self.read_pos.store(read + frames as u64, Ordering::Release);
        frames
    }

    /// Discard everything before frame index `frame` (consumer)
    ///
    /// The read cursor only moves forward and never passes the write cursor.
    pub fn skip_to(&self, frame: u64) {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        let target = frame.min(write).max(read);
        self.read_pos.store(target, Ordering::Release);
    }
}

impl std::fmt::Debug for PrefetchRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchRing")
            .field("capacity", &self.capacity)
            .field("channels", &self.channels)
            .field("read_pos", &self.read_position())
            .field("write_pos", &self.write_position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_ring_basic() {
        let ring = PrefetchRing::with_capacity(16, 1);

        let input = vec![1.0, 2.0, 3.0, 4.0];
        let mut output = vec![0.0; 4];

        assert_eq!(ring.push(&input), 4);
        assert_eq!(ring.buffered(), 4);
        assert_eq!(ring.pop(&mut output), 4);
        assert_eq!(output, input);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ring_wraparound() {
        let ring = PrefetchRing::with_capacity(8, 1);

        assert_eq!(ring.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), 6);

        let mut first = vec![0.0; 4];
        assert_eq!(ring.pop(&mut first), 4);
        assert_eq!(first, vec![1.0, 2.0, 3.0, 4.0]);

        // Full capacity is usable: 2 buffered, 6 free
        assert_eq!(ring.push(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0]), 6);
        assert_eq!(ring.free(), 0);

        let mut rest = vec![0.0; 10];
        assert_eq!(ring.pop(&mut rest), 8);
        assert_eq!(rest[..8], [5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_ring_capacity_rounding() {
        let ring = PrefetchRing::with_capacity(10, 2);
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.free(), 16);
    }

    #[test]
    fn test_ring_interleaved_frames() {
        let ring = PrefetchRing::with_capacity(4, 2);

        // Trailing partial frame is ignored
        assert_eq!(ring.push(&[0.1, 0.2, 0.3, 0.4, 0.5]), 2);

        let mut out = vec![0.0; 3];
        assert_eq!(ring.pop(&mut out), 1);
        assert_eq!(out[..2], [0.1, 0.2]);
    }

    #[test]
    fn test_ring_pop_until_limit() {
        let ring = PrefetchRing::with_capacity(8, 1);
        ring.push(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut out = vec![0.0; 8];
        assert_eq!(ring.pop_until(&mut out, 3), 3);
        assert_eq!(ring.pop_until(&mut out, 3), 0);
        assert_eq!(ring.read_position(), 3);
    }

    #[test]
    fn test_ring_skip_to() {
        let ring = PrefetchRing::with_capacity(8, 1);
        ring.push(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        ring.skip_to(3);
        let mut out = vec![0.0; 1];
        ring.pop(&mut out);
        assert_eq!(out[0], 4.0);

        // Never backwards, never past the writer
        ring.skip_to(1);
        assert_eq!(ring.read_position(), 4);
        ring.skip_to(100);
        assert_eq!(ring.read_position(), 5);
    }

    #[test]
    fn test_ring_concurrent_sequence() {
        const TOTAL: usize = 200_000;
        let ring = Arc::new(PrefetchRing::with_capacity(256, 2));

        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut next = 0usize;
                while next < TOTAL {
                    let chunk: Vec<f32> = (next..(next + 37).min(TOTAL))
                        .flat_map(|i| [i as f32, -(i as f32)])
                        .collect();
                    let written = ring.push(&chunk);
                    next += written;
                    if written == 0 {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0usize;
        let mut out = vec![0.0; 2 * 64];
        while expected < TOTAL {
            let frames = ring.pop(&mut out);
            assert!(ring.buffered() <= ring.capacity());
            for frame in out[..frames * 2].chunks_exact(2) {
                assert_eq!(frame[0], expected as f32);
                assert_eq!(frame[1], -(expected as f32));
                expected += 1;
            }
            if frames == 0 {
                std::thread::yield_now();
            }
        }

        producer.join().unwrap();
        assert!(ring.is_empty());
    }

    proptest! {
        #[test]
        fn prop_ring_preserves_order(
            ops in proptest::collection::vec((any::<bool>(), 1usize..20), 1..100)
        ) {
            let ring = PrefetchRing::with_capacity(16, 1);
            let mut model = std::collections::VecDeque::new();
            let mut counter = 0.0f32;

            for (is_push, n) in ops {
                if is_push {
                    let samples: Vec<f32> = (0..n).map(|i| counter + i as f32).collect();
                    let written = ring.push(&samples);
                    prop_assert_eq!(written, n.min(16 - model.len()));
                    model.extend(samples[..written].iter().copied());
                    counter += written as f32;
                } else {
                    let mut out = vec![0.0; n];
                    let read = ring.pop(&mut out);
                    prop_assert_eq!(read, n.min(model.len()));
                    for sample in &out[..read] {
                        prop_assert_eq!(Some(*sample), model.pop_front());
                    }
                }
                prop_assert!(ring.buffered() <= ring.capacity());
                prop_assert_eq!(ring.buffered(), model.len());
            }
        }
    }
}
