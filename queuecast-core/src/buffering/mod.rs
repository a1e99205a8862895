//! Sample buffering: the capture ring, typed chunks, and transport merging.
//!
//! The ring is a `ringbuf::HeapRb<f32>` whose `push_slice` is wait-free and
//! safe to call from a real-time capture callback.

pub mod chunk;
pub mod merge;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the capture backend.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the interval pump thread.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Default ring capacity: 2^20 f32 samples ≈ 21.8 s of mono audio at 48 kHz.
pub const DEFAULT_RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}
