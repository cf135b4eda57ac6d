//! Bounded lock-free MPMC FIFO rings for inter-thread hand-off.
//!
//! A [`Ring`] is a fixed-capacity, power-of-two-sized buffer of
//! bit-copyable payload handles, shared by any mix of producer and
//! consumer threads. Each side runs either an exclusive (one thread) or a
//! shared (CAS-reserving) protocol, chosen per side by [`Flags`] at
//! construction; transfers come in all-or-nothing *bulk* and partial
//! *burst* forms.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use rotor::{Flags, Ring};
//!
//! // Shared producer side, one consumer.
//! let ring = Arc::new(Ring::<u64>::new(1024, Flags::SC_DEQ)?);
//!
//! let producers: Vec<_> = (0..4u64)
//!     .map(|p| {
//!         let ring = Arc::clone(&ring);
//!         thread::spawn(move || {
//!             for i in 0..100u64 {
//!                 let mut item = (p << 32) | i;
//!                 while let Err(back) = ring.push(item) {
//!                     item = back;
//!                     std::hint::spin_loop();
//!                 }
//!             }
//!         })
//!     })
//!     .collect();
//!
//! let mut drained = 0;
//! while drained < 400 {
//!     let mut out = [0u64; 32];
//!     let n = ring.dequeue_burst(&mut out);
//!     if n == 0 {
//!         std::hint::spin_loop();
//!     }
//!     drained += n as usize;
//! }
//!
//! for p in producers {
//!     p.join().unwrap();
//! }
//! # Ok::<(), rotor::RingError>(())
//! ```

pub mod mem;
pub mod ring;
pub mod util;

mod trace;

pub use mem::{Extern, Heap, Mmap, RingAllocator};
pub use ring::{Flags, MAX_CAPACITY, Ring, RingError};
pub use trace::init_tracing;
