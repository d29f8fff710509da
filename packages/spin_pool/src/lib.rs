#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A concurrent pool of reusable byte buffers, with the locking and pointer-safety primitives it
//! is built from.
//!
//! The centerpiece is [`ConcurrentBufferPool`]: threads claim buffers by slot index, use them as
//! typed growable lists without any further locking, and release them for the next claimant.
//! Slot indices are recycled densely and most-recently-released first, so the working set of
//! buffers stays small even under heavy churn.
//!
//! # Building blocks
//!
//! - [`RwSpinLock`] and [`RawRwSpinLock`]: a busy-waiting reader-writer lock where every
//!   blocking call takes a timeout and writers cannot be starved by readers.
//! - [`PackedIndexProvider`]: hands out small integer indices and recycles returned ones.
//! - [`BufferedPtr`]: a pointer carrying a redundant check value, so that zeroed, corrupted or
//!   torn copies can be told apart from real pointers.
//! - [`SafeHandle`] and [`HandleKey`]: pointers whose validity is governed by a shared key that
//!   can invalidate every copy at once. Collections hand these out as "rentals".
//! - [`ConcurrentList`]: a lock-guarded list with per-call, batched and unsynchronized access.
//!
//! # Claiming buffers
//!
//! ```
//! use spin_pool::ConcurrentBufferPool;
//!
//! let pool = ConcurrentBufferPool::builder()
//!     .initial_slots(4)
//!     .buffer_capacity(64)
//!     .build();
//!
//! let mut claim = pool.claim_buffer::<u16>().unwrap();
//! claim.extend_from_slice(&[1, 2, 3]).unwrap();
//! assert_eq!(claim.as_slice(), &[1, 2, 3]);
//!
//! let index = claim.index();
//! claim.release().unwrap();
//!
//! // The released slot is the first to be handed out again, and it comes back empty.
//! let again = pool.claim_buffer::<u8>().unwrap();
//! assert_eq!(again.index(), index);
//! assert!(again.is_empty());
//! ```
//!
//! # Element types
//!
//! Buffers are untyped bytes that each claimant views through its own element type. Only
//! plain-old-data types implementing [`BufferElement`] can be stored: every primitive integer and
//! float, and arrays of them.
//!
//! # Timeouts and failures
//!
//! Nothing in this crate blocks indefinitely. Operations that need a lock spin for at most a
//! configurable timeout and then fail with [`Error::LockTimeout`], leaving everything as it was.
//! The caller decides whether to retry, skip the work or report it.
//!
//! # Detecting misuse
//!
//! Lifecycle bugs such as returning an index twice or dropping a pool that still has claimed
//! slots are logged through [`tracing`]. The [`CheckPolicy`] decides whether they additionally
//! panic; by default they do in debug builds. A [`LeakTracker`] collects leak counts from the
//! structures built with it, which makes leaks assertable in tests.

mod buffered_ptr;
mod check_policy;
mod claim;
mod concurrent_list;
mod element;
mod error;
mod index_provider;
mod leak_tracker;
mod maintenance;
mod pool;
mod pool_builder;
mod rw_spin_lock;
mod safe_handle;
mod sub_buffer;

pub use buffered_ptr::*;
pub use check_policy::*;
pub use claim::*;
pub use concurrent_list::*;
pub use element::*;
pub use error::Error;
pub(crate) use error::Result;
pub use index_provider::*;
pub use leak_tracker::*;
pub use maintenance::*;
pub use pool::*;
pub use pool_builder::*;
pub use rw_spin_lock::*;
pub use safe_handle::*;
pub(crate) use sub_buffer::*;
