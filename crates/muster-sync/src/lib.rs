// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread coordination primitives.
//!
//! Three independent monitors (mutex + condvar), each owning its counters:
//! - `CountDownLatch`: one-shot gate opened by counting down to zero
//! - `CyclicBarrier`: fixed-size reusable rendezvous with an optional action
//! - `Phaser`: multi-phase barrier with runtime registration and a
//!   termination predicate
//!
//! Blocking calls come in three flavours: unbounded, with a timeout, and
//! cancellable through a `CancelToken`. Failures are returned as `SyncError`.
//! Events are emitted through `tracing`; installing a subscriber is up to the
//! caller.

pub mod barrier;
pub mod cancel;
pub mod error;
pub mod latch;
mod monitor;
pub mod phaser;

pub use barrier::CyclicBarrier;
pub use cancel::CancelToken;
pub use error::{Result, SyncError};
pub use latch::CountDownLatch;
pub use phaser::{Phaser, PhaserSnapshot};
