//! # Physics/Writer Handoff
//!
//! The physics loop hands snapshots to a background writer through a single
//! slot. The slot is either free or holds one snapshot that the writer has
//! not finished with yet.
//!
//! ```text
//! Physics thread                      Writer thread
//! ──────────────                      ─────────────
//! stage(snapshot) ──┐
//!   (blocks while   │   ┌──────────┐
//!    slot is busy)  └──▶│  slot    │──▶ take() -> Staged
//!                       └──────────┘        │ write files
//!                            ▲              ▼
//!                            └──── drop(Staged): slot free again,
//!                                  writing_finished = true
//! ```
//!
//! The staged value is moved, never shared, so the physics side can refill
//! its own buffers the moment `stage` returns.

mod handoff;

pub use handoff::{handoff_slot, HandoffStats, SlotConsumer, SlotProducer, Staged, StageError, TakeError};
