//! Per-camera trackers.
//!
//! Two trackers cooperate on every camera: a fast motion/IoU tracker
//! ([`PrimaryTracker`]) that runs on every processed frame, and an appearance
//! tracker ([`AppearanceTracker`]) that re-associates the primary's residuals
//! at a lower rate using embedding similarity. Both emit camera-local track
//! ids, from disjoint ranges, so the global resolver never needs to know
//! which stage produced an id.
//!
//! This crate is pure: no I/O, no clocks. Time is the caller's frame counter.

mod assignment;
mod primary;
mod secondary;

pub use assignment::{greedy_assign, Assignment};
pub use primary::{LocalTrack, PrimaryOutput, PrimaryTracker};
pub use secondary::{AppearanceTracker, SecondaryMatch};

/// First local id handed out by the appearance tracker. Primary ids count up
/// from 1, so the two ranges never collide in practice.
pub const SECONDARY_ID_BASE: u32 = 0x0100_0000;
