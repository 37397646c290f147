//! Risk controls applied while an episode replays.
//!
//! - Maximum drawdown tracking and knock-out detection

mod mdd;

pub use mdd::DrawdownTracker;
