//! Epoch-based memory reclamation for the index cores.
//!
//! Two pieces work together:
//!
//!  - [`EpochManager`]: a ring of epochs with two tails. Transactions
//!    enter an epoch on begin and exit on commit or abort; a ticker
//!    thread advances the current epoch on a timer. `queue_tail` trails
//!    the oldest epoch that might still hold a live read-write
//!    transaction, `reclaim_tail` the oldest that might hold a live
//!    read-only one.
//!  - [`RetirementQueue`]: detached index nodes are pushed here stamped
//!    with the queue tail at retirement time, and freed once the reclaim
//!    tail has moved past that stamp.
//!
//! Epoch queue layout:
//!
//! ```text
//!  current epoch               queue tail                reclaim tail
//! /                           /                          /
//! +--------+--------+--------+--------+--------+--------+--------+-----
//! | head   | safety |  ....  |readonly| safety |  ....  |gc usage| ....
//! +--------+--------+--------+--------+--------+--------+--------+-----
//! New                                                   Old
//! ```
//!
//! Invariants:
//!  1. epochs at or older than the queue tail have no rw refs;
//!  2. epochs at or older than the reclaim tail have no ro refs;
//!  3. the reclaim tail trails the queue tail by at least the safety
//!     interval, and the queue tail trails the current epoch likewise.

mod manager;
mod retire;

pub use manager::{EpochManager, EpochTicker, EpochWatermarks, SAFETY_INTERVAL};
pub use retire::{RetirementQueue, RetirementStats};
