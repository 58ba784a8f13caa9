// Chronos: time ordering and the in-memory time index
pub mod clock;
pub mod index;
pub mod order;

pub use clock::{Clock, FixedClock, SystemClock};
pub use index::{Entry, Hole, Replay, TimeIndex};
