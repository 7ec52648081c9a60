//! The `burrowd` binary: the cluster master (worker supervision) and the
//! worker runtime (ordered startup and shutdown of the peer subsystems).

pub mod heartbeat;
pub mod logging;
pub mod master;
pub mod worker;
