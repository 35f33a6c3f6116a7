//! Common test infrastructure shared across integration tests.
//!
//! - `stubs`: the stub `Config` and a lockstep `RollbackEngine`
//! - `test_utils`: port allocation, the in-memory network and sync helpers
//!
//! ```ignore
//! mod common;
//! use common::stubs::{LockstepEngine, StubConfig, StubInput};
//! use common::{synchronize_sessions, MemoryNetwork};
//! ```

pub mod stubs;
pub mod test_utils;

#[allow(unused_imports)]
pub use test_utils::{
    drain_events, fast_sync_config, init_tracing, poll_all, seeded_protocol_config, step,
    synchronize_sessions, test_addr, MemoryNetwork, PortAllocator, MAX_SYNC_ITERATIONS,
    POLL_INTERVAL,
};
