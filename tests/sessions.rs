//! Session integration tests.
//!
//! - P2P sessions between two and three players
//! - Spectator sessions watching a match
//! - The `Session` trait and `SessionSlot`

#[path = "common/mod.rs"]
mod common;

mod sessions {
    pub mod p2p;
    pub mod session_trait;
    pub mod spectator;
}
