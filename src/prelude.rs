//! Re-exports of the types most game loops need.
//!
//! ```rust
//! use rollback_netplay::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use std::net::SocketAddr;
//!
//! #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
//! struct PadInput {
//!     buttons: u8,
//! }
//!
//! struct GameConfig;
//!
//! impl Config for GameConfig {
//!     type Input = PadInput;
//!     type Address = SocketAddr;
//! }
//!
//! let builder = SessionBuilder::<GameConfig>::new().with_sync_config(SyncConfig::lan());
//! ```

// Sessions
pub use crate::sessions::builder::SessionBuilder;
pub use crate::sessions::p2p_session::P2PSession;
pub use crate::sessions::p2p_spectator_session::SpectatorSession;
pub use crate::{EventDrain, Session, SessionSlot};

// Traits the application implements
pub use crate::{Config, DatagramSocket, RollbackEngine};

pub use crate::UdpNonBlockingSocket;

pub use crate::{Frame, Player, PlayerHandle, PlayerType, NULL_FRAME};

pub use crate::{InputStatus, NetplayEvent, SessionState};

pub use crate::NetplayError;

pub use crate::{GameInput, InputVec};

pub use crate::NetworkStats;

pub use crate::sessions::config::{ProtocolConfig, SpectatorConfig, SyncConfig};
