//! Wire protocol shared by the helper and the peers.
//!
//! All traffic between a peer and the helper is a sequence of length-prefixed
//! frames over TCP. The frame layout and the message catalogue live in
//! [`frame`] and [`message`]; the small value types they are built from live
//! in [`types`].

pub mod frame;
pub mod message;
pub mod types;

pub use frame::{read_message, write_message, FrameError, HEADER_LEN, MAX_FRAME_LEN};
pub use message::{Message, MessageKind};
pub use types::{port_add, BuddyId, Endpoint, PortAlloc, PORT_UNKNOWN};
