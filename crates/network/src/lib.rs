#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
//! Peer directory and wire messages for the cedar sync protocols.
//!
//! The transport itself (streams, dialing, identify) belongs to the embedding
//! host. This crate tracks what the sync core needs to know about peers —
//! connection status, protocol support, network membership and claimed
//! heads — and defines the hello and chainsync message layouts.

pub mod messages;
pub use messages::{
    ChainSyncRequest, ChainSyncResponse, HelloMessage, RequestOptions, ResponseStatus,
    TipsetBundle, CHAINSYNC_PROTOCOL_ID, HELLO_PROTOCOL_ID,
};

pub mod peers;
pub use peers::{ClaimedHead, GetPeerOptions, PeerDirectory, PeerStatus, PeerUpdate};
