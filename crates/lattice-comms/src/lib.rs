//! Outbound seams of a lattice region process.
//!
//! Everything a region says to the outside world goes through two traits:
//! [`InterregionChannel`] for peer region processes (create/close child
//! presences, entity transfers, the bounded viewer-connection wait) and
//! [`ClientEventQueue`] for routing pushes to the locally connected
//! viewer. The presence and transit crates depend only on these
//! contracts; [`HttpInterregionChannel`] is the production transport.

mod caps;
mod channel;
mod client;
mod http;

pub use caps::{full_caps_seed_url, generate_caps_path};
pub use channel::{AgentDescriptor, ChannelError, ChildAgentUpdate, InterregionChannel};
pub use client::ClientEventQueue;
pub use http::HttpInterregionChannel;
