//! Client-side adapters for Townhall.
//!
//! - [`ChatRoom`]: direct-to-broker chat for a city or the townhall.
//! - [`UpdatesFeed`]: typed construction and resource updates.
//! - [`RelayClient`] and [`RelayFeed`]: HTTP and WebSocket access to the relay.

pub mod direct;
pub mod error;
pub mod relay;
pub mod updates;

pub use direct::{ChatRoom, Moderation, Room};
pub use error::{ClientError, Result};
pub use relay::{FeedExit, FeedHandle, ListenerId, ReconnectPolicy, RelayClient, RelayFeed};
pub use updates::UpdatesFeed;
