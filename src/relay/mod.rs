//! Measurement relay
//!
//! A relay exposes one instrument to other processes over TCP. Requests are
//! short tokens (`I`, `AI0`, `SV 1.5`) decoded through a [`CommandTable`];
//! replies carry one `f32` in either the legacy or the framed encoding.

pub mod client;
pub mod codec;
pub mod command;
pub mod dispatcher;
pub mod server;

pub use client::{ClientSettings, RelayClient};
pub use codec::{Framing, Reply, ReplyStatus};
pub use command::{ChannelId, Command, CommandEntry, CommandTable, Preset, Route, RouteKind};
pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherSettings};
pub use server::{RelayHandle, RelayServer, RelaySettings, RelayState};
