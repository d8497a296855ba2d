//! Docker volume plugin transport.
//!
//! [`server::PluginServer`] speaks HTTP/1.1 on a Unix socket and hands each
//! [`PluginRequest`](crate::message::PluginRequest) to
//! [`server::dispatch`].

pub mod server;

pub use server::{PluginServer, dispatch};
