//! Network access to a [`Store`](vt_interfaces::Store): a TCP server answering ADD, GET and
//! CONTAINS requests and a client implementing the store interface on top of it.

mod client;
pub mod config;
pub mod protocol;
mod server;

pub use client::RemoteStore;
pub use server::StoreServer;
