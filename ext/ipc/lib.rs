// Copyright 2018-2025 the Deno authors. MIT license.

pub mod connection;
pub mod framing;
pub mod server;
pub mod session;
pub mod transport;

pub use connection::Connection;
pub use framing::read_frame;
pub use framing::write_frame;
pub use server::Server;
pub use session::Session;
pub use session::SessionError;
pub use transport::ConnectionStream;
pub use transport::Listener;
