//! estuary — a concurrent chat relay server.
//!
//! One TCP listener, one task per connection, one shared registry. Clients
//! exchange public/group/private text, relay files to each other through the
//! server, and play mediated tic-tac-toe, all over a single line-oriented
//! connection.

pub mod relay;
