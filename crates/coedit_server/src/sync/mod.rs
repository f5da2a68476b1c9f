mod connection;
pub mod protocol;
mod room;

pub use connection::{ClientConnection, Session};
pub use room::{DocumentRoom, Outbound, RoomRegistry, RoomStats};
