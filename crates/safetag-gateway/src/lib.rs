pub mod connection;
pub mod rooms;

pub use connection::GatewayContext;
pub use rooms::{Rooms, user_room};
