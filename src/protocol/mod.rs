//! Wire format, routes and payload schemas for the broker side of the bridge

pub mod messages;
pub mod schema;
pub mod topics;

pub use messages::*;
pub use schema::*;
pub use topics::*;
