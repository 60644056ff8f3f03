pub mod connection;
pub mod email;
pub mod messages;
pub mod validation;

pub use connection::*;
pub use email::*;
pub use messages::*;
pub use validation::*;
