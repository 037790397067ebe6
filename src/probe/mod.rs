pub mod packet;
pub mod sender;
pub mod socket;
pub mod stamp;

pub use packet::*;
pub use sender::*;
pub use socket::*;
