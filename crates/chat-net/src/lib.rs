mod codec;
mod connection;
mod error;
mod reactor;
mod session;

pub use codec::{LEN_PREFIX_SIZE, decode_string, decode_u32, encode_string, encode_u32};
pub use connection::{Connection, DrainOutcome, ReceiveOutcome};
pub use error::{ChatError, FatalError, ShortRead};
pub use reactor::Reactor;
pub use session::{Session, SessionEffect, SessionState};
