//! collectd binary network protocol: types.db, packet decoding and the UDP listener.

pub mod listener;
pub mod parser;
pub mod typesdb;

pub use listener::{BinaryListener, ListenerStats, SharedListenerStats};
pub use parser::{DecodeError, DecodedPacket, parse_packet};
pub use typesdb::{TypesDb, TypesDbError};
