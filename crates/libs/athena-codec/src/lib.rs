pub mod message;
pub mod name;
pub mod wire;

pub use message::{CcnxMessage, ContentObject, Interest, InterestReturn, ReturnCode};
pub use name::{Name, NameSegment};
pub use wire::{
    decode, encode, get_schema_version, hash, hop_limit, min_header_length, packet_length,
    set_hop_limit, CodecError, SCHEMA_VERSION,
};
