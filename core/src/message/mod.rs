// Message module: envelope types and the signing codec

pub mod codec;
pub mod types;

pub use codec::{decode_envelope, encode_envelope, sign, signing_input, verify, CodecError};
pub use types::{
    is_reserved_type, now_ms, Envelope, HandshakePayload, SharedSecret, ACK_TYPE, HELLO_TYPE,
};
