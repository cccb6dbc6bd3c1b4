//! Wire primitives for the quiver storage engine.
//!
//! Everything that crosses a storage or log boundary is encoded through the
//! [`BufWriter`]/[`BufReader`] cursor traits defined here, so that the byte
//! layout of a record is owned by exactly one `encode`/`decode` pair and can
//! be round-trip tested in isolation.

pub mod buffer;
pub mod varint;

pub use buffer::{BufReader, BufWriter, DecodeError};
pub use varint::{decode_varint, encode_varint, varint_len};
