//! Terminal grid snapshots as pushed by a Beach host.
//!
//! The binary payload is a fixed 28-byte header followed by a row stream of
//! run-length blank rows and content rows. [`decode`] is total: malformed or
//! truncated input yields a [`ProtocolError`], never a panic and never a
//! partially built snapshot. The structured form served by the polling
//! endpoint goes through [`decode_json`] and lands in the same [`Snapshot`].

pub mod envelope;
pub mod error;
pub mod json;
pub mod model;
pub mod width;
pub mod wire;

pub use envelope::{FRAME_SNAPSHOT, StreamFrame};
pub use error::ProtocolError;
pub use json::decode_json;
pub use model::{Cell, Color, Glyph, MAX_DIMENSION, Snapshot, SnapshotHeader};
pub use width::{glyph_width, has_emoji_presentation};
pub use wire::{
    CellEncoding, ColorEncoding, GlyphEncoding, HEADER_LEN, MAGIC, MIN_PAYLOAD_LEN, StyledCell,
    VERSION, decode, encode,
};
