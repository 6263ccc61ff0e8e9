//! Outer stream framing. Every binary frame on the streaming endpoint starts
//! with one marker byte; snapshot bodies use [`FRAME_SNAPSHOT`].

pub const FRAME_SNAPSHOT: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamFrame<'a> {
    Snapshot(&'a [u8]),
    /// Marker this client does not understand. Callers skip these.
    Other(u8),
}

impl<'a> StreamFrame<'a> {
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        let (&marker, body) = frame.split_first()?;
        Some(match marker {
            FRAME_SNAPSHOT => StreamFrame::Snapshot(body),
            other => StreamFrame::Other(other),
        })
    }

    /// Prefixes a snapshot body with its envelope marker.
    pub fn wrap_snapshot(body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(FRAME_SNAPSHOT);
        frame.extend_from_slice(body);
        frame
    }
}
