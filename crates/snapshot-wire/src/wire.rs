use crate::error::ProtocolError;
use crate::model::{Cell, Color, Glyph, GridBuilder, Snapshot, SnapshotHeader};
use crate::width::glyph_width;

pub const MAGIC: u16 = 0x5654;
pub const VERSION: u8 = 1;
/// Bytes occupied by the named header fields plus the reserved word.
pub const HEADER_LEN: usize = 28;
/// Hosts always send at least this much; anything shorter is rejected before
/// the header is looked at.
pub const MIN_PAYLOAD_LEN: usize = 32;

const ROW_RUN: u8 = 0xFE;
const ROW_CONTENT: u8 = 0xFD;

const CELL_EXTENDED: u8 = 0x80;
const CELL_UNICODE: u8 = 0x40;
const CELL_FG: u8 = 0x20;
const CELL_BG: u8 = 0x10;
const CELL_FG_RGB: u8 = 0x08;
const CELL_BG_RGB: u8 = 0x04;
const CELL_CHAR_MASK: u8 = 0x03;

const MAX_GLYPH_BYTES: usize = u8::MAX as usize;
const MAX_RUN: usize = u8::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlyphEncoding {
    Space,
    /// One raw byte, taken as a code point.
    Ascii,
    /// Length-prefixed UTF-8.
    Utf8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorEncoding {
    Palette,
    Rgb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StyledCell {
    pub glyph: GlyphEncoding,
    pub foreground: Option<ColorEncoding>,
    pub background: Option<ColorEncoding>,
    pub extended_attrs: bool,
}

/// Cell type byte, validated. Flag combinations that make no sense on the
/// wire collapse to the nearest meaningful layout instead of driving reads
/// of fields that are not there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellEncoding {
    Blank,
    Styled(StyledCell),
}

impl CellEncoding {
    pub fn from_tag(tag: u8) -> Self {
        if tag == 0 {
            return CellEncoding::Blank;
        }
        let glyph = if tag & CELL_CHAR_MASK == 0 {
            GlyphEncoding::Space
        } else if tag & CELL_UNICODE != 0 {
            GlyphEncoding::Utf8
        } else {
            GlyphEncoding::Ascii
        };
        let color = |present: u8, rgb: u8| {
            (tag & present != 0).then_some(if tag & rgb != 0 {
                ColorEncoding::Rgb
            } else {
                ColorEncoding::Palette
            })
        };
        CellEncoding::Styled(StyledCell {
            glyph,
            foreground: color(CELL_FG, CELL_FG_RGB),
            background: color(CELL_BG, CELL_BG_RGB),
            extended_attrs: tag & CELL_EXTENDED != 0,
        })
    }

    pub fn tag(&self) -> u8 {
        let CellEncoding::Styled(styled) = self else {
            return 0;
        };
        let mut tag = match styled.glyph {
            GlyphEncoding::Space => 0,
            GlyphEncoding::Ascii => 1,
            GlyphEncoding::Utf8 => CELL_UNICODE | 1,
        };
        match styled.foreground {
            Some(ColorEncoding::Palette) => tag |= CELL_FG,
            Some(ColorEncoding::Rgb) => tag |= CELL_FG | CELL_FG_RGB,
            None => {}
        }
        match styled.background {
            Some(ColorEncoding::Palette) => tag |= CELL_BG,
            Some(ColorEncoding::Rgb) => tag |= CELL_BG | CELL_BG_RGB,
            None => {}
        }
        if styled.extended_attrs {
            tag |= CELL_EXTENDED;
        }
        if tag == 0 {
            // A bare styled space still needs a non-zero tag to survive.
            tag = CELL_UNICODE;
        }
        tag
    }

    pub fn for_cell(cell: &Cell) -> Self {
        if cell.is_blank() {
            return CellEncoding::Blank;
        }
        let glyph = match &cell.glyph {
            Glyph::Char(' ') => GlyphEncoding::Space,
            Glyph::Char(ch) if ch.is_ascii() => GlyphEncoding::Ascii,
            _ => GlyphEncoding::Utf8,
        };
        let color = |color: Option<Color>| {
            color.map(|color| match color {
                Color::Palette(_) => ColorEncoding::Palette,
                Color::Rgb { .. } => ColorEncoding::Rgb,
            })
        };
        CellEncoding::Styled(StyledCell {
            glyph,
            foreground: color(cell.foreground),
            background: color(cell.background),
            extended_attrs: cell.attributes.is_some(),
        })
    }
}

/// Decodes one binary snapshot body (envelope already stripped).
pub fn decode(bytes: &[u8]) -> Result<Snapshot, ProtocolError> {
    if bytes.len() < MIN_PAYLOAD_LEN {
        return Err(ProtocolError::Truncated);
    }
    let mut cursor = Cursor::new(bytes);
    let header = read_header(&mut cursor)?;

    let mut grid = GridBuilder::new(&header);
    while !grid.is_full() {
        let Some(marker) = cursor.next_u8() else {
            break;
        };
        match marker {
            ROW_RUN => {
                let count = cursor.read_u8()?;
                grid.push_blank_rows(count as usize);
            }
            ROW_CONTENT => {
                let count = cursor.read_u16()? as usize;
                let mut row = Vec::with_capacity(count.min(grid.cols()));
                for _ in 0..count {
                    let cell = decode_cell(&mut cursor)?;
                    if row.len() < grid.cols() {
                        row.push(cell);
                    }
                }
                grid.push_row(row);
            }
            _ => break,
        }
    }
    Ok(grid.finish(header))
}

/// Reference encoder producing the host's layout. Blank rows collapse into
/// runs, trailing blank cells are trimmed, and short payloads are padded to
/// [`MIN_PAYLOAD_LEN`].
pub fn encode(snapshot: &Snapshot) -> Vec<u8> {
    let header = snapshot.header();
    let mut buf = Vec::with_capacity(MIN_PAYLOAD_LEN.max(HEADER_LEN + snapshot.grid().len() * 4));
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.push(VERSION);
    buf.push(0);
    buf.extend_from_slice(&header.cols.to_le_bytes());
    buf.extend_from_slice(&header.rows.to_le_bytes());
    buf.extend_from_slice(&header.viewport_y.to_le_bytes());
    buf.extend_from_slice(&header.cursor_x.to_le_bytes());
    buf.extend_from_slice(&header.cursor_y.to_le_bytes());
    buf.extend_from_slice(&[0; 4]);

    let mut blank_rows = 0usize;
    for row in snapshot.grid() {
        let used = row
            .iter()
            .rposition(|cell| !cell.is_blank())
            .map_or(0, |last| last + 1);
        if used == 0 {
            blank_rows += 1;
            continue;
        }
        encode_blank_rows(&mut buf, &mut blank_rows);
        buf.push(ROW_CONTENT);
        buf.extend_from_slice(&(used as u16).to_le_bytes());
        for cell in &row[..used] {
            encode_cell(&mut buf, cell);
        }
    }
    encode_blank_rows(&mut buf, &mut blank_rows);

    if buf.len() < MIN_PAYLOAD_LEN {
        buf.resize(MIN_PAYLOAD_LEN, 0);
    }
    buf
}

fn read_header(cursor: &mut Cursor<'_>) -> Result<SnapshotHeader, ProtocolError> {
    let magic = cursor.read_u16()?;
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }
    let version = cursor.read_u8()?;
    if version != VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let _flags = cursor.read_u8()?;
    let header = SnapshotHeader {
        cols: cursor.read_u32()?,
        rows: cursor.read_u32()?,
        viewport_y: cursor.read_i32()?,
        cursor_x: cursor.read_i32()?,
        cursor_y: cursor.read_i32()?,
    };
    cursor.read_bytes(4)?;
    header.validate()?;
    Ok(header)
}

fn decode_cell(cursor: &mut Cursor<'_>) -> Result<Cell, ProtocolError> {
    let styled = match CellEncoding::from_tag(cursor.read_u8()?) {
        CellEncoding::Blank => return Ok(Cell::blank()),
        CellEncoding::Styled(styled) => styled,
    };

    let glyph = match styled.glyph {
        GlyphEncoding::Space => Glyph::SPACE,
        GlyphEncoding::Ascii => Glyph::Char(char::from(cursor.read_u8()?)),
        GlyphEncoding::Utf8 => {
            let len = cursor.read_u8()? as usize;
            match std::str::from_utf8(cursor.read_bytes(len)?) {
                Ok(text) => Glyph::new(text),
                Err(_) => Glyph::Char('?'),
            }
        }
    };
    let width = match styled.glyph {
        GlyphEncoding::Utf8 => glyph_width(&glyph),
        _ => 1,
    };
    let foreground = styled
        .foreground
        .map(|encoding| decode_color(cursor, encoding))
        .transpose()?;
    let background = styled
        .background
        .map(|encoding| decode_color(cursor, encoding))
        .transpose()?;
    let attributes = if styled.extended_attrs {
        Some(cursor.read_u8()?)
    } else {
        None
    };

    Ok(Cell {
        glyph,
        width,
        foreground,
        background,
        attributes,
    })
}

fn decode_color(cursor: &mut Cursor<'_>, encoding: ColorEncoding) -> Result<Color, ProtocolError> {
    match encoding {
        ColorEncoding::Palette => Ok(Color::Palette(cursor.read_u8()?)),
        ColorEncoding::Rgb => {
            let [r, g, b] = cursor.read_array::<3>()?;
            Ok(Color::Rgb { r, g, b })
        }
    }
}

fn encode_blank_rows(buf: &mut Vec<u8>, pending: &mut usize) {
    while *pending > 0 {
        let run = (*pending).min(MAX_RUN);
        buf.push(ROW_RUN);
        buf.push(run as u8);
        *pending -= run;
    }
}

fn encode_cell(buf: &mut Vec<u8>, cell: &Cell) {
    let encoding = CellEncoding::for_cell(cell);
    buf.push(encoding.tag());
    let CellEncoding::Styled(styled) = encoding else {
        return;
    };
    match styled.glyph {
        GlyphEncoding::Space => {}
        GlyphEncoding::Ascii => buf.push(cell.glyph.first_char() as u8),
        GlyphEncoding::Utf8 => {
            let mut text = String::new();
            cell.glyph.push_to(&mut text);
            let mut len = text.len().min(MAX_GLYPH_BYTES);
            while !text.is_char_boundary(len) {
                len -= 1;
            }
            buf.push(len as u8);
            buf.extend_from_slice(&text.as_bytes()[..len]);
        }
    }
    for color in [cell.foreground, cell.background].into_iter().flatten() {
        match color {
            Color::Palette(index) => buf.push(index),
            Color::Rgb { r, g, b } => buf.extend_from_slice(&[r, g, b]),
        }
    }
    if let Some(attributes) = cell.attributes {
        buf.push(attributes);
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Marker reads: running dry here is the end of the stream, not an error.
    fn next_u8(&mut self) -> Option<u8> {
        let value = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(value)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.next_u8().ok_or(ProtocolError::Truncated)
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        self.read_array().map(u16::from_le_bytes)
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.read_array().map(u32::from_le_bytes)
    }

    fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.read_array().map(i32::from_le_bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}
