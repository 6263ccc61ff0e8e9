use std::fmt;

use crate::error::ProtocolError;
use crate::width::glyph_width;

/// Upper bound for both `cols` and `rows`.
pub const MAX_DIMENSION: u32 = 1000;

const RGB_TAG: u32 = 0xFF00_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Color {
    /// 256-color palette index.
    Palette(u8),
    /// 24-bit true color.
    Rgb { r: u8, g: u8, b: u8 },
}

impl Color {
    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Color::Rgb { r, g, b }
    }

    /// Packed form shared with the structured document: palette indices stay
    /// below 256, RGB values carry a non-zero top byte.
    pub fn packed(self) -> u32 {
        match self {
            Color::Palette(index) => index as u32,
            Color::Rgb { r, g, b } => RGB_TAG | (r as u32) << 16 | (g as u32) << 8 | b as u32,
        }
    }

    pub fn from_packed(value: u32) -> Option<Self> {
        if value & RGB_TAG != 0 {
            Some(Color::Rgb {
                r: (value >> 16) as u8,
                g: (value >> 8) as u8,
                b: value as u8,
            })
        } else if value <= u8::MAX as u32 {
            Some(Color::Palette(value as u8))
        } else {
            None
        }
    }
}

/// One grapheme cluster. Single scalars stay inline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Glyph {
    Char(char),
    Cluster(Box<str>),
}

impl Glyph {
    pub const SPACE: Glyph = Glyph::Char(' ');

    pub fn new(text: &str) -> Self {
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (None, _) => Glyph::SPACE,
            (Some(ch), None) => Glyph::Char(ch),
            _ => Glyph::Cluster(text.into()),
        }
    }

    pub fn first_char(&self) -> char {
        match self {
            Glyph::Char(ch) => *ch,
            Glyph::Cluster(text) => text.chars().next().unwrap_or(' '),
        }
    }

    pub fn is_space(&self) -> bool {
        matches!(self, Glyph::Char(' '))
    }

    pub fn push_to(&self, out: &mut String) {
        match self {
            Glyph::Char(ch) => out.push(*ch),
            Glyph::Cluster(text) => out.push_str(text),
        }
    }
}

impl Default for Glyph {
    fn default() -> Self {
        Glyph::SPACE
    }
}

impl From<char> for Glyph {
    fn from(ch: char) -> Self {
        Glyph::Char(ch)
    }
}

impl From<&str> for Glyph {
    fn from(text: &str) -> Self {
        Glyph::new(text)
    }
}

impl fmt::Display for Glyph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Glyph::Char(ch) => write!(f, "{ch}"),
            Glyph::Cluster(text) => f.write_str(text),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cell {
    pub glyph: Glyph,
    /// 1 or 2.
    pub width: u8,
    pub foreground: Option<Color>,
    pub background: Option<Color>,
    pub attributes: Option<u8>,
}

impl Cell {
    pub const fn blank() -> Self {
        Cell {
            glyph: Glyph::SPACE,
            width: 1,
            foreground: None,
            background: None,
            attributes: None,
        }
    }

    /// Plain cell whose width follows the emoji-presentation heuristic.
    pub fn new(glyph: impl Into<Glyph>) -> Self {
        let glyph = glyph.into();
        let width = glyph_width(&glyph);
        Cell {
            glyph,
            width,
            ..Cell::blank()
        }
    }

    pub fn with_foreground(mut self, color: Color) -> Self {
        self.foreground = Some(color);
        self
    }

    pub fn with_background(mut self, color: Color) -> Self {
        self.background = Some(color);
        self
    }

    pub fn with_attributes(mut self, attributes: u8) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn is_blank(&self) -> bool {
        *self == Cell::blank()
    }
}

impl Default for Cell {
    fn default() -> Self {
        Cell::blank()
    }
}

/// Fixed header fields shared by the binary and structured forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub cols: u32,
    pub rows: u32,
    pub viewport_y: i32,
    pub cursor_x: i32,
    pub cursor_y: i32,
}

impl SnapshotHeader {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let valid = |value: u32| value > 0 && value <= MAX_DIMENSION;
        if valid(self.cols) && valid(self.rows) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidDimensions {
                cols: self.cols,
                rows: self.rows,
            })
        }
    }
}

/// One full decoded grid. Every row holds exactly `cols` cells and there are
/// exactly `rows` rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    header: SnapshotHeader,
    cells: Vec<Vec<Cell>>,
}

impl Snapshot {
    /// Builds a snapshot from arbitrary rows, padding short rows and missing
    /// rows with blanks and dropping anything beyond the header dimensions.
    pub fn from_rows(header: SnapshotHeader, rows: Vec<Vec<Cell>>) -> Result<Self, ProtocolError> {
        header.validate()?;
        let mut grid = GridBuilder::new(&header);
        for row in rows {
            if grid.is_full() {
                break;
            }
            grid.push_row(row);
        }
        Ok(grid.finish(header))
    }

    /// A `cols` x `rows` grid of blank cells.
    pub fn blank(cols: u32, rows: u32) -> Result<Self, ProtocolError> {
        Snapshot::from_rows(
            SnapshotHeader {
                cols,
                rows,
                viewport_y: 0,
                cursor_x: 0,
                cursor_y: 0,
            },
            Vec::new(),
        )
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn cols(&self) -> u32 {
        self.header.cols
    }

    pub fn rows(&self) -> u32 {
        self.header.rows
    }

    pub fn viewport_y(&self) -> i32 {
        self.header.viewport_y
    }

    /// `(x, y)`
    pub fn cursor(&self) -> (i32, i32) {
        (self.header.cursor_x, self.header.cursor_y)
    }

    pub fn grid(&self) -> &[Vec<Cell>] {
        &self.cells
    }

    pub fn row(&self, index: usize) -> Option<&[Cell]> {
        self.cells.get(index).map(Vec::as_slice)
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&Cell> {
        self.cells.get(row).and_then(|cells| cells.get(col))
    }

    /// Plain text of each row with trailing spaces removed. Colors and
    /// attributes are dropped.
    pub fn lines(&self) -> Vec<String> {
        self.cells
            .iter()
            .map(|row| {
                let mut line = String::with_capacity(row.len());
                for cell in row {
                    cell.glyph.push_to(&mut line);
                }
                let trimmed = line.trim_end_matches(' ').len();
                line.truncate(trimmed);
                line
            })
            .collect()
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }
}

/// Accumulates rows while enforcing the `rows` x `cols` shape.
pub(crate) struct GridBuilder {
    cols: usize,
    rows: usize,
    cells: Vec<Vec<Cell>>,
}

impl GridBuilder {
    pub(crate) fn new(header: &SnapshotHeader) -> Self {
        let rows = header.rows as usize;
        Self {
            cols: header.cols as usize,
            rows,
            cells: Vec::with_capacity(rows),
        }
    }

    pub(crate) fn cols(&self) -> usize {
        self.cols
    }

    pub(crate) fn is_full(&self) -> bool {
        self.cells.len() >= self.rows
    }

    pub(crate) fn push_blank_rows(&mut self, count: usize) {
        let count = count.min(self.rows - self.cells.len());
        for _ in 0..count {
            self.cells.push(vec![Cell::blank(); self.cols]);
        }
    }

    pub(crate) fn push_row(&mut self, mut row: Vec<Cell>) {
        if self.is_full() {
            return;
        }
        row.truncate(self.cols);
        row.resize(self.cols, Cell::blank());
        self.cells.push(row);
    }

    pub(crate) fn finish(mut self, header: SnapshotHeader) -> Snapshot {
        let missing = self.rows - self.cells.len();
        self.push_blank_rows(missing);
        Snapshot {
            header,
            cells: self.cells,
        }
    }
}
