use serde::Deserialize;

use crate::error::ProtocolError;
use crate::model::{Cell, Color, Glyph, GridBuilder, Snapshot, SnapshotHeader};
use crate::width::glyph_width;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotDocument {
    cols: u32,
    rows: u32,
    #[serde(default)]
    viewport_y: i32,
    #[serde(default)]
    cursor_x: i32,
    #[serde(default)]
    cursor_y: i32,
    #[serde(default)]
    cells: Vec<Vec<CellDocument>>,
}

#[derive(Debug, Default, Deserialize)]
struct CellDocument {
    #[serde(default, rename = "char")]
    glyph: Option<String>,
    #[serde(default)]
    fg: Option<u32>,
    #[serde(default)]
    bg: Option<u32>,
    #[serde(default)]
    attrs: Option<u8>,
}

/// Decodes the structured snapshot document served by the polling endpoint.
///
/// Cell widths are derived from the glyph exactly as on the binary path; a
/// `width` field in the document is ignored.
pub fn decode_json(bytes: &[u8]) -> Result<Snapshot, ProtocolError> {
    let document: SnapshotDocument =
        serde_json::from_slice(bytes).map_err(|err| ProtocolError::Malformed(err.to_string()))?;

    let header = SnapshotHeader {
        cols: document.cols,
        rows: document.rows,
        viewport_y: document.viewport_y,
        cursor_x: document.cursor_x,
        cursor_y: document.cursor_y,
    };
    header.validate()?;

    let mut grid = GridBuilder::new(&header);
    for row in document.cells {
        if grid.is_full() {
            break;
        }
        let cells = row
            .into_iter()
            .take(grid.cols())
            .map(convert_cell)
            .collect::<Result<Vec<_>, _>>()?;
        grid.push_row(cells);
    }
    Ok(grid.finish(header))
}

fn convert_cell(cell: CellDocument) -> Result<Cell, ProtocolError> {
    let glyph = cell
        .glyph
        .as_deref()
        .map(Glyph::new)
        .unwrap_or(Glyph::SPACE);
    let width = glyph_width(&glyph);
    Ok(Cell {
        glyph,
        width,
        foreground: cell.fg.map(unpack_color).transpose()?,
        background: cell.bg.map(unpack_color).transpose()?,
        attributes: cell.attrs,
    })
}

fn unpack_color(value: u32) -> Result<Color, ProtocolError> {
    Color::from_packed(value)
        .ok_or_else(|| ProtocolError::Malformed(format!("invalid packed color {value:#010x}")))
}
