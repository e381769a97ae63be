//! Position-mapping side-file parsing
//!
//! The on-disk format is pluggable behind [`SyncNodeSource`]; the default
//! implementation reads the standard SyncTeX text format, plain or
//! gzip-compressed. Records for files other than the compiled source are
//! dropped, scaled points become PDF points, and box records carry higher
//! confidence than bare point records.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::debug;

use super::sync::SyncNode;

const SP_PER_PT: f32 = 65536.0;
const BOX_CONFIDENCE: f32 = 1.0;
const POINT_CONFIDENCE: f32 = 0.5;

/// Errors raised while loading a position-mapping side file
#[derive(Debug, thiserror::Error)]
pub enum SyncParseError {
    #[error("cannot read sync file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed sync file: {0}")]
    Malformed(String),

    #[error("sync file names no input matching {0}")]
    UnknownSource(PathBuf),
}

/// Source of sync nodes for one compiled document.
///
/// `source_path` identifies the main source file whose lines the nodes
/// should map; records attributed to other inputs are not returned.
pub trait SyncNodeSource: Send + Sync {
    fn load(&self, sync_path: &Path, source_path: &Path) -> Result<Vec<SyncNode>, SyncParseError>;
}

/// Default parser for the SyncTeX text format
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncTexParser;

impl SyncNodeSource for SyncTexParser {
    fn load(&self, sync_path: &Path, source_path: &Path) -> Result<Vec<SyncNode>, SyncParseError> {
        let text = read_maybe_gzipped(sync_path)?;
        parse_synctex(&text, source_path)
    }
}

/// Sniff the gzip magic rather than trusting the extension; engines differ
/// on whether they compress the side file.
fn read_maybe_gzipped(path: &Path) -> Result<String, SyncParseError> {
    let io_err = |source| SyncParseError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = BufReader::new(File::open(path).map_err(io_err)?);
    let magic = file.fill_buf().map_err(io_err)?;
    let gzipped = magic.len() >= 2 && magic[0] == 0x1f && magic[1] == 0x8b;

    let mut text = String::new();
    if gzipped {
        GzDecoder::new(file)
            .read_to_string(&mut text)
            .map_err(io_err)?;
    } else {
        file.read_to_string(&mut text).map_err(io_err)?;
    }
    Ok(text)
}

fn parse_synctex(text: &str, source_path: &Path) -> Result<Vec<SyncNode>, SyncParseError> {
    let mut unit = 1.0f32;
    let mut magnification = 1000.0f32;
    let mut x_offset = 0.0f32;
    let mut y_offset = 0.0f32;
    let mut source_tag: Option<u32> = None;

    let source_name = source_path.file_name();
    let mut lines = text.lines();

    // preamble: Input tag map plus global scaling
    for line in lines.by_ref() {
        if line == "Content:" {
            break;
        }
        if let Some(rest) = line.strip_prefix("Input:") {
            let Some((tag, path)) = rest.split_once(':') else {
                continue;
            };
            let tag: u32 = tag
                .parse()
                .map_err(|_| SyncParseError::Malformed(format!("input tag in {line:?}")))?;
            let path = Path::new(path.trim());
            if path == source_path || path.file_name() == source_name {
                source_tag = Some(tag);
            }
        } else if let Some(rest) = line.strip_prefix("Unit:") {
            unit = rest.trim().parse().unwrap_or(1.0);
        } else if let Some(rest) = line.strip_prefix("Magnification:") {
            magnification = rest.trim().parse().unwrap_or(1000.0);
        } else if let Some(rest) = line.strip_prefix("X Offset:") {
            x_offset = rest.trim().parse().unwrap_or(0.0);
        } else if let Some(rest) = line.strip_prefix("Y Offset:") {
            y_offset = rest.trim().parse().unwrap_or(0.0);
        }
    }

    let Some(source_tag) = source_tag else {
        return Err(SyncParseError::UnknownSource(source_path.to_path_buf()));
    };

    let to_pt = {
        let scale = unit * (magnification / 1000.0) / SP_PER_PT;
        move |sp: f32, offset: f32| (sp + offset) * scale
    };

    let mut nodes = Vec::new();
    let mut current_page: Option<usize> = None;

    for line in lines {
        if line.starts_with("Postamble") {
            break;
        }
        let Some(first) = line.chars().next() else {
            continue;
        };
        match first {
            '{' => {
                let page: usize = line[1..]
                    .trim()
                    .parse()
                    .map_err(|_| SyncParseError::Malformed(format!("page record {line:?}")))?;
                // records use 1-based page numbers
                current_page = page.checked_sub(1);
            }
            '}' => current_page = None,
            '(' | '[' => {
                if let (Some(page), Some(raw)) =
                    (current_page, parse_record(&line[1..], BOX_CONFIDENCE))
                {
                    push_for_source(&mut nodes, raw, page, source_tag, &to_pt, x_offset, y_offset);
                }
            }
            'h' | 'v' | 'x' | 'k' | 'g' | '$' => {
                if let (Some(page), Some(raw)) =
                    (current_page, parse_record(&line[1..], POINT_CONFIDENCE))
                {
                    push_for_source(&mut nodes, raw, page, source_tag, &to_pt, x_offset, y_offset);
                }
            }
            _ => {}
        }
    }

    debug!(
        "parsed {} sync nodes for {}",
        nodes.len(),
        source_path.display()
    );
    Ok(nodes)
}

/// Raw record fields before unit conversion
struct RawRecord {
    tag: u32,
    line: u32,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    depth: f32,
    confidence: f32,
}

/// Record body: `tag,line:x,y[:W,H,D]`. Point records omit the size triple
/// (or carry a lone kern width), leaving a zero-extent rectangle.
fn parse_record(body: &str, confidence: f32) -> Option<RawRecord> {
    let mut sections = body.split(':');
    let ident = sections.next()?;
    let (tag, line) = ident.split_once(',')?;
    let tag: u32 = tag.trim().parse().ok()?;
    // a trailing `,column` on the line field is rare but legal
    let line: u32 = line.split(',').next()?.trim().parse().ok()?;

    let point = sections.next()?;
    let (x, y) = point.split_once(',')?;
    let x: f32 = x.trim().parse().ok()?;
    let y: f32 = y.trim().parse().ok()?;

    let mut width = 0.0;
    let mut height = 0.0;
    let mut depth = 0.0;
    if let Some(size) = sections.next() {
        let mut parts = size.split(',');
        width = parts.next().and_then(|v| v.trim().parse().ok()).unwrap_or(0.0);
        height = parts.next().and_then(|v| v.trim().parse().ok()).unwrap_or(0.0);
        depth = parts.next().and_then(|v| v.trim().parse().ok()).unwrap_or(0.0);
    }

    Some(RawRecord {
        tag,
        line,
        x,
        y,
        width,
        height,
        depth,
        confidence,
    })
}

fn push_for_source(
    nodes: &mut Vec<SyncNode>,
    raw: RawRecord,
    page: usize,
    source_tag: u32,
    to_pt: &impl Fn(f32, f32) -> f32,
    x_offset: f32,
    y_offset: f32,
) {
    if raw.tag != source_tag || raw.line == 0 {
        return;
    }
    // y is the baseline; the rectangle spans height above and depth below
    let height_pt = to_pt(raw.height + raw.depth, 0.0);
    nodes.push(SyncNode {
        source_line: raw.line,
        page_index: page,
        x: to_pt(raw.x, x_offset),
        y: to_pt(raw.y, y_offset) - to_pt(raw.height, 0.0),
        width: to_pt(raw.width, 0.0),
        height: height_pt,
        confidence: raw.confidence,
    });
}
