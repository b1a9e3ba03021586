//! Turning an [`ExecutionResult`] into displayable blocks.

use std::fmt::Write as _;

use crate::engine::{ExecutionResult, PlotImage};

/// Shown when a script never called the display operation.
pub const NO_PLOTS_NOTICE: &str =
    "Note: no plt.show() calls were found, so no plots are displayed.";

/// One displayable piece of run output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// Advisory hint, not an error.
    Notice(String),
    Text(String),
    Image(PlotImage),
    Error(String),
}

/// Lay out a result in presentation order: the no-plots notice, each
/// segment's text followed by its plot, leftover text, then the error.
pub fn render(result: &ExecutionResult) -> Vec<Block> {
    let mut blocks = Vec::new();

    if !result.has_plots() {
        blocks.push(Block::Notice(NO_PLOTS_NOTICE.to_string()));
    }

    for segment in &result.segments {
        if !segment.text.is_empty() {
            blocks.push(Block::Text(segment.text.clone()));
        }
        if let Some(image) = &segment.image {
            blocks.push(Block::Image(image.clone()));
        }
    }

    if !result.trailing_text.is_empty() {
        blocks.push(Block::Text(result.trailing_text.clone()));
    }

    if let Some(error) = result.error_text() {
        blocks.push(Block::Error(error));
    }

    blocks
}

/// Terminal rendition. Images are listed by index and size; `image_label`
/// may map an image index to something more useful, such as the file it
/// was saved to.
pub fn render_plain(
    result: &ExecutionResult,
    image_label: impl Fn(usize, &PlotImage) -> Option<String>,
) -> String {
    let mut out = String::new();
    let mut image_index = 0;

    for block in render(result) {
        match block {
            Block::Notice(text) => {
                let _ = writeln!(out, "! {text}");
            }
            Block::Text(text) => {
                let _ = writeln!(out, "{text}");
            }
            Block::Image(image) => {
                image_index += 1;
                let label = image_label(image_index, &image).unwrap_or_else(|| {
                    format!("{}, {} bytes", image.mime_type(), image.bytes().len())
                });
                let _ = writeln!(out, "[plot {image_index}: {label}]");
            }
            Block::Error(text) => {
                let _ = writeln!(out, "{text}");
            }
        }
    }

    out
}
