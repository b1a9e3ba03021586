//! Host-side plot sink.

use super::{OutputSegment, PlotImage};

/// Receives every plot-display call of a running script.
///
/// A sink is handed to the runner explicitly for the duration of one run;
/// nothing about it is global, so two runs never see each other's plots.
pub trait PlotSink: Send {
    /// `text` is everything printed since the previous display call (or the
    /// start of the script), untrimmed.
    fn plot(&mut self, text: &str, image: Option<PlotImage>);
}

/// Sink that keeps segments in arrival order.
#[derive(Debug, Default)]
pub struct SegmentCollector {
    segments: Vec<OutputSegment>,
}

impl SegmentCollector {
    pub fn segments(&self) -> &[OutputSegment] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<OutputSegment> {
        self.segments
    }
}

impl PlotSink for SegmentCollector {
    fn plot(&mut self, text: &str, image: Option<PlotImage>) {
        self.segments.push(OutputSegment {
            text: text.trim().to_string(),
            image,
        });
    }
}
