//! Drawing events carried over the data channel

use serde::{Deserialize, Serialize};

/// One pointer sample of a stroke
///
/// `end_line` marks the pen being lifted; its coordinates are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawEvent {
    pub offset_x: f64,
    pub offset_y: f64,
    pub end_line: bool,
}

impl DrawEvent {
    pub fn point(offset_x: f64, offset_y: f64) -> Self {
        Self {
            offset_x,
            offset_y,
            end_line: false,
        }
    }

    pub fn end_line(offset_x: f64, offset_y: f64) -> Self {
        Self {
            offset_x,
            offset_y,
            end_line: true,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// What a remote event means for the path being rendered
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StrokeUpdate {
    /// Start a new path at this point
    Begin { x: f64, y: f64 },
    /// Extend the current path to this point
    Extend { x: f64, y: f64 },
    /// Close the current path
    End,
}

/// Turns the remote event stream into path operations
#[derive(Debug, Default)]
pub struct StrokeAssembler {
    drawing: bool,
}

impl StrokeAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` for a terminator with no open path
    pub fn apply(&mut self, event: &DrawEvent) -> Option<StrokeUpdate> {
        if event.end_line {
            let was_drawing = std::mem::replace(&mut self.drawing, false);
            return was_drawing.then_some(StrokeUpdate::End);
        }

        let (x, y) = (event.offset_x, event.offset_y);
        if self.drawing {
            Some(StrokeUpdate::Extend { x, y })
        } else {
            self.drawing = true;
            Some(StrokeUpdate::Begin { x, y })
        }
    }

    pub fn is_drawing(&self) -> bool {
        self.drawing
    }
}
