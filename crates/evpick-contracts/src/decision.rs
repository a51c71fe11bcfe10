use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Axis-aligned box in frame pixels, serialised as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(bbox: BoundingBox) -> Self {
        [bbox.x1, bbox.y1, bbox.x2, bbox.y2]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(alias = "name")]
    pub class_name: String,
    #[serde(alias = "conf", default)]
    pub confidence: f32,
    #[serde(alias = "xyxy")]
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_name: &str, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_name: class_name.to_string(),
            confidence,
            bbox,
        }
    }
}

/// Outcome of one event screen. `debug` is diagnostic output only and its
/// keys may change between releases.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDecision {
    pub matched_key: Option<String>,
    pub matched_key_step: Option<String>,
    pub pick_option: u32,
    pub clicked_box: Option<BoundingBox>,
    pub debug: Map<String, Value>,
}
