use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Pixel size of the frames submitted by the real-time loop. Boxes in a
/// frame response are expressed in this space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for FrameSize {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Fresh,
    Rotten,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Fresh => "fresh",
            Label::Rotten => "rotten",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Corner coordinates in the pixel space of the submitted image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
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

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn scale(&self, scale_x: f32, scale_y: f32) -> Self {
        Self {
            x1: self.x1 * scale_x,
            y1: self.y1 * scale_y,
            x2: self.x2 * scale_x,
            y2: self.y2 * scale_y,
        }
    }

    /// Maps a box reported for a `frame`-sized capture onto a display surface
    /// of the given size. Overlays drawn without this step land in the wrong
    /// place whenever the display and the frame differ.
    pub fn to_display(&self, frame: FrameSize, display_width: f32, display_height: f32) -> Self {
        if frame.width == 0 || frame.height == 0 {
            return *self;
        }
        self.scale(
            display_width / frame.width as f32,
            display_height / frame.height as f32,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub label: Label,
    #[serde(deserialize_with = "deserialize_confidence")]
    pub confidence: u8,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "bbox")]
    pub bounding_box: BoundingBox,
}

/// The backend reports confidence as a percentage; some model versions send
/// it as a float, so accept any number in range and round it.
fn deserialize_confidence<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !(0.0..=100.0).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "confidence {} is outside 0..=100",
            value
        )));
    }
    Ok(value.round() as u8)
}

/// Fresh and rotten tallies over a set of detections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCounts {
    pub fresh_count: u32,
    pub rotten_count: u32,
}

impl LabelCounts {
    pub fn tally(detections: &[DetectionResult]) -> Self {
        detections
            .iter()
            .fold(LabelCounts::default(), |mut counts, detection| {
                match detection.label {
                    Label::Fresh => counts.fresh_count += 1,
                    Label::Rotten => counts.rotten_count += 1,
                }
                counts
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_detection() {
        let json = r#"{"label":"rotten","confidence":81.4,"emoji":"x","message":"Do not eat","bbox":[10,20,110,220]}"#;
        let detection: DetectionResult = serde_json::from_str(json).unwrap();

        assert_eq!(detection.label, Label::Rotten);
        assert_eq!(detection.confidence, 81);
        assert_eq!(detection.message, "Do not eat");
        assert_eq!(detection.bounding_box.width(), 100.0);
        assert_eq!(detection.bounding_box.height(), 200.0);
    }

    #[test]
    fn test_reject_out_of_range_confidence() {
        let json = r#"{"label":"fresh","confidence":140,"message":"","bbox":[0,0,1,1]}"#;
        assert!(serde_json::from_str::<DetectionResult>(json).is_err());
    }

    #[test]
    fn test_reject_unknown_label() {
        let json = r#"{"label":"ripe","confidence":50,"message":"","bbox":[0,0,1,1]}"#;
        assert!(serde_json::from_str::<DetectionResult>(json).is_err());
    }

    #[test]
    fn test_to_display_rescales_from_frame_space() {
        let bbox = BoundingBox::from([64.0, 48.0, 320.0, 240.0]);
        let frame = FrameSize::default();
        let scaled = bbox.to_display(frame, 1280.0, 960.0);
        assert_eq!(scaled, BoundingBox::from([128.0, 96.0, 640.0, 480.0]));

        let unchanged = bbox.to_display(frame, 640.0, 480.0);
        assert_eq!(unchanged, bbox);
    }

    #[test]
    fn test_to_display_uses_configured_frame_size() {
        let bbox = BoundingBox::from([32.0, 24.0, 160.0, 120.0]);
        let small = FrameSize::new(320, 240);

        let scaled = bbox.to_display(small, 640.0, 480.0);
        assert_eq!(scaled, BoundingBox::from([64.0, 48.0, 320.0, 240.0]));

        let unchanged = bbox.to_display(small, 320.0, 240.0);
        assert_eq!(unchanged, bbox);
    }

    #[test]
    fn test_tally() {
        let detection = |label| DetectionResult {
            label,
            confidence: 90,
            message: String::new(),
            bounding_box: BoundingBox::from([0.0, 0.0, 1.0, 1.0]),
        };
        let counts = LabelCounts::tally(&[
            detection(Label::Fresh),
            detection(Label::Rotten),
            detection(Label::Fresh),
        ]);
        assert_eq!(counts.fresh_count, 2);
        assert_eq!(counts.rotten_count, 1);
    }
}
