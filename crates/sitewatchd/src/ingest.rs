//! Detection ingest records.
//!
//! The daemon consumes JSON Lines on stdin, one record per frame. The
//! same format is replayed from files by the CLI.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use sitewatch_core::{Detection, Frame};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("malformed frame record: {0}")]
pub struct RecordError(#[from] serde_json::Error);

/// One frame's worth of primary-detector output for one stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameRecord {
    pub stream: String,
    /// Milliseconds from the stream epoch.
    pub timestamp_ms: u64,
    pub detections: Vec<Detection>,
    /// Path to the frame image, when the producer saves frames for the
    /// secondary verifier.
    #[serde(default)]
    pub image: Option<PathBuf>,
}

impl FrameRecord {
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn frame(&self) -> Frame {
        Frame {
            timestamp: Duration::from_millis(self.timestamp_ms),
            detections: self.detections.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitewatch_core::ObjectClass;

    #[test]
    fn test_parse_record() {
        let record = FrameRecord::parse(
            r#"{
                "stream": "cam-1",
                "timestamp_ms": 1500,
                "detections": [
                    {"class": "person", "confidence": 0.92,
                     "bbox": {"x_min": 10.0, "y_min": 20.0, "x_max": 210.0, "y_max": 520.0}},
                    {"class": "no_helmet", "confidence": 0.7,
                     "bbox": {"x_min": 40.0, "y_min": 20.0, "x_max": 120.0, "y_max": 110.0}}
                ],
                "image": "/tmp/cam-1/1500.jpg"
            }"#,
        )
        .unwrap();
        assert_eq!(record.stream, "cam-1");
        assert_eq!(record.frame().timestamp, Duration::from_millis(1500));
        assert_eq!(record.detections.len(), 2);
        assert_eq!(record.detections[1].class, ObjectClass::NoHelmet);
        assert!(record.image.is_some());
    }

    #[test]
    fn test_image_is_optional() {
        let record = FrameRecord::parse(
            r#"{"stream": "cam-2", "timestamp_ms": 0, "detections": []}"#,
        )
        .unwrap();
        assert!(record.image.is_none());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(FrameRecord::parse("not json").is_err());
        assert!(FrameRecord::parse(r#"{"stream": "cam-1"}"#).is_err());
    }
}
