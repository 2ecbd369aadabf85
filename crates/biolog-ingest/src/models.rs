//! Domain types for biometric log ingestion
//!
//! A [`BiometricsRecord`] is the structured content of one raw log line. It
//! is built by the parser, converted by the transcoder, and discarded; it is
//! never mutated after construction.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The request type whose lines are exported and persisted
pub const IP_REQUEST_TYPE: &str = "IP";

/// Sentinel sample id for a fingerprint group whose id token did not parse
pub const UNKNOWN_SAMPLE_ID: i32 = -1;

/// One of the 10 canonical finger channels
///
/// Any finger name outside this set is ignored wherever it appears: the
/// parser drops the token and the transcoder skips the JSON key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Finger {
    RightThumb,
    RightIndex,
    RightMiddle,
    RightRing,
    RightLittle,
    LeftThumb,
    LeftIndex,
    LeftMiddle,
    LeftRing,
    LeftLittle,
}

impl Finger {
    /// All fingers, right hand first, thumb to little finger
    pub const ALL: [Finger; 10] = [
        Finger::RightThumb,
        Finger::RightIndex,
        Finger::RightMiddle,
        Finger::RightRing,
        Finger::RightLittle,
        Finger::LeftThumb,
        Finger::LeftIndex,
        Finger::LeftMiddle,
        Finger::LeftRing,
        Finger::LeftLittle,
    ];

    /// Parse the raw log token key (e.g. `RightThumb` in `RightThumb=97`)
    pub fn from_log_key(key: &str) -> Option<Self> {
        match key {
            "RightThumb" => Some(Finger::RightThumb),
            "RightIndex" => Some(Finger::RightIndex),
            "RightMiddle" => Some(Finger::RightMiddle),
            "RightRing" => Some(Finger::RightRing),
            "RightLittle" => Some(Finger::RightLittle),
            "LeftThumb" => Some(Finger::LeftThumb),
            "LeftIndex" => Some(Finger::LeftIndex),
            "LeftMiddle" => Some(Finger::LeftMiddle),
            "LeftRing" => Some(Finger::LeftRing),
            "LeftLittle" => Some(Finger::LeftLittle),
            _ => None,
        }
    }

    /// Parse the JSONL object key (e.g. `right_thumb`)
    pub fn from_json_key(key: &str) -> Option<Self> {
        Finger::ALL.iter().copied().find(|f| f.json_key() == key)
    }

    /// Key used in the JSONL `fingers` object
    pub fn json_key(&self) -> &'static str {
        match self {
            Finger::RightThumb => "right_thumb",
            Finger::RightIndex => "right_index",
            Finger::RightMiddle => "right_middle",
            Finger::RightRing => "right_ring",
            Finger::RightLittle => "right_little",
            Finger::LeftThumb => "left_thumb",
            Finger::LeftIndex => "left_index",
            Finger::LeftMiddle => "left_middle",
            Finger::LeftRing => "left_ring",
            Finger::LeftLittle => "left_little",
        }
    }

    /// Storage channel name (e.g. `RIGHT_THUMB`)
    pub fn channel(&self) -> &'static str {
        match self {
            Finger::RightThumb => "RIGHT_THUMB",
            Finger::RightIndex => "RIGHT_INDEX",
            Finger::RightMiddle => "RIGHT_MIDDLE",
            Finger::RightRing => "RIGHT_RING",
            Finger::RightLittle => "RIGHT_LITTLE",
            Finger::LeftThumb => "LEFT_THUMB",
            Finger::LeftIndex => "LEFT_INDEX",
            Finger::LeftMiddle => "LEFT_MIDDLE",
            Finger::LeftRing => "LEFT_RING",
            Finger::LeftLittle => "LEFT_LITTLE",
        }
    }
}

/// Match score and minutiae count for a single finger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerValue {
    /// Match score; None when the token value did not parse
    pub score: Option<i32>,

    /// Minutiae count (`nbpk` token); None when absent or unparsable
    pub nbpk: Option<i32>,
}

/// One repeating fingerprint-capture group on a log line
///
/// Every `FingerprintSampleId` token opens a fresh group, even when the id
/// value repeats; groups are never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintSample {
    /// Parsed sample id, [`UNKNOWN_SAMPLE_ID`] when unparsable
    pub sample_id: i32,

    /// Capture type (e.g. `TENPRINT_SLAP`), first `SampleType` in the group
    pub sample_type: Option<String>,

    /// Per-finger measurements; a repeated finger in one group overwrites
    pub fingers: BTreeMap<Finger, FingerValue>,
}

/// Structured content of one raw log line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BiometricsRecord {
    /// Request type token (`RqType=`); only "IP" lines are exported
    pub request_type: String,

    /// First identity token on the line (`ReId=`), empty string if absent
    pub primary_id: String,

    /// Negative secondary `ReId` value, last negative occurrence wins
    pub status_code: Option<i32>,

    // Face block
    pub face_sample_id: Option<i32>,
    pub face_sample_type: Option<String>,
    pub face_score: Option<i32>,

    // Iris block
    pub iris_sample_id: Option<i32>,
    pub left_eye_score: Option<i32>,
    pub right_eye_score: Option<i32>,

    /// Fingerprint groups in encounter order
    pub fingerprint_samples: Vec<FingerprintSample>,

    /// Unrecognized `Key=Value` tokens, preserved verbatim
    pub extra: BTreeMap<String, String>,

    /// Original line minus trailing newline, kept for audit
    pub raw_line: String,
}

impl BiometricsRecord {
    /// Whether this record's line carried `RqType=IP`
    pub fn is_ip(&self) -> bool {
        self.request_type == IP_REQUEST_TYPE
    }

    /// Whether any face field was populated
    pub fn has_face(&self) -> bool {
        self.face_sample_id.is_some()
            || self.face_sample_type.is_some()
            || self.face_score.is_some()
    }

    /// Whether any iris field was populated
    pub fn has_iris(&self) -> bool {
        self.iris_sample_id.is_some()
            || self.left_eye_score.is_some()
            || self.right_eye_score.is_some()
    }
}

/// Biometric category of a fact row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Face,
    Iris,
    Finger,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Face => "FACE",
            Modality::Iris => "IRIS",
            Modality::Finger => "FINGER",
        }
    }
}

/// One storage fact row: a single (record, modality, channel) measurement
///
/// A record expands to 0 or 1 FACE row, 0 or 2 IRIS rows, and one FINGER row
/// per recognized finger in each fingerprint group.
#[derive(Debug, Clone, PartialEq)]
pub struct BiometricScoreRow {
    // Context
    pub record_id: String,
    pub status_code: Option<i32>,
    pub request_type: String,
    pub log_date: Option<NaiveDate>,
    pub server_name: Option<String>,
    pub source_file: Option<String>,
    pub raw_line: Option<String>,

    // Dimension
    pub modality: Modality,
    pub channel: &'static str,
    pub sample_id: Option<i32>,
    pub sample_type: Option<String>,

    // Measure
    pub score: Option<i32>,
    pub nbpk: Option<i32>,
}
