//! Record transcoding
//!
//! Converts a [`BiometricsRecord`] to and from its flat JSONL wire form, and
//! expands it into storage fact rows (one row per biometric channel).
//!
//! `to_json` and `from_json` are exact inverses for any record the parser
//! builds from an `RqType=IP` line. Non-IP records serialize to a degenerate
//! two-field form and are never read back in normal operation.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::models::{
    BiometricScoreRow, BiometricsRecord, Finger, FingerValue, FingerprintSample, Modality,
};

/// Matches the `YYYY-MM-DD` date embedded in source log filenames,
/// e.g. `quality.2026-01-26.log`
static FILENAME_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2})").expect("valid pattern"));

/// JSONL wire form of an IP record
#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    rq_type: String,
    re_id: String,
    re_code: Option<i32>,
    #[serde(default)]
    raw_line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    face: Option<WireFace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iris: Option<WireIris>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fingerprints: Option<Vec<WireFingerprint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extra: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFace {
    sample_id: Option<i32>,
    sample_type: Option<String>,
    score: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireIris {
    sample_id: Option<i32>,
    left: Option<i32>,
    right: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFingerprint {
    sample_id: i32,
    sample_type: Option<String>,
    // String-keyed on the wire; unrecognized finger names are skipped when
    // converting back to the domain model.
    fingers: BTreeMap<String, FingerValue>,
}

/// Serialize a record to its JSONL object
///
/// Optional blocks (`face`, `iris`, `fingerprints`, `extra`) are present only
/// when non-empty. Non-IP records degrade to `{rq_type, re_id}`.
pub fn to_json(record: &BiometricsRecord) -> serde_json::Value {
    if !record.is_ip() {
        return serde_json::json!({
            "rq_type": record.request_type,
            "re_id": record.primary_id,
        });
    }

    let face = record.has_face().then(|| WireFace {
        sample_id: record.face_sample_id,
        sample_type: record.face_sample_type.clone(),
        score: record.face_score,
    });

    let iris = record.has_iris().then(|| WireIris {
        sample_id: record.iris_sample_id,
        left: record.left_eye_score,
        right: record.right_eye_score,
    });

    let fingerprints = (!record.fingerprint_samples.is_empty()).then(|| {
        record
            .fingerprint_samples
            .iter()
            .map(|sample| WireFingerprint {
                sample_id: sample.sample_id,
                sample_type: sample.sample_type.clone(),
                fingers: sample
                    .fingers
                    .iter()
                    .map(|(finger, value)| (finger.json_key().to_string(), *value))
                    .collect(),
            })
            .collect()
    });

    let wire = WireRecord {
        rq_type: record.request_type.clone(),
        re_id: record.primary_id.clone(),
        re_code: record.status_code,
        raw_line: Some(record.raw_line.clone()),
        face,
        iris,
        fingerprints,
        extra: (!record.extra.is_empty()).then(|| record.extra.clone()),
    };

    // WireRecord is a plain struct of JSON-safe fields; serialization cannot fail.
    serde_json::to_value(wire).unwrap_or_default()
}

/// Rebuild a record from its JSONL object
///
/// Inverse of [`to_json`] for IP records. Finger names outside the canonical
/// set are skipped rather than rejected.
pub fn from_json(value: serde_json::Value) -> Result<BiometricsRecord> {
    let wire: WireRecord =
        serde_json::from_value(value).context("Malformed JSONL record")?;

    let mut record = BiometricsRecord {
        request_type: wire.rq_type,
        primary_id: wire.re_id,
        status_code: wire.re_code,
        raw_line: wire.raw_line.unwrap_or_default(),
        ..Default::default()
    };

    if let Some(face) = wire.face {
        record.face_sample_id = face.sample_id;
        record.face_sample_type = face.sample_type;
        record.face_score = face.score;
    }

    if let Some(iris) = wire.iris {
        record.iris_sample_id = iris.sample_id;
        record.left_eye_score = iris.left;
        record.right_eye_score = iris.right;
    }

    if let Some(fingerprints) = wire.fingerprints {
        record.fingerprint_samples = fingerprints
            .into_iter()
            .map(|sample| FingerprintSample {
                sample_id: sample.sample_id,
                sample_type: sample.sample_type,
                fingers: sample
                    .fingers
                    .into_iter()
                    .filter_map(|(name, value)| {
                        Finger::from_json_key(&name).map(|finger| (finger, value))
                    })
                    .collect(),
            })
            .collect();
    }

    if let Some(extra) = wire.extra {
        record.extra = extra;
    }

    Ok(record)
}

/// Extract the `YYYY-MM-DD` log date embedded in a source filename
///
/// A missing or malformed date yields `None`, never an error.
pub fn log_date_from_filename(filename: &str) -> Option<NaiveDate> {
    let captured = FILENAME_DATE.find(filename)?;
    NaiveDate::parse_from_str(captured.as_str(), "%Y-%m-%d").ok()
}

/// Expand a record into storage fact rows
///
/// - 0 or 1 FACE row (present iff the face score is set)
/// - 0 or 2 IRIS rows: the LEFT_EYE/RIGHT_EYE pair is emitted whenever the
///   record carries any iris data, a missing eye keeps a NULL score
/// - one FINGER row per recognized finger in each fingerprint group
pub fn to_fact_rows(
    record: &BiometricsRecord,
    server_name: Option<&str>,
    source_file: Option<&str>,
) -> Vec<BiometricScoreRow> {
    let log_date = source_file.and_then(log_date_from_filename);

    let base = |modality: Modality, channel: &'static str| BiometricScoreRow {
        record_id: record.primary_id.clone(),
        status_code: record.status_code,
        request_type: record.request_type.clone(),
        log_date,
        server_name: server_name.map(str::to_string),
        source_file: source_file.map(str::to_string),
        raw_line: Some(record.raw_line.clone()),
        modality,
        channel,
        sample_id: None,
        sample_type: None,
        score: None,
        nbpk: None,
    };

    let mut rows = Vec::new();

    if record.face_score.is_some() {
        let mut row = base(Modality::Face, "FACE");
        row.sample_id = record.face_sample_id;
        row.sample_type = record.face_sample_type.clone();
        row.score = record.face_score;
        rows.push(row);
    }

    if record.has_iris() {
        let mut left = base(Modality::Iris, "LEFT_EYE");
        left.sample_id = record.iris_sample_id;
        left.score = record.left_eye_score;
        rows.push(left);

        let mut right = base(Modality::Iris, "RIGHT_EYE");
        right.sample_id = record.iris_sample_id;
        right.score = record.right_eye_score;
        rows.push(right);
    }

    for sample in &record.fingerprint_samples {
        for (finger, value) in &sample.fingers {
            let mut row = base(Modality::Finger, finger.channel());
            row.sample_id = Some(sample.sample_id);
            row.sample_type = sample.sample_type.clone();
            row.score = value.score;
            row.nbpk = value.nbpk;
            rows.push(row);
        }
    }

    rows
}
