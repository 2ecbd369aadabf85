//! Log line parser
//!
//! Parses the fixed whitespace-delimited `Key=Value` grammar emitted by the
//! identity-verification servers, e.g.:
//!
//! ```text
//! RqType=IP ReId=438326870647742011 FaceSampleId=1 SampleType=STILL Face=200
//!   IrisSampleId=1 LeftEye=84 RightEye=84
//!   FingerprintSampleId=2 SampleType=TENPRINT_SLAP RightThumb=97 nbpk=21 ...
//! ```
//!
//! Parsing never fails a line: unparsable numeric tokens leave the matching
//! field unset, unknown keys land in `extra`, and everything else is dropped
//! according to the rules below.

use anyhow::{Context, Result};
use std::path::Path;

use crate::models::{BiometricsRecord, Finger, FingerValue, FingerprintSample, UNKNOWN_SAMPLE_ID};

/// Parse one raw log line into a [`BiometricsRecord`]
///
/// Token rules, applied left to right with one cursor:
/// - tokens without `=` are skipped entirely
/// - the first `ReId` is the primary id; later `ReId` values are captured as
///   the status code only when they parse as a negative integer
///   (last negative wins, non-negative repeats are discarded)
/// - `SampleType` before any `FingerprintSampleId` scopes to the face block;
///   inside a group it attaches to that group; later repeats are ignored
/// - every `FingerprintSampleId` opens a new group, duplicate ids included
/// - a finger key is only meaningful inside an open group, where the next
///   token is also inspected: an immediately following `nbpk=` is consumed
///   as that finger's minutiae count
/// - a finger key outside any group, and an `nbpk` not following a finger
///   score, are dropped silently
pub fn parse_line(line: &str) -> BiometricsRecord {
    let raw_line = line.trim_end_matches(['\r', '\n']).to_string();
    let tokens: Vec<&str> = raw_line.split_whitespace().collect();

    let mut builder = LineBuilder::default();

    let mut i = 0;
    while i < tokens.len() {
        let Some((key, value)) = tokens[i].split_once('=') else {
            i += 1;
            continue;
        };

        match key {
            "RqType" => builder.record.request_type = value.to_string(),
            "ReId" => builder.take_re_id(value),
            "FaceSampleId" => {
                if let Ok(id) = value.parse() {
                    builder.record.face_sample_id = Some(id);
                }
            },
            "SampleType" => builder.take_sample_type(value),
            "Face" => {
                if let Ok(score) = value.parse() {
                    builder.record.face_score = Some(score);
                }
            },
            "IrisSampleId" => {
                if let Ok(id) = value.parse() {
                    builder.record.iris_sample_id = Some(id);
                }
            },
            "LeftEye" => {
                if let Ok(score) = value.parse() {
                    builder.record.left_eye_score = Some(score);
                }
            },
            "RightEye" => {
                if let Ok(score) = value.parse() {
                    builder.record.right_eye_score = Some(score);
                }
            },
            "FingerprintSampleId" => builder.open_fingerprint_group(value),
            // A stray nbpk (not directly after a finger score) is handled
            // but meaningless standalone.
            "nbpk" => {},
            _ => {
                if let Some(finger) = Finger::from_log_key(key) {
                    // Lookahead: an immediately following nbpk token belongs
                    // to this finger and is consumed here.
                    let nbpk = tokens
                        .get(i + 1)
                        .and_then(|t| t.split_once('='))
                        .filter(|(k, _)| *k == "nbpk");
                    if let Some((_, nbpk_value)) = nbpk {
                        builder.take_finger(finger, value, Some(nbpk_value));
                        i += 1;
                    } else {
                        builder.take_finger(finger, value, None);
                    }
                } else {
                    builder
                        .record
                        .extra
                        .insert(key.to_string(), value.to_string());
                }
            },
        }

        i += 1;
    }

    builder.finish(raw_line)
}

/// Parse a whole log file, one record per non-empty line
///
/// The file is read lossily: invalid UTF-8 bytes are replaced rather than
/// failing the batch.
pub fn parse_file(path: &Path) -> Result<Vec<BiometricsRecord>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read log file: {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);

    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect())
}

/// Accumulator for one line: the record in progress plus the index of the
/// currently open fingerprint group
#[derive(Default)]
struct LineBuilder {
    record: BiometricsRecord,
    primary_id: Option<String>,
    current_group: Option<usize>,
}

impl LineBuilder {
    /// First `ReId` is the identity; later ones are candidate status codes
    fn take_re_id(&mut self, value: &str) {
        if self.primary_id.is_none() {
            self.primary_id = Some(value.to_string());
        } else if let Ok(code) = value.parse::<i32>() {
            if code < 0 {
                self.record.status_code = Some(code);
            }
        }
    }

    /// Scope a `SampleType` token to the face block or the open group
    fn take_sample_type(&mut self, value: &str) {
        match self.current_group {
            None => {
                if self.record.face_sample_type.is_none() {
                    self.record.face_sample_type = Some(value.to_string());
                }
            },
            Some(idx) => {
                let group = &mut self.record.fingerprint_samples[idx];
                if group.sample_type.is_none() {
                    group.sample_type = Some(value.to_string());
                }
            },
        }
    }

    /// Open a fresh fingerprint group and make it current
    fn open_fingerprint_group(&mut self, value: &str) {
        let sample_id = value.parse().unwrap_or(UNKNOWN_SAMPLE_ID);
        self.record.fingerprint_samples.push(FingerprintSample {
            sample_id,
            ..Default::default()
        });
        self.current_group = Some(self.record.fingerprint_samples.len() - 1);
    }

    /// Record a finger score (and optional consumed nbpk) in the open group
    fn take_finger(&mut self, finger: Finger, score: &str, nbpk: Option<&str>) {
        let Some(idx) = self.current_group else {
            // Finger token outside any group: dropped, not an extra.
            return;
        };

        let value = FingerValue {
            score: score.parse().ok(),
            nbpk: nbpk.and_then(|v| v.parse().ok()),
        };
        self.record.fingerprint_samples[idx]
            .fingers
            .insert(finger, value);
    }

    fn finish(mut self, raw_line: String) -> BiometricsRecord {
        self.record.primary_id = self.primary_id.unwrap_or_default();
        self.record.raw_line = raw_line;
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Finger;

    #[test]
    fn test_parse_basic_ip_line() {
        let line = "RqType=IP ReId=438326870647742011 FaceSampleId=1 SampleType=STILL \
                    Face=200 IrisSampleId=1 LeftEye=84 RightEye=84";
        let rec = parse_line(line);

        assert_eq!(rec.request_type, "IP");
        assert_eq!(rec.primary_id, "438326870647742011");
        assert_eq!(rec.status_code, None);
        assert_eq!(rec.face_sample_id, Some(1));
        assert_eq!(rec.face_sample_type.as_deref(), Some("STILL"));
        assert_eq!(rec.face_score, Some(200));
        assert_eq!(rec.iris_sample_id, Some(1));
        assert_eq!(rec.left_eye_score, Some(84));
        assert_eq!(rec.right_eye_score, Some(84));
        assert!(rec.fingerprint_samples.is_empty());
        assert!(rec.extra.is_empty());
        assert_eq!(rec.raw_line, line);
    }

    #[test]
    fn test_negative_secondary_re_id_becomes_status_code() {
        let rec = parse_line("RqType=IP ReId=9 ReId=-7");
        assert_eq!(rec.primary_id, "9");
        assert_eq!(rec.status_code, Some(-7));
    }

    #[test]
    fn test_last_negative_re_id_wins() {
        let rec = parse_line("RqType=IP ReId=9 ReId=-7 ReId=-5");
        assert_eq!(rec.status_code, Some(-5));
    }

    #[test]
    fn test_non_negative_secondary_re_id_is_discarded() {
        let rec = parse_line("RqType=IP ReId=9 ReId=12");
        assert_eq!(rec.primary_id, "9");
        assert_eq!(rec.status_code, None);
    }

    #[test]
    fn test_fingerprint_groups_with_nbpk_lookahead() {
        let line = "RqType=IP ReId=1 FingerprintSampleId=2 SampleType=TENPRINT_SLAP \
                    RightThumb=97 nbpk=21 RightIndex=88 LeftLittle=abc nbpk=4";
        let rec = parse_line(line);

        assert_eq!(rec.fingerprint_samples.len(), 1);
        let group = &rec.fingerprint_samples[0];
        assert_eq!(group.sample_id, 2);
        assert_eq!(group.sample_type.as_deref(), Some("TENPRINT_SLAP"));
        assert_eq!(group.fingers.len(), 3);

        let thumb = group.fingers[&Finger::RightThumb];
        assert_eq!(thumb.score, Some(97));
        assert_eq!(thumb.nbpk, Some(21));

        // No nbpk follows RightIndex, so its count stays unset.
        let index = group.fingers[&Finger::RightIndex];
        assert_eq!(index.score, Some(88));
        assert_eq!(index.nbpk, None);

        // Unparsable score still keeps the consumed nbpk.
        let little = group.fingers[&Finger::LeftLittle];
        assert_eq!(little.score, None);
        assert_eq!(little.nbpk, Some(4));
    }

    #[test]
    fn test_duplicate_group_ids_stay_distinct() {
        let line = "RqType=IP ReId=1 FingerprintSampleId=3 RightThumb=90 \
                    FingerprintSampleId=3 LeftThumb=80";
        let rec = parse_line(line);

        assert_eq!(rec.fingerprint_samples.len(), 2);
        assert_eq!(rec.fingerprint_samples[0].sample_id, 3);
        assert_eq!(rec.fingerprint_samples[1].sample_id, 3);
        assert!(rec.fingerprint_samples[0]
            .fingers
            .contains_key(&Finger::RightThumb));
        assert!(rec.fingerprint_samples[1]
            .fingers
            .contains_key(&Finger::LeftThumb));
    }

    #[test]
    fn test_unparsable_group_id_uses_sentinel() {
        let rec = parse_line("RqType=IP ReId=1 FingerprintSampleId=oops RightRing=50");
        assert_eq!(rec.fingerprint_samples[0].sample_id, -1);
    }

    #[test]
    fn test_finger_outside_any_group_is_dropped() {
        let rec = parse_line("RqType=IP ReId=1 RightThumb=97 nbpk=21");
        assert!(rec.fingerprint_samples.is_empty());
        assert!(rec.extra.is_empty());
    }

    #[test]
    fn test_stray_nbpk_is_dropped() {
        let rec = parse_line("RqType=IP ReId=1 nbpk=9 Foo=bar");
        assert!(rec.extra.contains_key("Foo"));
        assert!(!rec.extra.contains_key("nbpk"));
    }

    #[test]
    fn test_sample_type_scoping() {
        // Before any group: face-scoped. Second face-scoped occurrence ignored.
        let rec = parse_line("RqType=IP ReId=1 SampleType=STILL SampleType=OTHER");
        assert_eq!(rec.face_sample_type.as_deref(), Some("STILL"));

        // Inside a group: attaches to that group, repeats ignored.
        let rec = parse_line(
            "RqType=IP ReId=1 SampleType=STILL FingerprintSampleId=1 \
             SampleType=SLAP SampleType=ROLLED",
        );
        assert_eq!(rec.face_sample_type.as_deref(), Some("STILL"));
        assert_eq!(
            rec.fingerprint_samples[0].sample_type.as_deref(),
            Some("SLAP")
        );
    }

    #[test]
    fn test_unknown_keys_go_to_extra() {
        let rec = parse_line("RqType=IP ReId=1 Vendor=acme Build=1.2 plain_token");
        assert_eq!(rec.extra.get("Vendor").map(String::as_str), Some("acme"));
        assert_eq!(rec.extra.get("Build").map(String::as_str), Some("1.2"));
        // Tokens without '=' are skipped, not extras.
        assert_eq!(rec.extra.len(), 2);
    }

    #[test]
    fn test_unparsable_numerics_leave_fields_unset() {
        let rec = parse_line("RqType=IP ReId=1 FaceSampleId=x Face=y IrisSampleId=z LeftEye=- RightEye=");
        assert_eq!(rec.face_sample_id, None);
        assert_eq!(rec.face_score, None);
        assert_eq!(rec.iris_sample_id, None);
        assert_eq!(rec.left_eye_score, None);
        assert_eq!(rec.right_eye_score, None);
    }

    #[test]
    fn test_missing_re_id_yields_empty_primary() {
        let rec = parse_line("RqType=IP Face=200");
        assert_eq!(rec.primary_id, "");
    }

    #[test]
    fn test_raw_line_strips_trailing_newline() {
        let rec = parse_line("RqType=IP ReId=1\n");
        assert_eq!(rec.raw_line, "RqType=IP ReId=1");
    }

    #[test]
    fn test_parse_file_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quality.2026-01-26.log");
        std::fs::write(&path, "RqType=IP ReId=1\n\n   \nRqType=XX ReId=2\n").unwrap();

        let records = parse_file(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].primary_id, "1");
        assert_eq!(records[1].request_type, "XX");
    }
}
