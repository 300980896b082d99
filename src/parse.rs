//! Decoders for the logger's BLE notification payloads.
//!
//! Everything here is pure: no I/O and no clock reads.  Callers pass the
//! arrival timestamp in, which keeps the decoders trivially testable.
//!
//! | Item | Channel | Format |
//! |---|---|---|
//! | [`decode_raw_frame`] | raw | 120 B, 10 × 6 × `i16` LE |
//! | [`FeatureDecoder`] | features | CSV text; first frame is the header |
//! | [`parse_prediction`] | prediction | `PRED:<label>` |
//! | [`NotificationDecoder`] | all | routes by characteristic UUID |
//!
//! Malformed payloads never produce an error.  They are dropped and logged at
//! `debug` level.

use log::{debug, trace};
use uuid::Uuid;

use crate::protocol::{
    FEATURE_CHARACTERISTIC, FEATURE_DELIMITER, PREDICTION_CHARACTERISTIC, PREDICTION_PREFIX,
    RAW_CHARACTERISTIC, RAW_FRAME_LEN, RAW_VALUES_PER_SAMPLE,
};
use crate::types::{FeatureRow, RawSample, StreamEvent};

// ── Raw frames ───────────────────────────────────────────────────────────────

/// Decode a raw inertial frame.
///
/// The frame is ten back-to-back samples, each six little-endian `i16`
/// values (acc x/y/z, gyro x/y/z).  Every sample is stamped with
/// `timestamp_ms`.
///
/// Returns `None` unless `data` is exactly [`RAW_FRAME_LEN`] bytes long.
///
/// ```
/// # use m5_logger::parse::decode_raw_frame;
/// let mut frame = [0u8; 120];
/// frame[0..2].copy_from_slice(&(-5i16).to_le_bytes());
/// let samples = decode_raw_frame(&frame, 1_000).unwrap();
/// assert_eq!(samples.len(), 10);
/// assert_eq!(samples[0].acc[0], -5);
/// assert!(decode_raw_frame(&frame[..12], 1_000).is_none());
/// ```
pub fn decode_raw_frame(data: &[u8], timestamp_ms: i64) -> Option<Vec<RawSample>> {
    if data.len() != RAW_FRAME_LEN {
        debug!("raw: dropping {}-byte frame (want {RAW_FRAME_LEN})", data.len());
        return None;
    }

    let samples = data
        .chunks_exact(RAW_VALUES_PER_SAMPLE * 2)
        .map(|chunk| {
            let v = |i: usize| i16::from_le_bytes([chunk[2 * i], chunk[2 * i + 1]]);
            RawSample {
                timestamp_ms,
                acc: [v(0), v(1), v(2)],
                gyro: [v(3), v(4), v(5)],
            }
        })
        .collect();
    Some(samples)
}

// ── Feature frames ───────────────────────────────────────────────────────────

/// What a single feature frame turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureFrame {
    /// The frame was taken as this session's header.
    Header(Vec<String>),
    /// A data row that matched the header.
    Row(FeatureRow),
}

/// Stateful decoder for the feature stream.
///
/// The firmware announces its field names once, in the first notification
/// after a connection is made, then sends bare value rows.  Nothing on the
/// wire distinguishes the two, so the decoder goes by position: the first
/// frame it sees is the header, whatever it contains.  The header then stays
/// fixed until [`FeatureDecoder::reset`] is called, which the client does at
/// the start of every session.
///
/// Rows whose token count differs from the header, or which contain a token
/// that is not a number, are dropped.
///
/// ```
/// # use m5_logger::parse::{FeatureDecoder, FeatureFrame};
/// let mut dec = FeatureDecoder::new();
/// assert!(matches!(dec.push("mean,std"), Some(FeatureFrame::Header(_))));
/// assert!(matches!(dec.push("0.5, 1.25"), Some(FeatureFrame::Row(_))));
/// assert!(dec.push("1,2,3").is_none()); // wrong arity
/// ```
#[derive(Debug, Default)]
pub struct FeatureDecoder {
    header: Option<Vec<String>>,
}

impl FeatureDecoder {
    pub fn new() -> Self {
        Self { header: None }
    }

    /// The header of the current session, once one has been received.
    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    /// Forget the header.  The next frame becomes the new one.
    pub fn reset(&mut self) {
        self.header = None;
    }

    /// Feed one decoded text frame.
    pub fn push(&mut self, text: &str) -> Option<FeatureFrame> {
        let tokens: Vec<&str> = tokenize(text).collect();

        let Some(header) = &self.header else {
            let header: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
            debug!("features: header = {header:?}");
            self.header = Some(header.clone());
            return Some(FeatureFrame::Header(header));
        };

        if tokens.len() != header.len() {
            debug!(
                "features: dropping row with {} fields (header has {})",
                tokens.len(),
                header.len()
            );
            return None;
        }

        let values: Option<Vec<f64>> = tokens.iter().map(|t| t.parse::<f64>().ok()).collect();
        match values {
            Some(values) => Some(FeatureFrame::Row(FeatureRow { values })),
            None => {
                debug!("features: dropping non-numeric row {text:?}");
                None
            }
        }
    }
}

/// Split a feature frame into trimmed tokens.
///
/// Trailing line terminators and a trailing NUL (some firmware sends C
/// strings) are stripped first.
fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.trim_end_matches(['\0', '\r', '\n'])
        .split(FEATURE_DELIMITER)
        .map(str::trim)
}

// ── Prediction frames ────────────────────────────────────────────────────────

/// Extract the label from a prediction frame.
///
/// The frame must start with [`PREDICTION_PREFIX`].  Whitespace around the
/// label is trimmed; a frame with nothing after the prefix yields `None`.
///
/// ```
/// # use m5_logger::parse::parse_prediction;
/// assert_eq!(parse_prediction("PRED: walking\n").as_deref(), Some("walking"));
/// assert_eq!(parse_prediction("walking"), None);
/// ```
pub fn parse_prediction(text: &str) -> Option<String> {
    let label = text
        .strip_prefix(PREDICTION_PREFIX)?
        .trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if label.is_empty() {
        None
    } else {
        Some(label.to_owned())
    }
}

// ── Notification demultiplexer ───────────────────────────────────────────────

/// Routes notifications from any of the three stream characteristics to the
/// right decoder and turns the result into [`StreamEvent`]s.
///
/// One instance lives for one session.  It owns the [`FeatureDecoder`], so
/// header state is per-session by construction.
#[derive(Debug, Default)]
pub struct NotificationDecoder {
    features: FeatureDecoder,
}

impl NotificationDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget session state (the feature header).
    pub fn reset(&mut self) {
        self.features.reset();
    }

    /// The feature header, once received.
    pub fn feature_header(&self) -> Option<&[String]> {
        self.features.header()
    }

    /// Decode one notification.
    ///
    /// Returns no events for unknown characteristics and for malformed
    /// payloads.
    pub fn decode(&mut self, uuid: Uuid, data: &[u8], timestamp_ms: i64) -> Option<StreamEvent> {
        if uuid == RAW_CHARACTERISTIC {
            return decode_raw_frame(data, timestamp_ms).map(StreamEvent::Raw);
        }

        if uuid == FEATURE_CHARACTERISTIC {
            let text = String::from_utf8_lossy(data);
            return match self.features.push(&text)? {
                FeatureFrame::Header(h) => Some(StreamEvent::FeatureHeader(h)),
                FeatureFrame::Row(r) => Some(StreamEvent::Features(r)),
            };
        }

        if uuid == PREDICTION_CHARACTERISTIC {
            let text = String::from_utf8_lossy(data);
            let label = parse_prediction(&text);
            if label.is_none() {
                debug!("prediction: dropping frame {text:?}");
            }
            return label.map(StreamEvent::Prediction);
        }

        trace!("ignoring notification from {uuid} ({} bytes)", data.len());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(samples: &[[i16; 6]]) -> Vec<u8> {
        samples
            .iter()
            .flat_map(|s| s.iter().flat_map(|v| v.to_le_bytes()))
            .collect()
    }

    #[test]
    fn raw_frame_decodes_ten_samples_with_shared_timestamp() {
        let input: Vec<[i16; 6]> = (0..10)
            .map(|i| {
                let i = i as i16;
                [i, -i, i * 100, i16::MIN + i, i16::MAX - i, 7]
            })
            .collect();
        let bytes = frame_of(&input);
        assert_eq!(bytes.len(), RAW_FRAME_LEN);

        let samples = decode_raw_frame(&bytes, 1_700_000_000_123).unwrap();
        assert_eq!(samples.len(), 10);
        for (s, want) in samples.iter().zip(&input) {
            assert_eq!(s.timestamp_ms, 1_700_000_000_123);
            assert_eq!(&s.values(), want);
        }
    }

    #[test]
    fn raw_frame_of_other_length_is_dropped() {
        for len in [0, 12, 119, 121, 240] {
            assert!(decode_raw_frame(&vec![0u8; len], 0).is_none(), "len {len}");
        }
    }

    #[test]
    fn first_feature_frame_is_header_even_if_numeric() {
        let mut dec = FeatureDecoder::new();
        assert_eq!(
            dec.push("1.0,2.0,3.0"),
            Some(FeatureFrame::Header(vec!["1.0".into(), "2.0".into(), "3.0".into()]))
        );
        assert_eq!(
            dec.push("4,5,6"),
            Some(FeatureFrame::Row(FeatureRow {
                values: vec![4.0, 5.0, 6.0]
            }))
        );
    }

    #[test]
    fn header_is_not_replaced_by_later_frames() {
        let mut dec = FeatureDecoder::new();
        dec.push("a,b");
        assert!(dec.push("c,d").is_none()); // non-numeric, dropped
        assert_eq!(dec.header().unwrap(), ["a", "b"]);
    }

    #[test]
    fn feature_row_with_wrong_arity_is_dropped() {
        let mut dec = FeatureDecoder::new();
        dec.push("rms_x,rms_y,peak");
        assert!(dec.push("1,2").is_none());
        assert!(dec.push("1,2,3,4").is_none());
        assert!(dec.push("").is_none());
        assert!(matches!(dec.push("1,2,3"), Some(FeatureFrame::Row(_))));
    }

    #[test]
    fn feature_tokens_are_trimmed() {
        let mut dec = FeatureDecoder::new();
        assert_eq!(
            dec.push(" mean , var \r\n"),
            Some(FeatureFrame::Header(vec!["mean".into(), "var".into()]))
        );
        assert_eq!(
            dec.push(" -0.5 ,1e3\0"),
            Some(FeatureFrame::Row(FeatureRow {
                values: vec![-0.5, 1000.0]
            }))
        );
    }

    #[test]
    fn reset_makes_next_frame_the_header() {
        let mut dec = FeatureDecoder::new();
        dec.push("a,b");
        dec.reset();
        assert!(dec.header().is_none());
        assert!(matches!(dec.push("x,y,z"), Some(FeatureFrame::Header(h)) if h.len() == 3));
    }

    #[test]
    fn prediction_requires_prefix() {
        assert_eq!(parse_prediction("PRED:idle").as_deref(), Some("idle"));
        assert_eq!(parse_prediction("PRED:  run \0").as_deref(), Some("run"));
        assert_eq!(parse_prediction("pred:idle"), None);
        assert_eq!(parse_prediction(" PRED:idle"), None);
        assert_eq!(parse_prediction("idle"), None);
        assert_eq!(parse_prediction("PRED:"), None);
        assert_eq!(parse_prediction("PRED:   "), None);
    }

    #[test]
    fn notification_decoder_routes_by_uuid() {
        let mut dec = NotificationDecoder::new();

        let raw = frame_of(&[[1, 2, 3, 4, 5, 6]; 10]);
        match dec.decode(RAW_CHARACTERISTIC, &raw, 42) {
            Some(StreamEvent::Raw(samples)) => {
                assert_eq!(samples.len(), 10);
                assert_eq!(samples[9].gyro, [4, 5, 6]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(dec.decode(RAW_CHARACTERISTIC, &raw[..60], 42).is_none());

        assert_eq!(
            dec.decode(FEATURE_CHARACTERISTIC, b"f1,f2", 0),
            Some(StreamEvent::FeatureHeader(vec!["f1".into(), "f2".into()]))
        );
        assert_eq!(
            dec.decode(FEATURE_CHARACTERISTIC, b"0.1,0.2", 0),
            Some(StreamEvent::Features(FeatureRow {
                values: vec![0.1, 0.2]
            }))
        );
        assert_eq!(
            dec.decode(PREDICTION_CHARACTERISTIC, b"PRED:shake", 0),
            Some(StreamEvent::Prediction("shake".into()))
        );
        assert!(dec.decode(PREDICTION_CHARACTERISTIC, b"shake", 0).is_none());

        let other = Uuid::from_u128(0x0000_2a19_0000_1000_8000_00805f9b34fb);
        assert!(dec.decode(other, &raw, 0).is_none());
    }

    #[test]
    fn notification_decoder_reset_clears_feature_header() {
        let mut dec = NotificationDecoder::new();
        dec.decode(FEATURE_CHARACTERISTIC, b"a,b", 0);
        assert!(dec.feature_header().is_some());
        dec.reset();
        assert!(dec.feature_header().is_none());
        assert!(matches!(
            dec.decode(FEATURE_CHARACTERISTIC, b"1,2", 0),
            Some(StreamEvent::FeatureHeader(_))
        ));
    }
}
