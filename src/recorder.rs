//! Append-only CSV recordings of the raw and feature streams.
//!
//! A [`CsvRecorder`] owns one output file.  The header row is written when
//! the recorder is created and never changes afterwards.  Rows can carry a
//! leading tag column (the "segment" counter the user bumps between
//! gestures).  [`CsvRecorder::close`] flushes and releases the file; it is
//! safe to call more than once, and appends after it are silently ignored.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use log::{debug, info, warn};

use crate::protocol::RAW_CSV_HEADER;
use crate::types::{FeatureRow, RawSample, StreamEvent};

/// Which stream a recording holds; decides the header row.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingKind {
    /// `timestamp_ms` plus the six axes.
    Raw,
    /// The feature names announced by the device.
    Features(Vec<String>),
}

impl RecordingKind {
    fn columns(&self) -> Vec<String> {
        match self {
            RecordingKind::Raw => RAW_CSV_HEADER.iter().map(|s| s.to_string()).collect(),
            RecordingKind::Features(names) => names.clone(),
        }
    }
}

/// Where and how to create recordings.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Output directory; created on demand.  Default: `data`.
    pub dir: PathBuf,
    /// Name of the leading tag column, or `None` for untagged files.
    /// Default: `Some("segment")`.
    pub tag_column: Option<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            tag_column: Some("segment".into()),
        }
    }
}

/// One CSV output file.
///
/// Generic over the sink so tests can observe flushes; production code uses
/// the default `BufWriter<File>` through [`CsvRecorder::create`].
pub struct CsvRecorder<W: Write = BufWriter<File>> {
    writer: Option<csv::Writer<W>>,
    path: Option<PathBuf>,
    /// Data columns, without the tag column.
    columns: Vec<String>,
    tagged: bool,
    rows: u64,
}

impl CsvRecorder<BufWriter<File>> {
    /// Create `<dir>/<prefix>_<local timestamp>.csv` and write its header.
    ///
    /// If a file of that name already exists (two recordings started within
    /// the same second) a `_1`, `_2`, … suffix is added rather than
    /// overwriting it.
    pub fn create(config: &RecorderConfig, prefix: &str, kind: RecordingKind) -> Result<Self> {
        fs::create_dir_all(&config.dir)
            .with_context(|| format!("creating {}", config.dir.display()))?;

        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let (path, file) = create_unique(&config.dir, prefix, &stamp)?;

        let mut rec = Self::from_writer(BufWriter::new(file), kind, config.tag_column.as_deref())?;
        info!("Recording to {}", path.display());
        rec.path = Some(path);
        Ok(rec)
    }
}

/// Open `<dir>/<prefix>_<stamp>[_n].csv` with `create_new`, bumping `n` on
/// collisions.
fn create_unique(dir: &Path, prefix: &str, stamp: &str) -> Result<(PathBuf, File)> {
    for n in 0u32.. {
        let name = if n == 0 {
            format!("{prefix}_{stamp}.csv")
        } else {
            format!("{prefix}_{stamp}_{n}.csv")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("creating {}", path.display())),
        }
    }
    unreachable!("u32 range exhausted while picking a file name")
}

impl<W: Write> CsvRecorder<W> {
    /// Wrap an arbitrary sink and write the header row to it.
    ///
    /// With `tag_column = Some(name)`, `name` becomes the first column and
    /// every row starts with the caller-supplied tag.
    pub fn from_writer(writer: W, kind: RecordingKind, tag_column: Option<&str>) -> Result<Self> {
        let columns = kind.columns();
        let mut writer = csv::Writer::from_writer(writer);
        writer
            .write_record(tag_column.into_iter().chain(columns.iter().map(String::as_str)))
            .context("writing header")?;
        Ok(Self {
            writer: Some(writer),
            path: None,
            columns,
            tagged: tag_column.is_some(),
            rows: 0,
        })
    }

    /// Output path, for display.  `None` for recorders built on a custom sink.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Data columns of the header row (excluding any tag column).
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Append one row per raw sample.
    pub fn append_raw(&mut self, tag: Option<u32>, samples: &[RawSample]) -> Result<()> {
        for s in samples {
            let values = s.values();
            let fields = std::iter::once(s.timestamp_ms.to_string())
                .chain(values.iter().map(i16::to_string));
            self.append_fields(tag, fields)?;
        }
        Ok(())
    }

    /// Append one feature row.
    ///
    /// Rows whose length differs from the recorder's header are dropped.
    pub fn append_features(&mut self, tag: Option<u32>, row: &FeatureRow) -> Result<()> {
        if row.values.len() != self.columns.len() {
            debug!(
                "recorder: dropping {}-field row for {}-column file",
                row.values.len(),
                self.columns.len()
            );
            return Ok(());
        }
        self.append_fields(tag, row.values.iter().map(f64::to_string))
    }

    fn append_fields(&mut self, tag: Option<u32>, fields: impl Iterator<Item = String>) -> Result<()> {
        let tagged = self.tagged;
        let Some(w) = self.writer.as_mut() else {
            return Ok(());
        };
        let tag_field = tagged.then(|| tag.map(|t| t.to_string()).unwrap_or_default());
        w.write_record(tag_field.into_iter().chain(fields))
            .context("writing row")?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and release the sink.  Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        let Some(w) = self.writer.take() else {
            return Ok(());
        };
        // `into_inner` flushes once and keeps the csv writer's drop from
        // flushing again.
        w.into_inner()
            .map_err(|e| e.into_error())
            .context("flushing recording")?;
        match &self.path {
            Some(p) => info!("Closed {} ({} rows)", p.display(), self.rows),
            None => debug!("Closed recording ({} rows)", self.rows),
        }
        Ok(())
    }
}

impl<W: Write> Drop for CsvRecorder<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("recorder: {e:#}");
        }
    }
}

// ── SessionRecorder ──────────────────────────────────────────────────────────

/// File prefix of raw recordings.
pub const RAW_PREFIX: &str = "raw";
/// File prefix of feature recordings.
pub const FEATURE_PREFIX: &str = "features";

/// The recording side of the presentation layer.
///
/// Holds up to two open recordings (raw and features) plus the segment
/// counter, and is fed every [`StreamEvent`] the session produces.  Feature
/// recording can be requested before the device has sent its header; the
/// file is opened as soon as the header arrives.  A header that differs from
/// the open file's (the device was reconnected with a new feature set) closes
/// that file and starts a new one, since a file's header never changes.
pub struct SessionRecorder {
    config: RecorderConfig,
    raw: Option<CsvRecorder>,
    features: Option<CsvRecorder>,
    want_features: bool,
    feature_header: Option<Vec<String>>,
    segment: u32,
}

impl SessionRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            raw: None,
            features: None,
            want_features: false,
            feature_header: None,
            segment: 0,
        }
    }

    /// Current segment tag.
    pub fn segment(&self) -> u32 {
        self.segment
    }

    /// Bump the segment tag; returns the new value.
    pub fn next_segment(&mut self) -> u32 {
        self.segment = self.segment.wrapping_add(1);
        info!("Segment {}", self.segment);
        self.segment
    }

    pub fn is_recording_raw(&self) -> bool {
        self.raw.is_some()
    }

    /// `true` while feature recording is requested, even if the file is
    /// still waiting for a header.
    pub fn is_recording_features(&self) -> bool {
        self.want_features
    }

    /// Path of the open raw recording.
    pub fn raw_path(&self) -> Option<&Path> {
        self.raw.as_ref().and_then(|r| r.path())
    }

    /// Path of the open feature recording.
    pub fn feature_path(&self) -> Option<&Path> {
        self.features.as_ref().and_then(|r| r.path())
    }

    /// Start a raw recording.  No-op if one is already open.
    pub fn start_raw(&mut self) -> Result<()> {
        if self.raw.is_none() {
            self.raw = Some(CsvRecorder::create(&self.config, RAW_PREFIX, RecordingKind::Raw)?);
        }
        Ok(())
    }

    pub fn stop_raw(&mut self) -> Result<()> {
        match self.raw.take() {
            Some(mut r) => r.close(),
            None => Ok(()),
        }
    }

    /// Start a feature recording, now if the header is known or as soon as
    /// it arrives.
    pub fn start_features(&mut self) -> Result<()> {
        self.want_features = true;
        self.open_features()
    }

    pub fn stop_features(&mut self) -> Result<()> {
        self.want_features = false;
        match self.features.take() {
            Some(mut r) => r.close(),
            None => Ok(()),
        }
    }

    /// Start both recordings.
    pub fn start(&mut self) -> Result<()> {
        self.start_raw()?;
        self.start_features()
    }

    /// Stop both recordings.  Both are closed even if the first close fails.
    pub fn stop(&mut self) -> Result<()> {
        let raw = self.stop_raw();
        let features = self.stop_features();
        raw.and(features)
    }

    /// Drop the remembered feature header; the next session announces its
    /// own.  An open feature file stays open until a different header rolls
    /// it.
    pub fn forget_header(&mut self) {
        self.feature_header = None;
    }

    /// Feed one session event.
    pub fn handle(&mut self, event: &StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Raw(samples) => {
                if let Some(r) = &mut self.raw {
                    r.append_raw(Some(self.segment), samples)?;
                }
            }
            StreamEvent::FeatureHeader(header) => {
                if self.features.as_ref().is_some_and(|f| f.columns() != header.as_slice()) {
                    if let Some(mut old) = self.features.take() {
                        old.close()?;
                    }
                }
                self.feature_header = Some(header.clone());
                self.open_features()?;
            }
            StreamEvent::Features(row) => {
                if let Some(f) = &mut self.features {
                    f.append_features(Some(self.segment), row)?;
                }
            }
            StreamEvent::Disconnected { .. } => self.forget_header(),
            _ => {}
        }
        Ok(())
    }

    fn open_features(&mut self) -> Result<()> {
        if !self.want_features || self.features.is_some() {
            return Ok(());
        }
        if let Some(header) = &self.feature_header {
            let kind = RecordingKind::Features(header.clone());
            self.features = Some(CsvRecorder::create(&self.config, FEATURE_PREFIX, kind)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Sink that records bytes and counts flushes.
    #[derive(Clone, Default)]
    struct Sink {
        buf: Rc<std::cell::RefCell<Vec<u8>>>,
        flushes: Rc<Cell<u32>>,
    }

    impl Write for Sink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.buf.borrow_mut().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            self.flushes.set(self.flushes.get() + 1);
            Ok(())
        }
    }

    impl Sink {
        fn text(&self) -> String {
            String::from_utf8(self.buf.borrow().clone()).unwrap()
        }
    }

    fn sample(ts: i64, base: i16) -> RawSample {
        RawSample {
            timestamp_ms: ts,
            acc: [base, base + 1, base + 2],
            gyro: [-base, -base - 1, -base - 2],
        }
    }

    #[test]
    fn raw_header_and_rows() {
        let sink = Sink::default();
        let mut rec = CsvRecorder::from_writer(sink.clone(), RecordingKind::Raw, None).unwrap();
        rec.append_raw(None, &[sample(10, 1), sample(10, 4)]).unwrap();
        rec.close().unwrap();

        assert_eq!(
            sink.text(),
            "timestamp_ms,acc_x,acc_y,acc_z,gyro_x,gyro_y,gyro_z\n\
             10,1,2,3,-1,-2,-3\n\
             10,4,5,6,-4,-5,-6\n"
        );
        assert_eq!(rec.rows_written(), 2);
    }

    #[test]
    fn tag_column_comes_first() {
        let sink = Sink::default();
        let kind = RecordingKind::Features(vec!["mean".into(), "peak".into()]);
        let mut rec = CsvRecorder::from_writer(sink.clone(), kind, Some("segment")).unwrap();
        rec.append_features(Some(3), &FeatureRow { values: vec![0.5, 2.0] })
            .unwrap();
        rec.append_features(None, &FeatureRow { values: vec![1.0, -1.5] })
            .unwrap();
        drop(rec);

        assert_eq!(sink.text(), "segment,mean,peak\n3,0.5,2\n,1,-1.5\n");
    }

    #[test]
    fn feature_row_with_wrong_arity_is_skipped() {
        let sink = Sink::default();
        let kind = RecordingKind::Features(vec!["a".into(), "b".into()]);
        let mut rec = CsvRecorder::from_writer(sink.clone(), kind, None).unwrap();
        rec.append_features(None, &FeatureRow { values: vec![1.0] })
            .unwrap();
        assert_eq!(rec.rows_written(), 0);
        rec.close().unwrap();
        assert_eq!(sink.text(), "a,b\n");
    }

    #[test]
    fn close_is_idempotent_and_appends_after_close_are_noops() {
        let sink = Sink::default();
        let mut rec = CsvRecorder::from_writer(sink.clone(), RecordingKind::Raw, None).unwrap();
        rec.close().unwrap();
        rec.close().unwrap();
        assert!(rec.is_closed());
        assert_eq!(sink.flushes.get(), 1);

        let before = sink.text();
        rec.append_raw(Some(1), &[sample(1, 1)]).unwrap();
        assert_eq!(sink.text(), before);
        assert_eq!(rec.rows_written(), 0);

        drop(rec);
        assert_eq!(sink.flushes.get(), 1);
    }

    #[test]
    fn feature_names_with_delimiters_are_quoted() {
        let sink = Sink::default();
        let kind = RecordingKind::Features(vec!["a,b".into(), "say \"hi\"".into()]);
        let mut rec = CsvRecorder::from_writer(sink.clone(), kind, None).unwrap();
        rec.append_features(None, &FeatureRow { values: vec![1.0, 2.0] })
            .unwrap();
        rec.close().unwrap();
        assert_eq!(sink.text(), "\"a,b\",\"say \"\"hi\"\"\"\n1,2\n");
    }

    #[test]
    fn create_writes_into_dir_and_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let config = RecorderConfig {
            dir: tmp.path().join("nested"),
            tag_column: Some("segment".into()),
        };

        let mut a = CsvRecorder::create(&config, "raw", RecordingKind::Raw).unwrap();
        let mut b = CsvRecorder::create(&config, "raw", RecordingKind::Raw).unwrap();
        a.append_raw(Some(0), &[sample(5, 1)]).unwrap();
        a.close().unwrap();
        b.close().unwrap();

        let pa = a.path().unwrap().to_path_buf();
        let pb = b.path().unwrap().to_path_buf();
        assert_ne!(pa, pb);
        assert!(pa.file_name().unwrap().to_string_lossy().starts_with("raw_"));
        assert_eq!(pa.extension().unwrap(), "csv");

        let text = fs::read_to_string(&pa).unwrap();
        assert_eq!(
            text,
            "segment,timestamp_ms,acc_x,acc_y,acc_z,gyro_x,gyro_y,gyro_z\n0,5,1,2,3,-1,-2,-3\n"
        );
    }
    fn header(names: &[&str]) -> StreamEvent {
        StreamEvent::FeatureHeader(names.iter().map(|s| s.to_string()).collect())
    }

    fn csv_files(dir: &Path, prefix: &str) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(prefix))
            .collect();
        files.sort();
        files
    }

    #[test]
    fn session_recorder_waits_for_header_and_tags_segments() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = SessionRecorder::new(RecorderConfig {
            dir: tmp.path().to_path_buf(),
            tag_column: Some("segment".into()),
        });

        rec.start().unwrap();
        assert!(rec.is_recording_raw());
        assert!(rec.is_recording_features());
        assert!(rec.feature_path().is_none());

        rec.handle(&StreamEvent::Raw(vec![sample(7, 1)])).unwrap();
        rec.handle(&header(&["mean", "std"])).unwrap();
        let feature_path = rec.feature_path().unwrap().to_path_buf();
        rec.handle(&StreamEvent::Features(FeatureRow { values: vec![1.0, 2.0] }))
            .unwrap();
        assert_eq!(rec.next_segment(), 1);
        rec.handle(&StreamEvent::Features(FeatureRow { values: vec![3.0, 4.0] }))
            .unwrap();
        rec.handle(&StreamEvent::Prediction("idle".into())).unwrap();
        rec.stop().unwrap();
        rec.stop().unwrap();

        assert!(!rec.is_recording_raw());
        assert!(!rec.is_recording_features());
        assert_eq!(
            fs::read_to_string(feature_path).unwrap(),
            "segment,mean,std\n0,1,2\n1,3,4\n"
        );
        let raw = csv_files(tmp.path(), RAW_PREFIX);
        assert_eq!(raw.len(), 1);
        assert!(fs::read_to_string(&raw[0]).unwrap().ends_with("\n0,7,1,2,3,-1,-2,-3\n"));
    }

    #[test]
    fn new_feature_header_rolls_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = SessionRecorder::new(RecorderConfig {
            dir: tmp.path().to_path_buf(),
            tag_column: None,
        });
        rec.handle(&header(&["a", "b"])).unwrap();
        rec.start_features().unwrap();
        let first = rec.feature_path().unwrap().to_path_buf();

        // Same header again (reconnect to the same firmware): file kept.
        rec.handle(&header(&["a", "b"])).unwrap();
        assert_eq!(rec.feature_path().unwrap(), first);

        rec.handle(&header(&["a", "b", "c"])).unwrap();
        let second = rec.feature_path().unwrap().to_path_buf();
        assert_ne!(first, second);
        rec.stop().unwrap();

        assert_eq!(fs::read_to_string(first).unwrap(), "a,b\n");
        assert_eq!(fs::read_to_string(second).unwrap(), "a,b,c\n");
    }

    #[test]
    fn disconnect_forgets_the_feature_header() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = SessionRecorder::new(RecorderConfig {
            dir: tmp.path().to_path_buf(),
            tag_column: None,
        });
        rec.handle(&header(&["a", "b"])).unwrap();
        rec.handle(&StreamEvent::Disconnected { reason: None }).unwrap();

        // Recording requested between sessions waits for the next header.
        rec.start_features().unwrap();
        assert!(rec.feature_path().is_none());
        assert!(csv_files(tmp.path(), FEATURE_PREFIX).is_empty());

        rec.handle(&header(&["x", "y", "z"])).unwrap();
        let path = rec.feature_path().unwrap().to_path_buf();
        rec.stop().unwrap();
        assert_eq!(csv_files(tmp.path(), FEATURE_PREFIX), vec![path.clone()]);
        assert_eq!(fs::read_to_string(path).unwrap(), "x,y,z\n");
    }

    #[test]
    fn events_are_ignored_while_not_recording() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = SessionRecorder::new(RecorderConfig {
            dir: tmp.path().join("never"),
            tag_column: None,
        });
        rec.handle(&StreamEvent::Raw(vec![sample(1, 1)])).unwrap();
        rec.handle(&header(&["x"])).unwrap();
        rec.handle(&StreamEvent::Features(FeatureRow { values: vec![1.0] }))
            .unwrap();
        assert!(!tmp.path().join("never").exists());
    }
}
