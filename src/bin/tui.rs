//! Live terminal monitor for the M5StickC BLE logger.
//!
//! Usage:
//!   cargo run --bin tui                # scan, then pick a device with Tab / Enter
//!   cargo run --bin tui -- --simulate  # synthetic data, no hardware needed
//!
//! Keys (main view)
//! ----------------
//!   Tab      open device picker
//!   s        scan again
//!   d        disconnect
//!   r        start / stop raw recording
//!   f        start / stop feature recording
//!   n        next segment
//!   +  / =   zoom out
//!   -        zoom in
//!   a        auto-scale both charts
//!   c        clear buffers
//!   q / Esc  quit
//!
//! Keys (device picker)
//! --------------------
//!   ↑ / ↓   navigate list
//!   Enter    connect to highlighted device
//!   s        rescan
//!   Esc      close picker

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Layout, Margin, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span, Text},
    widgets::{
        Axis, Block, Borders, Cell, Chart, Clear, Dataset, GraphType, List, ListItem, ListState,
        Paragraph, Row, Table,
    },
    Frame, Terminal,
};
use tokio::sync::mpsc;

use m5_logger::ble_client::{BleDevice, SessionHandle, StreamClient, StreamClientConfig};
use m5_logger::parse::NotificationDecoder;
use m5_logger::protocol::{
    FEATURE_CHARACTERISTIC, PREDICTION_CHARACTERISTIC, RAW_AXIS_NAMES, RAW_CHARACTERISTIC,
    RAW_SAMPLES_PER_FRAME,
};
use m5_logger::recorder::{RecorderConfig, SessionRecorder};
use m5_logger::types::{ScanEvent, StreamEvent};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Nominal IMU sample rate of the firmware (Hz); only used for the x axis.
const SAMPLE_HZ: f64 = 100.0;

/// Width of the scrolling chart window in seconds.
const WINDOW_SECS: f64 = 5.0;

/// Samples retained per axis.
const BUF_SIZE: usize = (WINDOW_SECS * SAMPLE_HZ) as usize; // 500

/// Half-ranges of the y axis in raw sensor counts.
const Y_SCALES: &[f64] = &[250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0, 32768.0];

/// Starting scale: ±4000 counts suits a resting board on the default ranges.
const DEFAULT_SCALE: usize = 4;

/// Axis colours, x/y/z.
const COLORS: [Color; 3] = [Color::Red, Color::Green, Color::Cyan];

/// Columns of the feature grid.
const FEATURE_COLS: usize = 3;

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// A prediction older than this is drawn dimmed.
const PREDICTION_STALE: Duration = Duration::from_secs(3);

// ── Command line ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(version, about = "Live terminal view of an M5StickC BLE stream")]
struct Args {
    /// Feed synthetic frames instead of scanning for a device.
    #[arg(long)]
    simulate: bool,

    /// Only list devices whose name starts with this prefix (empty = all).
    #[arg(long, default_value = "M5")]
    name_prefix: String,

    /// Scan window in seconds.
    #[arg(long, default_value_t = 5)]
    scan_secs: u64,

    /// Directory for CSV recordings.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

// ── App mode ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum AppMode {
    /// Nothing running; waiting for the user.
    Idle,
    /// A scan is in progress.
    Scanning,
    /// A session is being set up.
    Connecting(String),
    /// Streaming from a device.
    Connected(String),
    /// `--simulate`: streaming from the built-in generator.
    Simulated,
    /// The last session ended.  Carries the reason if it was not requested.
    Disconnected(Option<String>),
}

// ── App state (shared with the event task via Arc<Mutex<_>>) ──────────────────

pub struct App {
    // ── IMU data: acc x/y/z then gyro x/y/z
    bufs: [VecDeque<f64>; 6],

    // ── Features / prediction
    feature_header: Vec<String>,
    feature_values: Vec<f64>,
    prediction: Option<(String, Instant)>,

    // ── Status
    pub mode: AppMode,
    /// Generation of the session whose events are shown.
    session: u64,
    total_frames: u64,
    frame_times: VecDeque<Instant>,
    pub last_error: Option<String>,

    // ── Recording
    recorder: SessionRecorder,

    // ── UI controls
    acc_scale: usize,
    gyro_scale: usize,

    // ── Device picker
    pub show_picker: bool,
    pub picker_cursor: usize,
    pub picker_entries: Vec<String>,
    pub picker_scanning: bool,
}

impl App {
    fn new(recorder: SessionRecorder) -> Self {
        Self {
            bufs: std::array::from_fn(|_| VecDeque::with_capacity(BUF_SIZE + 16)),
            feature_header: vec![],
            feature_values: vec![],
            prediction: None,
            mode: AppMode::Idle,
            session: 0,
            total_frames: 0,
            frame_times: VecDeque::with_capacity(64),
            last_error: None,
            recorder,
            acc_scale: DEFAULT_SCALE,
            gyro_scale: DEFAULT_SCALE,
            show_picker: false,
            picker_cursor: 0,
            picker_entries: vec![],
            picker_scanning: false,
        }
    }

    /// Switch to a new session and return its generation.  Events still
    /// arriving from the previous session are ignored from here on.
    fn begin_session(&mut self, mode: AppMode) -> u64 {
        self.session += 1;
        self.clear();
        self.feature_header.clear();
        self.feature_values.clear();
        self.recorder.forget_header();
        self.show_picker = false;
        self.mode = mode;
        self.session
    }

    /// Apply an event from session `generation`, unless it was replaced.
    fn apply_from(&mut self, generation: u64, event: StreamEvent) {
        if generation != self.session {
            log::debug!("dropping event from replaced session {generation}");
            return;
        }
        self.apply(event);
    }

    /// Apply one session event: record it, then update the display state.
    fn apply(&mut self, event: StreamEvent) {
        if let Err(e) = self.recorder.handle(&event) {
            log::error!("recording: {e:#}");
            self.last_error = Some(format!("recording: {e:#}"));
        }

        match event {
            StreamEvent::State(state) => log::debug!("session state: {state}"),
            StreamEvent::Connected(name) => {
                if !matches!(self.mode, AppMode::Simulated) {
                    self.mode = AppMode::Connected(name);
                }
                self.last_error = None;
            }
            StreamEvent::Raw(samples) => {
                for s in &samples {
                    for (buf, v) in self.bufs.iter_mut().zip(s.values()) {
                        buf.push_back(v as f64);
                        while buf.len() > BUF_SIZE {
                            buf.pop_front();
                        }
                    }
                }
                self.note_frame();
            }
            StreamEvent::FeatureHeader(header) => {
                self.feature_values = vec![f64::NAN; header.len()];
                self.feature_header = header;
            }
            StreamEvent::Features(row) => self.feature_values = row.values,
            StreamEvent::Prediction(label) => self.prediction = Some((label, Instant::now())),
            StreamEvent::Disconnected { reason } => {
                self.mode = AppMode::Disconnected(reason);
            }
        }
    }

    /// Track raw frame arrivals over a 2 s sliding window.
    fn note_frame(&mut self) {
        self.total_frames += 1;
        let now = Instant::now();
        self.frame_times.push_back(now);
        while self
            .frame_times
            .front()
            .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(2))
        {
            self.frame_times.pop_front();
        }
    }

    /// Raw frames per second.
    fn frame_rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.frame_times.front(), self.frame_times.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if self.frame_times.len() < 2 || span < 1e-9 {
            0.0
        } else {
            (self.frame_times.len() as f64 - 1.0) / span
        }
    }

    /// Wipe live data.  Recording state and the picker are left alone.
    fn clear(&mut self) {
        for b in &mut self.bufs {
            b.clear();
        }
        self.feature_values.iter_mut().for_each(|v| *v = f64::NAN);
        self.prediction = None;
        self.total_frames = 0;
        self.frame_times.clear();
        self.last_error = None;
    }

    fn scale_up(&mut self) {
        self.acc_scale = (self.acc_scale + 1).min(Y_SCALES.len() - 1);
        self.gyro_scale = (self.gyro_scale + 1).min(Y_SCALES.len() - 1);
    }

    fn scale_down(&mut self) {
        self.acc_scale = self.acc_scale.saturating_sub(1);
        self.gyro_scale = self.gyro_scale.saturating_sub(1);
    }

    /// Pick the smallest scale that fits each chart's peak with 10 % headroom.
    fn auto_scale(&mut self) {
        let fit = |bufs: &[VecDeque<f64>]| {
            let peak = bufs
                .iter()
                .flat_map(|b| b.iter())
                .fold(0.0_f64, |acc, &v| acc.max(v.abs()));
            Y_SCALES
                .iter()
                .position(|&s| s >= peak * 1.1)
                .unwrap_or(Y_SCALES.len() - 1)
        };
        self.acc_scale = fit(&self.bufs[..3]);
        self.gyro_scale = fit(&self.bufs[3..]);
    }

    /// Toggle raw recording; reports failures in the header.
    fn toggle_raw_recording(&mut self) {
        let result = if self.recorder.is_recording_raw() {
            self.recorder.stop_raw()
        } else {
            self.recorder.start_raw()
        };
        if let Err(e) = result {
            self.last_error = Some(format!("{e:#}"));
        }
    }

    fn toggle_feature_recording(&mut self) {
        let result = if self.recorder.is_recording_features() {
            self.recorder.stop_features()
        } else {
            self.recorder.start_features()
        };
        if let Err(e) = result {
            self.last_error = Some(format!("{e:#}"));
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Shorten a BLE identifier for compact display (last 8 characters).
fn short_id(id: &str) -> String {
    let trimmed = id.trim_matches(|c: char| c == '{' || c == '}');
    let start = trimmed
        .char_indices()
        .rev()
        .nth(7)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_uppercase()
}

fn device_entry(d: &BleDevice) -> String {
    let rssi = d.rssi.map(|r| format!("  {r} dBm")).unwrap_or_default();
    format!("{}  [{}]{rssi}", d.name, short_id(&d.id))
}

fn spinner_str() -> &'static str {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    SPINNER[(ms / 100) as usize % SPINNER.len()]
}

// ── Simulator ─────────────────────────────────────────────────────────────────

/// One synthetic IMU sample at time `t` (seconds): a slow wrist swing with a
/// burst of shaking every 8 s.
fn sim_sample(t: f64) -> [i16; 6] {
    let shake = if (t % 8.0) > 6.0 { 1.0 } else { 0.0 };
    let swing = (2.0 * PI * 0.5 * t).sin();
    let jitter = |k: f64| ((t * 1000.7 + k * 137.5).sin() * 9973.1).fract() - 0.5;
    let v = [
        1200.0 * swing + 3000.0 * shake * (2.0 * PI * 7.0 * t).sin() + 80.0 * jitter(1.0),
        600.0 * (2.0 * PI * 0.5 * t).cos() + 80.0 * jitter(2.0),
        4096.0 + 300.0 * swing + 80.0 * jitter(3.0),
        2500.0 * (2.0 * PI * 0.5 * t).cos() + 6000.0 * shake * (2.0 * PI * 7.0 * t).cos(),
        400.0 * swing + 60.0 * jitter(4.0),
        200.0 * (2.0 * PI * 0.25 * t).sin() + 60.0 * jitter(5.0),
    ];
    v.map(|x| x.clamp(i16::MIN as f64, i16::MAX as f64) as i16)
}

/// Root-mean-square of one value column of `window`.
fn rms(window: &[[i16; 6]], col: usize) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let sum: f64 = window.iter().map(|s| (s[col] as f64).powi(2)).sum();
    (sum / window.len() as f64).sqrt()
}

/// Spawn a generator that speaks the firmware's wire format.
///
/// Frames are encoded to bytes and pushed through the same
/// [`NotificationDecoder`] a real session uses, so the simulator also
/// exercises the decoders:
/// * raw: one 120-byte frame every 100 ms (10 samples at 100 Hz)
/// * features: header first, then a row every 500 ms
/// * prediction: `PRED:<label>` every 2 s
fn spawn_simulator() -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        let mut decoder = NotificationDecoder::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        let dt = 1.0 / SAMPLE_HZ;
        let mut t = 0.0_f64;
        let mut tick = 0u64;
        let mut window: Vec<[i16; 6]> = Vec::with_capacity(50);

        let mut send = |uuid, bytes: Vec<u8>| {
            let now = chrono::Utc::now().timestamp_millis();
            decoder.decode(uuid, &bytes, now)
        };

        if let Some(ev) = send(
            FEATURE_CHARACTERISTIC,
            b"acc_x_rms,acc_y_rms,acc_z_rms,gyro_x_rms,gyro_y_rms,gyro_z_rms".to_vec(),
        ) {
            let _ = tx.send(ev).await;
        }
        let _ = tx
            .send(StreamEvent::Connected("Simulator".into()))
            .await;

        loop {
            ticker.tick().await;

            let samples: Vec<[i16; 6]> = (0..RAW_SAMPLES_PER_FRAME)
                .map(|i| sim_sample(t + i as f64 * dt))
                .collect();
            t += RAW_SAMPLES_PER_FRAME as f64 * dt;
            window.extend_from_slice(&samples);

            let frame: Vec<u8> = samples
                .iter()
                .flat_map(|s| s.iter().flat_map(|v| v.to_le_bytes()))
                .collect();
            let mut events = vec![send(RAW_CHARACTERISTIC, frame)];

            tick += 1;
            if tick % 5 == 0 {
                let row: Vec<String> = (0..6).map(|c| format!("{:.2}", rms(&window, c))).collect();
                window.clear();
                events.push(send(FEATURE_CHARACTERISTIC, row.join(",").into_bytes()));
            }
            if tick % 20 == 0 {
                let label = if (t % 8.0) > 6.0 {
                    "shake"
                } else if (t % 16.0) > 8.0 {
                    "walk"
                } else {
                    "idle"
                };
                events.push(send(
                    PREDICTION_CHARACTERISTIC,
                    format!("PRED:{label}").into_bytes(),
                ));
            }

            for ev in events.into_iter().flatten() {
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

// ── Event plumbing ────────────────────────────────────────────────────────────

/// Forward events of session `generation` into `app` until it ends.
fn spawn_event_task(mut rx: mpsc::Receiver<StreamEvent>, app: Arc<Mutex<App>>, generation: u64) {
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            let done = matches!(ev, StreamEvent::Disconnected { .. });
            app.lock().unwrap().apply_from(generation, ev);
            if done {
                break;
            }
        }
    });
}

/// Start a scan, resetting the picker list.
fn start_scan(
    client: &StreamClient,
    app: &Arc<Mutex<App>>,
    devices: &mut Vec<BleDevice>,
) -> mpsc::Receiver<ScanEvent> {
    devices.clear();
    let mut s = app.lock().unwrap();
    s.picker_entries.clear();
    s.picker_cursor = 0;
    s.picker_scanning = true;
    if !matches!(s.mode, AppMode::Connected(_) | AppMode::Connecting(_)) {
        s.mode = AppMode::Scanning;
    }
    client.scan()
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn draw(frame: &mut Frame, app: &App) {
    let area = frame.area();
    let [header, body, footer] = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(0),
        Constraint::Length(4),
    ])
    .areas(area);

    let [charts, side] =
        Layout::horizontal([Constraint::Percentage(65), Constraint::Percentage(35)]).areas(body);
    let [acc, gyro] =
        Layout::vertical([Constraint::Ratio(1, 2), Constraint::Ratio(1, 2)]).areas(charts);
    let [features, prediction] =
        Layout::vertical([Constraint::Min(0), Constraint::Length(5)]).areas(side);

    draw_header(frame, header, app);
    draw_imu_chart(frame, acc, app, 0, "Accelerometer", Y_SCALES[app.acc_scale]);
    draw_imu_chart(frame, gyro, app, 3, "Gyroscope", Y_SCALES[app.gyro_scale]);
    draw_features(frame, features, app);
    draw_prediction(frame, prediction, app);
    draw_footer(frame, footer, app);

    if app.show_picker {
        draw_device_picker(frame, area, app);
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let (label, color) = match &app.mode {
        AppMode::Idle => ("○ Idle · [s] scan, [Tab] pick a device".to_owned(), Color::DarkGray),
        AppMode::Scanning => (format!("{} Scanning…", spinner_str()), Color::Yellow),
        AppMode::Connecting(name) => (
            format!("{} Connecting to {name}…", spinner_str()),
            Color::Yellow,
        ),
        AppMode::Connected(name) => (format!("● {name}"), Color::Green),
        AppMode::Simulated => ("◆ Simulated".to_owned(), Color::Cyan),
        AppMode::Disconnected(reason) => {
            let reason = reason
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default();
            (format!("✕ Disconnected{reason}"), Color::Red)
        }
    };

    let mut spans = vec![
        Span::styled(
            " M5 BLE Logger ",
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        sep(),
        Span::raw(format!("{:.1} frm/s", app.frame_rate())),
        sep(),
        Span::styled(
            format!("{} frames", app.total_frames),
            Style::default().fg(Color::DarkGray),
        ),
        sep(),
        Span::styled(
            format!("segment {}", app.recorder.segment()),
            Style::default().fg(Color::LightBlue).add_modifier(Modifier::BOLD),
        ),
    ];
    if app.recorder.is_recording_raw() || app.recorder.is_recording_features() {
        spans.push(sep());
        spans.push(Span::styled(
            "⏺ REC",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ));
    }
    if let Some(err) = &app.last_error {
        spans.push(sep());
        spans.push(Span::styled(err.clone(), Style::default().fg(Color::Red)));
    }

    frame.render_widget(
        Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

#[inline]
fn sep<'a>() -> Span<'a> {
    Span::styled(" │ ", Style::default().fg(Color::DarkGray))
}

// ── IMU charts ────────────────────────────────────────────────────────────────

/// Draw three axes starting at buffer `first` on one chart.
///
/// Points are clamped to the y window; ratatui drops out-of-range points,
/// which would break the line into dots.
fn draw_imu_chart(frame: &mut Frame, area: Rect, app: &App, first: usize, title: &str, y: f64) {
    let data: Vec<Vec<(f64, f64)>> = (first..first + 3)
        .map(|i| {
            app.bufs[i]
                .iter()
                .enumerate()
                .map(|(n, &v)| (n as f64 / SAMPLE_HZ, v.clamp(-y, y)))
                .collect()
        })
        .collect();

    let latest: Vec<String> = (first..first + 3)
        .map(|i| {
            let v = app.bufs[i].back().copied().unwrap_or(0.0);
            format!("{}:{v:+6.0}", RAW_AXIS_NAMES[i])
        })
        .collect();
    let clipping = app.bufs[first..first + 3]
        .iter()
        .flat_map(|b| b.iter())
        .any(|v| v.abs() > y);

    let datasets: Vec<Dataset> = data
        .iter()
        .enumerate()
        .map(|(axis, points)| {
            Dataset::default()
                .name(["x", "y", "z"][axis])
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(COLORS[axis]))
                .data(points)
        })
        .collect();

    let clip_tag = if clipping { " [CLIP]" } else { "" };
    let border = if clipping { Color::Red } else { Color::Gray };
    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .title(Span::styled(
                    format!(" {title}  {}{clip_tag} ", latest.join("  ")),
                    Style::default().add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(border)),
        )
        .x_axis(
            Axis::default()
                .bounds([0.0, WINDOW_SECS])
                .labels(vec![
                    "0s".to_string(),
                    format!("{:.1}s", WINDOW_SECS / 2.0),
                    format!("{:.0}s", WINDOW_SECS),
                ])
                .style(Style::default().fg(Color::DarkGray)),
        )
        .y_axis(
            Axis::default()
                .bounds([-y, y])
                .labels(vec![format!("{:+.0}", -y), "0".to_string(), format!("{:+.0}", y)])
                .style(Style::default().fg(Color::DarkGray)),
        );

    frame.render_widget(chart, area);
}

// ── Features / prediction ─────────────────────────────────────────────────────

/// Feature names and latest values, three per row.
fn draw_features(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .title(" Features ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Gray));

    if app.feature_header.is_empty() {
        frame.render_widget(
            Paragraph::new("waiting for feature header…")
                .style(Style::default().fg(Color::DarkGray))
                .block(block),
            area,
        );
        return;
    }

    let rows: Vec<Row> = app
        .feature_header
        .chunks(FEATURE_COLS)
        .zip(app.feature_values.chunks(FEATURE_COLS))
        .map(|(names, values)| {
            let cells = names.iter().zip(values).map(|(name, v)| {
                let value = if v.is_nan() {
                    "—".to_owned()
                } else {
                    format!("{v:.3}")
                };
                Cell::from(Text::from(vec![
                    Line::styled(name.clone(), Style::default().add_modifier(Modifier::BOLD)),
                    Line::raw(value),
                ]))
            });
            Row::new(cells).height(2)
        })
        .collect();

    let widths = [Constraint::Ratio(1, FEATURE_COLS as u32); FEATURE_COLS];
    frame.render_widget(Table::new(rows, widths).block(block), area);
}

fn draw_prediction(frame: &mut Frame, area: Rect, app: &App) {
    let (text, style) = match &app.prediction {
        Some((label, at)) => {
            let color = if at.elapsed() > PREDICTION_STALE {
                Color::DarkGray
            } else {
                Color::Yellow
            };
            (
                label.to_uppercase(),
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            )
        }
        None => ("—".to_owned(), Style::default().fg(Color::DarkGray)),
    };

    frame.render_widget(
        Paragraph::new(vec![Line::raw(""), Line::styled(text, style)])
            .alignment(Alignment::Center)
            .block(Block::default().title(" Prediction ").borders(Borders::ALL)),
        area,
    );
}

// ── Footer ────────────────────────────────────────────────────────────────────

/// Key hints on the first line, recording status on the second.
fn draw_footer(frame: &mut Frame, area: Rect, app: &App) {
    let keys = Line::from(vec![
        Span::raw(" "),
        key("[Tab]"),
        Span::raw("Devices  "),
        key("[s]"),
        Span::raw("Scan  "),
        key("[d]"),
        Span::raw("Disconnect  "),
        key("[r]"),
        Span::raw("Rec raw  "),
        key("[f]"),
        Span::raw("Rec features  "),
        key("[n]"),
        Span::raw("Next segment  "),
        key("[+/-/a]"),
        Span::raw("Scale  "),
        key("[c]"),
        Span::raw("Clear  "),
        key("[q]"),
        Span::raw("Quit"),
    ]);

    let rec = |on: bool, path: Option<String>, what: &str| -> Vec<Span<'static>> {
        if on {
            vec![
                Span::styled(
                    format!("⏺ {what} "),
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                ),
                Span::styled(
                    path.unwrap_or_else(|| "(waiting for header)".into()),
                    Style::default().fg(Color::Gray),
                ),
                Span::raw("   "),
            ]
        } else {
            vec![Span::styled(
                format!("○ {what} off   "),
                Style::default().fg(Color::DarkGray),
            )]
        }
    };

    let r = &app.recorder;
    let mut status = vec![Span::raw(" ")];
    status.extend(rec(
        r.is_recording_raw(),
        r.raw_path().map(|p| p.display().to_string()),
        "raw",
    ));
    status.extend(rec(
        r.is_recording_features(),
        r.feature_path().map(|p| p.display().to_string()),
        "features",
    ));

    frame.render_widget(
        Paragraph::new(vec![keys, Line::from(status)]).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

#[inline]
fn key(s: &str) -> Span<'_> {
    Span::styled(
        s,
        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
    )
}

// ── Device picker overlay ─────────────────────────────────────────────────────

fn draw_device_picker(frame: &mut Frame, area: Rect, app: &App) {
    let n = app.picker_entries.len().max(1);
    let box_h = n as u16 + 6;
    let box_w = (area.width * 60 / 100).max(52).min(area.width);
    let x = area.x + area.width.saturating_sub(box_w) / 2;
    let y = area.y + area.height.saturating_sub(box_h) / 2;
    let popup = Rect::new(x, y, box_w, box_h.min(area.height));

    frame.render_widget(Clear, popup);

    let title = if app.picker_scanning {
        format!(" {} Scanning…  ({} found) ", spinner_str(), app.picker_entries.len())
    } else {
        format!(" Select Device  ({} found) ", app.picker_entries.len())
    };
    frame.render_widget(
        Block::default()
            .title(Span::styled(
                title,
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            ))
            .borders(Borders::ALL),
        popup,
    );

    let inner = popup.inner(Margin {
        horizontal: 1,
        vertical: 1,
    });
    let [list_area, _, hint_area] = Layout::vertical([
        Constraint::Min(1),
        Constraint::Length(1),
        Constraint::Length(1),
    ])
    .areas(inner);

    let items: Vec<ListItem> = if app.picker_entries.is_empty() {
        vec![ListItem::new(Span::styled(
            "  No devices found, press [s] to scan",
            Style::default().fg(Color::DarkGray),
        ))]
    } else {
        app.picker_entries
            .iter()
            .map(|e| ListItem::new(format!("  {e}")))
            .collect()
    };

    let mut list_state = ListState::default();
    if !app.picker_entries.is_empty() {
        list_state.select(Some(app.picker_cursor));
    }
    frame.render_stateful_widget(
        List::new(items)
            .highlight_style(
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::White)
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ "),
        list_area,
        &mut list_state,
    );

    frame.render_widget(
        Paragraph::new(Line::from(vec![
            key(" [↑↓]"),
            Span::raw(" Navigate  "),
            key("[↵]"),
            Span::raw(" Connect  "),
            key("[s]"),
            Span::raw(" Rescan  "),
            key("[Esc]"),
            Span::raw(" Close"),
        ])),
        hint_area,
    );
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    use std::io::IsTerminal as _;
    if !io::stdout().is_terminal() {
        eprintln!("Error: the m5-logger tui requires a real terminal (TTY).");
        std::process::exit(1);
    }

    let args = Args::parse();

    // ── Logging ─────────────────────────────────────────────────────────────
    // Logs go to m5-tui.log so they never draw over the UI.
    if let Ok(file) = std::fs::File::create("m5-tui.log") {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
    }

    let client = StreamClient::new(StreamClientConfig {
        scan_timeout: Duration::from_secs(args.scan_secs),
        name_prefix: (!args.name_prefix.is_empty()).then(|| args.name_prefix.clone()),
        ..Default::default()
    });
    let recorder = SessionRecorder::new(RecorderConfig {
        dir: args.data_dir.clone(),
        ..Default::default()
    });
    let app = Arc::new(Mutex::new(App::new(recorder)));

    // ── Session state (owned by the main task) ────────────────────────────────
    let mut devices: Vec<BleDevice> = vec![];
    let mut handle: Option<SessionHandle> = None;
    let mut pending_scan: Option<mpsc::Receiver<ScanEvent>> = None;

    if args.simulate {
        let generation = app.lock().unwrap().begin_session(AppMode::Simulated);
        spawn_event_task(spawn_simulator(), Arc::clone(&app), generation);
    } else {
        pending_scan = Some(start_scan(&client, &app, &mut devices));
    }

    // ── Terminal setup ────────────────────────────────────────────────────────
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    let tick = Duration::from_millis(33); // ~30 FPS

    // ── Main loop ─────────────────────────────────────────────────────────────
    'main: loop {
        // ── 1. Drain scan results ────────────────────────────────────────────
        let mut scan_done = false;
        if let Some(rx) = pending_scan.as_mut() {
            while let Ok(event) = rx.try_recv() {
                let mut s = app.lock().unwrap();
                match event {
                    ScanEvent::Found(d) => {
                        s.picker_entries.push(device_entry(&d));
                        devices.push(d);
                    }
                    ScanEvent::Finished { error } => {
                        s.picker_scanning = false;
                        if matches!(s.mode, AppMode::Scanning) {
                            s.mode = AppMode::Idle;
                        }
                        if let Some(e) = error {
                            s.last_error = Some(e);
                        }
                        // Let the user choose.
                        if !devices.is_empty() && handle.is_none() {
                            s.show_picker = true;
                        }
                        scan_done = true;
                        break;
                    }
                }
            }
        }
        if scan_done {
            pending_scan = None;
        }

        // ── 2. Drop the handle of a finished session ─────────────────────────
        if handle.as_ref().is_some_and(SessionHandle::is_finished) {
            handle = None;
        }

        // ── 3. Render ─────────────────────────────────────────────────────────
        {
            let s = app.lock().unwrap();
            terminal.draw(|f| draw(f, &s))?;
        }

        // ── 4. Keyboard ───────────────────────────────────────────────────────
        if !event::poll(tick)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };

        let ctrl_c =
            key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c');
        if key.code == KeyCode::Char('q') || ctrl_c {
            break 'main;
        }

        if app.lock().unwrap().show_picker {
            match key.code {
                KeyCode::Esc => app.lock().unwrap().show_picker = false,
                KeyCode::Char('s') if pending_scan.is_none() && !args.simulate => {
                    pending_scan = Some(start_scan(&client, &app, &mut devices));
                }
                KeyCode::Up => {
                    let mut s = app.lock().unwrap();
                    s.picker_cursor = s.picker_cursor.saturating_sub(1);
                }
                KeyCode::Down => {
                    let mut s = app.lock().unwrap();
                    let max = s.picker_entries.len().saturating_sub(1);
                    s.picker_cursor = (s.picker_cursor + 1).min(max);
                }
                KeyCode::Enter if !args.simulate => {
                    let cursor = app.lock().unwrap().picker_cursor;
                    if let Some(device) = devices.get(cursor).cloned() {
                        if let Some(old) = handle.take() {
                            old.disconnect();
                        }
                        let generation = app
                            .lock()
                            .unwrap()
                            .begin_session(AppMode::Connecting(device.name.clone()));
                        let (rx, h) = client.open(device);
                        spawn_event_task(rx, Arc::clone(&app), generation);
                        handle = Some(h);
                    }
                }
                _ => {}
            }
            continue;
        }

        match key.code {
            KeyCode::Esc => break 'main,
            KeyCode::Tab => app.lock().unwrap().show_picker = true,
            KeyCode::Char('s') if pending_scan.is_none() && !args.simulate => {
                pending_scan = Some(start_scan(&client, &app, &mut devices));
            }
            KeyCode::Char('d') => {
                if let Some(h) = &handle {
                    h.disconnect();
                }
            }
            KeyCode::Char('r') => app.lock().unwrap().toggle_raw_recording(),
            KeyCode::Char('f') => app.lock().unwrap().toggle_feature_recording(),
            KeyCode::Char('n') => {
                app.lock().unwrap().recorder.next_segment();
            }
            KeyCode::Char('+') | KeyCode::Char('=') => app.lock().unwrap().scale_up(),
            KeyCode::Char('-') => app.lock().unwrap().scale_down(),
            KeyCode::Char('a') => app.lock().unwrap().auto_scale(),
            KeyCode::Char('c') => app.lock().unwrap().clear(),
            _ => {}
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    if let Some(h) = handle {
        h.disconnect();
        let _ = tokio::time::timeout(Duration::from_secs(3), h.join()).await;
    }
    if let Err(e) = app.lock().unwrap().recorder.stop() {
        log::error!("closing recordings: {e:#}");
    }
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
