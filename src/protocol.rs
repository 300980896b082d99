//! GATT UUIDs, frame geometry, and timing constants for the M5StickC logger
//! firmware.
//!
//! All UUIDs are 16-bit assigned values expanded into the Bluetooth base UUID
//! `0000XXXX-0000-1000-8000-00805f9b34fb`.

use std::time::Duration;

use uuid::Uuid;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service exposed by the logger firmware.
pub const LOGGER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Raw inertial stream: one [`RAW_FRAME_LEN`]-byte frame per notification.
pub const RAW_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Feature stream: comma-separated text.  The first notification after
/// connecting names the fields; the rest carry values.
pub const FEATURE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000ffe2_0000_1000_8000_00805f9b34fb);

/// Classifier output: text of the form `PRED:<label>`.
pub const PREDICTION_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000ffe3_0000_1000_8000_00805f9b34fb);

/// Every notification channel the client knows how to decode, in subscription
/// order.  Channels missing on a device are skipped.
pub const STREAM_CHARACTERISTICS: [Uuid; 3] = [
    RAW_CHARACTERISTIC,
    FEATURE_CHARACTERISTIC,
    PREDICTION_CHARACTERISTIC,
];

/// Short human-readable name for a known characteristic, for log lines.
pub fn characteristic_name(uuid: &Uuid) -> &'static str {
    if *uuid == RAW_CHARACTERISTIC {
        "raw"
    } else if *uuid == FEATURE_CHARACTERISTIC {
        "features"
    } else if *uuid == PREDICTION_CHARACTERISTIC {
        "prediction"
    } else {
        "unknown"
    }
}

// ── Raw frame geometry ────────────────────────────────────────────────────────

/// Values per sample: acc x/y/z followed by gyro x/y/z.
pub const RAW_VALUES_PER_SAMPLE: usize = 6;

/// Samples packed into one raw notification.
pub const RAW_SAMPLES_PER_FRAME: usize = 10;

/// Bytes in one raw notification: 10 samples × 6 × `i16`.
///
/// Any notification of a different length is discarded.
pub const RAW_FRAME_LEN: usize = RAW_SAMPLES_PER_FRAME * RAW_VALUES_PER_SAMPLE * 2;

/// Axis labels in wire order.
pub const RAW_AXIS_NAMES: [&str; RAW_VALUES_PER_SAMPLE] =
    ["acc_x", "acc_y", "acc_z", "gyro_x", "gyro_y", "gyro_z"];

/// Header row written at the top of every raw recording.
pub const RAW_CSV_HEADER: [&str; RAW_VALUES_PER_SAMPLE + 1] = [
    "timestamp_ms",
    "acc_x",
    "acc_y",
    "acc_z",
    "gyro_x",
    "gyro_y",
    "gyro_z",
];

// ── Text frames ───────────────────────────────────────────────────────────────

/// Field separator of feature frames.
pub const FEATURE_DELIMITER: char = ',';

/// Literal prefix of every prediction frame.
pub const PREDICTION_PREFIX: &str = "PRED:";

// ── Timing ────────────────────────────────────────────────────────────────────

/// Default scan window.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard limit on `connect()`; BlueZ can otherwise block indefinitely.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval at which the session polls the link state.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the event channel between the session task and its consumer.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
