//! # m5-logger
//!
//! Async Rust library, CLI, and terminal UI for streaming sensor data from an
//! M5StickC running the BLE logger firmware.
//!
//! The firmware exposes three notification channels:
//!
//! | Channel | Payload | Decoded into |
//! |---|---|---|
//! | raw | 120-byte frame, 10 × six `i16` LE (acc xyz, gyro xyz) | [`types::RawSample`] × 10 |
//! | features | comma-separated text; first frame is the header | [`types::FeatureRow`] |
//! | prediction | `PRED:<label>` | `String` |
//!
//! Channels missing on a device are skipped, so firmware that only streams
//! raw frames works unchanged.
//!
//! ## Quick start
//!
//! ```no_run
//! use m5_logger::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = StreamClient::new(StreamClientConfig {
//!         name_prefix: Some("M5".into()),
//!         ..Default::default()
//!     });
//!     let device = client
//!         .scan_all()
//!         .await?
//!         .into_iter()
//!         .next()
//!         .ok_or_else(|| anyhow::anyhow!("no device found"))?;
//!     let (mut rx, _handle) = client.open(device);
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             StreamEvent::Raw(samples) => println!("acc {:?}", samples[0].acc),
//!             StreamEvent::Prediction(label) => println!("→ {label}"),
//!             StreamEvent::Disconnected { reason } => {
//!                 println!("done: {reason:?}");
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`ble_client`] | Scanning, sessions, and the [`ble_client::SessionHandle`] |
//! | [`types`] | Data model and the event enums |
//! | [`protocol`] | GATT UUIDs, frame geometry, and timing constants |
//! | [`parse`] | Pure decoders for the three channels |
//! | [`recorder`] | CSV recordings with an optional segment column |

pub mod ble_client;
pub mod parse;
pub mod protocol;
pub mod recorder;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates and the bundled binaries.
pub mod prelude {
    pub use crate::ble_client::{BleDevice, SessionHandle, StreamClient, StreamClientConfig};

    pub use crate::types::{ConnectionState, FeatureRow, RawSample, ScanEvent, StreamEvent};

    pub use crate::recorder::{CsvRecorder, RecorderConfig, RecordingKind, SessionRecorder};

    pub use crate::protocol::{
        FEATURE_CHARACTERISTIC, PREDICTION_CHARACTERISTIC, RAW_AXIS_NAMES, RAW_CHARACTERISTIC,
        RAW_FRAME_LEN,
    };
}
