use std::fmt;

/// One inertial measurement decoded from a raw frame.
///
/// Values are the sensor's raw signed counts; no unit conversion is applied
/// because the firmware's full-scale settings are not part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    /// Arrival time of the frame in milliseconds since the Unix epoch.
    ///
    /// All ten samples of one frame share this value.
    pub timestamp_ms: i64,
    /// Acceleration, x/y/z.
    pub acc: [i16; 3],
    /// Angular rate, x/y/z.
    pub gyro: [i16; 3],
}

impl RawSample {
    /// The six measurements in wire order: acc x/y/z then gyro x/y/z.
    pub fn values(&self) -> [i16; 6] {
        [
            self.acc[0],
            self.acc[1],
            self.acc[2],
            self.gyro[0],
            self.gyro[1],
            self.gyro[2],
        ]
    }
}

/// A row of the feature stream, already checked against the session's header.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    /// Values in header order; always the same length as the header.
    pub values: Vec<f64>,
}

impl FeatureRow {
    /// Iterate `(name, value)` pairs against `header`.
    pub fn named<'a>(&'a self, header: &'a [String]) -> impl Iterator<Item = (&'a str, f64)> {
        header
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

/// Lifecycle of one connection session.
///
/// `Disconnected` is terminal; every session reaches it through the same
/// teardown path whatever ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Waiting for `connect()` and service discovery.
    Connecting,
    /// Subscribed and forwarding notifications.
    Connected,
    /// Unsubscribing and disconnecting.
    TearingDown,
    /// Session over.
    #[default]
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::TearingDown => "tearing down",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Everything a session sends to its consumer.
///
/// Consumers receive these through the `mpsc::Receiver` returned by
/// [`crate::ble_client::StreamClient::open`].  The last event of every
/// session is [`StreamEvent::Disconnected`]; the channel closes right after.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The session moved to a new state.
    State(ConnectionState),
    /// Link up and subscriptions done.  Carries the advertised device name.
    Connected(String),
    /// Ten samples from one raw frame.
    Raw(Vec<RawSample>),
    /// The feature header for this session.  Sent once, before any
    /// [`StreamEvent::Features`].
    FeatureHeader(Vec<String>),
    /// One feature row matching the last [`StreamEvent::FeatureHeader`].
    Features(FeatureRow),
    /// Latest classifier label.
    Prediction(String),
    /// The session ended.
    ///
    /// `reason` is `None` when the consumer asked for the disconnect and a
    /// human-readable message otherwise (peer dropped the link, connect
    /// timed out, adapter error, …).
    Disconnected { reason: Option<String> },
}

/// Result of a discovery run, delivered by
/// [`crate::ble_client::StreamClient::scan`].
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A peripheral was seen.
    Found(crate::ble_client::BleDevice),
    /// Scan over.  `error` carries the failure message if the scan could not
    /// run; devices found before the failure have already been reported.
    Finished { error: Option<String> },
}
