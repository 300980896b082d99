use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::parse::NotificationDecoder;
use crate::protocol::{
    characteristic_name, DEFAULT_CONNECT_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_SCAN_TIMEOUT,
    EVENT_CHANNEL_CAPACITY, LOGGER_SERVICE_UUID, STREAM_CHARACTERISTICS,
};
use crate::types::{ConnectionState, ScanEvent, StreamEvent};

/// Upper bound on service discovery after the link is up.
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

/// Extra time a scan task may take beyond the scan window before it is
/// abandoned.  Guards against `Manager::new()` or `start_scan()` hanging when
/// the Bluetooth stack is wedged.
const SCAN_GRACE: Duration = Duration::from_secs(10);

/// Display name for peripherals that do not advertise one.
pub const UNKNOWN_NAME: &str = "<unknown>";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── BleDevice ─────────────────────────────────────────────────────────────────

/// A peripheral seen during a scan.
///
/// Pass it to [`StreamClient::open`] to start a session.  Descriptors are
/// meant to be short-lived; they are not refreshed after the scan ends.
#[derive(Clone, Debug)]
pub struct BleDevice {
    /// Advertised local name, or [`UNKNOWN_NAME`].
    pub name: String,
    /// Platform identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: the device's BlueZ identifier
    pub id: String,
    /// Bluetooth MAC address as reported by the adapter.  CoreBluetooth hides
    /// real addresses, so on macOS this is all zeroes.
    pub address: String,
    /// Signal strength at discovery time, in dBm.
    pub rssi: Option<i16>,
    pub(crate) peripheral: Peripheral,
}

impl BleDevice {
    /// `true` if `query` names this device by id or MAC address
    /// (case-insensitive).
    pub fn matches(&self, query: &str) -> bool {
        address_matches(&self.id, &self.address, query)
    }
}

fn address_matches(id: &str, address: &str, query: &str) -> bool {
    let query = query.trim();
    !query.is_empty() && (id.eq_ignore_ascii_case(query) || address.eq_ignore_ascii_case(query))
}

/// Scan filter.  A device advertising the logger service is always kept;
/// otherwise its name must start with `prefix` (if one is set).
fn passes_filter(name: &str, services: &[Uuid], prefix: Option<&str>) -> bool {
    services.contains(&LOGGER_SERVICE_UUID) || prefix.map_or(true, |p| name.starts_with(p))
}

// ── StreamClientConfig ────────────────────────────────────────────────────────

/// Configuration for [`StreamClient`].
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// How long a scan listens for advertisements. Default: 5 s.
    pub scan_timeout: Duration,
    /// Hard limit on establishing the link. Default: 10 s.
    pub connect_timeout: Duration,
    /// How often a connected session checks that the link is still up.
    /// Default: 100 ms.
    pub poll_interval: Duration,
    /// Only report peripherals whose advertised name starts with this string
    /// or that advertise the logger service.  `None` reports everything,
    /// including unnamed devices. Default: `None`.
    pub name_prefix: Option<String>,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            name_prefix: None,
        }
    }
}

// ── StreamClient ──────────────────────────────────────────────────────────────

/// BLE client for the logger firmware.
///
/// Scanning and sessions both run on spawned tokio tasks, so every method
/// must be called from inside a tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct StreamClient {
    config: StreamClientConfig,
}

impl StreamClient {
    pub fn new(config: StreamClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StreamClientConfig {
        &self.config
    }

    // ── Public: scan ─────────────────────────────────────────────────────────

    /// Start a scan in the background.
    ///
    /// The receiver yields one [`ScanEvent::Found`] per peripheral as it is
    /// seen, then exactly one [`ScanEvent::Finished`].  Dropping the receiver
    /// early is fine; the task runs out its window and exits.
    pub fn scan(&self) -> mpsc::Receiver<ScanEvent> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.clone();
        let deadline = self.config.scan_timeout + SCAN_GRACE;
        tokio::spawn(async move {
            let scanning = OnceCell::new();
            let stop = |adapter: &Adapter| {
                let adapter = adapter.clone();
                async move {
                    adapter.stop_scan().await.ok();
                }
            };
            let work = client.discover(&tx, &scanning);
            let error = match bounded_scan(deadline, &scanning, work, stop).await {
                Some(Ok(n)) => {
                    info!("Scan finished: {n} device(s)");
                    None
                }
                Some(Err(e)) => {
                    warn!("Scan failed: {e:#}");
                    Some(format!("{e:#}"))
                }
                None => {
                    warn!("Scan timed out after {deadline:?}");
                    Some("scan timed out".to_owned())
                }
            };
            let _ = tx.send(ScanEvent::Finished { error }).await;
        });
        rx
    }

    /// Scan for the configured window and return every device found.
    pub async fn scan_all(&self) -> Result<Vec<BleDevice>> {
        let mut rx = self.scan();
        let mut found = vec![];
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::Found(d) => found.push(d),
                ScanEvent::Finished { error: Some(e) } => bail!(e),
                ScanEvent::Finished { error: None } => break,
            }
        }
        Ok(found)
    }

    /// Scan until a device with the given id or MAC address shows up.
    pub async fn find(&self, address: &str) -> Result<BleDevice> {
        let mut rx = self.scan();
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::Found(d) if d.matches(address) => return Ok(d),
                ScanEvent::Found(_) => {}
                ScanEvent::Finished { error: Some(e) } => bail!(e),
                ScanEvent::Finished { error: None } => break,
            }
        }
        Err(anyhow!(
            "no device with address {address} found within {} s",
            self.config.scan_timeout.as_secs()
        ))
    }

    // ── Public: open ─────────────────────────────────────────────────────────

    /// Start a session with `device`.
    ///
    /// Returns immediately.  Connection progress, decoded data, and the final
    /// outcome all arrive on the receiver; a failed connect shows up as
    /// [`StreamEvent::Disconnected`] with the error text as reason.
    pub fn open(&self, device: BleDevice) -> (mpsc::Receiver<StreamEvent>, SessionHandle) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();

        let session = Session {
            peripheral: device.peripheral,
            config: self.config.clone(),
            link: SessionLink {
                name: device.name,
                events,
                state,
                cancel: cancel.clone(),
            },
        };
        let task = tokio::spawn(session.run());

        (rx, SessionHandle::new(cancel, state_rx, task))
    }

    /// [`find`](Self::find) followed by [`open`](Self::open).
    pub async fn open_address(
        &self,
        address: &str,
    ) -> Result<(mpsc::Receiver<StreamEvent>, SessionHandle)> {
        let device = self.find(address).await?;
        Ok(self.open(device))
    }

    // ── Private: discovery ───────────────────────────────────────────────────

    /// Run one scan window, reporting devices on `tx`.  Returns the number
    /// reported.  The adapter is published in `scanning` once the scan is
    /// running, so a caller that gives up early can still stop it.
    async fn discover(
        &self,
        tx: &mpsc::Sender<ScanEvent>,
        scanning: &OnceCell<Adapter>,
    ) -> Result<usize> {
        let adapter = default_adapter().await?;
        let mut events = adapter.events().await?;

        info!("Scanning for {} s …", self.config.scan_timeout.as_secs_f32());
        adapter.start_scan(ScanFilter::default()).await?;
        let _ = scanning.set(adapter.clone());

        let mut seen = HashSet::new();
        let window = tokio::time::sleep(self.config.scan_timeout);
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = &mut window => break,
                event = events.next() => match event {
                    // Names often arrive in a later advertisement than the
                    // first sighting, so updates are checked too.
                    Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                        if seen.contains(&id) {
                            continue;
                        }
                        let Ok(p) = adapter.peripheral(&id).await else { continue };
                        if let Some(device) = self.describe(p).await {
                            seen.insert(id);
                            let _ = tx.send(ScanEvent::Found(device)).await;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        adapter.stop_scan().await.ok();

        // Sweep the adapter's cache for anything the event stream missed.
        for p in adapter.peripherals().await? {
            if seen.contains(&p.id()) {
                continue;
            }
            let id = p.id();
            if let Some(device) = self.describe(p).await {
                seen.insert(id);
                let _ = tx.send(ScanEvent::Found(device)).await;
            }
        }

        Ok(seen.len())
    }

    /// Build a descriptor for `p`, or `None` if it fails the name filter.
    async fn describe(&self, p: Peripheral) -> Option<BleDevice> {
        let props = p.properties().await.ok().flatten()?;
        let name = props.local_name.unwrap_or_else(|| UNKNOWN_NAME.to_owned());
        if !passes_filter(&name, &props.services, self.config.name_prefix.as_deref()) {
            return None;
        }
        let device = BleDevice {
            name,
            id: p.id().to_string(),
            address: props.address.to_string(),
            rssi: props.rssi,
            peripheral: p,
        };
        info!(
            "Found {}  id={}  rssi={:?}",
            device.name, device.id, device.rssi
        );
        Some(device)
    }
}

/// Run `work` for at most `deadline`.
///
/// Returns `None` if the deadline passed.  In that case, if `work` had
/// already published its adapter in `started`, `stop` is run on it so the
/// radio does not keep scanning after the task is gone.
async fn bounded_scan<A, W, S, SF>(
    deadline: Duration,
    started: &OnceCell<A>,
    work: W,
    stop: S,
) -> Option<Result<usize>>
where
    W: Future<Output = Result<usize>>,
    S: FnOnce(&A) -> SF,
    SF: Future<Output = ()>,
{
    match timeout(deadline, work).await {
        Ok(r) => Some(r),
        Err(_) => {
            if let Some(adapter) = started.get() {
                stop(adapter).await;
            }
            None
        }
    }
}

/// First adapter of the platform manager.
///
/// On macOS, `CBCentralManager` starts in an "unknown" state and silently
/// ignores scans until it reports *poweredOn*; this waits up to 3 s for it.
async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

    #[cfg(target_os = "macos")]
    {
        use btleplug::api::CentralState;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => break,
                Ok(state) if tokio::time::Instant::now() >= deadline => {
                    warn!("macOS: adapter still {state:?} after 3 s, scanning anyway");
                    break;
                }
                Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                Err(e) => {
                    warn!("macOS: adapter_state() error: {e}");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    Ok(adapter)
}

// ── Session ───────────────────────────────────────────────────────────────────

/// The reporting side of a session: what it is called, where its events go,
/// the state it publishes, and the token that ends it.
struct SessionLink {
    name: String,
    events: mpsc::Sender<StreamEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl SessionLink {
    /// Drive one session from `Connecting` to `Disconnected` around `stream`.
    ///
    /// `stream` resolves to `Ok(None)` when the consumer stopped listening,
    /// `Ok(Some(reason))` when the peer went away, or `Err` on failure.
    /// Cancellation wins over a ready stream.  Whatever ends the session,
    /// `teardown` runs once and the last event sent is
    /// [`StreamEvent::Disconnected`], with no reason for a user request.
    async fn drive<S, F, T>(&self, stream: S, teardown: F)
    where
        S: Future<Output = Result<Option<String>>>,
        F: FnOnce() -> T,
        T: Future<Output = ()>,
    {
        self.set_state(ConnectionState::Connecting).await;

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(None),
            r = stream => r,
        };
        let reason = match outcome {
            Ok(None) => {
                info!("{}: disconnect requested", self.name);
                None
            }
            Ok(Some(reason)) => {
                info!("{}: {reason}", self.name);
                Some(reason)
            }
            Err(e) => {
                warn!("{}: {e:#}", self.name);
                Some(format!("{e:#}"))
            }
        };

        self.set_state(ConnectionState::TearingDown).await;
        teardown().await;
        self.set_state(ConnectionState::Disconnected).await;
        let _ = self.events.send(StreamEvent::Disconnected { reason }).await;
    }

    async fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        let _ = self.events.send(StreamEvent::State(state)).await;
    }

    /// Forward `event`; `false` once the consumer is gone.
    async fn emit(&self, event: StreamEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

/// State owned by one session task.
struct Session {
    peripheral: Peripheral,
    config: StreamClientConfig,
    link: SessionLink,
}

impl Session {
    async fn run(self) {
        self.link.drive(self.stream(), || self.teardown()).await;
    }

    /// Connect, subscribe, and forward notifications until the link ends.
    async fn stream(&self) -> Result<Option<String>> {
        let name = &self.link.name;
        let limit = self.config.connect_timeout;
        timeout(limit, self.peripheral.connect())
            .await
            .map_err(|_| anyhow!("connect timed out after {} s", limit.as_secs()))?
            .context("connect failed")?;

        // BlueZ reports the link as up before the remote GATT cache is
        // populated; discovering immediately can return no services.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        timeout(DISCOVER_TIMEOUT, self.peripheral.discover_services())
            .await
            .map_err(|_| anyhow!("service discovery timed out"))?
            .context("service discovery failed")?;

        if !self
            .peripheral
            .services()
            .iter()
            .any(|s| s.uuid == LOGGER_SERVICE_UUID)
        {
            warn!("{name}: logger service {LOGGER_SERVICE_UUID} not found");
        }

        // Take the notification stream before subscribing: the first feature
        // frame is the header and must not be lost.
        let mut notifications = self.peripheral.notifications().await?;

        let chars = self.peripheral.characteristics();
        let mut subscribed = 0usize;
        for uuid in STREAM_CHARACTERISTICS {
            let label = characteristic_name(&uuid);
            let Some(c) = chars.iter().find(|c| c.uuid == uuid) else {
                warn!("{name}: no {label} characteristic ({uuid}), skipping");
                continue;
            };
            self.peripheral
                .subscribe(c)
                .await
                .with_context(|| format!("subscribing to {label}"))?;
            subscribed += 1;
            debug!("{name}: subscribed to {label}");
        }
        if subscribed == 0 {
            warn!("{name}: none of the stream characteristics are present");
        }

        self.link.set_state(ConnectionState::Connected).await;
        if !self.link.emit(StreamEvent::Connected(name.clone())).await {
            return Ok(None);
        }
        info!("{name}: connected, {subscribed} stream(s)");

        let mut decoder = NotificationDecoder::new();
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                notif = notifications.next() => {
                    let Some(notif) = notif else {
                        return Ok(Some("notification stream ended".into()));
                    };
                    let Some(event) = decoder.decode(notif.uuid, &notif.value, now_ms()) else {
                        continue;
                    };
                    if !self.link.emit(event).await {
                        debug!("{name}: event receiver dropped");
                        return Ok(None);
                    }
                }
                _ = poll.tick() => {
                    if !self.peripheral.is_connected().await? {
                        return Ok(Some("peer disconnected".into()));
                    }
                }
            }
        }
    }

    /// Best-effort unsubscribe and disconnect.  Failures are logged only.
    ///
    /// Runs on every exit path, including a connect that never completed, so
    /// it works from the peripheral's current state rather than from what
    /// `stream` managed to do.
    async fn teardown(&self) {
        let name = &self.link.name;
        let limit = self.config.connect_timeout;
        if self.peripheral.is_connected().await.unwrap_or(false) {
            let chars = self.peripheral.characteristics();
            for c in chars.iter().filter(|c| STREAM_CHARACTERISTICS.contains(&c.uuid)) {
                let label = characteristic_name(&c.uuid);
                match timeout(limit, self.peripheral.unsubscribe(c)).await {
                    Ok(Ok(())) => debug!("{name}: unsubscribed from {label}"),
                    Ok(Err(e)) => debug!("{name}: unsubscribe {label}: {e}"),
                    Err(_) => debug!("{name}: unsubscribe {label} timed out"),
                }
            }
        }
        match timeout(limit, self.peripheral.disconnect()).await {
            Ok(Ok(())) => info!("{name}: disconnected"),
            Ok(Err(e)) => warn!("{name}: disconnect: {e}"),
            Err(_) => warn!("{name}: disconnect timed out"),
        }
    }
}

// ── SessionHandle ─────────────────────────────────────────────────────────────

/// Control side of a running session.
///
/// Dropping the handle does **not** end the session; call
/// [`disconnect`](Self::disconnect) for that.
#[derive(Debug)]
pub struct SessionHandle {
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn new(cancel: CancellationToken, state: watch::Receiver<ConnectionState>, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            state,
            task,
        }
    }

    /// Ask the session to tear down.  Returns immediately; the session then
    /// emits `TearingDown`, `Disconnected`, and a final
    /// `StreamEvent::Disconnected { reason: None }`.  Calling it again has no
    /// further effect.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// `true` once [`disconnect`](Self::disconnect) has been called.
    pub fn disconnect_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Last state published by the session.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// `true` once the session task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("session task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn default_config_uses_protocol_timings() {
        let c = StreamClientConfig::default();
        assert_eq!(c.scan_timeout, Duration::from_secs(5));
        assert_eq!(c.connect_timeout, Duration::from_secs(10));
        assert_eq!(c.poll_interval, Duration::from_millis(100));
        assert!(c.name_prefix.is_none());
    }

    #[test]
    fn address_match_is_case_insensitive_on_id_or_mac() {
        let id = "hci0/dev_AA_BB_CC_DD_EE_FF";
        let mac = "AA:BB:CC:DD:EE:FF";
        assert!(address_matches(id, mac, "aa:bb:cc:dd:ee:ff"));
        assert!(address_matches(id, mac, " AA:BB:CC:DD:EE:FF "));
        assert!(address_matches(id, mac, "HCI0/dev_aa_bb_cc_dd_ee_ff"));
        assert!(!address_matches(id, mac, "AA:BB:CC:DD:EE:00"));
        assert!(!address_matches(id, mac, ""));
    }

    #[test]
    fn logger_service_passes_any_name_filter() {
        assert!(passes_filter("M5StickC", &[], Some("M5")));
        assert!(!passes_filter("Headphones", &[], Some("M5")));
        assert!(passes_filter(UNKNOWN_NAME, &[LOGGER_SERVICE_UUID], Some("M5")));
        assert!(passes_filter("Headphones", &[], None));
    }

    #[tokio::test]
    async fn overrunning_scan_is_stopped() {
        let started = OnceCell::new();
        let stopped = Cell::new(None);
        let work = async {
            let _ = started.set(7u32);
            futures::future::pending::<Result<usize>>().await
        };
        let stop = |a: &u32| {
            stopped.set(Some(*a));
            async {}
        };
        let out = bounded_scan(Duration::from_millis(20), &started, work, stop).await;
        assert!(out.is_none());
        assert_eq!(stopped.get(), Some(7));
    }

    #[tokio::test]
    async fn scan_that_never_started_is_not_stopped() {
        let started = OnceCell::<u32>::new();
        let stopped = Cell::new(false);
        let stop = |_: &u32| {
            stopped.set(true);
            async {}
        };
        let work = futures::future::pending::<Result<usize>>();
        assert!(bounded_scan(Duration::from_millis(20), &started, work, stop)
            .await
            .is_none());
        assert!(!stopped.get());

        let done = bounded_scan(Duration::from_secs(1), &started, async { Ok(3) }, |_: &u32| async {});
        assert_eq!(done.await.unwrap().unwrap(), 3);
    }

    // ── Session lifecycle ────────────────────────────────────────────────────

    fn link() -> (SessionLink, mpsc::Receiver<StreamEvent>, watch::Receiver<ConnectionState>) {
        let (events, rx) = mpsc::channel(16);
        let (state, state_rx) = watch::channel(ConnectionState::Connecting);
        let link = SessionLink {
            name: "M5StickC".into(),
            events,
            state,
            cancel: CancellationToken::new(),
        };
        (link, rx, state_rx)
    }

    fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = vec![];
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn states(events: &[StreamEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::State(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn peer_drop_reports_reason_after_full_state_sequence() {
        let (link, mut rx, state_rx) = link();
        let torn = Cell::new(0);
        let stream = async {
            link.set_state(ConnectionState::Connected).await;
            Ok(Some("peer disconnected".to_owned()))
        };
        link.drive(stream, || async { torn.set(torn.get() + 1) }).await;

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::TearingDown,
                ConnectionState::Disconnected,
            ]
        );
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Disconnected {
                reason: Some("peer disconnected".into())
            })
        );
        let finals = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Disconnected { .. }))
            .count();
        assert_eq!(finals, 1);
        assert_eq!(torn.get(), 1);
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn failure_reason_is_the_error_chain() {
        let (link, mut rx, _state) = link();
        let torn = Cell::new(false);
        let stream = async {
            Err::<Option<String>, _>(anyhow!("timed out")).context("connect failed")
        };
        link.drive(stream, || async { torn.set(true) }).await;

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                ConnectionState::Connecting,
                ConnectionState::TearingDown,
                ConnectionState::Disconnected,
            ]
        );
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Disconnected {
                reason: Some("connect failed: timed out".into())
            })
        );
        assert!(torn.get());
    }

    #[tokio::test]
    async fn consumer_gone_ends_without_reason() {
        let (link, mut rx, _state) = link();
        let torn = Cell::new(false);
        link.drive(async { Ok(None) }, || async { torn.set(true) }).await;
        assert_eq!(
            drain(&mut rx).last(),
            Some(&StreamEvent::Disconnected { reason: None })
        );
        assert!(torn.get());
    }

    #[tokio::test]
    async fn cancel_while_streaming_tears_down_without_reason() {
        let (link, mut rx, state_rx) = link();
        let torn = Cell::new(false);
        let stream = async {
            link.set_state(ConnectionState::Connected).await;
            futures::future::pending::<Result<Option<String>>>().await
        };
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            link.cancel.cancel();
        };
        tokio::join!(link.drive(stream, || async { torn.set(true) }), cancel);

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::TearingDown,
                ConnectionState::Disconnected,
            ]
        );
        assert_eq!(events.last(), Some(&StreamEvent::Disconnected { reason: None }));
        assert!(torn.get());
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancellation_wins_over_a_ready_stream() {
        let (link, mut rx, _state) = link();
        link.cancel.cancel();
        link.drive(async { Ok(Some("peer disconnected".to_owned())) }, || async {})
            .await;
        assert_eq!(
            drain(&mut rx).last(),
            Some(&StreamEvent::Disconnected { reason: None })
        );
    }

    // ── SessionHandle ────────────────────────────────────────────────────────

    /// A session whose stream connects and then never ends on its own.
    fn idle_session() -> (mpsc::Receiver<StreamEvent>, SessionHandle) {
        let (link, rx, state_rx) = link();
        let cancel = link.cancel.clone();
        let task = tokio::spawn(async move {
            let stream = async {
                link.set_state(ConnectionState::Connected).await;
                futures::future::pending::<Result<Option<String>>>().await
            };
            link.drive(stream, || async {}).await;
        });
        (rx, SessionHandle::new(cancel, state_rx, task))
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_ends_the_session() {
        let (mut rx, handle) = idle_session();
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::State(ConnectionState::Connecting))
        );
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::State(ConnectionState::Connected))
        );
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert!(!handle.disconnect_requested());

        handle.disconnect();
        handle.disconnect();
        assert!(handle.disconnect_requested());

        let mut rest = vec![];
        while let Some(ev) = rx.recv().await {
            rest.push(ev);
        }
        assert_eq!(
            rest,
            vec![
                StreamEvent::State(ConnectionState::TearingDown),
                StreamEvent::State(ConnectionState::Disconnected),
                StreamEvent::Disconnected { reason: None },
            ]
        );
        handle.join().await;
    }

    #[tokio::test]
    async fn finished_flag_follows_the_task() {
        let (mut rx, handle) = idle_session();
        rx.recv().await;
        assert!(!handle.is_finished());
        handle.disconnect();
        while rx.recv().await.is_some() {}
        // The channel closes when the task drops its sender, which happens as
        // the task returns; give the runtime a moment to record completion.
        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.is_finished());
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }
}
