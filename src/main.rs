use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn};

use m5_logger::ble_client::{StreamClient, StreamClientConfig};
use m5_logger::recorder::{RecorderConfig, SessionRecorder};
use m5_logger::types::{ScanEvent, StreamEvent};

/// Stream raw IMU frames, features, and predictions from an M5StickC over BLE.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Connect to this device (platform id or MAC address) instead of the
    /// first one found.
    #[arg(long)]
    address: Option<String>,

    /// Only consider devices whose name starts with this prefix.
    #[arg(long, default_value = "M5")]
    name_prefix: String,

    /// Scan window in seconds.
    #[arg(long, default_value_t = 5)]
    scan_secs: u64,

    /// Only list nearby devices, then exit.
    #[arg(long)]
    list: bool,

    /// Directory for CSV recordings.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Start recording as soon as the device is connected.
    #[arg(long)]
    record: bool,

    /// Write recordings without the leading `segment` column.
    #[arg(long)]
    no_segment: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // RUST_LOG=m5_logger=debug shows dropped frames and subscription details.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let client = StreamClient::new(StreamClientConfig {
        scan_timeout: Duration::from_secs(args.scan_secs),
        // An explicit address should match whatever the device calls itself.
        name_prefix: if args.address.is_some() || args.name_prefix.is_empty() {
            None
        } else {
            Some(args.name_prefix.clone())
        },
        ..Default::default()
    });
    let mut recorder = SessionRecorder::new(RecorderConfig {
        dir: args.data_dir.clone(),
        tag_column: (!args.no_segment).then(|| "segment".to_owned()),
    });

    if args.list {
        let mut rx = client.scan();
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::Found(d) => {
                    let rssi = d.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "?".into());
                    println!("{:24} {:40} {rssi}", d.name, d.id);
                }
                ScanEvent::Finished { error: Some(e) } => return Err(anyhow!(e)),
                ScanEvent::Finished { error: None } => break,
            }
        }
        return Ok(());
    }

    // ── Connect ───────────────────────────────────────────────────────────────
    let (mut rx, handle) = match &args.address {
        Some(address) => {
            info!("Looking for {address} …");
            client.open_address(address).await?
        }
        None => {
            info!("Looking for a device named {}* …", args.name_prefix);
            let device = client
                .scan_all()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no device named {}* found", args.name_prefix))?;
            info!("Connecting to {} ({})", device.name, device.id);
            client.open(device)
        }
    };

    info!("Commands (type + Enter):");
    info!("  r  – start recording");
    info!("  s  – stop recording");
    info!("  n  – next segment");
    info!("  q  – disconnect and quit");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a plain OS thread so no StdinLock is held across an
    // await point, then relayed into the async loop below.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line.trim().to_owned()).is_err() {
                break;
            }
        }
    });

    let mut feature_header: Vec<String> = vec![];
    let mut stdin_open = true;

    // ── Main event loop ───────────────────────────────────────────────────────
    loop {
        tokio::select! {
            line = line_rx.recv(), if stdin_open => {
                let Some(line) = line else {
                    stdin_open = false;
                    continue;
                };
                let result = match line.as_str() {
                    "" => Ok(()),
                    "r" => recorder.start().map(|()| {
                        if let Some(p) = recorder.raw_path() {
                            info!("Recording raw → {}", p.display());
                        }
                    }),
                    "s" => recorder.stop().map(|()| info!("Recording stopped")),
                    "n" => {
                        recorder.next_segment();
                        Ok(())
                    }
                    "q" | "d" => {
                        info!("Disconnecting …");
                        handle.disconnect();
                        Ok(())
                    }
                    other => {
                        warn!("Unknown command '{other}'");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    error!("{e:#}");
                }
            }

            event = rx.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = recorder.handle(&event) {
                    error!("Recording error: {e:#}");
                }
                match event {
                    StreamEvent::State(state) => info!("State: {state}"),
                    StreamEvent::Connected(name) => {
                        info!("✅  Connected to: {name}");
                        if args.record {
                            if let Err(e) = recorder.start() {
                                error!("{e:#}");
                            }
                        }
                    }
                    StreamEvent::Raw(samples) => {
                        let s = &samples[0];
                        println!(
                            "[RAW]  ts={}  acc={:+6} {:+6} {:+6}  gyro={:+6} {:+6} {:+6}",
                            s.timestamp_ms, s.acc[0], s.acc[1], s.acc[2], s.gyro[0], s.gyro[1], s.gyro[2]
                        );
                    }
                    StreamEvent::FeatureHeader(header) => {
                        println!("[FEAT] header: {}", header.join(", "));
                        feature_header = header;
                    }
                    StreamEvent::Features(row) => {
                        let fields: Vec<String> = row
                            .named(&feature_header)
                            .map(|(name, v)| format!("{name}={v:.3}"))
                            .collect();
                        println!("[FEAT] {}", fields.join("  "));
                    }
                    StreamEvent::Prediction(label) => println!("[PRED] {label}"),
                    StreamEvent::Disconnected { reason } => {
                        match reason {
                            Some(r) => info!("❌  Disconnected: {r}"),
                            None => info!("❌  Disconnected."),
                        }
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = recorder.stop() {
        error!("{e:#}");
    }
    handle.join().await;
    info!("Event loop finished – exiting.");
    Ok(())
}
