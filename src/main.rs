//! EchoStream agent entry point.
//!
//! Composes the shared process-wide state (channel sessions, the
//! broadcast buffer, tone-detector state, the UDP transport) the way the
//! teacher's `main()` composed its encoder/decoder/ring-buffer/socket —
//! just generalized from one fixed peer to a configurable set of PTT
//! channels (§9 Design Notes: avoid re-introducing globals by building an
//! owned value at startup and passing it by reference into each worker).

mod broadcast;
mod capture;
mod config;
mod constants;
mod crypto;
mod error;
mod jitter;
mod playback;
mod ptt;
mod recording;
mod session;
mod shutdown;
mod signalling;
mod telemetry;
mod tone;
mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex as PLMutex;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use broadcast::BroadcastBuffer;
use config::{Args, EchoStreamConfig};
use ptt::{PttEdge, PttEdgeDetector, PttLines};
use recording::{HttpObjectStoreUploader, ObjectStoreUploader, ToneRecorder};
use session::{ChannelSession, ControlSurface, SignallingControlSurface};
use shutdown::Shutdown;
use signalling::{ActivationMessage, WebSocketSignallingClient};
use telemetry::{NullTelemetryPublisher, TelemetryPublisher};
use tone::{ToneDetectorState, ToneEvent};
use transport::{ChannelTransportState, UdpTransport};

/// Placeholder object-store endpoint: `s3_upload.py` hardcodes its bucket
/// name the same way ("should be from config", per its own comment) rather
/// than threading one through the shadow document.
const RECORDING_UPLOAD_BASE_URL: &str = "https://echostream-recordings.s3.amazonaws.com";

/// Forwards control-surface events to whatever signalling client is live
/// at the moment, or drops them with a log line before one connects.
/// Exists so the PTT worker can start polling immediately at process
/// startup (§4.4's "pre-held PTT begins transmission immediately") without
/// waiting on the signalling handshake that installs the real client.
struct DeferredControlSurface {
    inner: RwLock<Option<Arc<dyn ControlSurface>>>,
}

impl DeferredControlSurface {
    fn new() -> Self {
        Self { inner: RwLock::new(None) }
    }

    async fn install(&self, surface: Arc<dyn ControlSurface>) {
        *self.inner.write().await = Some(surface);
    }
}

#[async_trait::async_trait]
impl ControlSurface for DeferredControlSurface {
    async fn emit_connect(&self, channel: &ChannelSession) {
        if let Some(surface) = self.inner.read().await.as_ref() {
            surface.emit_connect(channel).await;
        }
    }

    async fn emit_transmit_started(&self, channel: &ChannelSession) {
        match self.inner.read().await.as_ref() {
            Some(surface) => surface.emit_transmit_started(channel).await,
            None => warn!(channel = %channel.channel_id, "transmit_started with no signalling connection yet"),
        }
    }

    async fn emit_transmit_ended(&self, channel: &ChannelSession) {
        match self.inner.read().await.as_ref() {
            Some(surface) => surface.emit_transmit_ended(channel).await,
            None => warn!(channel = %channel.channel_id, "transmit_ended with no signalling connection yet"),
        }
    }

    async fn keepalive(&self) {
        if let Some(surface) = self.inner.read().await.as_ref() {
            surface.keepalive().await;
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    std::panic::set_hook(Box::new(|panic_info| {
        error!("panic occurred: {}", panic_info);
    }));
}

/// Polls the four PTT lines every 100ms, gates each channel's
/// `ptt_active` flag, and emits transmit_started/ended through `control`
/// (§4.4).
async fn run_ptt_worker<L: PttLines, C: ControlSurface>(
    mut detector: PttEdgeDetector<L>,
    sessions: Arc<Vec<Arc<ChannelSession>>>,
    control: Arc<C>,
    shutdown: Arc<Shutdown>,
) {
    detector.prime();
    for (i, session) in sessions.iter().enumerate() {
        session.ptt_active.store(detector.is_active(i), Ordering::SeqCst);
    }

    let mut tick: u32 = 0;
    info!("PTT edge detector started");

    while !shutdown.is_shutting_down() {
        tokio::time::sleep(Duration::from_millis(constants::PTT_POLL_INTERVAL_MS)).await;
        tick += 1;

        for (channel_index, edge) in detector.poll_edges() {
            let Some(session) = sessions.get(channel_index) else { continue };
            let active = edge == PttEdge::Started;
            session.ptt_active.store(active, Ordering::SeqCst);
            info!(channel = %session.channel_id, active, "PTT transition");
            match edge {
                PttEdge::Started => control.emit_transmit_started(session).await,
                PttEdge::Ended => control.emit_transmit_ended(session).await,
            }
        }

        if tick % constants::PTT_KEEPALIVE_TICKS == 0 {
            control.keepalive().await;
        }
        if tick % constants::PTT_STATUS_TICKS == 0 {
            let active_channels: Vec<&str> = sessions
                .iter()
                .filter(|s| s.ptt_active.load(Ordering::SeqCst))
                .map(|s| s.channel_id.as_str())
                .collect();
            info!(?active_channels, "PTT status snapshot");
        }
    }

    info!("PTT edge detector stopped");
}

/// Runs the tone detector's sliding-window analysis against the broadcast
/// buffer (§4.8). Uses a dedicated OS thread via `spawn_blocking` because
/// `BroadcastBuffer::wait_ready` blocks on a `parking_lot::Condvar`, not an
/// async primitive.
fn run_tone_worker(
    detector: Arc<PLMutex<ToneDetectorState>>,
    broadcast: Arc<BroadcastBuffer>,
    passthrough_active: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<ToneEvent>,
    shutdown: Arc<Shutdown>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        let mut scratch = Vec::new();
        info!("tone detector started");

        while !shutdown.is_shutting_down() {
            if !broadcast.wait_ready(Duration::from_millis(constants::UDP_RECV_TIMEOUT_MS)) {
                continue;
            }
            broadcast.snapshot_into(&mut scratch);
            let now_ms = start.elapsed().as_millis() as u64;

            let mut det = detector.lock();
            let events = det.process_audio(&scratch, now_ms);
            det.expire_recording(now_ms);
            passthrough_active.store(det.passthrough_active, Ordering::Release);
            drop(det);

            for event in events {
                let _ = events_tx.send(event);
            }
        }

        info!("tone detector stopped");
    })
}

/// Drains tone-detection events, publishes them via telemetry (§6), and
/// kicks off a recording+upload task for every two-tone match when the
/// configuration asks for one (§9 supplemented feature, grounded on
/// `s3_upload.py`'s `start_new_tone_audio_recording`).
async fn run_event_forwarder(
    mut events_rx: mpsc::UnboundedReceiver<ToneEvent>,
    telemetry: Arc<dyn TelemetryPublisher>,
    broadcast: Arc<BroadcastBuffer>,
    uploader: Arc<dyn ObjectStoreUploader>,
    shutdown: Arc<Shutdown>,
) {
    while let Some(event) = events_rx.recv().await {
        info!(?event, "tone event detected");
        telemetry.publish_tone_event(&event).await;

        if let ToneEvent::TwoTone { tone_a_hz, tone_b_hz, record_length_ms, .. } = event {
            if record_length_ms == 0 {
                continue;
            }
            tokio::spawn(record_and_upload(
                broadcast.clone(),
                uploader.clone(),
                tone_a_hz,
                tone_b_hz,
                record_length_ms,
                shutdown.clone(),
            ));
        }
    }
}

/// Tails the broadcast buffer into a WAV file for `duration_ms`, then
/// uploads and removes the finished recording.
async fn record_and_upload(
    broadcast: Arc<BroadcastBuffer>,
    uploader: Arc<dyn ObjectStoreUploader>,
    tone_a_hz: f64,
    tone_b_hz: f64,
    duration_ms: u64,
    shutdown: Arc<Shutdown>,
) {
    let unix_secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let path = std::env::temp_dir().join(format!("tone_recording_{unix_secs}_{tone_a_hz:.0}_{tone_b_hz:.0}.wav"));

    let mut recorder = match ToneRecorder::start(&path) {
        Ok(recorder) => recorder,
        Err(e) => {
            error!(error = %e, "failed to start tone recording");
            return;
        }
    };

    let mut scratch: Vec<f32> = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(duration_ms);
    while tokio::time::Instant::now() < deadline && !shutdown.is_shutting_down() {
        broadcast.consume_into(&mut scratch, constants::DEVICE_CHUNK_SAMPLES);
        if !scratch.is_empty() {
            recorder.write_samples(&crypto::float_to_i16(&scratch));
        }
        tokio::time::sleep(Duration::from_millis(constants::PLAYBACK_LOOP_SLEEP_MS * 2)).await;
    }

    let finished_path = recorder.finish();
    if let Err(e) = uploader.upload(&finished_path, tone_a_hz, tone_b_hz).await {
        error!(error = %e, "tone recording upload failed");
    }
    if let Err(e) = tokio::fs::remove_file(&finished_path).await {
        warn!(error = %e, "failed to remove uploaded tone recording");
    }
}

/// Builds the per-line GPIO backend for this platform. Non-Linux builds
/// fall back to a backend that reports every line inactive, matching how
/// the rest of the pipeline is cross-platform for development even though
/// the GPIO chip only exists on deployed hardware.
#[cfg(target_os = "linux")]
fn open_ptt_lines(channel_count: usize) -> ptt::GpioCdevLines {
    ptt::GpioCdevLines::open("/dev/gpiochip0", channel_count).unwrap_or_else(|e| {
        warn!(error = %e, "failed to open GPIO chip, PTT lines will read inactive");
        ptt::GpioCdevLines::inactive()
    })
}

#[cfg(not(target_os = "linux"))]
fn open_ptt_lines(_channel_count: usize) -> ptt::InactiveLines {
    ptt::InactiveLines
}

/// Connects to the signalling channel, waits for its activation message,
/// and installs the resulting session key + UDP endpoint into every
/// channel (§4.9). Retries with a fixed backoff rather than giving up,
/// since a signalling outage must not take the process down (§7).
async fn connect_and_activate(
    websocket_url: &str,
    sessions: Arc<Vec<Arc<ChannelSession>>>,
    control: Arc<DeferredControlSurface>,
    shutdown: Arc<Shutdown>,
) -> Option<ActivationMessage> {
    let (activation_tx, mut activation_rx) = mpsc::unbounded_channel::<ActivationMessage>();

    loop {
        if shutdown.is_shutting_down() {
            return None;
        }

        let tx = activation_tx.clone();
        match WebSocketSignallingClient::connect(websocket_url, move |activation| {
            let _ = tx.send(activation);
        })
        .await
        {
            Ok(client) => {
                let surface = Arc::new(SignallingControlSurface::new(Arc::new(client)));
                control.install(surface as Arc<dyn ControlSurface>).await;
                info!(url = %websocket_url, "signalling channel connected");

                for session in sessions.iter() {
                    control.emit_connect(session).await;
                }

                let activation = tokio::select! {
                    activation = activation_rx.recv() => activation,
                    _ = shutdown.wait() => None,
                };
                return activation;
            }
            Err(e) => {
                warn!(error = %e, "signalling connection failed, retrying in 5s");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = shutdown.wait() => return None,
                }
            }
        }
    }
}

/// Waits for either SIGINT or SIGTERM (§5 Cancellation and timeouts).
/// `ctrl_c()` alone only covers SIGINT; process managers on deployed
/// hardware send SIGTERM, so the unix-only branch layers in a SIGTERM
/// listener next to it.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

struct ChannelRuntime {
    session: Arc<ChannelSession>,
    is_tone_source: bool,
    is_passthrough_target: bool,
}

fn build_channel_runtimes(config: &EchoStreamConfig) -> Vec<ChannelRuntime> {
    let passthrough_channel_id = config.tone_detect.as_ref().and_then(|t| t.passthrough_channel_id.as_deref());

    config
        .channels
        .iter()
        .map(|channel| ChannelRuntime {
            session: Arc::new(ChannelSession::new(channel.channel_id.clone(), config.agency_name.clone())),
            is_tone_source: config.tone_detect_source_channel_id.as_deref() == Some(channel.channel_id.as_str()),
            is_passthrough_target: passthrough_channel_id == Some(channel.channel_id.as_str()),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    let config = config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    info!(device_id = %config.device_id, channels = config.channels.len(), "configuration loaded");

    if args.dry_run {
        info!("dry run: configuration is valid, exiting without opening devices or sockets");
        return Ok(());
    }

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.trigger();
        });
    }

    let runtimes = build_channel_runtimes(&config);
    let sessions: Arc<Vec<Arc<ChannelSession>>> = Arc::new(runtimes.iter().map(|r| r.session.clone()).collect());

    let broadcast = config.tone_detect.as_ref().map(|_| Arc::new(BroadcastBuffer::new()));
    let passthrough_active = Arc::new(AtomicBool::new(false));
    let telemetry: Arc<dyn TelemetryPublisher> = Arc::new(NullTelemetryPublisher);

    let mut worker_handles = Vec::new();

    // PTT edge detector: starts immediately so a pre-held line begins
    // transmitting as soon as the pipeline comes up (§4.4, §8 boundary).
    let control = Arc::new(DeferredControlSurface::new());
    let ptt_lines = open_ptt_lines(config.channels.len());
    let ptt_detector = PttEdgeDetector::new(ptt_lines);
    worker_handles.push(tokio::spawn(run_ptt_worker(ptt_detector, sessions.clone(), control.clone(), shutdown.clone())));

    // Tone detector: runs against whatever the broadcast buffer holds,
    // which is empty until the designated source channel starts capturing.
    if let (Some(broadcast), Some(tone_config)) = (&broadcast, &config.tone_detect) {
        let detector = Arc::new(PLMutex::new(ToneDetectorState::new(tone_config.clone())));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        worker_handles.push(run_tone_worker(
            detector,
            broadcast.clone(),
            passthrough_active.clone(),
            events_tx,
            shutdown.clone(),
        ));
        let uploader: Arc<dyn ObjectStoreUploader> = Arc::new(HttpObjectStoreUploader::new(RECORDING_UPLOAD_BASE_URL));
        worker_handles.push(tokio::spawn(run_event_forwarder(
            events_rx,
            telemetry.clone(),
            broadcast.clone(),
            uploader,
            shutdown.clone(),
        )));
    }

    // Signalling: blocks (but does not crash the process on failure) until
    // the relay hands back a UDP endpoint and session key.
    let activation = connect_and_activate(&config.websocket_url, sessions.clone(), control.clone(), shutdown.clone()).await;

    let Some(activation) = activation else {
        warn!("no signalling activation received; audio pipeline will not start");
        shutdown.wait().await;
        for handle in worker_handles {
            let _ = handle.await;
        }
        return Ok(());
    };

    match config.session_key {
        Some(session_key) => {
            session::install_session_key(session_key, &sessions, control.as_ref()).await;
        }
        None => warn!("no session key configured; channels will not transmit or receive audio"),
    }

    let transport = Arc::new(
        UdpTransport::connect(&activation.udp_host, activation.udp_port)
            .await
            .context("failed to bind UDP transport")?,
    );

    let transport_states: Arc<Vec<ChannelTransportState>> = {
        let mut states = Vec::with_capacity(runtimes.len());
        for runtime in &runtimes {
            states.push(
                ChannelTransportState::new(runtime.session.channel_id.clone(), runtime.session.clone())
                    .with_context(|| format!("failed to initialize opus decoder for channel {}", runtime.session.channel_id))?,
            );
        }
        Arc::new(states)
    };

    {
        let transport = transport.clone();
        let shutdown = shutdown.clone();
        worker_handles.push(tokio::spawn(async move {
            transport.run_keepalive(shutdown).await;
        }));
    }
    {
        let transport = transport.clone();
        let transport_states = transport_states.clone();
        let shutdown = shutdown.clone();
        worker_handles.push(tokio::spawn(async move {
            transport.run_receive_loop(transport_states, shutdown).await;
        }));
    }

    for (i, runtime) in runtimes.iter().enumerate() {
        let channel_id = runtime.session.channel_id.clone();
        let capture_config = capture::CaptureConfig { device_name: None, is_tone_source: runtime.is_tone_source };
        let playback_config = playback::PlaybackConfig { device_name: None, is_passthrough_target: runtime.is_passthrough_target };

        // Shared with the receive loop via `transport_states[i]`: the
        // receive loop pushes decoded frames in, playback pulls them out.
        let jitter = transport_states[i].jitter.clone();

        let capture_channel_id = channel_id.clone();
        let capture_session = runtime.session.clone();
        let capture_transport = transport.clone();
        let capture_broadcast = broadcast.clone();
        let capture_shutdown = shutdown.clone();
        worker_handles.push(tokio::spawn(async move {
            if let Err(e) = capture::run(
                capture_channel_id.clone(),
                capture_config,
                capture_session,
                capture_transport,
                capture_broadcast,
                capture_shutdown,
            )
            .await
            {
                error!(channel = %capture_channel_id, error = %e, "capture worker exited with error");
            }
        }));

        let playback_broadcast = broadcast.clone();
        let playback_passthrough_active = passthrough_active.clone();
        let playback_shutdown = shutdown.clone();
        worker_handles.push(tokio::spawn(async move {
            if let Err(e) = playback::run(
                channel_id.clone(),
                playback_config,
                jitter,
                playback_broadcast,
                playback_passthrough_active,
                playback_shutdown,
            )
            .await
            {
                error!(channel = %channel_id, error = %e, "playback worker exited with error");
            }
        }));
    }

    info!("EchoStream agent running");
    shutdown.wait().await;

    for session in sessions.iter() {
        session.ptt_active.store(false, Ordering::SeqCst);
    }

    for handle in worker_handles {
        let _ = handle.await;
    }

    info!("EchoStream agent shut down cleanly");
    Ok(())
}
