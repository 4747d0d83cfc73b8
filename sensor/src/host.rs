use std::{
    fs::{self, File},
    io::Write,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tokio::{net::TcpListener, runtime::Handle, sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};

use rssi_logger_common::{
    display::{
        connecting_text, humidity_text, link_text, progress_text, signal_text, temperature_text,
        MSG_CONNECTED, MSG_LOGGING_DISABLED,
    },
    update::{SHA256_HEADER, TOKEN_HEADER},
    Climate, ClimateSensor, Clock, ConnectivityManager, DeviceConfig, DirVolume, LinkInfo,
    MonotonicClock, NetworkConfig, Presenter, Radio, RadioError, RestartReason, SampleLoop,
    StorageLogger, UpdateError, UpdateListener, UpdatePoll, UpdateRequest, UpdateSink,
    UpdateSummary, UpdateTracker,
};

const DEFAULT_SD_ROOT: &str = "./sdcard";
const SIMULATED_SSID: &str = "rssi-logger-sim";
const MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;
const UPLOAD_CHUNK_SIZE: usize = 4096;
const STAGED_IMAGE: &str = "firmware.bin";
const STAGED_IMAGE_PART: &str = "firmware.bin.part";
const SERVER_STOP_GRACE: Duration = Duration::from_secs(2);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let raw_config = match std::env::var("RSSI_LOGGER_CONFIG") {
        Ok(path) => Some(
            fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file `{path}`"))?,
        ),
        Err(_) => None,
    };
    let config = build_config(raw_config.as_deref(), |key| std::env::var(key).ok())?;

    let sd_root = PathBuf::from(
        std::env::var("SD_ROOT").unwrap_or_else(|_| DEFAULT_SD_ROOT.to_string()),
    );
    let staging_dir = std::env::var("UPDATE_STAGING_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("rssi-logger-update"));
    let simulation = SimulationConfig::from_env();

    info!(
        "simulated logger starting: medium {}, update port {}",
        sd_root.display(),
        config.update.listen_port
    );

    let mut boots: u32 = 0;
    loop {
        boots = boots.saturating_add(1);
        info!("boot #{boots}");

        let runtime = Handle::current();
        let session = BootSession {
            config: config.clone(),
            sd_root: sd_root.clone(),
            staging_dir: staging_dir.clone(),
            simulation: simulation.clone(),
        };
        let reason = tokio::task::spawn_blocking(move || session.run(runtime))
            .await
            .context("sample loop thread panicked")?;

        warn!("restart requested: {reason}");
        tokio::time::sleep(Duration::from_millis(config.timing.restart_delay_ms.into())).await;
    }
}

/// JSON file contents (when given) with environment overrides on top. An
/// empty SSID falls back to the simulated access point so a bare run works.
fn build_config<F>(raw: Option<&str>, lookup: F) -> anyhow::Result<DeviceConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match raw {
        Some(raw) => DeviceConfig::from_json(raw).context("invalid device config")?,
        None => DeviceConfig::default(),
    };
    config
        .apply_overrides(lookup)
        .context("invalid environment override")?;

    if !config.network.has_station_credentials() {
        warn!("no WIFI_SSID configured; joining simulated network `{SIMULATED_SSID}`");
        config.network.ssid = SIMULATED_SSID.to_string();
    }
    Ok(config)
}

/// Everything one simulated power cycle needs. Dropping it at the end of
/// [`BootSession::run`] tears the whole device down.
struct BootSession {
    config: DeviceConfig,
    sd_root: PathBuf,
    staging_dir: PathBuf,
    simulation: SimulationConfig,
}

impl BootSession {
    fn run(self, runtime: Handle) -> RestartReason {
        let mut clock = MonotonicClock::new();
        let mut presenter = ConsolePresenter::default();

        let volume = DirVolume::new(&self.sd_root);
        let mut storage = if self.config.storage.enabled {
            StorageLogger::new(volume, &self.config.storage.log_path)
        } else {
            presenter.show_status(MSG_LOGGING_DISABLED);
            StorageLogger::disabled(volume, &self.config.storage.log_path)
        };
        storage.prepare(&mut presenter);
        clock.delay_ms(self.config.timing.notice_hold_ms);

        let radio = SimulatedRadio::new(self.simulation.clone());
        let listener =
            HttpUpdateListener::new(runtime, self.config.update.listen_port, self.staging_dir);
        let mut connectivity = ConnectivityManager::new(
            radio,
            listener,
            self.config.network.clone(),
            &self.config.timing,
        );
        if let Err(reason) = connectivity.connect(&mut clock, &mut presenter) {
            return reason;
        }

        let mut sampler =
            SampleLoop::new(connectivity, storage, &self.config.timing, clock.now_ms());
        let mut sensor = SimulatedClimate::default();
        sampler.run(&mut clock, &mut sensor, &mut presenter, || {})
    }
}

#[derive(Debug, Clone)]
struct SimulationConfig {
    join_after_polls: u32,
    link_drop_after: Option<Duration>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            join_after_polls: 5,
            link_drop_after: None,
        }
    }
}

impl SimulationConfig {
    fn from_env() -> Self {
        let mut simulation = Self::default();
        if let Some(polls) = std::env::var("SIM_JOIN_POLLS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
        {
            simulation.join_after_polls = polls;
        }
        simulation.link_drop_after = std::env::var("SIM_LINK_DROP_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        simulation
    }
}

/// Station that associates a fixed number of status polls after `begin` and
/// can be told to lose the link periodically.
struct SimulatedRadio {
    simulation: SimulationConfig,
    began: bool,
    polls_since_begin: u32,
    associated_at: Option<Instant>,
    rssi_tick: u32,
}

impl SimulatedRadio {
    fn new(simulation: SimulationConfig) -> Self {
        Self {
            simulation,
            began: false,
            polls_since_begin: 0,
            associated_at: None,
            rssi_tick: 0,
        }
    }
}

impl Radio for SimulatedRadio {
    fn begin(&mut self, network: &NetworkConfig) -> Result<(), RadioError> {
        if !network.has_station_credentials() {
            return Err(RadioError::Config("ssid is empty".to_string()));
        }
        debug!("simulated radio joining `{}`", network.ssid);
        self.began = true;
        self.polls_since_begin = 0;
        self.associated_at = None;
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        if let Some(since) = self.associated_at {
            match self.simulation.link_drop_after {
                Some(limit) if since.elapsed() >= limit => {
                    warn!("simulated link drop after {}s", limit.as_secs());
                    self.associated_at = None;
                    self.began = false;
                    return false;
                }
                _ => return true,
            }
        }

        if !self.began {
            return false;
        }
        self.polls_since_begin = self.polls_since_begin.saturating_add(1);
        if self.polls_since_begin >= self.simulation.join_after_polls {
            self.associated_at = Some(Instant::now());
            return true;
        }
        false
    }

    fn disconnect(&mut self) {
        self.began = false;
        self.associated_at = None;
    }

    fn rssi(&mut self) -> i8 {
        self.rssi_tick = self.rssi_tick.wrapping_add(1);
        -60 - ((self.rssi_tick.wrapping_mul(7) % 15) as i8)
    }

    fn link_info(&mut self) -> LinkInfo {
        LinkInfo {
            ip: Ipv4Addr::LOCALHOST,
            channel: 6,
        }
    }
}

#[derive(Debug, Default)]
struct SimulatedClimate {
    tick: u64,
}

impl ClimateSensor for SimulatedClimate {
    fn read(&mut self) -> Option<Climate> {
        self.tick = self.tick.saturating_add(1);
        Some(Climate {
            temperature_c: 21.0 + ((self.tick % 8) as f64 * 0.2),
            relative_humidity_pct: 45.0 + ((self.tick % 6) as f64 * 0.5),
        })
    }
}

/// Renders what the panel would show as log lines.
#[derive(Debug, Default)]
struct ConsolePresenter {
    last_signal: Option<i8>,
}

impl Presenter for ConsolePresenter {
    fn show_status(&mut self, text: &str) {
        for line in text.lines() {
            info!(target: "display", "{line}");
        }
    }

    fn show_connecting(&mut self, ssid: &str) {
        info!(target: "display", "{}", connecting_text(ssid));
    }

    fn show_connect_progress(&mut self, failed_polls: u32) {
        debug!(target: "display", "{}", progress_text(failed_polls));
    }

    fn show_connected(&mut self, ip: Ipv4Addr, channel: u8) {
        info!(target: "display", "{MSG_CONNECTED}");
        info!(target: "display", "{}", link_text(ip, channel));
    }

    fn show_signal(&mut self, rssi_dbm: i8) {
        self.last_signal = Some(rssi_dbm);
        debug!(target: "display", "{}", signal_text(rssi_dbm));
    }

    fn show_reading(&mut self, temperature_c: f64, relative_humidity_pct: f64) {
        let signal = self.last_signal.map(signal_text).unwrap_or_default();
        info!(
            target: "display",
            "{signal}  {}  {}",
            temperature_text(temperature_c),
            humidity_text(relative_humidity_pct)
        );
    }

    fn show_error(&mut self, text: &str) {
        for line in text.lines() {
            warn!(target: "display", "{line}");
        }
    }
}

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// `POST /update` on the configured port. The server is bound on the first
/// `arm` and lives until the simulated device restarts; while disarmed it
/// answers 503.
struct HttpUpdateListener {
    runtime: Handle,
    port: u16,
    staging_dir: Arc<PathBuf>,
    tracker: UpdateTracker,
    server: Option<ServerHandle>,
}

#[derive(Clone)]
struct UpdateState {
    tracker: UpdateTracker,
    staging_dir: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct UpdateAccepted {
    hostname: String,
    bytes: u64,
    sha256: String,
}

impl HttpUpdateListener {
    fn new(runtime: Handle, port: u16, staging_dir: PathBuf) -> Self {
        Self {
            runtime,
            port,
            staging_dir: Arc::new(staging_dir),
            tracker: UpdateTracker::new(),
            server: None,
        }
    }

    fn start_server(&mut self) -> Result<(), UpdateError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = self
            .runtime
            .block_on(TcpListener::bind(addr))
            .map_err(|err| UpdateError::Listener(format!("bind {addr}: {err}")))?;

        let app = update_router(UpdateState {
            tracker: self.tracker.clone(),
            staging_dir: self.staging_dir.clone(),
        });
        let (shutdown, stopped) = oneshot::channel::<()>();
        let task = self.runtime.spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = stopped.await;
            });
            if let Err(err) = server.await {
                warn!("update listener stopped: {err}");
            }
        });

        info!("update listener on http://{addr}/update");
        self.server = Some(ServerHandle { shutdown, task });
        Ok(())
    }
}

impl UpdateListener for HttpUpdateListener {
    fn arm(&mut self, hostname: &str, auth_token: &str) -> Result<(), UpdateError> {
        if self.server.is_none() {
            self.start_server()?;
        }
        self.tracker.arm(hostname, auth_token);
        Ok(())
    }

    fn disarm(&mut self) {
        self.tracker.disarm();
    }

    fn service(&mut self) -> UpdatePoll {
        self.tracker.poll()
    }
}

impl Drop for HttpUpdateListener {
    fn drop(&mut self) {
        self.tracker.disarm();
        if let Some(server) = self.server.take() {
            let _ = server.shutdown.send(());
            let _ = self
                .runtime
                .block_on(async { tokio::time::timeout(SERVER_STOP_GRACE, server.task).await });
        }
    }
}

fn update_router(state: UpdateState) -> Router {
    Router::new()
        .route("/update", post(handle_post_update))
        .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES))
        .with_state(state)
}

async fn handle_post_update(
    State(state): State<UpdateState>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let expected_token = match state.tracker.try_start() {
        Ok(token) => token,
        Err(err) => return error_response(&err),
    };

    let provided_token = header_value(&headers, TOKEN_HEADER).unwrap_or_default();
    let expected_sha256 = header_value(&headers, SHA256_HEADER);
    let request = match UpdateRequest::authorize(
        &provided_token,
        &expected_token,
        expected_sha256.as_deref(),
    ) {
        Ok(request) => request,
        Err(err) => {
            warn!("update rejected: {err}");
            state.tracker.fail(&err);
            return error_response(&err);
        }
    };

    let tracker = state.tracker.clone();
    let staging_dir = state.staging_dir.clone();
    let result =
        tokio::task::spawn_blocking(move || stage_image(&staging_dir, &tracker, request, &body))
            .await
            .unwrap_or_else(|err| Err(UpdateError::Sink(format!("update task failed: {err}"))));

    match result {
        Ok(summary) => {
            state.tracker.complete(summary.bytes);
            info!(
                "update image staged: {} bytes, sha256 {}",
                summary.bytes, summary.sha256
            );
            Json(UpdateAccepted {
                hostname: state.tracker.hostname(),
                bytes: summary.bytes,
                sha256: summary.sha256,
            })
            .into_response()
        }
        Err(err) => {
            warn!("update rejected: {err}");
            state.tracker.fail(&err);
            error_response(&err)
        }
    }
}

fn stage_image(
    staging_dir: &Path,
    tracker: &UpdateTracker,
    request: UpdateRequest,
    image: &[u8],
) -> Result<UpdateSummary, UpdateError> {
    let mut session = request.open(StagedImage::create(staging_dir)?);

    for chunk in image.chunks(UPLOAD_CHUNK_SIZE) {
        if let Err(err) = session.write(chunk) {
            session.abort();
            return Err(err);
        }
        tracker.progress(session.bytes_written());
    }

    session.finish()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

fn error_response(err: &UpdateError) -> axum::response::Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// Image written next to its final name and renamed into place on commit.
struct StagedImage {
    file: File,
    part_path: PathBuf,
    final_path: PathBuf,
}

impl StagedImage {
    fn create(dir: &Path) -> Result<Self, UpdateError> {
        fs::create_dir_all(dir)
            .map_err(|err| UpdateError::Sink(format!("create {}: {err}", dir.display())))?;
        let part_path = dir.join(STAGED_IMAGE_PART);
        let file = File::create(&part_path)
            .map_err(|err| UpdateError::Sink(format!("create {}: {err}", part_path.display())))?;
        Ok(Self {
            file,
            part_path,
            final_path: dir.join(STAGED_IMAGE),
        })
    }
}

impl UpdateSink for StagedImage {
    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        self.file
            .write_all(chunk)
            .map_err(|err| UpdateError::Sink(err.to_string()))
    }

    fn commit(mut self) -> Result<(), UpdateError> {
        self.file
            .flush()
            .and_then(|()| self.file.sync_all())
            .map_err(|err| UpdateError::Sink(err.to_string()))?;
        drop(self.file);
        fs::rename(&self.part_path, &self.final_path)
            .map_err(|err| UpdateError::Sink(format!("install staged image: {err}")))
    }

    fn abort(self) {
        drop(self.file);
        if let Err(err) = fs::remove_file(&self.part_path) {
            debug!("discarding partial image failed: {err}");
        }
    }
}
