use std::{
    io::{ErrorKind, Read},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{on, MethodFilter, MethodRouter},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex, Notify},
    task::JoinHandle,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use form_common::{
    dedupe_networks,
    form::{self, MAX_FORM_BODY},
    mode::{SETUP_ROUTES, STATION_ROUTES},
    pages::{self, SETUP_AP_SSID},
    route,
    scheduler::is_clock_valid,
    store::STORE_SIZE,
    wellness::{DEFAULT_API_HOST, MAX_RESPONSE_BYTES},
    BootPlan, ByteStore, ConfigChange, ConnectivityManager, ConnectivityState, FormDevice,
    HttpMethod, JoinPolicy, MemoryStore, NetworkCredentials, Pause, Radio, RadioError,
    RadioStatus, RefreshPolicy, RemoteDataClient, Route, ScannedNetwork, StoreError,
    TransportResponse, WellnessRequest, WellnessTransport,
};

const SIM_POLLS_TO_SETTLE: u32 = 3;

type Device = FormDevice<FileStore>;

#[derive(Clone)]
struct AppState {
    device: Arc<Mutex<Device>>,
    networks: Arc<Vec<ScannedNetwork>>,
    reload: Arc<Notify>,
    station: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeExit {
    Reload,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum RefreshKind {
    Form,
    History,
}

/// How the simulated access point answers a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimulatedOutcome {
    Connect,
    AuthFail,
    NoSsid,
    Timeout,
}

impl SimulatedOutcome {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ok" => Some(Self::Connect),
            "auth-fail" => Some(Self::AuthFail),
            "no-ssid" => Some(Self::NoSsid),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

struct HostSettings {
    data_dir: PathBuf,
    http_port: u16,
    api_host: String,
    sim_outcome: SimulatedOutcome,
    sim_networks: Vec<ScannedNetwork>,
}

impl HostSettings {
    fn from_env() -> Self {
        let data_dir = std::env::var("FORM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.form-display"));
        let http_port = std::env::var("FORM_HTTP_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8080);
        let api_host =
            std::env::var("FORM_API_HOST").unwrap_or_else(|_| DEFAULT_API_HOST.to_string());
        let sim_outcome = std::env::var("FORM_SIM_WIFI")
            .ok()
            .and_then(|value| SimulatedOutcome::parse(&value))
            .unwrap_or(SimulatedOutcome::Connect);
        let sim_networks = std::env::var("FORM_SIM_NETWORKS")
            .map(|value| parse_sim_networks(&value))
            .unwrap_or_default();

        Self {
            data_dir,
            http_port,
            api_host,
            sim_outcome,
            sim_networks,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    let store = FileStore::open(settings.data_dir.join("config.bin"));
    let policy = RefreshPolicy::default();
    let device = Arc::new(Mutex::new(FormDevice::new(
        store,
        RemoteDataClient::new(settings.api_host.clone()),
        policy.clone(),
    )));
    let networks: Arc<Vec<ScannedNetwork>> = Arc::new(
        dedupe_networks(settings.sim_networks.clone())
            .into_iter()
            .collect(),
    );

    loop {
        let connectivity = establish(&device, settings.sim_outcome, networks.clone()).await?;
        let time_synced = if connectivity.is_connected() {
            wait_for_clock(&policy).await
        } else {
            false
        };

        let plan = {
            let mut device = device.lock().await;
            device.set_connectivity(connectivity);
            device.set_time_synced(time_synced);
            device.boot_plan()
        };
        info!("boot plan: {plan:?}");

        let app_state = AppState {
            device: device.clone(),
            networks: networks.clone(),
            reload: Arc::new(Notify::new()),
            station: plan.is_station(),
        };

        let scheduler = match plan {
            BootPlan::Station { initial_refresh } => {
                if initial_refresh {
                    spawn_initial_refresh(device.clone());
                }
                Some(spawn_scheduler_loop(device.clone()))
            }
            BootPlan::AccessPoint => {
                info!("setup portal open on simulated access point {SETUP_AP_SSID}");
                None
            }
        };

        let exit = serve_mode(
            build_router(app_state.clone()),
            settings.http_port,
            app_state.reload.clone(),
        )
        .await;

        if let Some(handle) = scheduler {
            handle.abort();
        }

        match exit? {
            ModeExit::Reload => {
                info!("configuration changed, restarting connectivity");
                device.lock().await.reload();
            }
            ModeExit::Shutdown => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn establish(
    device: &Arc<Mutex<Device>>,
    outcome: SimulatedOutcome,
    networks: Arc<Vec<ScannedNetwork>>,
) -> anyhow::Result<ConnectivityState> {
    let creds = device.lock().await.network_credentials();
    let state = tokio::task::spawn_blocking(move || {
        let mut radio = SimulatedRadio::new(outcome, networks);
        ConnectivityManager::new(JoinPolicy::default()).establish(
            &mut radio,
            &mut ThreadPause,
            &creds,
        )
    })
    .await
    .context("wifi join task failed")?;

    match state.failure() {
        Some(err) => warn!("{err}, falling back to setup mode"),
        None => info!("connectivity: {}", state.mode.as_str()),
    }
    Ok(state)
}

async fn wait_for_clock(policy: &RefreshPolicy) -> bool {
    for _ in 0..policy.time_sync_polls {
        if is_clock_valid(Utc::now()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(policy.time_sync_poll_ms)).await;
    }
    warn!(
        "clock not valid after {} polls, scheduled refresh disabled",
        policy.time_sync_polls
    );
    false
}

fn spawn_initial_refresh(device: Arc<Mutex<Device>>) {
    tokio::task::spawn_blocking(move || {
        let mut device = device.blocking_lock();
        let today = device.civil_now(Utc::now()).date();
        let mut transport = HttpTransport::for_device(&device);
        if let Err(err) = device.refresh(&mut transport, today) {
            warn!("initial refresh failed: {err}");
        }
    });
}

fn spawn_scheduler_loop(device: Arc<Mutex<Device>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;

            let shared = device.clone();
            let tick = tokio::task::spawn_blocking(move || {
                let mut device = shared.blocking_lock();
                let mut transport = HttpTransport::for_device(&device);
                device.tick(monotonic_ms(), Some(Utc::now()), &mut transport)
            })
            .await;

            if let Err(err) = tick {
                warn!("scheduler tick failed: {err}");
            }
        }
    })
}

async fn serve_mode(router: Router, port: u16, reload: Arc<Notify>) -> anyhow::Result<ModeExit> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind display server at {addr}"))?;
    info!("display listening on http://{addr}");

    let (exit_tx, exit_rx) = oneshot::channel();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let exit = tokio::select! {
                _ = reload.notified() => ModeExit::Reload,
                _ = tokio::signal::ctrl_c() => ModeExit::Shutdown,
            };
            let _ = exit_tx.send(exit);
        })
        .await
        .context("display server failed")?;

    Ok(exit_rx.await.unwrap_or(ModeExit::Shutdown))
}

fn build_router(state: AppState) -> Router {
    let table: &[(HttpMethod, &str, Route)] = if state.station {
        &STATION_ROUTES
    } else {
        &SETUP_ROUTES
    };

    let mut router = Router::new();
    for (method, path, route) in table {
        let filter = match method {
            HttpMethod::Get => MethodFilter::GET,
            HttpMethod::Post => MethodFilter::POST,
            HttpMethod::Other => continue,
        };
        router = router.route(*path, handler_for(*route, filter));
    }

    router
        .fallback(handle_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn handler_for(route: Route, filter: MethodFilter) -> MethodRouter<AppState> {
    match route {
        Route::Dashboard => on(filter, handle_dashboard),
        Route::SaveApi => on(filter, handle_save_api),
        Route::SaveSchedule => on(filter, handle_save_schedule),
        Route::Reset => on(filter, handle_reset),
        Route::ApiForm => on(filter, handle_api_form),
        Route::ApiHistory => on(filter, handle_api_history),
        Route::Setup => on(filter, handle_setup),
        Route::Connect => on(filter, handle_connect),
        Route::CaptiveRedirect | Route::NotFound => on(filter, handle_fallback),
    }
}

async fn handle_dashboard(State(state): State<AppState>) -> Html<String> {
    let view = state.device.lock().await.dashboard_view();
    Html(pages::render_dashboard(&view))
}

async fn handle_save_api(State(state): State<AppState>, body: Bytes) -> Response {
    let fields = match form_body(&body) {
        Ok(fields) => fields,
        Err(response) => return response,
    };
    let api_key = form::field(fields, "apikey").unwrap_or_default();
    let athlete_id = form::field(fields, "athleteid").unwrap_or_default();

    let change = state.device.lock().await.save_remote(&api_key, &athlete_id);
    finish_change(&state, change).await
}

async fn handle_save_schedule(State(state): State<AppState>, body: Bytes) -> Response {
    let fields = match form_body(&body) {
        Ok(fields) => fields,
        Err(response) => return response,
    };
    let time = form::field(fields, "time").unwrap_or_default();
    let offset = form::field(fields, "tz").unwrap_or_default();

    let change = state.device.lock().await.save_schedule(&time, &offset);
    finish_change(&state, change).await
}

async fn handle_reset(State(state): State<AppState>) -> Response {
    let change = state.device.lock().await.reset();
    finish_change(&state, change).await
}

async fn handle_api_form(State(state): State<AppState>) -> Response {
    run_refresh(state, RefreshKind::Form).await
}

async fn handle_api_history(State(state): State<AppState>) -> Response {
    run_refresh(state, RefreshKind::History).await
}

async fn handle_setup(State(state): State<AppState>) -> Html<String> {
    Html(pages::render_setup(&state.networks))
}

async fn handle_connect(State(state): State<AppState>, body: Bytes) -> Response {
    let fields = match form_body(&body) {
        Ok(fields) => fields,
        Err(response) => return response,
    };
    let ssid = form::field(fields, "ssid").unwrap_or_default();
    if ssid.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "SSID is required");
    }
    let password = form::field(fields, "password").unwrap_or_default();

    let change = state.device.lock().await.save_network(&ssid, &password);
    finish_change(&state, change).await
}

async fn handle_fallback(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    match route(state.station, http_method(&method), uri.path()) {
        Route::CaptiveRedirect => (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response(),
        _ => error_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

async fn run_refresh(state: AppState, kind: RefreshKind) -> Response {
    let shared = state.device.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut device = shared.blocking_lock();
        let today = device.civil_now(Utc::now()).date();
        let mut transport = HttpTransport::for_device(&device);
        match kind {
            RefreshKind::Form => device.refresh_form(&mut transport, today),
            RefreshKind::History => device.refresh_history(&mut transport, today),
        }
    })
    .await;

    match result {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(response)).into_response()
        }
        Err(err) => {
            warn!("refresh task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Refresh failed")
        }
    }
}

async fn finish_change(state: &AppState, change: Result<ConfigChange, StoreError>) -> Response {
    match change {
        Ok(ConfigChange::Applied) => Redirect::to("/").into_response(),
        Ok(ConfigChange::ResyncTime) => {
            let policy = state.device.lock().await.policy().clone();
            let synced = wait_for_clock(&policy).await;
            state.device.lock().await.set_time_synced(synced);
            Redirect::to("/").into_response()
        }
        Ok(ConfigChange::ReloadRequired) => {
            state.reload.notify_one();
            Html(pages::render_message(
                "Restarting",
                "Settings saved. The display is reconnecting.",
            ))
            .into_response()
        }
        Err(err) => {
            warn!("failed to persist settings: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist settings",
            )
        }
    }
}

fn form_body(body: &Bytes) -> Result<&str, Response> {
    if body.len() > MAX_FORM_BODY {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Request body too large",
        ));
    }
    std::str::from_utf8(body)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Request body is not valid UTF-8"))
}

fn http_method(method: &Method) -> HttpMethod {
    if *method == Method::GET {
        HttpMethod::Get
    } else if *method == Method::POST {
        HttpMethod::Post
    } else {
        HttpMethod::Other
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn parse_sim_networks(value: &str) -> Vec<ScannedNetwork> {
    value
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.trim().split(':');
            let ssid = parts.next()?.trim();
            let rssi = parts
                .next()
                .and_then(|rssi| rssi.trim().parse::<i8>().ok())
                .unwrap_or(-70);
            let secure = parts.next().map_or(true, |flag| flag.trim() != "open");
            (!ssid.is_empty()).then(|| ScannedNetwork {
                ssid: ssid.to_string(),
                rssi,
                secure,
            })
        })
        .collect()
}

/// Config image persisted as a flat file under the data dir.
struct FileStore {
    path: PathBuf,
    image: MemoryStore,
}

impl FileStore {
    fn open(path: PathBuf) -> Self {
        let image = match std::fs::read(&path) {
            Ok(raw) if raw.len() == STORE_SIZE => MemoryStore::from_bytes(&raw),
            Ok(raw) => {
                warn!(
                    "ignoring config image {} of {} bytes",
                    path.display(),
                    raw.len()
                );
                MemoryStore::new()
            }
            Err(err) if err.kind() == ErrorKind::NotFound => MemoryStore::new(),
            Err(err) => {
                warn!("failed to read config image {}: {err}", path.display());
                MemoryStore::new()
            }
        };
        Self { path, image }
    }
}

impl ByteStore for FileStore {
    fn len(&self) -> usize {
        self.image.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        self.image.read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        self.image.write(offset, data)
    }

    fn erase(&mut self) -> Result<(), StoreError> {
        self.image.erase()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        std::fs::write(&self.path, self.image.as_bytes())
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

struct SimulatedRadio {
    outcome: SimulatedOutcome,
    networks: Arc<Vec<ScannedNetwork>>,
    powered: bool,
    target: Option<String>,
    polls: u32,
}

impl SimulatedRadio {
    fn new(outcome: SimulatedOutcome, networks: Arc<Vec<ScannedNetwork>>) -> Self {
        Self {
            outcome,
            networks,
            powered: false,
            target: None,
            polls: 0,
        }
    }

    fn is_visible(&self, ssid: &str) -> bool {
        self.networks.is_empty() || self.networks.iter().any(|network| network.ssid == ssid)
    }
}

impl Radio for SimulatedRadio {
    fn power_off(&mut self) -> Result<(), RadioError> {
        self.powered = false;
        self.target = None;
        Ok(())
    }

    fn power_on_station(&mut self) -> Result<(), RadioError> {
        self.powered = true;
        Ok(())
    }

    fn begin(&mut self, creds: &NetworkCredentials) -> Result<(), RadioError> {
        if !self.powered {
            return Err(RadioError("radio is powered off".to_string()));
        }
        self.target = Some(creds.ssid.clone());
        self.polls = 0;
        Ok(())
    }

    fn status(&mut self) -> RadioStatus {
        let Some(target) = self.target.as_deref() else {
            return RadioStatus::Idle;
        };
        self.polls += 1;
        if self.polls < SIM_POLLS_TO_SETTLE {
            return RadioStatus::Connecting;
        }
        if !self.is_visible(target) {
            return RadioStatus::SsidNotFound;
        }

        match self.outcome {
            SimulatedOutcome::Connect => RadioStatus::Connected,
            SimulatedOutcome::AuthFail => RadioStatus::AuthFailed,
            SimulatedOutcome::NoSsid => RadioStatus::SsidNotFound,
            SimulatedOutcome::Timeout => RadioStatus::Connecting,
        }
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.target = None;
        Ok(())
    }

    fn set_auto_reconnect(&mut self, enabled: bool) {
        info!("simulated auto-reconnect enabled: {enabled}");
    }
}

struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Blocking HTTPS client. Runs on the blocking pool only.
struct HttpTransport {
    timeout: Duration,
}

impl HttpTransport {
    fn for_device(device: &Device) -> Self {
        Self {
            timeout: Duration::from_millis(device.policy().fetch_timeout_ms),
        }
    }
}

impl WellnessTransport for HttpTransport {
    fn get(&mut self, request: &WellnessRequest) -> Result<TransportResponse, String> {
        // Server certificates are not verified, same as the firmware build.
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| err.to_string())?;

        let mut builder = client.get(&request.url);
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }
        let response = builder.send().map_err(|err| err.to_string())?;
        let status = response.status().as_u16();

        let mut body = Vec::new();
        response
            .take(MAX_RESPONSE_BYTES as u64 + 1)
            .read_to_end(&mut body)
            .map_err(|err| err.to_string())?;
        Ok(TransportResponse { status, body })
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
