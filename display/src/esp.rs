use core::ffi::c_void;
use std::{
    io,
    net::UdpSocket,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, OnceLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{
        Configuration as HttpConfiguration, EspHttpConnection as EspHttpServerConnection,
        EspHttpServer, Request,
    },
    log::EspLogger,
    mdns::EspMdns,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use form_common::{
    dedupe_networks,
    dns::{self, DNS_PORT, MAX_DNS_PACKET},
    form::{self, MAX_FORM_BODY},
    mode::{self, SETUP_ROUTES, STATION_ROUTES},
    pages::{self, SETUP_AP_SSID},
    scheduler::is_clock_valid,
    store::STORE_SIZE,
    wellness::MAX_RESPONSE_BYTES,
    BootPlan, ByteStore, ConfigChange, ConnectivityManager, ConnectivityState, FormDevice,
    HttpMethod, JoinPolicy, MemoryStore, NetworkCredentials, Pause, Radio, RadioError,
    RadioStatus, RefreshPolicy, RemoteDataClient, Route, ScannedNetwork, StoreError,
    TransportResponse, WellnessRequest, WellnessTransport,
};

const NVS_NAMESPACE: &str = "formdisplay";
const NVS_IMAGE_KEY: &str = "config";
const MDNS_HOSTNAME: &str = "formdisplay";
const MDNS_INSTANCE: &str = "Form Display";
const HTTP_STACK_SIZE: usize = 20 * 1024;
const SCHEDULER_STACK_SIZE: usize = 20 * 1024;
const SCHEDULER_TICK_MS: u64 = 1_000;
const RELOAD_POLL_MS: u64 = 250;
const RELOAD_GRACE_MS: u64 = 1_000;
const READ_CHUNK_SIZE: usize = 1024;
const DNS_STACK_SIZE: usize = 6 * 1024;
const DNS_READ_TIMEOUT_MS: u64 = 500;

// wifi_err_reason_t values reported with WIFI_EVENT_STA_DISCONNECTED.
const REASON_AUTH_EXPIRE: u16 = 2;
const REASON_4WAY_HANDSHAKE_TIMEOUT: u16 = 15;
const REASON_NO_AP_FOUND: u16 = 201;
const REASON_AUTH_FAIL: u16 = 202;
const REASON_HANDSHAKE_TIMEOUT: u16 = 204;

/// Last station disconnect reason, 0 while none has been reported.
static LAST_DISCONNECT_REASON: AtomicU16 = AtomicU16::new(0);
static AUTO_RECONNECT: AtomicBool = AtomicBool::new(false);

type SharedDevice = Arc<Mutex<FormDevice<NvsImage>>>;
type HttpRequest<'r, 'c> = Request<&'r mut EspHttpServerConnection<'c>>;

#[derive(Clone)]
struct ServerState {
    device: SharedDevice,
    reload: Arc<AtomicBool>,
    sntp: Option<Arc<Mutex<Option<EspSntp<'static>>>>>,
    networks: Arc<Vec<ScannedNetwork>>,
}

/// The config image mirrored into a single NVS blob.
struct NvsImage {
    nvs: EspNvs<NvsDefault>,
    image: MemoryStore,
}

struct EspRadio<'a> {
    wifi: &'a mut EspWifi<'static>,
}

struct ThreadPause;

struct EspTransport {
    timeout: Duration,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let store = NvsImage::open(nvs_partition.clone()).context("failed to open config store")?;
    let policy = RefreshPolicy::default();
    let device: SharedDevice = Arc::new(Mutex::new(FormDevice::new(
        store,
        RemoteDataClient::default(),
        policy.clone(),
    )));

    let mut wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    register_disconnect_handler()?;

    loop {
        let creds = lock_device(&device)?.network_credentials();
        let connectivity = ConnectivityManager::new(JoinPolicy::default()).establish(
            &mut EspRadio { wifi: &mut wifi },
            &mut ThreadPause,
            &creds,
        );
        info!("connectivity: {}", connectivity.mode.as_str());

        let reload = Arc::new(AtomicBool::new(false));
        if connectivity.is_connected() {
            disable_wifi_power_save();
            run_station(&device, connectivity, &policy, &reload)?;
        } else {
            run_setup(&device, connectivity, &mut wifi, &sys_loop, &reload)?;
        }

        info!("configuration changed, restarting connectivity");
        lock_device(&device)?.reload();
    }
}

fn run_station(
    device: &SharedDevice,
    connectivity: ConnectivityState,
    policy: &RefreshPolicy,
    reload: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    let time_synced = wait_for_sntp(&sntp, policy);
    let sntp = Arc::new(Mutex::new(Some(sntp)));

    let plan = {
        let mut device = lock_device(device)?;
        device.set_connectivity(connectivity);
        device.set_time_synced(time_synced);
        device.boot_plan()
    };
    info!("boot plan: {plan:?}");

    let _mdns = match start_mdns() {
        Ok(mdns) => Some(mdns),
        Err(err) => {
            warn!("mDNS unavailable: {err:#}");
            None
        }
    };

    if let BootPlan::Station {
        initial_refresh: true,
    } = plan
    {
        let mut device = lock_device(device)?;
        let today = device.civil_now(Utc::now()).date();
        let mut transport = EspTransport::for_device(&device);
        if let Err(err) = device.refresh(&mut transport, today) {
            warn!("initial refresh failed: {err}");
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let scheduler = spawn_scheduler_loop(device.clone(), running.clone())?;

    let server = create_station_server(ServerState {
        device: device.clone(),
        reload: reload.clone(),
        sntp: Some(sntp),
        networks: Arc::new(Vec::new()),
    })?;

    wait_for_reload(reload);
    running.store(false, Ordering::Relaxed);
    if scheduler.join().is_err() {
        warn!("scheduler thread panicked");
    }
    drop(server);
    Ok(())
}

fn run_setup(
    device: &SharedDevice,
    connectivity: ConnectivityState,
    wifi: &mut EspWifi<'static>,
    sys_loop: &EspSystemEventLoop,
    reload: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    {
        let mut device = lock_device(device)?;
        device.set_connectivity(connectivity);
        device.set_time_synced(false);
    }

    let (networks, ap_ip) = start_setup_ap(wifi, sys_loop)?;
    let running = Arc::new(AtomicBool::new(true));
    let dns = spawn_captive_dns(ap_ip, running.clone())?;
    let server = create_setup_server(ServerState {
        device: device.clone(),
        reload: reload.clone(),
        sntp: None,
        networks: Arc::new(networks),
    })?;

    wait_for_reload(reload);
    running.store(false, Ordering::Relaxed);
    if dns.join().is_err() {
        warn!("captive DNS thread panicked");
    }
    drop(server);
    Ok(())
}

fn wait_for_reload(reload: &AtomicBool) {
    while !reload.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(RELOAD_POLL_MS));
    }
    // Lets the handler that requested the reload finish its response.
    thread::sleep(Duration::from_millis(RELOAD_GRACE_MS));
}

fn wait_for_sntp(sntp: &EspSntp<'static>, policy: &RefreshPolicy) -> bool {
    for _ in 0..policy.time_sync_polls {
        if sntp.get_sync_status() == SyncStatus::Completed && is_clock_valid(Utc::now()) {
            info!("time synced: {}", Utc::now());
            return true;
        }
        thread::sleep(Duration::from_millis(policy.time_sync_poll_ms));
    }
    warn!(
        "time not synced after {} polls, scheduled refresh disabled",
        policy.time_sync_polls
    );
    false
}

fn resync_time(state: &ServerState) -> anyhow::Result<()> {
    let Some(sntp) = state.sntp.as_ref() else {
        return Ok(());
    };
    let policy = lock_device(&state.device)?.policy().clone();

    let mut slot = sntp.lock().map_err(|_| anyhow!("sntp lock poisoned"))?;
    // Only one SNTP instance may exist at a time.
    *slot = None;
    let restarted = EspSntp::new_default().context("failed to restart SNTP")?;
    let synced = wait_for_sntp(&restarted, &policy);
    *slot = Some(restarted);
    drop(slot);

    lock_device(&state.device)?.set_time_synced(synced);
    Ok(())
}

fn start_mdns() -> anyhow::Result<EspMdns> {
    let mut mdns = EspMdns::take()?;
    mdns.set_hostname(MDNS_HOSTNAME)?;
    mdns.set_instance_name(MDNS_INSTANCE)?;
    mdns.add_service(None, "_http", "_tcp", 80, &[])?;
    info!("mDNS responding as {MDNS_HOSTNAME}.local");
    Ok(mdns)
}

fn spawn_scheduler_loop(
    device: SharedDevice,
    running: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("refresh-scheduler".into())
        .stack_size(SCHEDULER_STACK_SIZE)
        .spawn(move || {
            while running.load(Ordering::Relaxed) {
                match lock_device(&device) {
                    Ok(mut device) => {
                        let mut transport = EspTransport::for_device(&device);
                        device.tick(monotonic_ms(), Some(Utc::now()), &mut transport);
                    }
                    Err(err) => warn!("scheduler tick skipped: {err:#}"),
                }
                thread::sleep(Duration::from_millis(SCHEDULER_TICK_MS));
            }
        })
        .context("failed to spawn scheduler thread")
}

fn start_setup_ap(
    wifi: &mut EspWifi<'static>,
    sys_loop: &EspSystemEventLoop,
) -> anyhow::Result<(Vec<ScannedNetwork>, [u8; 4])> {
    let mut wifi = BlockingWifi::wrap(wifi, sys_loop.clone())?;

    // Scanning needs the station interface, so it runs before the AP comes up.
    if !wifi.is_started()? {
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        wifi.start()?;
    }
    let scanned = match wifi.scan() {
        Ok(found) => found
            .into_iter()
            .map(|ap| ScannedNetwork {
                ssid: ap.ssid.to_string(),
                rssi: ap.signal_strength,
                secure: !matches!(ap.auth_method, None | Some(AuthMethod::None)),
            })
            .collect::<Vec<_>>(),
        Err(err) => {
            warn!("wifi scan failed: {err}");
            Vec::new()
        }
    };
    let networks: Vec<ScannedNetwork> = dedupe_networks(scanned).into_iter().collect();
    info!("wifi scan found {} networks", networks.len());

    wifi.stop()?;
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: SETUP_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("setup AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    let ap_ip = wifi.wifi().ap_netif().get_ip_info()?.ip;
    info!("setup access point `{SETUP_AP_SSID}` started on {ap_ip}");
    Ok((networks, ap_ip.octets()))
}

fn spawn_captive_dns(ap_ip: [u8; 4], running: Arc<AtomicBool>) -> anyhow::Result<JoinHandle<()>> {
    let socket = UdpSocket::bind(("0.0.0.0", DNS_PORT)).context("failed to bind DNS socket")?;
    socket.set_read_timeout(Some(Duration::from_millis(DNS_READ_TIMEOUT_MS)))?;

    thread::Builder::new()
        .name("captive-dns".into())
        .stack_size(DNS_STACK_SIZE)
        .spawn(move || {
            let mut request = [0_u8; MAX_DNS_PACKET];
            let mut reply = [0_u8; MAX_DNS_PACKET];
            while running.load(Ordering::Relaxed) {
                let (len, peer) = match socket.recv_from(&mut request) {
                    Ok(received) => received,
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue
                    }
                    Err(err) => {
                        warn!("captive DNS receive failed: {err}");
                        continue;
                    }
                };
                let Some(reply_len) = dns::captive_answer(&request[..len], ap_ip, &mut reply)
                else {
                    continue;
                };
                if let Err(err) = socket.send_to(&reply[..reply_len], peer) {
                    warn!("captive DNS reply to {peer} failed: {err}");
                }
            }
        })
        .context("failed to spawn captive DNS thread")
}

fn create_station_server(state: ServerState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: HTTP_STACK_SIZE,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for (method, path, route) in STATION_ROUTES {
        let Some(method) = esp_method(method) else {
            continue;
        };
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>(path, method, move |req| {
            handle_station(&state, route, req)
        })?;
    }

    for method in [Method::Get, Method::Post] {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/*", method, move |req| {
            let route = mode::route(true, http_method(method), req.uri());
            handle_station(&state, route, req)
        })?;
    }

    Ok(server)
}

fn create_setup_server(state: ServerState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: HTTP_STACK_SIZE,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for (method, path, route) in SETUP_ROUTES {
        let Some(method) = esp_method(method) else {
            continue;
        };
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>(path, method, move |req| {
            handle_setup(&state, route, req)
        })?;
    }

    for method in [Method::Get, Method::Post] {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/*", method, move |req| {
            let route = mode::route(false, http_method(method), req.uri());
            handle_setup(&state, route, req)
        })?;
    }

    Ok(server)
}

fn handle_station(
    state: &ServerState,
    route: Route,
    mut req: HttpRequest<'_, '_>,
) -> anyhow::Result<()> {
    match route {
        Route::Dashboard => {
            let view = lock_device(&state.device)?.dashboard_view();
            write_html(req, 200, &pages::render_dashboard(&view))
        }
        Route::SaveApi => {
            let Some(body) = read_form_body(&mut req)? else {
                return write_error(req, 400, "Request body too large");
            };
            let api_key = form::field(&body, "apikey").unwrap_or_default();
            let athlete_id = form::field(&body, "athleteid").unwrap_or_default();
            let change = lock_device(&state.device)?.save_remote(&api_key, &athlete_id);
            finish_change(state, change, req)
        }
        Route::SaveSchedule => {
            let Some(body) = read_form_body(&mut req)? else {
                return write_error(req, 400, "Request body too large");
            };
            let time = form::field(&body, "time").unwrap_or_default();
            let offset = form::field(&body, "tz").unwrap_or_default();
            let change = lock_device(&state.device)?.save_schedule(&time, &offset);
            finish_change(state, change, req)
        }
        Route::Reset => {
            let change = lock_device(&state.device)?.reset();
            finish_change(state, change, req)
        }
        Route::ApiForm | Route::ApiHistory => {
            let response = {
                let mut device = lock_device(&state.device)?;
                let today = device.civil_now(Utc::now()).date();
                let mut transport = EspTransport::for_device(&device);
                if route == Route::ApiForm {
                    device.refresh_form(&mut transport, today)
                } else {
                    device.refresh_history(&mut transport, today)
                }
            };
            write_json(req, response.status, &response)
        }
        _ => write_error(req, 404, "Not found"),
    }
}

fn handle_setup(
    state: &ServerState,
    route: Route,
    mut req: HttpRequest<'_, '_>,
) -> anyhow::Result<()> {
    match route {
        Route::Setup => write_html(req, 200, &pages::render_setup(&state.networks)),
        Route::Connect => {
            let Some(body) = read_form_body(&mut req)? else {
                return write_error(req, 400, "Request body too large");
            };
            let ssid = form::field(&body, "ssid").unwrap_or_default();
            if ssid.trim().is_empty() {
                return write_error(req, 400, "SSID is required");
            }
            let password = form::field(&body, "password").unwrap_or_default();
            let change = lock_device(&state.device)?.save_network(&ssid, &password);
            finish_change(state, change, req)
        }
        Route::CaptiveRedirect => redirect(req, 302, "/"),
        _ => write_error(req, 404, "Not found"),
    }
}

fn finish_change(
    state: &ServerState,
    change: Result<ConfigChange, StoreError>,
    req: HttpRequest<'_, '_>,
) -> anyhow::Result<()> {
    match change {
        Ok(ConfigChange::Applied) => redirect(req, 303, "/"),
        Ok(ConfigChange::ResyncTime) => {
            if let Err(err) = resync_time(state) {
                warn!("time resync failed: {err:#}");
            }
            redirect(req, 303, "/")
        }
        Ok(ConfigChange::ReloadRequired) => {
            state.reload.store(true, Ordering::Relaxed);
            write_html(
                req,
                200,
                &pages::render_message("Restarting", "Settings saved. The display is reconnecting."),
            )
        }
        Err(err) => {
            warn!("failed to persist settings: {err}");
            write_error(req, 500, "Failed to persist settings")
        }
    }
}

/// `None` when the body exceeds `MAX_FORM_BODY`.
fn read_form_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Option<String>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_FORM_BODY {
        return Ok(None);
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(Some(String::from_utf8_lossy(&body).into_owned()))
}

fn write_html(req: HttpRequest<'_, '_>, status_code: u16, body: &str) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/html; charset=utf-8")],
    )?
    .write_all(body.as_bytes())?;
    Ok(())
}

fn write_json<T: Serialize>(
    req: HttpRequest<'_, '_>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    write_json(req, status_code, &serde_json::json!({ "error": message }))
}

fn redirect(req: HttpRequest<'_, '_>, status_code: u16, location: &str) -> anyhow::Result<()> {
    req.into_response(status_code, None, &[("Location", location)])?;
    Ok(())
}

fn esp_method(method: HttpMethod) -> Option<Method> {
    match method {
        HttpMethod::Get => Some(Method::Get),
        HttpMethod::Post => Some(Method::Post),
        HttpMethod::Other => None,
    }
}

fn http_method(method: Method) -> HttpMethod {
    match method {
        Method::Get => HttpMethod::Get,
        Method::Post => HttpMethod::Post,
        _ => HttpMethod::Other,
    }
}

fn lock_device(device: &SharedDevice) -> anyhow::Result<MutexGuard<'_, FormDevice<NvsImage>>> {
    device
        .lock()
        .map_err(|_| anyhow!("device state lock poisoned"))
}

impl NvsImage {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; STORE_SIZE];
        let image = match nvs.get_raw(NVS_IMAGE_KEY, &mut buffer)? {
            Some(raw) => MemoryStore::from_bytes(raw),
            None => MemoryStore::new(),
        };
        Ok(Self { nvs, image })
    }
}

impl ByteStore for NvsImage {
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
        self.nvs
            .set_raw(NVS_IMAGE_KEY, self.image.as_bytes())
            .map(|_| ())
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

fn radio_error(err: impl core::fmt::Display) -> RadioError {
    RadioError(err.to_string())
}

impl Radio for EspRadio<'_> {
    fn power_off(&mut self) -> Result<(), RadioError> {
        AUTO_RECONNECT.store(false, Ordering::Relaxed);
        if self.wifi.is_started().map_err(radio_error)? {
            self.wifi.stop().map_err(radio_error)?;
        }
        Ok(())
    }

    fn power_on_station(&mut self) -> Result<(), RadioError> {
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration::default()))
            .map_err(radio_error)?;
        self.wifi.start().map_err(radio_error)
    }

    fn begin(&mut self, creds: &NetworkCredentials) -> Result<(), RadioError> {
        let auth_method = if creds.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: creds
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| RadioError("wifi ssid too long".to_string()))?,
                password: creds
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| RadioError("wifi password too long".to_string()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(radio_error)?;

        LAST_DISCONNECT_REASON.store(0, Ordering::Relaxed);
        self.wifi.connect().map_err(radio_error)
    }

    fn status(&mut self) -> RadioStatus {
        if self.wifi.is_connected().unwrap_or(false) {
            return if self.wifi.is_up().unwrap_or(false) {
                RadioStatus::Connected
            } else {
                RadioStatus::Connecting
            };
        }
        status_for_reason(LAST_DISCONNECT_REASON.load(Ordering::Relaxed))
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        AUTO_RECONNECT.store(false, Ordering::Relaxed);
        self.wifi.disconnect().map_err(radio_error)
    }

    fn set_auto_reconnect(&mut self, enabled: bool) {
        AUTO_RECONNECT.store(enabled, Ordering::Relaxed);
    }
}

fn status_for_reason(reason: u16) -> RadioStatus {
    match reason {
        0 => RadioStatus::Connecting,
        REASON_NO_AP_FOUND => RadioStatus::SsidNotFound,
        REASON_AUTH_EXPIRE | REASON_4WAY_HANDSHAKE_TIMEOUT | REASON_AUTH_FAIL
        | REASON_HANDSHAKE_TIMEOUT => RadioStatus::AuthFailed,
        _ => RadioStatus::Disconnected,
    }
}

unsafe extern "C" fn on_sta_disconnected(
    _arg: *mut c_void,
    _event_base: esp_idf_svc::sys::esp_event_base_t,
    _event_id: i32,
    event_data: *mut c_void,
) {
    if !event_data.is_null() {
        let event = &*(event_data as *const esp_idf_svc::sys::wifi_event_sta_disconnected_t);
        LAST_DISCONNECT_REASON.store(u16::from(event.reason), Ordering::Relaxed);
    }
    if AUTO_RECONNECT.load(Ordering::Relaxed) {
        esp_idf_svc::sys::esp_wifi_connect();
    }
}

fn register_disconnect_handler() -> anyhow::Result<()> {
    let rc = unsafe {
        esp_idf_svc::sys::esp_event_handler_register(
            esp_idf_svc::sys::WIFI_EVENT,
            esp_idf_svc::sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED as i32,
            Some(on_sta_disconnected),
            core::ptr::null_mut(),
        )
    };
    if rc == esp_idf_svc::sys::ESP_OK {
        return Ok(());
    }
    Err(anyhow!("esp_event_handler_register failed with code {}", rc))
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

impl Pause for ThreadPause {
    fn pause(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl EspTransport {
    fn for_device(device: &FormDevice<NvsImage>) -> Self {
        Self {
            timeout: Duration::from_millis(device.policy().fetch_timeout_ms),
        }
    }
}

impl WellnessTransport for EspTransport {
    fn get(&mut self, request: &WellnessRequest) -> Result<TransportResponse, String> {
        // No CA bundle: server certificates are not verified.
        let http_conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            use_global_ca_store: false,
            crt_bundle_attach: None,
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf).map_err(|err| err.to_string())?;
        let mut client = HttpClient::wrap(connection);

        let headers = request.headers();
        let outgoing = client
            .request(Method::Get, &request.url, &headers)
            .map_err(|err| format!("{err:?}"))?;
        let mut response = outgoing.submit().map_err(|err| format!("{err:?}"))?;
        let status = response.status();

        let mut body = Vec::new();
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|err| format!("{err:?}"))?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
            if body.len() > MAX_RESPONSE_BYTES {
                break;
            }
        }
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
