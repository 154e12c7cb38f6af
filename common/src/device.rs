//! Application state shared by both back ends.
//!
//! `FormDevice` owns the persisted config, the history cache and the refresh
//! scheduler. Back ends wrap it in a single mutex, so a scheduled refresh and a
//! user-triggered refresh are serialized on the same lock.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use log::{info, warn};

use crate::{
    config::{DeviceConfig, NetworkCredentials, RefreshPolicy, RemoteCredentials, ScheduleConfig},
    connectivity::ConnectivityState,
    error::{FetchError, StoreError},
    history::FormHistory,
    mode::BootPlan,
    scheduler::{civil_time, RefreshScheduler},
    store::{ByteStore, ConfigStore},
    types::{ApiResponse, DashboardView},
    wellness::{RemoteDataClient, WellnessTransport},
};

/// What a back end has to do after a configuration write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// Takes effect on the next refresh.
    Applied,
    /// The UTC offset may have moved; wall-clock time must be re-synced.
    ResyncTime,
    /// Tear down the current mode and re-run the join sequence from the store.
    ReloadRequired,
}

pub struct FormDevice<S> {
    store: ConfigStore<S>,
    config: DeviceConfig,
    history: FormHistory,
    scheduler: RefreshScheduler,
    client: RemoteDataClient,
    policy: RefreshPolicy,
    connectivity: ConnectivityState,
    time_synced: bool,
}

impl<S: ByteStore> FormDevice<S> {
    pub fn new(backend: S, client: RemoteDataClient, policy: RefreshPolicy) -> Self {
        let store = ConfigStore::new(backend);
        let config = store.load();
        info!(
            "loaded config: ssid {}, api key {}, athlete {}, schedule {}",
            if config.network.is_configured() { "set" } else { "unset" },
            if config.remote.is_configured() { "set" } else { "unset" },
            config.remote.athlete_id,
            config.schedule,
        );

        Self {
            store,
            config,
            history: FormHistory::new(),
            scheduler: RefreshScheduler::new(policy.poll_interval_ms),
            client,
            policy,
            connectivity: ConnectivityState::default(),
            time_synced: false,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn history(&self) -> &FormHistory {
        &self.history
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    pub fn store(&self) -> &ConfigStore<S> {
        &self.store
    }

    pub fn network_credentials(&self) -> NetworkCredentials {
        self.config.network.clone()
    }

    pub fn set_connectivity(&mut self, state: ConnectivityState) {
        self.connectivity = state;
    }

    pub fn set_time_synced(&mut self, synced: bool) {
        self.time_synced = synced;
    }

    pub fn boot_plan(&self) -> BootPlan {
        BootPlan::select(
            &self.connectivity,
            self.config.remote.is_configured(),
            self.time_synced,
        )
    }

    /// Re-reads the persisted config after a `ReloadRequired` change.
    pub fn reload(&mut self) {
        self.config = self.store.load();
        self.connectivity = ConnectivityState::default();
        self.time_synced = false;
    }

    pub fn civil_now(&self, utc: DateTime<Utc>) -> NaiveDateTime {
        civil_time(utc, self.config.schedule.utc_offset_hours)
    }

    /// Inclusive `(oldest, newest)` window ending on `today`.
    pub fn history_window(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let span = u64::from(self.policy.history_days.max(1) - 1);
        let oldest = today.checked_sub_days(Days::new(span)).unwrap_or(today);
        (oldest, today)
    }

    /// Fetches the history window and swaps it in. The cache is untouched on
    /// any error. Does not mark the scheduled-refresh date.
    pub fn refresh<T: WellnessTransport>(
        &mut self,
        transport: &mut T,
        today: NaiveDate,
    ) -> Result<usize, FetchError> {
        let (oldest, newest) = self.history_window(today);
        let records = self
            .client
            .fetch_wellness(transport, &self.config.remote, oldest, newest)?;

        if !self.history.replace(&records) {
            return Err(FetchError::EmptyOrMalformed("no records".to_string()));
        }
        info!("history updated with {} days", self.history.len());
        Ok(self.history.len())
    }

    /// Backs `/api/form`.
    pub fn refresh_form<T: WellnessTransport>(
        &mut self,
        transport: &mut T,
        today: NaiveDate,
    ) -> ApiResponse {
        match self.refresh(transport, today) {
            Ok(_) => match self.history.current() {
                Some(current) => ApiResponse::ok(format!(
                    "Form {:+} (CTL {}, ATL {})",
                    current.form, current.ctl, current.atl
                )),
                None => ApiResponse::failed(&FetchError::EmptyOrMalformed(
                    "no current record".to_string(),
                )),
            },
            Err(err) => {
                warn!("manual form refresh failed: {err}");
                ApiResponse::failed(&err)
            }
        }
    }

    /// Backs `/api/history`.
    pub fn refresh_history<T: WellnessTransport>(
        &mut self,
        transport: &mut T,
        today: NaiveDate,
    ) -> ApiResponse {
        match self.refresh(transport, today) {
            Ok(days) => ApiResponse::ok(format!("Loaded {days} days")),
            Err(err) => {
                warn!("manual history refresh failed: {err}");
                ApiResponse::failed(&err)
            }
        }
    }

    /// One scheduler tick. Returns `None` when nothing was due. `utc` is
    /// ignored until the clock has been synced.
    pub fn tick<T: WellnessTransport>(
        &mut self,
        now_ms: u64,
        utc: Option<DateTime<Utc>>,
        transport: &mut T,
    ) -> Option<Result<usize, FetchError>> {
        let civil_now = utc
            .filter(|_| self.time_synced)
            .map(|utc| self.civil_now(utc));
        let today = self
            .scheduler
            .poll(now_ms, civil_now, &self.config.schedule)?;

        info!("scheduled refresh due for {today}");
        let result = self.refresh(transport, today);
        match &result {
            Ok(_) => self.scheduler.record_success(today),
            Err(err) => warn!("scheduled refresh failed, retrying next poll: {err}"),
        }
        Some(result)
    }

    /// An empty `api_key` keeps the stored key.
    pub fn save_remote(
        &mut self,
        api_key: &str,
        athlete_id: &str,
    ) -> Result<ConfigChange, StoreError> {
        let mut remote = RemoteCredentials {
            api_key: match api_key.trim() {
                "" => self.config.remote.api_key.clone(),
                key => key.to_string(),
            },
            athlete_id: athlete_id.to_string(),
        };
        remote.sanitize();

        self.store.save_remote(&remote)?;
        info!("saved remote credentials for athlete {}", remote.athlete_id);
        self.config.remote = remote;
        Ok(ConfigChange::Applied)
    }

    /// Unparsable fields keep their stored value.
    pub fn save_schedule(&mut self, time: &str, offset: &str) -> Result<ConfigChange, StoreError> {
        let mut schedule: ScheduleConfig = self.config.schedule;
        match ScheduleConfig::parse_time(time) {
            Some((hour, minute)) => {
                schedule.hour = hour;
                schedule.minute = minute;
            }
            None => warn!("ignoring invalid schedule time {time:?}"),
        }
        match ScheduleConfig::parse_offset(offset) {
            Some(hours) => schedule.utc_offset_hours = hours,
            None => warn!("ignoring invalid utc offset {offset:?}"),
        }

        self.store.save_schedule(&schedule)?;
        info!("saved schedule {schedule}");
        self.config.schedule = schedule;
        Ok(ConfigChange::ResyncTime)
    }

    pub fn save_network(&mut self, ssid: &str, password: &str) -> Result<ConfigChange, StoreError> {
        let creds = NetworkCredentials::new(ssid.trim(), password);
        self.store.save_network(&creds)?;
        info!("saved wifi credentials for {:?}", creds.ssid);
        self.config.network = creds;
        Ok(ConfigChange::ReloadRequired)
    }

    pub fn reset(&mut self) -> Result<ConfigChange, StoreError> {
        self.store.erase_all()?;
        warn!("all persisted configuration erased");
        self.config = DeviceConfig::default();
        self.history = FormHistory::new();
        Ok(ConfigChange::ReloadRequired)
    }

    pub fn dashboard_view(&self) -> DashboardView {
        DashboardView {
            current: self.history.current().copied(),
            history: self.history.records().to_vec(),
            schedule_time: self.config.schedule.time_string(),
            utc_offset: self.config.schedule.offset_string(),
            athlete_id: self.config.remote.athlete_id.clone(),
            api_key_set: self.config.remote.is_configured(),
            last_scheduled_fetch: self.scheduler.last_fetch().date(),
            time_synced: self.time_synced,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        connectivity::{ConnectivityMode, RadioStatus},
        store::MemoryStore,
        wellness::{TransportResponse, WellnessRequest},
    };

    struct CannedTransport {
        responses: Vec<Result<TransportResponse, String>>,
        requests: Vec<WellnessRequest>,
    }

    impl CannedTransport {
        fn new(responses: Vec<Result<TransportResponse, String>>) -> Self {
            Self {
                responses,
                requests: Vec::new(),
            }
        }

        fn body(body: &str) -> Result<TransportResponse, String> {
            Ok(TransportResponse {
                status: 200,
                body: body.as_bytes().to_vec(),
            })
        }
    }

    impl WellnessTransport for CannedTransport {
        fn get(&mut self, request: &WellnessRequest) -> Result<TransportResponse, String> {
            self.requests.push(request.clone());
            if self.responses.is_empty() {
                return Err("no canned response".to_string());
            }
            self.responses.remove(0)
        }
    }

    const TWO_DAYS: &str = r#"[{"id":"2025-03-09","ctl":40.4,"atl":50.6},{"id":"2025-03-10","ctl":43.1,"atl":39.5}]"#;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn configured_device() -> FormDevice<MemoryStore> {
        let mut device = FormDevice::new(
            MemoryStore::new(),
            RemoteDataClient::default(),
            RefreshPolicy::default(),
        );
        device.save_remote("secret", "i42").unwrap();
        device
    }

    #[test]
    fn refresh_requests_thirty_day_window() {
        let mut device = configured_device();
        let mut transport = CannedTransport::new(vec![CannedTransport::body(TWO_DAYS)]);

        assert_eq!(device.refresh(&mut transport, day(30)), Ok(2));
        assert_eq!(
            transport.requests[0].url,
            "https://intervals.icu/api/v1/athlete/i42/wellness?oldest=2025-03-01&newest=2025-03-30"
        );
        assert_eq!(device.history().current().map(|r| r.form), Some(3));
    }

    #[test]
    fn malformed_response_keeps_previous_history() {
        let mut device = configured_device();
        let mut transport = CannedTransport::new(vec![
            CannedTransport::body(TWO_DAYS),
            CannedTransport::body("[]"),
            CannedTransport::body("{not json"),
            Err("connection reset".to_string()),
        ]);

        device.refresh(&mut transport, day(10)).unwrap();
        let before = *device.history().current().unwrap();

        assert!(matches!(
            device.refresh(&mut transport, day(10)),
            Err(FetchError::EmptyOrMalformed(_))
        ));
        assert!(matches!(
            device.refresh(&mut transport, day(10)),
            Err(FetchError::EmptyOrMalformed(_))
        ));
        assert!(matches!(
            device.refresh(&mut transport, day(10)),
            Err(FetchError::Transport(_))
        ));
        assert_eq!(device.history().current(), Some(&before));
        assert_eq!(device.history().len(), 2);
    }

    #[test]
    fn malformed_form_refresh_reports_upstream_failure() {
        let mut device = configured_device();
        let mut transport = CannedTransport::new(vec![
            CannedTransport::body(TWO_DAYS),
            CannedTransport::body("{not json"),
        ]);

        device.refresh(&mut transport, day(10)).unwrap();
        let before = *device.history().current().unwrap();

        let response = device.refresh_form(&mut transport, day(10));
        assert_eq!(response.status, 502);
        assert!(!response.success);
        assert_eq!(response.message, None);
        assert_eq!(
            response.error.as_deref(),
            Some("No usable wellness data received")
        );
        assert_eq!(device.history().current(), Some(&before));
        assert_eq!(device.history().len(), 2);
    }

    #[test]
    fn unconfigured_refresh_fails_without_network() {
        let mut device = FormDevice::new(
            MemoryStore::new(),
            RemoteDataClient::default(),
            RefreshPolicy::default(),
        );
        let mut transport = CannedTransport::new(vec![CannedTransport::body(TWO_DAYS)]);

        let response = device.refresh_form(&mut transport, day(10));
        assert_eq!(
            response,
            ApiResponse {
                status: 400,
                success: false,
                message: None,
                error: Some("API key not configured".to_string()),
            }
        );
        assert!(transport.requests.is_empty());
    }

    #[test]
    fn manual_refresh_messages() {
        let mut device = configured_device();
        let mut transport = CannedTransport::new(vec![
            CannedTransport::body(TWO_DAYS),
            CannedTransport::body(TWO_DAYS),
        ]);

        assert_eq!(
            device.refresh_form(&mut transport, day(10)),
            ApiResponse::ok("Form +3 (CTL 43, ATL 40)")
        );
        assert_eq!(
            device.refresh_history(&mut transport, day(10)),
            ApiResponse::ok("Loaded 2 days")
        );
        assert_eq!(device.dashboard_view().last_scheduled_fetch, None);
    }

    #[test]
    fn scheduled_tick_marks_only_on_success() {
        let mut device = configured_device();
        device.set_time_synced(true);
        let mut transport = CannedTransport::new(vec![
            Err("timeout".to_string()),
            CannedTransport::body(TWO_DAYS),
        ]);
        let before = Utc.with_ymd_and_hms(2025, 3, 10, 6, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 10, 7, 0, 0).unwrap();

        assert!(device.tick(0, Some(before), &mut transport).is_none());
        assert!(matches!(
            device.tick(30_000, Some(after), &mut transport),
            Some(Err(FetchError::Transport(_)))
        ));
        assert_eq!(device.dashboard_view().last_scheduled_fetch, None);

        assert_eq!(device.tick(60_000, Some(after), &mut transport), Some(Ok(2)));
        assert_eq!(device.dashboard_view().last_scheduled_fetch, Some(day(10)));
        assert!(device.tick(90_000, Some(after), &mut transport).is_none());
    }

    #[test]
    fn tick_waits_for_time_sync() {
        let mut device = configured_device();
        let mut transport = CannedTransport::new(vec![CannedTransport::body(TWO_DAYS)]);
        let noon = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();

        assert!(device.tick(0, Some(noon), &mut transport).is_none());
        assert!(transport.requests.is_empty());
    }

    #[test]
    fn schedule_change_requests_resync_without_marking_today() {
        let mut device = configured_device();
        assert_eq!(
            device.save_schedule("06:30", "+2"),
            Ok(ConfigChange::ResyncTime)
        );
        assert_eq!(device.config().schedule.to_string(), "06:30 UTC+2");
        assert_eq!(device.dashboard_view().last_scheduled_fetch, None);

        device.save_schedule("25:00", "x").unwrap();
        assert_eq!(device.config().schedule.to_string(), "06:30 UTC+2");

        let reloaded = ConfigStore::new(MemoryStore::from_bytes(device.store().backend().as_bytes()));
        assert_eq!(reloaded.load().schedule, device.config().schedule);
    }

    #[test]
    fn empty_api_key_keeps_stored_key() {
        let mut device = configured_device();
        assert_eq!(device.save_remote("", " "), Ok(ConfigChange::Applied));
        assert_eq!(device.config().remote.api_key, "secret");
        assert_eq!(device.config().remote.athlete_id, "0");
    }

    #[test]
    fn network_save_and_reset_require_reload() {
        let mut device = configured_device();
        assert_eq!(
            device.save_network(" home ", "pw"),
            Ok(ConfigChange::ReloadRequired)
        );
        device.set_connectivity(ConnectivityState {
            mode: ConnectivityMode::Connected,
            attempts: 1,
            last_status: RadioStatus::Connected,
        });
        device.reload();
        assert_eq!(device.network_credentials(), NetworkCredentials::new("home", "pw"));
        assert_eq!(device.boot_plan(), BootPlan::AccessPoint);

        assert_eq!(device.reset(), Ok(ConfigChange::ReloadRequired));
        device.reload();
        assert_eq!(device.config(), &DeviceConfig::default());
        assert!(device.history().is_empty());
    }

    #[test]
    fn boot_plan_follows_connectivity_and_sync() {
        let mut device = configured_device();
        assert_eq!(device.boot_plan(), BootPlan::AccessPoint);

        device.set_connectivity(ConnectivityState {
            mode: ConnectivityMode::Connected,
            attempts: 1,
            last_status: RadioStatus::Connected,
        });
        assert_eq!(
            device.boot_plan(),
            BootPlan::Station {
                initial_refresh: false
            }
        );
        device.set_time_synced(true);
        assert_eq!(
            device.boot_plan(),
            BootPlan::Station {
                initial_refresh: true
            }
        );
    }
}
