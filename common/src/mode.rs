//! Boot-time mode selection and the two disjoint route tables.

use crate::connectivity::ConnectivityState;

pub const CAPTIVE_PROBE_PATHS: [&str; 8] = [
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
    "/success.txt",
    "/canonical.html",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPlan {
    Station { initial_refresh: bool },
    AccessPoint,
}

impl BootPlan {
    /// `time_synced` is only consulted in station mode; the plan is fixed for
    /// the rest of the boot.
    pub fn select(state: &ConnectivityState, remote_configured: bool, time_synced: bool) -> Self {
        if state.is_connected() {
            Self::Station {
                initial_refresh: remote_configured && time_synced,
            }
        } else {
            Self::AccessPoint
        }
    }

    pub fn is_station(&self) -> bool {
        matches!(self, Self::Station { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Dashboard,
    SaveApi,
    SaveSchedule,
    Reset,
    ApiForm,
    ApiHistory,
    Setup,
    Connect,
    CaptiveRedirect,
    NotFound,
}

pub const STATION_ROUTES: [(HttpMethod, &str, Route); 6] = [
    (HttpMethod::Get, "/", Route::Dashboard),
    (HttpMethod::Post, "/saveapi", Route::SaveApi),
    (HttpMethod::Post, "/saveschedule", Route::SaveSchedule),
    (HttpMethod::Post, "/reset", Route::Reset),
    (HttpMethod::Get, "/api/form", Route::ApiForm),
    (HttpMethod::Get, "/api/history", Route::ApiHistory),
];

pub const SETUP_ROUTES: [(HttpMethod, &str, Route); 2] = [
    (HttpMethod::Get, "/", Route::Setup),
    (HttpMethod::Post, "/connect", Route::Connect),
];

pub fn route(station: bool, method: HttpMethod, uri: &str) -> Route {
    let path = uri.split(|c: char| c == '?' || c == '#').next().unwrap_or(uri);
    let table: &[(HttpMethod, &str, Route)] = if station {
        &STATION_ROUTES
    } else {
        &SETUP_ROUTES
    };

    if let Some((_, _, route)) = table
        .iter()
        .find(|(m, p, _)| *m == method && *p == path)
    {
        return *route;
    }

    // Anything unrecognised in setup mode, including OS probe URLs, lands on
    // the network chooser.
    if station {
        Route::NotFound
    } else {
        Route::CaptiveRedirect
    }
}
