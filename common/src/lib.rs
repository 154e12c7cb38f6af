pub mod config;
pub mod connectivity;
pub mod device;
pub mod dns;
pub mod error;
pub mod form;
pub mod history;
pub mod mode;
pub mod networks;
pub mod pages;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod wellness;

pub use config::{
    DeviceConfig, JoinPolicy, NetworkCredentials, RefreshPolicy, RemoteCredentials,
    ScheduleConfig,
};
pub use connectivity::{
    ConnectivityManager, ConnectivityMode, ConnectivityState, Pause, Radio, RadioStatus,
};
pub use device::{ConfigChange, FormDevice};
pub use error::{ConnectError, FetchError, RadioError, StoreError};
pub use history::{FormHistory, FormRecord};
pub use mode::{route, BootPlan, HttpMethod, Route};
pub use networks::{dedupe_networks, ScannedNetwork};
pub use store::{ByteStore, ConfigStore, MemoryStore};
pub use types::{ApiResponse, DashboardView};
pub use wellness::{RemoteDataClient, TransportResponse, WellnessRequest, WellnessTransport};
