pub mod clock;
pub mod config;
pub mod connectivity;
pub mod display;
pub mod hte501;
pub mod retry;
pub mod sampler;
pub mod storage;
pub mod types;
pub mod update;

#[cfg(test)]
mod testing;

pub use clock::{elapsed_ms, Clock, MonotonicClock};
pub use config::{DeviceConfig, NetworkConfig, StorageConfig, TimingConfig, UpdateConfig};
pub use connectivity::{ConnectivityManager, Radio, RadioError, RestartReason};
pub use display::Presenter;
pub use hte501::{Hte501, Hte501Error};
pub use retry::{RetryOutcome, RetryPolicy};
pub use sampler::{ClimateSensor, LogOutcome, PassOutcome, SampleLoop};
pub use storage::{DirVolume, MountError, StorageError, StorageLogger, Volume};
pub use types::{Climate, LinkInfo, LinkState, LogState, Sample, LOG_HEADER};
pub use update::{
    UpdateError, UpdateListener, UpdatePoll, UpdateRequest, UpdateSession, UpdateSink,
    UpdateSummary, UpdateTracker,
};
