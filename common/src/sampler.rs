use log::debug;

use crate::{
    clock::{elapsed_ms, Clock},
    config::TimingConfig,
    connectivity::{ConnectivityManager, Radio, RestartReason},
    display::{Presenter, MSG_SENSOR_UNAVAILABLE},
    storage::{StorageLogger, Volume},
    types::{Climate, Sample},
    update::UpdateListener,
};

/// Temperature/humidity source. `None` means no reading this tick.
pub trait ClimateSensor {
    fn read(&mut self) -> Option<Climate>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Written,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PassOutcome {
    /// The period has not elapsed yet.
    Idle,
    Sampled { sample: Sample, logged: LogOutcome },
}

/// Fixed-period scheduler driving one sample per period. Periods missed while
/// a pass was blocked are dropped, never made up.
pub struct SampleLoop<R, U, V> {
    connectivity: ConnectivityManager<R, U>,
    storage: StorageLogger<V>,
    sample_period_ms: u32,
    idle_poll_ms: u32,
    last_sample_ms: u32,
}

impl<R, U, V> SampleLoop<R, U, V>
where
    R: Radio,
    U: UpdateListener,
    V: Volume,
{
    /// `now_ms` is the boot time; the first pass samples immediately.
    pub fn new(
        connectivity: ConnectivityManager<R, U>,
        storage: StorageLogger<V>,
        timing: &TimingConfig,
        now_ms: u32,
    ) -> Self {
        Self {
            connectivity,
            storage,
            sample_period_ms: timing.sample_period_ms,
            idle_poll_ms: timing.idle_poll_ms,
            last_sample_ms: now_ms.wrapping_sub(timing.sample_period_ms),
        }
    }

    pub fn connectivity(&self) -> &ConnectivityManager<R, U> {
        &self.connectivity
    }

    pub fn storage(&self) -> &StorageLogger<V> {
        &self.storage
    }

    pub fn last_sample_ms(&self) -> u32 {
        self.last_sample_ms
    }

    pub fn pass<C, S, P>(
        &mut self,
        clock: &mut C,
        sensor: &mut S,
        presenter: &mut P,
    ) -> Result<PassOutcome, RestartReason>
    where
        C: Clock + ?Sized,
        S: ClimateSensor + ?Sized,
        P: Presenter + ?Sized,
    {
        self.connectivity.ensure_healthy(clock, presenter)?;
        self.connectivity.service_update_listener(presenter)?;

        let now = clock.now_ms();
        if elapsed_ms(now, self.last_sample_ms) < self.sample_period_ms {
            return Ok(PassOutcome::Idle);
        }
        self.last_sample_ms = now;

        let rssi_dbm = self.connectivity.signal_strength();
        presenter.show_signal(rssi_dbm);

        let climate = sensor.read();
        match climate {
            Some(reading) => {
                presenter.show_reading(reading.temperature_c, reading.relative_humidity_pct)
            }
            None => {
                debug!("climate sensor unavailable at {now}ms");
                presenter.show_error(MSG_SENSOR_UNAVAILABLE);
            }
        }

        let sample = Sample {
            timestamp_ms: now,
            rssi_dbm,
            climate,
        };

        let logged = if self.storage.is_enabled() {
            match self.storage.append(&sample, presenter) {
                Ok(()) => LogOutcome::Written,
                Err(_) => LogOutcome::Failed,
            }
        } else {
            LogOutcome::Skipped
        };

        Ok(PassOutcome::Sampled { sample, logged })
    }

    /// Runs passes until something demands a restart. `before_pass` runs at
    /// the top of every pass (watchdog feeding and the like).
    pub fn run<C, S, P, F>(
        &mut self,
        clock: &mut C,
        sensor: &mut S,
        presenter: &mut P,
        mut before_pass: F,
    ) -> RestartReason
    where
        C: Clock + ?Sized,
        S: ClimateSensor + ?Sized,
        P: Presenter + ?Sized,
        F: FnMut(),
    {
        loop {
            before_pass();
            match self.pass(clock, sensor, presenter) {
                Ok(PassOutcome::Idle) => clock.delay_ms(self.idle_poll_ms),
                Ok(PassOutcome::Sampled { .. }) => {}
                Err(reason) => return reason,
            }
        }
    }
}
