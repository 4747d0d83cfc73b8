use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    clock::Clock,
    config::{NetworkConfig, TimingConfig},
    display::{Presenter, MSG_LINK_FATAL, MSG_LINK_LOST, MSG_UPDATE_APPLIED},
    retry::{RetryOutcome, RetryPolicy},
    types::{LinkInfo, LinkState},
    update::{UpdateListener, UpdatePoll},
};

/// Conditions the core cannot recover from in-process. The firmware entry
/// point answers every one of them with a full restart.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RestartReason {
    #[error("wifi association not established after {polls} polls")]
    LinkUnrecoverable { polls: u32 },
    #[error("firmware update applied ({bytes} bytes)")]
    UpdateApplied { bytes: u64 },
}

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("radio configuration rejected: {0}")]
    Config(String),
    #[error("radio driver error: {0}")]
    Driver(String),
}

/// Station-mode wireless interface.
pub trait Radio {
    /// Applies credentials and starts association without waiting for it.
    fn begin(&mut self, network: &NetworkConfig) -> Result<(), RadioError>;

    /// Non-blocking association status.
    fn is_associated(&mut self) -> bool;

    /// Drops the current (possibly stale) association.
    fn disconnect(&mut self);

    fn rssi(&mut self) -> i8;

    fn link_info(&mut self) -> LinkInfo;
}

pub struct ConnectivityManager<R, U> {
    radio: R,
    listener: U,
    network: NetworkConfig,
    policy: RetryPolicy,
    status_hold_ms: u32,
    state: LinkState,
    listener_armed: bool,
    reconnects: u32,
    #[cfg(test)]
    state_history: Vec<LinkState>,
}

impl<R: Radio, U: UpdateListener> ConnectivityManager<R, U> {
    pub fn new(radio: R, listener: U, network: NetworkConfig, timing: &TimingConfig) -> Self {
        Self {
            radio,
            listener,
            network,
            policy: RetryPolicy::new(timing.connect_poll_interval_ms, timing.connect_max_polls),
            status_hold_ms: timing.status_hold_ms,
            state: LinkState::Disconnected,
            listener_armed: false,
            reconnects: 0,
            #[cfg(test)]
            state_history: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_listener_armed(&self) -> bool {
        self.listener_armed
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Every state entered since construction, oldest first.
    #[cfg(test)]
    pub(crate) fn state_history(&self) -> &[LinkState] {
        &self.state_history
    }

    pub fn signal_strength(&mut self) -> i8 {
        self.radio.rssi()
    }

    /// Blocks until associated or the poll budget is spent. Every call gets a
    /// fresh budget.
    pub fn connect<C, P>(
        &mut self,
        clock: &mut C,
        presenter: &mut P,
    ) -> Result<LinkState, RestartReason>
    where
        C: Clock + ?Sized,
        P: Presenter + ?Sized,
    {
        self.set_state(LinkState::Connecting);
        presenter.show_connecting(&self.network.ssid);
        info!("wifi connecting to `{}`", self.network.ssid);

        if let Err(err) = self.radio.begin(&self.network) {
            warn!("wifi begin failed: {err}");
        }

        let radio = &mut self.radio;
        let outcome = self.policy.poll_until(
            clock,
            || radio.is_associated(),
            |failed| presenter.show_connect_progress(failed),
        );

        match outcome {
            RetryOutcome::Succeeded { attempts } => {
                self.set_state(LinkState::Connected);
                let link = self.radio.link_info();
                info!(
                    "wifi connected after {attempts} poll(s): ip {} channel {}",
                    link.ip, link.channel
                );
                presenter.show_connected(link.ip, link.channel);
                self.arm_listener(presenter);
                Ok(LinkState::Connected)
            }
            RetryOutcome::Exhausted { attempts } => {
                self.set_state(LinkState::Disconnected);
                warn!("wifi association failed after {attempts} poll(s)");
                presenter.show_error(MSG_LINK_FATAL);
                Err(RestartReason::LinkUnrecoverable { polls: attempts })
            }
        }
    }

    /// Cheap when the link is up. When it is not, tears the stale association
    /// down and reconnects before returning, so no caller ever works on a dead
    /// link.
    pub fn ensure_healthy<C, P>(
        &mut self,
        clock: &mut C,
        presenter: &mut P,
    ) -> Result<LinkState, RestartReason>
    where
        C: Clock + ?Sized,
        P: Presenter + ?Sized,
    {
        if self.state == LinkState::Connected && self.radio.is_associated() {
            return Ok(LinkState::Connected);
        }

        warn!("wifi association lost; reconnecting");
        self.set_state(LinkState::Disconnected);
        self.disarm_listener();
        presenter.show_status(MSG_LINK_LOST);
        clock.delay_ms(self.status_hold_ms);

        self.radio.disconnect();
        clock.yield_now();
        self.reconnects = self.reconnects.saturating_add(1);

        self.connect(clock, presenter)
    }

    pub fn service_update_listener<P>(&mut self, presenter: &mut P) -> Result<(), RestartReason>
    where
        P: Presenter + ?Sized,
    {
        if self.state != LinkState::Connected || !self.listener_armed {
            return Ok(());
        }

        match self.listener.service() {
            UpdatePoll::Idle => Ok(()),
            UpdatePoll::Receiving { bytes } => {
                debug!("update in progress: {bytes} bytes received");
                Ok(())
            }
            UpdatePoll::Failed(reason) => {
                warn!("remote update failed: {reason}");
                presenter.show_error(&format!("Update failed: {reason}"));
                Ok(())
            }
            UpdatePoll::Completed { bytes } => {
                info!("remote update staged ({bytes} bytes)");
                presenter.show_status(MSG_UPDATE_APPLIED);
                Err(RestartReason::UpdateApplied { bytes })
            }
        }
    }

    fn arm_listener<P>(&mut self, presenter: &mut P)
    where
        P: Presenter + ?Sized,
    {
        match self
            .listener
            .arm(&self.network.hostname, &self.network.update_auth_token)
        {
            Ok(()) => {
                self.listener_armed = true;
                info!("update listener armed as `{}`", self.network.hostname);
            }
            Err(err) => {
                self.listener_armed = false;
                warn!("update listener unavailable: {err}");
                presenter.show_error("Update listener unavailable");
            }
        }
    }

    fn disarm_listener(&mut self) {
        if self.listener_armed {
            self.listener.disarm();
            self.listener_armed = false;
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!("link {} -> {}", self.state.as_str(), state.as_str());
            self.state = state;
            #[cfg(test)]
            self.state_history.push(state);
        }
    }
}
