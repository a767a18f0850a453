//! Retransmission tracking for Child Update Request and Data Request.
//!
//! Two independent timed retry tracks with attempt counts and jitter.
//! Exhausting a track is the only path that promotes a recoverable
//! error into a role transition (Detached).

use crate::time::{Duration, Timestamp};
use crate::traits::Random;
use crate::types::{MAX_CHILD_KEEP_ALIVE_ATTEMPTS, MAX_TRANSMISSION_ATTEMPTS, RETX_DELAY, RETX_JITTER};

/// State of one retry track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RetryState {
    #[default]
    Idle,
    WaitingForResponse,
    SendingKeepAlive,
}

/// One retry track.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryInfo {
    pub state: RetryState,
    pub next_tx_time: Timestamp,
    pub attempts: u8,
}

impl RetryInfo {
    fn reset(&mut self) {
        self.state = RetryState::Idle;
        self.attempts = 0;
    }

    fn increment_attempts(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    fn set_next_tx_time<R: Random>(&mut self, delay: Duration, rng: &mut R, now: Timestamp) {
        self.next_tx_time = now + rng.add_jitter(delay, RETX_JITTER);
    }

    fn should_send(&self, now: Timestamp) -> bool {
        match self.state {
            RetryState::Idle => false,
            RetryState::WaitingForResponse | RetryState::SendingKeepAlive => {
                now >= self.next_tx_time
            }
        }
    }

    fn fire_time(&self) -> Option<Timestamp> {
        match self.state {
            RetryState::Idle => None,
            RetryState::WaitingForResponse | RetryState::SendingKeepAlive => Some(self.next_tx_time),
        }
    }

    fn exhausted(&self) -> bool {
        self.attempts >= MAX_TRANSMISSION_ATTEMPTS
    }
}

/// Action decided by the tracker on a timer tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetxAction {
    None,
    SendChildUpdateRequest,
    SendDataRequest,
    /// A track exhausted its attempts; transition to Detached.
    Detach,
}

/// The two-track retransmission tracker.
#[derive(Default)]
pub struct RetxTracker {
    pub child_update: RetryInfo,
    pub data_request: RetryInfo,
}

impl RetxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop both tracks (device left the child role or was disabled).
    pub fn stop(&mut self) {
        self.child_update.reset();
        self.data_request.reset();
    }

    /// Role changed to Child: reset and prime the keep-alive timer.
    ///
    /// Keep-alive is used only on rx-on-when-idle children; sleepy
    /// children keep the link alive through data polls.
    pub fn on_role_change_to_child<R: Random>(
        &mut self,
        timeout_secs: u32,
        rx_on_when_idle: bool,
        rng: &mut R,
        now: Timestamp,
    ) {
        self.child_update.reset();
        self.data_request.reset();
        self.prime_keep_alive(timeout_secs, rx_on_when_idle, rng, now);
    }

    fn prime_keep_alive<R: Random>(
        &mut self,
        timeout_secs: u32,
        rx_on_when_idle: bool,
        rng: &mut R,
        now: Timestamp,
    ) {
        if !rx_on_when_idle {
            return;
        }

        // Leave room for every retry to complete before the parent's
        // timeout expires.
        let budget = (RETX_DELAY + RETX_JITTER) * MAX_CHILD_KEEP_ALIVE_ATTEMPTS as u64;
        let interval =
            Duration::from_secs(timeout_secs as u64).saturating_sub(budget);

        self.child_update.state = RetryState::SendingKeepAlive;
        self.child_update.set_next_tx_time(interval, rng, now);
    }

    /// A Child Update Request was transmitted to the parent.
    ///
    /// With CSL enabled the retry must wait at least one CSL period for
    /// the response to be delivered through a wake window.
    pub fn on_child_update_request_tx<R: Random>(
        &mut self,
        csl_period: Option<Duration>,
        rng: &mut R,
        now: Timestamp,
    ) {
        let mut delay = RETX_DELAY;
        if let Some(period) = csl_period {
            delay += period;
        }

        self.child_update.increment_attempts();
        self.child_update.state = RetryState::WaitingForResponse;
        self.child_update.set_next_tx_time(delay, rng, now);
    }

    /// A matching Child Update Response arrived.
    pub fn on_child_update_response_rx<R: Random>(
        &mut self,
        timeout_secs: u32,
        rx_on_when_idle: bool,
        rng: &mut R,
        now: Timestamp,
    ) {
        self.child_update.reset();
        self.prime_keep_alive(timeout_secs, rx_on_when_idle, rng, now);

        // Data Request retries were held while the Child Update
        // Response was awaited (it typically carries the data). If one
        // is still outstanding, re-arm it now.
        if self.data_request.state == RetryState::WaitingForResponse {
            self.data_request.set_next_tx_time(RETX_DELAY, rng, now);
        }
    }

    /// A Data Request was transmitted. Retries are tracked only on a
    /// sleepy child; an rx-on child hears the response directly.
    pub fn on_data_request_tx<R: Random>(
        &mut self,
        is_sleepy_child: bool,
        rng: &mut R,
        now: Timestamp,
    ) {
        if is_sleepy_child {
            self.data_request.increment_attempts();
            self.data_request.state = RetryState::WaitingForResponse;
            self.data_request.set_next_tx_time(RETX_DELAY, rng, now);
        } else {
            self.data_request.reset();
        }
    }

    /// A Data Response satisfied the outstanding request.
    pub fn on_data_response_rx(&mut self) {
        self.data_request.reset();
    }

    /// Whether a Data Response is still awaited.
    pub fn is_waiting_for_data_response(&self) -> bool {
        self.data_request.state == RetryState::WaitingForResponse
    }

    /// Earliest deadline either track needs a tick for.
    ///
    /// Data Request firing is suppressed while a Child Update Response
    /// is awaited, to avoid redundant polls.
    pub fn next_fire_time(&self) -> Option<Timestamp> {
        let mut next = self.child_update.fire_time();

        if self.child_update.state != RetryState::WaitingForResponse {
            next = match (next, self.data_request.fire_time()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        next
    }

    /// Decide what (at most one thing) to do at `now`.
    pub fn on_timer(&mut self, now: Timestamp) -> RetxAction {
        if self.child_update.should_send(now) {
            if self.child_update.exhausted() {
                return RetxAction::Detach;
            }
            return RetxAction::SendChildUpdateRequest;
        }

        // Deferred while a Child Update Response is awaited.
        if self.child_update.state != RetryState::WaitingForResponse
            && self.data_request.should_send(now)
        {
            if self.data_request.exhausted() {
                return RetxAction::Detach;
            }
            return RetxAction::SendDataRequest;
        }

        RetxAction::None
    }
}
