//! Coordinated sampled listening receiver.
//!
//! Schedules periodic receive windows from the device's own CSL phase
//! and period. On radios with receive-timing hardware the timer fires
//! once per period and arms a timed receive; otherwise it fires twice,
//! once at window start and once at window end.
//!
//! Window growth: the longer a peer has not provably heard us, the
//! wider the window, bounded by half the period. A second, independent
//! wakeup-listen cycle (used when parenting second-tier children) is
//! interleaved whenever a full wakeup window fits before the next CSL
//! window.

use crate::neighbors::Peer;
use crate::time::{DurationUs, TimestampUs};
use crate::traits::Radio;
use crate::types::{
    CSL_CANDIDATE_WINDOW_GUARD, CSL_MIN_RECEIVE_ON_AFTER, CSL_MIN_RECEIVE_ON_AHEAD,
    CSL_RECEIVE_TIME_AHEAD, US_PER_TEN_SYMBOLS, WAKEUP_LISTEN_LENGTH,
};

/// Which window the next timer firing opens or closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CslRxState {
    /// Next firing opens a CSL sample window.
    CslQueued,
    /// Inside a CSL sample window (no receive-timing hardware).
    CslReceive,
    /// Next firing opens a wakeup-listen window.
    WakeupQueued,
    /// Inside a wakeup-listen window.
    WakeupReceive,
}

/// Kinds of peers contributing to the receive-window width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CslPeerKind {
    Parent,
    /// Parent candidate; gets an extra guard while the link settles.
    ParentCandidate,
    Child,
}

/// Receive window edges around the sample time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowEdges {
    pub ahead: DurationUs,
    pub after: DurationUs,
}

/// The CSL receiver.
pub struct CslReceiver {
    pub state: CslRxState,
    /// Own CSL period in ten-symbol units; zero disables sampling.
    period: u16,
    channel: u8,
    sample_time: TimestampUs,
    // Wakeup listening.
    wakeup_enabled: bool,
    wakeup_channel: u8,
    /// Wakeup interval in units of 256 ten-symbol periods.
    wakeup_period: u16,
    wakeup_listen_time: TimestampUs,
}

impl Default for CslReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl CslReceiver {
    pub fn new() -> Self {
        CslReceiver {
            state: CslRxState::CslQueued,
            period: 0,
            channel: 0,
            sample_time: TimestampUs::ZERO,
            wakeup_enabled: false,
            wakeup_channel: 0,
            wakeup_period: 1,
            wakeup_listen_time: TimestampUs::ZERO,
        }
    }

    pub fn period(&self) -> u16 {
        self.period
    }

    pub fn is_enabled(&self) -> bool {
        self.period > 0
    }

    fn period_us(&self) -> DurationUs {
        DurationUs::from_us(self.period as u64 * US_PER_TEN_SYMBOLS)
    }

    fn wakeup_period_us(&self) -> DurationUs {
        DurationUs::from_us(self.wakeup_period as u64 * 256 * US_PER_TEN_SYMBOLS)
    }

    /// Reconfigure CSL sampling. Returns `true` when the configuration
    /// changed and the timer must be (re)armed by running
    /// [`Self::handle_timer`] immediately.
    pub fn configure<R: Radio>(
        &mut self,
        radio: &mut R,
        period: u16,
        channel: u8,
    ) -> bool {
        let changed = period != self.period || channel != self.channel;
        if !changed {
            return false;
        }

        self.channel = channel;
        self.period = period;
        let _ = radio.enable_csl(period);

        if period > 0 {
            self.sample_time = radio.now_us();
            self.wakeup_listen_time = radio.now_us();
            self.state = CslRxState::CslQueued;
        }
        changed
    }

    /// Enable or disable the wakeup-listen cycle.
    pub fn set_wakeup_listening(&mut self, enabled: bool, channel: u8, period: u16, now: TimestampUs) {
        self.wakeup_enabled = enabled;
        self.wakeup_channel = channel;
        self.wakeup_period = period.max(1);
        if enabled {
            self.wakeup_listen_time = now;
        }
    }

    /// Rewrite the radio's CSL short/ext entry tables from the current
    /// parent, candidate, and security-ready children.
    pub fn update_radio_entries<'a, R: Radio>(
        &self,
        radio: &mut R,
        peers: impl Iterator<Item = &'a Peer>,
    ) {
        radio.clear_csl_short_entries();
        radio.clear_csl_ext_entries();

        for peer in peers {
            if peer.rloc16 != crate::types::Rloc16::INVALID {
                let _ = radio.add_csl_short_entry(peer.rloc16);
            }
            let _ = radio.add_csl_ext_entry(peer.ext_address);
        }
    }

    /// Half-window contribution of one peer: clock drift accumulated
    /// since it last provably heard us, plus both uncertainties.
    pub fn peer_semi_window(
        peer: &Peer,
        kind: CslPeerKind,
        local_accuracy_ppm: u8,
        local_uncertainty: u8,
        now: TimestampUs,
    ) -> DurationUs {
        let elapsed = now.saturating_sub(peer.csl.last_sync_timestamp);
        let drift = elapsed.as_us()
            * (local_accuracy_ppm as u64 + peer.csl.accuracy.clock_accuracy_ppm as u64)
            / 1_000_000;
        let mut semi = DurationUs::from_us(drift)
            .saturating_add(DurationUs::from_us(peer.csl.accuracy.uncertainty_us()))
            .saturating_add(DurationUs::from_us(local_uncertainty as u64 * 10));

        if kind == CslPeerKind::ParentCandidate {
            semi = semi.saturating_add(CSL_CANDIDATE_WINDOW_GUARD);
        }
        semi
    }

    /// Compute the receive-window edges from every synchronized peer.
    pub fn window_edges<'a, R: Radio>(
        &self,
        radio: &R,
        peers: impl Iterator<Item = (CslPeerKind, &'a Peer)>,
    ) -> WindowEdges {
        let semi_period = DurationUs::from_us(self.period_us().as_us() / 2);
        let now = radio.now_us();

        let mut semi_window = DurationUs::ZERO;
        for (kind, peer) in peers {
            let peer_semi = Self::peer_semi_window(
                peer,
                kind,
                radio.csl_accuracy_ppm(),
                radio.csl_uncertainty(),
                now,
            );
            if peer_semi > semi_window {
                semi_window = peer_semi;
            }
        }

        WindowEdges {
            ahead: semi_period.min(
                semi_window
                    .saturating_add(CSL_MIN_RECEIVE_ON_AHEAD)
                    .saturating_add(CSL_RECEIVE_TIME_AHEAD),
            ),
            after: semi_period.min(semi_window.saturating_add(CSL_MIN_RECEIVE_ON_AFTER)),
        }
    }

    /// Drive the receiver state machine. Returns the next firing time.
    ///
    /// `edges` must come from [`Self::window_edges`] computed over the
    /// currently synchronized peers.
    pub fn handle_timer<R: Radio>(&mut self, radio: &mut R, edges: WindowEdges) -> TimestampUs {
        match self.state {
            CslRxState::CslReceive | CslRxState::WakeupReceive => {
                // Window ended; sleep until the next one.
                let next = self.schedule_next_event(edges.ahead, radio.now_us());
                let _ = radio.sleep();
                next
            }
            CslRxState::CslQueued => self.handle_csl_window_begin(radio, edges),
            CslRxState::WakeupQueued => self.handle_wakeup_window_begin(radio, edges),
        }
    }

    fn handle_csl_window_begin<R: Radio>(&mut self, radio: &mut R, edges: WindowEdges) -> TimestampUs {
        let period = self.period_us();
        let next_fire;

        if radio.supports_receive_timing() {
            let win_start = self.sample_time - edges.ahead + CSL_RECEIVE_TIME_AHEAD;
            let win_duration = (edges.ahead + edges.after).saturating_sub(CSL_RECEIVE_TIME_AHEAD);

            self.sample_time += period;
            next_fire = self.schedule_next_event(edges.ahead, win_start + win_duration);

            let _ = radio.receive_at(self.channel, win_start, win_duration.as_us());
        } else {
            next_fire = self.sample_time + edges.after;
            self.state = CslRxState::CslReceive;
            self.sample_time += period;
            let _ = radio.receive(self.channel);
        }

        radio.update_csl_sample_time(self.sample_time);
        next_fire
    }

    fn handle_wakeup_window_begin<R: Radio>(&mut self, radio: &mut R, edges: WindowEdges) -> TimestampUs {
        if radio.supports_receive_timing() {
            let win_end = self.wakeup_listen_time + WAKEUP_LISTEN_LENGTH;
            let _ = radio.receive_at(
                self.wakeup_channel,
                self.wakeup_listen_time,
                WAKEUP_LISTEN_LENGTH.as_us(),
            );
            self.wakeup_listen_time += self.wakeup_period_us();
            self.schedule_next_event(edges.ahead, win_end)
        } else {
            let _ = radio.receive(self.wakeup_channel);
            self.state = CslRxState::WakeupReceive;
            self.wakeup_listen_time += self.wakeup_period_us();
            radio.now_us() + WAKEUP_LISTEN_LENGTH + CSL_RECEIVE_TIME_AHEAD
        }
    }

    /// Decide whether the next event is a CSL window or a wakeup
    /// window, and return its firing time.
    fn schedule_next_event(&mut self, ahead: DurationUs, busy_until: TimestampUs) -> TimestampUs {
        let csl_fire =
            TimestampUs::from_us(self.sample_time.as_us().saturating_sub(ahead.as_us()));
        self.state = CslRxState::CslQueued;

        if !self.wakeup_enabled {
            return csl_fire;
        }

        // Catch the wakeup schedule up if it fell behind.
        let period = self.wakeup_period_us();
        while self.wakeup_listen_time < busy_until {
            self.wakeup_listen_time += period;
        }

        // Take the wakeup window only when it completes before the CSL
        // window opens.
        if self.wakeup_listen_time + WAKEUP_LISTEN_LENGTH < csl_fire {
            self.state = CslRxState::WakeupQueued;
            return TimestampUs::from_us(
                self.wakeup_listen_time
                    .as_us()
                    .saturating_sub(CSL_RECEIVE_TIME_AHEAD.as_us()),
            );
        }

        csl_fire
    }
}

/// Record a CSL sync point from a transmitted frame: the frame carried
/// a CSL information element and its ack was received.
pub fn update_last_sync_on_tx(peer: &mut Peer, acked_with_csl_ie: bool, timestamp: TimestampUs) {
    if acked_with_csl_ie {
        peer.csl.last_sync_timestamp = timestamp;
    }
}

/// Record a CSL sync point from a received frame that we acked with a
/// secured enhanced ack.
pub fn update_last_sync_on_rx(peer: &mut Peer, acked_with_sec_enh_ack: bool, timestamp: TimestampUs) {
    if acked_with_sec_enh_ack {
        peer.csl.last_sync_timestamp = timestamp;
    }
}
