//! Ordered-fallback state machine for the client router.
//!
//! The machine holds no timers. The router feeds it the current [`Instant`]
//! and transport reports; it answers with [`Directive`]s and the next
//! deadline it needs to be woken for. Tests drive it with synthetic clocks.
//!
//! Schedule: the most resilient transport (the managed socket) is tried
//! first, then the list is walked in priority order, wrapping around. Each
//! failure waits `base * factor^min(n-1, max_exponent)`, capped at the
//! ceiling, before the next attempt. After `max_cycles` full passes the
//! machine commits to the socket and only ever retries that.

use std::time::{Duration, Instant};

use runcash_core::config::ClientConfig;
use tracing::{debug, info, warn};

use crate::types::TransportKind;

/// Capped exponential backoff between attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max_exponent: u32,
    pub ceiling: Duration,
}

impl BackoffPolicy {
    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.backoff_base_ms),
            factor: cfg.backoff_factor,
            max_exponent: cfg.backoff_max_exponent,
            ceiling: Duration::from_millis(cfg.backoff_ceiling_ms),
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(self.max_exponent);
        let ms = self.base.as_millis() as f64 * self.factor.powi(exponent as i32);
        Duration::from_millis(ms as u64).min(self.ceiling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Backing off; the next attempt starts at `until`.
    Waiting { until: Instant },
    /// Started, not yet opened; abandoned at `deadline`.
    Connecting { deadline: Instant },
    Open,
    Stopped,
}

/// What the router must do to the transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Start(TransportKind),
    /// Open timeout expired: stop the transport, it counts as failed.
    Abandon(TransportKind),
}

#[derive(Debug)]
pub struct FallbackMachine {
    order: [TransportKind; 4],
    index: usize,
    start_index: usize,
    failures: u32,
    cycles: u32,
    max_cycles: u32,
    committed: bool,
    last_failed: [bool; 4],
    phase: Phase,
    backoff: BackoffPolicy,
    open_timeout: Duration,
}

impl FallbackMachine {
    pub fn new(cfg: &ClientConfig, now: Instant) -> Self {
        let order = TransportKind::PRIORITY;
        let start_index = position(&order, TransportKind::MOST_RESILIENT);
        Self {
            order,
            index: start_index,
            start_index,
            failures: 0,
            cycles: 0,
            max_cycles: cfg.max_cycles,
            committed: cfg.max_cycles == 0,
            last_failed: [false; 4],
            phase: Phase::Waiting { until: now },
            backoff: BackoffPolicy::from_config(cfg),
            open_timeout: Duration::from_millis(cfg.open_timeout_ms),
        }
    }

    pub fn current(&self) -> TransportKind {
        self.order[self.index]
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// Consecutive failures since the last successful open.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// False only while the latest attempt of every transport has failed.
    pub fn connected(&self) -> bool {
        !self.last_failed.iter().all(|failed| *failed)
    }

    /// When the router must call [`tick`](Self::tick) next, if ever.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Waiting { until } => Some(until),
            Phase::Connecting { deadline } => Some(deadline),
            Phase::Open | Phase::Stopped => None,
        }
    }

    /// Advance on the clock.
    pub fn tick(&mut self, now: Instant) -> Option<Directive> {
        match self.phase {
            Phase::Waiting { until } if now >= until => {
                self.phase = Phase::Connecting {
                    deadline: now + self.open_timeout,
                };
                debug!(transport = %self.current(), "starting transport");
                Some(Directive::Start(self.current()))
            }
            Phase::Connecting { deadline } if now >= deadline => {
                let kind = self.current();
                warn!(
                    transport = %kind,
                    timeout_ms = self.open_timeout.as_millis() as u64,
                    "transport did not open in time"
                );
                self.record_failure(now);
                Some(Directive::Abandon(kind))
            }
            _ => None,
        }
    }

    /// The transport reported a successful open. Returns whether the report
    /// was accepted (it must come from the current transport).
    pub fn on_opened(&mut self, kind: TransportKind) -> bool {
        if kind != self.current() || !self.is_live() {
            return false;
        }
        self.phase = Phase::Open;
        self.failures = 0;
        self.last_failed[self.index] = false;
        true
    }

    /// The transport reported failure. Returns whether it was accepted; if
    /// so the caller must stop that transport.
    pub fn on_failed(&mut self, kind: TransportKind, now: Instant) -> bool {
        if kind != self.current() || !self.is_live() {
            return false;
        }
        self.record_failure(now);
        true
    }

    pub fn stop(&mut self) {
        self.phase = Phase::Stopped;
    }

    fn is_live(&self) -> bool {
        matches!(self.phase, Phase::Connecting { .. } | Phase::Open)
    }

    fn record_failure(&mut self, now: Instant) {
        self.last_failed[self.index] = true;
        self.failures += 1;

        if !self.committed {
            self.index = (self.index + 1) % self.order.len();
            if self.index == self.start_index {
                self.cycles += 1;
                if self.cycles >= self.max_cycles {
                    self.committed = true;
                    self.index = position(&self.order, TransportKind::MOST_RESILIENT);
                    info!(
                        cycles = self.cycles,
                        transport = %self.current(),
                        "fallback cycles exhausted, committing to most resilient transport"
                    );
                }
            }
        }

        let delay = self.backoff.delay(self.failures);
        debug!(
            next = %self.current(),
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "backing off before next transport attempt"
        );
        self.phase = Phase::Waiting { until: now + delay };
    }
}

fn position(order: &[TransportKind], kind: TransportKind) -> usize {
    order.iter().position(|k| *k == kind).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ClientConfig {
        ClientConfig {
            open_timeout_ms: 3_000,
            backoff_base_ms: 1_000,
            backoff_factor: 1.5,
            backoff_max_exponent: 8,
            backoff_ceiling_ms: 10_000,
            max_cycles: 2,
            ..ClientConfig::default()
        }
    }

    /// Start whatever is due and fail it immediately; returns the started kind.
    fn start_and_fail(m: &mut FallbackMachine, now: &mut Instant) -> TransportKind {
        *now = m.next_deadline().unwrap();
        let Some(Directive::Start(kind)) = m.tick(*now) else {
            panic!("expected a start directive");
        };
        assert!(m.on_failed(kind, *now));
        kind
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = BackoffPolicy::from_config(&cfg());
        assert_eq!(p.delay(1), Duration::from_millis(1_000));
        assert_eq!(p.delay(2), Duration::from_millis(1_500));
        assert_eq!(p.delay(3), Duration::from_millis(2_250));
        assert_eq!(p.delay(20), Duration::from_millis(10_000));
    }

    #[test]
    fn first_attempt_is_immediate_and_socket() {
        let t0 = Instant::now();
        let mut m = FallbackMachine::new(&cfg(), t0);
        assert_eq!(m.tick(t0), Some(Directive::Start(TransportKind::Socket)));
        assert!(m.connected());
        assert!(m.on_opened(TransportKind::Socket));
        assert_eq!(m.phase(), Phase::Open);
        assert_eq!(m.next_deadline(), None);
    }

    #[test]
    fn walks_priority_order_and_wraps_to_socket() {
        let mut now = Instant::now();
        let mut m = FallbackMachine::new(&cfg(), now);

        let tried: Vec<TransportKind> = (0..5).map(|_| start_and_fail(&mut m, &mut now)).collect();
        assert_eq!(
            tried,
            vec![
                TransportKind::Socket,
                TransportKind::DirectStream,
                TransportKind::ProxiedStream,
                TransportKind::Polling,
                TransportKind::Socket,
            ]
        );
        assert_eq!(m.cycles(), 1);
        assert!(!m.is_committed());
    }

    #[test]
    fn last_transport_opening_restores_connectivity() {
        let mut now = Instant::now();
        let mut m = FallbackMachine::new(&cfg(), now);
        for _ in 0..4 {
            start_and_fail(&mut m, &mut now);
        }
        assert!(!m.connected());

        now = m.next_deadline().unwrap();
        assert_eq!(m.tick(now), Some(Directive::Start(TransportKind::Socket)));
        assert!(m.on_opened(TransportKind::Socket));
        assert!(m.connected());
        assert_eq!(m.failures(), 0);
    }

    #[test]
    fn commits_to_socket_after_max_cycles() {
        let mut now = Instant::now();
        let mut m = FallbackMachine::new(&cfg(), now);
        for _ in 0..8 {
            start_and_fail(&mut m, &mut now);
        }
        assert!(m.is_committed());
        for _ in 0..5 {
            assert_eq!(start_and_fail(&mut m, &mut now), TransportKind::Socket);
        }
        assert!(!m.connected());
    }

    #[test]
    fn open_timeout_abandons_current() {
        let t0 = Instant::now();
        let mut m = FallbackMachine::new(&cfg(), t0);
        assert_eq!(m.tick(t0), Some(Directive::Start(TransportKind::Socket)));
        assert_eq!(m.tick(t0 + Duration::from_millis(2_999)), None);

        let late = t0 + Duration::from_millis(3_000);
        assert_eq!(m.tick(late), Some(Directive::Abandon(TransportKind::Socket)));
        assert_eq!(m.current(), TransportKind::DirectStream);
        assert_eq!(
            m.next_deadline(),
            Some(late + Duration::from_millis(1_000))
        );
    }

    #[test]
    fn reports_from_other_transports_are_ignored() {
        let t0 = Instant::now();
        let mut m = FallbackMachine::new(&cfg(), t0);
        m.tick(t0);
        assert!(!m.on_opened(TransportKind::Polling));
        assert!(!m.on_failed(TransportKind::Polling, t0));
        assert_eq!(m.current(), TransportKind::Socket);
    }

    #[test]
    fn failure_while_open_rotates() {
        let t0 = Instant::now();
        let mut m = FallbackMachine::new(&cfg(), t0);
        m.tick(t0);
        m.on_opened(TransportKind::Socket);
        assert!(m.on_failed(TransportKind::Socket, t0));
        assert_eq!(m.current(), TransportKind::DirectStream);
        // the other three have not failed yet
        assert!(m.connected());
    }

    #[test]
    fn zero_cycles_means_socket_only() {
        let mut now = Instant::now();
        let mut m = FallbackMachine::new(
            &ClientConfig {
                max_cycles: 0,
                ..cfg()
            },
            now,
        );
        for _ in 0..3 {
            assert_eq!(start_and_fail(&mut m, &mut now), TransportKind::Socket);
        }
    }
}
