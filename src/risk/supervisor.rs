//! Safety Supervisor state machine.
//!
//! `Normal -> Paused` on any limit breach, on a data gap (when configured) or
//! after too many consecutive degraded ticks. `Paused -> Normal` only on an
//! explicit acknowledgment or at the first tick of a later session; signals
//! recovering below their limits never resume on their own.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::event::{AlertSeverity, Breach, BreachKind, ResumeTrigger, RiskEvent, RiskEventKind};
use crate::allocation::{Allocation, SafeAllocation};
use crate::config::{RiskLimitsConfig, ScheduleConfig};
use crate::market::MarketSnapshot;
use crate::state::FeatureVector;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SupervisorState {
    Normal,
    Paused,
}

/// What reaches the Strategy Zoo this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Projected policy allocation
    Allocate(Allocation),
    /// Supervisor override; the policy path is blocked
    Override(SafeAllocation),
}

impl Directive {
    pub fn weights(&self) -> &[f64] {
        match self {
            Directive::Allocate(a) => a.weights(),
            Directive::Override(s) => s.weights(),
        }
    }

    pub fn is_override(&self) -> bool {
        matches!(self, Directive::Override(_))
    }
}

/// Already-computed risk inputs for one tick. Reading these never blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskSignals {
    pub timestamp: DateTime<Utc>,
    pub iv_percentile: Option<f64>,
    pub net_gamma_exposure: Option<f64>,
    pub normalized_delta: Option<f64>,
    /// Cumulative PnL today as a fraction (negative = loss)
    pub daily_pnl_fraction: Decimal,
    pub leverage: Decimal,
    /// Degraded source fields, empty when the tick was clean
    pub degraded_fields: Vec<String>,
}

impl RiskSignals {
    pub fn from_tick(features: &FeatureVector, snapshot: &MarketSnapshot) -> Self {
        Self {
            timestamp: snapshot.timestamp,
            iv_percentile: features.iv_percentile,
            net_gamma_exposure: features.net_gamma_exposure,
            normalized_delta: snapshot.portfolio.normalized_delta,
            daily_pnl_fraction: snapshot.portfolio.daily_pnl_fraction,
            leverage: snapshot.portfolio.leverage,
            degraded_fields: features.degraded.iter().map(|f| format!("{f:?}")).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorDecision {
    pub state: SupervisorState,
    pub directive: Directive,
    pub events: Vec<RiskEvent>,
}

pub struct SafetySupervisor {
    limits: RiskLimitsConfig,
    safe_allocation: SafeAllocation,
    offset: FixedOffset,
    session_open: NaiveTime,
    state: SupervisorState,
    /// Exchange-local date the current pause began
    paused_on: Option<NaiveDate>,
    consecutive_degraded: u32,
}

impl SafetySupervisor {
    pub fn new(limits: &RiskLimitsConfig, schedule: &ScheduleConfig, safe_allocation: SafeAllocation) -> Self {
        let offset = FixedOffset::east_opt(schedule.session_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        let session_open = NaiveTime::from_hms_opt(schedule.session_open_hour, schedule.session_open_minute, 0)
            .unwrap_or_default();
        Self {
            limits: limits.clone(),
            safe_allocation,
            offset,
            session_open,
            state: SupervisorState::Normal,
            paused_on: None,
            consecutive_degraded: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == SupervisorState::Paused
    }

    pub fn safe_allocation(&self) -> &SafeAllocation {
        &self.safe_allocation
    }

    /// Limits breached by `signals`. Pure; does not change state.
    ///
    /// A non-finite reading counts as a breach of its limit.
    pub fn evaluate(&self, signals: &RiskSignals) -> Vec<Breach> {
        let mut breaches = Vec::new();
        let limits = &self.limits;

        if let Some(pct) = signals.iv_percentile {
            if !pct.is_finite() || pct > limits.max_volatility_percentile {
                breaches.push(Breach {
                    kind: BreachKind::VolatilityRegime,
                    measured: pct,
                    limit: limits.max_volatility_percentile,
                });
            }
        }

        if let Some(gex) = signals.net_gamma_exposure {
            if !gex.is_finite() || gex.abs() > limits.max_abs_gamma_exposure {
                breaches.push(Breach {
                    kind: BreachKind::GammaExposure,
                    measured: gex,
                    limit: limits.max_abs_gamma_exposure,
                });
            }
        }

        if let Some(delta) = signals.normalized_delta {
            if !delta.is_finite() || delta.abs() > limits.max_abs_normalized_delta {
                breaches.push(Breach {
                    kind: BreachKind::NormalizedDelta,
                    measured: delta,
                    limit: limits.max_abs_normalized_delta,
                });
            }
        }

        let loss = -signals.daily_pnl_fraction;
        if loss > limits.max_daily_loss {
            breaches.push(Breach {
                kind: BreachKind::DailyLoss,
                measured: loss.to_f64().unwrap_or(f64::INFINITY),
                limit: limits.max_daily_loss.to_f64().unwrap_or(0.0),
            });
        }

        if signals.leverage > limits.max_leverage {
            breaches.push(Breach {
                kind: BreachKind::Leverage,
                measured: signals.leverage.to_f64().unwrap_or(f64::INFINITY),
                limit: limits.max_leverage.to_f64().unwrap_or(0.0),
            });
        }

        breaches
    }

    /// Authoritative check between projection and dispatch.
    pub fn review(&mut self, proposed: Allocation, signals: &RiskSignals) -> SupervisorDecision {
        let mut events = Vec::new();

        if let Some(event) = self.maybe_resume_for_session(signals.timestamp) {
            events.push(event);
        }

        if signals.degraded_fields.is_empty() {
            self.consecutive_degraded = 0;
        } else {
            self.consecutive_degraded += 1;
            debug!(
                consecutive = self.consecutive_degraded,
                fields = ?signals.degraded_fields,
                "Degraded tick"
            );
            if self.consecutive_degraded >= self.limits.max_consecutive_degraded_ticks
                && !self.is_paused()
            {
                self.pause(signals.timestamp);
                events.push(RiskEvent::new(
                    signals.timestamp,
                    RiskEventKind::DegradedInput {
                        consecutive: self.consecutive_degraded,
                        fields: signals.degraded_fields.clone(),
                    },
                    AlertSeverity::Error,
                    Some(self.state),
                    format!(
                        "{} consecutive degraded ticks, pausing",
                        self.consecutive_degraded
                    ),
                ));
            }
        }

        let breaches = self.evaluate(signals);
        if !breaches.is_empty() && !self.is_paused() {
            self.pause(signals.timestamp);
            let summary: Vec<String> = breaches
                .iter()
                .map(|b| format!("{:?} {:.4} > {:.4}", b.kind, b.measured, b.limit))
                .collect();
            events.push(RiskEvent::new(
                signals.timestamp,
                RiskEventKind::LimitBreach { breaches },
                AlertSeverity::Critical,
                Some(self.state),
                format!("Risk limits breached: {}", summary.join(", ")),
            ));
        }

        let directive = if self.is_paused() {
            Directive::Override(self.safe_allocation.clone())
        } else {
            Directive::Allocate(proposed)
        };

        SupervisorDecision {
            state: self.state,
            directive,
            events,
        }
    }

    /// A tick was skipped for missing data.
    pub fn record_data_gap(&mut self, at: DateTime<Utc>, reason: &str) -> Vec<RiskEvent> {
        let mut events = Vec::new();
        if let Some(event) = self.maybe_resume_for_session(at) {
            events.push(event);
        }
        self.consecutive_degraded += 1;

        let should_pause = self.limits.pause_on_data_gap
            || self.consecutive_degraded >= self.limits.max_consecutive_degraded_ticks;
        let newly_paused = should_pause && !self.is_paused();
        if newly_paused {
            self.pause(at);
        }

        events.push(RiskEvent::new(
            at,
            RiskEventKind::DataGap {
                reason: reason.to_string(),
            },
            if newly_paused {
                AlertSeverity::Error
            } else {
                AlertSeverity::Warning
            },
            Some(self.state),
            format!("Tick skipped: {reason}"),
        ));
        events
    }

    /// Explicit operator acknowledgment.
    pub fn acknowledge(&mut self, at: DateTime<Utc>) -> Option<RiskEvent> {
        if !self.is_paused() {
            return None;
        }
        self.resume();
        info!("Supervisor resumed by acknowledgment");
        Some(RiskEvent::new(
            at,
            RiskEventKind::Resumed {
                trigger: ResumeTrigger::Acknowledged,
            },
            AlertSeverity::Info,
            Some(self.state),
            "Pause acknowledged, policy dispatch re-enabled".to_string(),
        ))
    }

    fn maybe_resume_for_session(&mut self, at: DateTime<Utc>) -> Option<RiskEvent> {
        let paused_on = self.paused_on?;
        let local = at.with_timezone(&self.offset);
        if local.date_naive() <= paused_on || local.time() < self.session_open {
            return None;
        }

        self.resume();
        info!(date = %local.date_naive(), "Supervisor resumed at new session");
        Some(RiskEvent::new(
            at,
            RiskEventKind::Resumed {
                trigger: ResumeTrigger::NewSession,
            },
            AlertSeverity::Info,
            Some(self.state),
            format!("New session {}, pause cleared", local.date_naive()),
        ))
    }

    fn pause(&mut self, at: DateTime<Utc>) {
        warn!(at = %at, "Supervisor entering PAUSED");
        self.state = SupervisorState::Paused;
        self.paused_on = Some(at.with_timezone(&self.offset).date_naive());
    }

    fn resume(&mut self) {
        self.state = SupervisorState::Normal;
        self.paused_on = None;
        self.consecutive_degraded = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::GroupTable;
    use crate::config::GroupsConfig;
    use crate::market::fixtures::monday_midday;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn supervisor(limits: RiskLimitsConfig) -> SafetySupervisor {
        let groups = GroupsConfig::default();
        SafetySupervisor::new(
            &limits,
            &ScheduleConfig::default(),
            SafeAllocation::withdrawn(groups.groups.len()),
        )
    }

    fn proposal() -> Allocation {
        GroupTable::from_config(&GroupsConfig::default())
            .unwrap()
            .equal_weight()
    }

    fn calm(at: DateTime<Utc>) -> RiskSignals {
        RiskSignals {
            timestamp: at,
            iv_percentile: Some(0.4),
            net_gamma_exposure: Some(1.0e9),
            normalized_delta: Some(0.1),
            daily_pnl_fraction: dec!(0.001),
            leverage: dec!(1.5),
            degraded_fields: Vec::new(),
        }
    }

    #[test]
    fn test_calm_signals_pass_policy_allocation() {
        let mut sup = supervisor(RiskLimitsConfig::default());
        let decision = sup.review(proposal(), &calm(monday_midday()));
        assert_eq!(decision.state, SupervisorState::Normal);
        assert_eq!(decision.directive, Directive::Allocate(proposal()));
        assert!(decision.events.is_empty());
    }

    #[test]
    fn test_each_limit_detected() {
        let sup = supervisor(RiskLimitsConfig::default());
        let t = monday_midday();
        let cases: Vec<(BreachKind, Box<dyn Fn(&mut RiskSignals)>)> = vec![
            (BreachKind::VolatilityRegime, Box::new(|s| s.iv_percentile = Some(0.99))),
            (BreachKind::GammaExposure, Box::new(|s| s.net_gamma_exposure = Some(-3.0e10))),
            (BreachKind::NormalizedDelta, Box::new(|s| s.normalized_delta = Some(-0.7))),
            (BreachKind::DailyLoss, Box::new(|s| s.daily_pnl_fraction = dec!(-0.025))),
            (BreachKind::Leverage, Box::new(|s| s.leverage = dec!(3.5))),
        ];

        for (kind, mutate) in cases {
            let mut signals = calm(t);
            mutate(&mut signals);
            let breaches = sup.evaluate(&signals);
            assert_eq!(breaches.len(), 1);
            assert_eq!(breaches[0].kind, kind);
        }
    }

    #[test]
    fn test_non_finite_signals_breach() {
        let mut sup = supervisor(RiskLimitsConfig::default());
        let t = monday_midday();
        let cases: Vec<(BreachKind, Box<dyn Fn(&mut RiskSignals)>)> = vec![
            (BreachKind::VolatilityRegime, Box::new(|s| s.iv_percentile = Some(f64::NAN))),
            (BreachKind::GammaExposure, Box::new(|s| s.net_gamma_exposure = Some(f64::INFINITY))),
            (BreachKind::NormalizedDelta, Box::new(|s| s.normalized_delta = Some(f64::NAN))),
        ];

        for (kind, mutate) in cases {
            let mut signals = calm(t);
            mutate(&mut signals);
            let breaches = sup.evaluate(&signals);
            assert_eq!(breaches.len(), 1);
            assert_eq!(breaches[0].kind, kind);
        }

        let mut signals = calm(t);
        signals.normalized_delta = Some(f64::NAN);
        let decision = sup.review(proposal(), &signals);
        assert_eq!(decision.state, SupervisorState::Paused);
        assert!(decision.directive.is_override());
    }

    #[test]
    fn test_paused_overrides_until_acknowledged() {
        let mut sup = supervisor(RiskLimitsConfig::default());
        let t = monday_midday();

        let mut losing = calm(t);
        losing.daily_pnl_fraction = dec!(-0.03);
        let decision = sup.review(proposal(), &losing);
        assert_eq!(decision.state, SupervisorState::Paused);
        assert!(decision.directive.is_override());
        assert!(decision.directive.weights().iter().all(|w| *w == 0.0));
        assert!(matches!(decision.events[0].kind, RiskEventKind::LimitBreach { .. }));

        // Loss recovers; still paused for the rest of the session.
        for i in 1..=10 {
            let decision = sup.review(proposal(), &calm(t + Duration::minutes(5 * i)));
            assert_eq!(decision.directive, Directive::Override(SafeAllocation::withdrawn(9)));
            assert!(decision.events.is_empty());
        }

        let event = sup.acknowledge(t + Duration::hours(1)).unwrap();
        assert_eq!(
            event.kind,
            RiskEventKind::Resumed {
                trigger: ResumeTrigger::Acknowledged
            }
        );
        let decision = sup.review(proposal(), &calm(t + Duration::minutes(65)));
        assert_eq!(decision.directive, Directive::Allocate(proposal()));
        assert!(sup.acknowledge(t + Duration::hours(2)).is_none());
    }

    #[test]
    fn test_next_session_clears_pause() {
        let mut sup = supervisor(RiskLimitsConfig::default());
        let t = monday_midday();
        let mut levered = calm(t);
        levered.leverage = dec!(4);
        sup.review(proposal(), &levered);
        assert!(sup.is_paused());

        // Same local day, after the close: still paused.
        let evening = sup.review(proposal(), &calm(t + Duration::hours(5)));
        assert!(evening.directive.is_override());

        // Tuesday 09:20 IST = 03:50 UTC.
        let tuesday_open = t + Duration::hours(21) + Duration::minutes(35);
        let decision = sup.review(proposal(), &calm(tuesday_open));
        assert_eq!(decision.state, SupervisorState::Normal);
        assert!(matches!(
            decision.events[0].kind,
            RiskEventKind::Resumed {
                trigger: ResumeTrigger::NewSession
            }
        ));
    }

    #[test]
    fn test_consecutive_degraded_ticks_pause() {
        let mut sup = supervisor(RiskLimitsConfig::default());
        let t = monday_midday();
        let mut degraded = calm(t);
        degraded.degraded_fields = vec!["NearChain".to_string()];

        assert!(!sup.review(proposal(), &degraded).directive.is_override());
        assert!(!sup.review(proposal(), &calm(t)).directive.is_override());
        assert!(!sup.review(proposal(), &degraded).directive.is_override());
        assert!(!sup.review(proposal(), &degraded).directive.is_override());
        let third = sup.review(proposal(), &degraded);
        assert!(third.directive.is_override());
        assert!(matches!(
            third.events[0].kind,
            RiskEventKind::DegradedInput { consecutive: 3, .. }
        ));
    }

    #[test]
    fn test_data_gap_pauses_when_configured() {
        let mut sup = supervisor(RiskLimitsConfig::default());
        let events = sup.record_data_gap(monday_midday(), "timeout");
        assert!(sup.is_paused());
        assert_eq!(events[0].severity, AlertSeverity::Error);

        let mut lenient = supervisor(RiskLimitsConfig {
            pause_on_data_gap: false,
            ..RiskLimitsConfig::default()
        });
        lenient.record_data_gap(monday_midday(), "timeout");
        lenient.record_data_gap(monday_midday(), "timeout");
        assert!(!lenient.is_paused());
        lenient.record_data_gap(monday_midday(), "timeout");
        assert!(lenient.is_paused());
    }
}
