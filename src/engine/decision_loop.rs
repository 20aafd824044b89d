//! Fixed-cadence decision loop.
//!
//! Per tick: snapshot → features → actor → projector → supervisor → dispatch,
//! then the previous tick's pending decision is completed with the realized
//! reward and handed to the learner. Ticks never overlap and never wait on
//! the learner.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, Offset, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::dispatcher::{DispatchReport, StrategyDispatcher};
use crate::allocation::{Allocation, ConstraintProjector, GroupTable, SafeAllocation};
use crate::config::Config;
use crate::error::{AllocatorError, AllocatorResult};
use crate::market::{MarketSnapshot, SnapshotSource};
use crate::persistence::PersistenceManager;
use crate::policy::{ParameterStore, PolicySnapshot};
use crate::replay::Transition;
use crate::reward::RewardCalculator;
use crate::risk::{
    AlertSeverity, Directive, RiskEvent, RiskEventKind, RiskSignals, SafetySupervisor,
    SupervisorState,
};
use crate::state::{FeatureVector, StateBuilder};

/// Operator commands delivered between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Acknowledge a pause and re-enable policy dispatch
    Resume,
}

/// A dispatched policy decision waiting for its realized outcome.
#[derive(Debug, Clone)]
struct PendingDecision {
    state: Vec<f64>,
    action: Vec<f64>,
    session: NaiveDate,
    decided_at: DateTime<Utc>,
}

/// What a single tick did.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Dispatched {
        directive: Directive,
        state: SupervisorState,
        /// The policy path failed and a fallback allocation was used
        fallback: bool,
        degraded: bool,
        policy_version: u64,
        /// Reward credited to the previous decision, if one was pending
        reward: Option<f64>,
    },
    /// No directive was dispatched this tick
    Skipped { reason: String },
    /// The snapshot source has no more data
    Exhausted,
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopMetrics {
    pub ticks: u64,
    pub dispatched: u64,
    pub overrides: u64,
    pub skipped: u64,
    pub fallbacks: u64,
    pub transitions_sent: u64,
    pub transitions_dropped: u64,
}

pub struct DecisionLoop<S, D> {
    groups: GroupTable,
    builder: StateBuilder,
    projector: ConstraintProjector,
    supervisor: SafetySupervisor,
    reward: RewardCalculator,
    params: Arc<ParameterStore>,
    source: S,
    dispatcher: D,
    transitions: mpsc::Sender<Transition>,
    persistence: Option<Arc<PersistenceManager>>,
    offset: FixedOffset,
    tick_interval: Duration,
    snapshot_timeout: Duration,
    explore: bool,
    rng: ChaCha8Rng,
    pending: Option<PendingDecision>,
    last_valid: Option<Allocation>,
    last_snapshot_at: Option<DateTime<Utc>>,
    current_session: Option<NaiveDate>,
    metrics: LoopMetrics,
}

impl<S, D> DecisionLoop<S, D>
where
    S: SnapshotSource,
    D: StrategyDispatcher,
{
    pub fn new(
        config: &Config,
        groups: GroupTable,
        params: Arc<ParameterStore>,
        source: S,
        dispatcher: D,
        transitions: mpsc::Sender<Transition>,
    ) -> AllocatorResult<Self> {
        let safe = SafeAllocation::from_config(&config.risk.safe_allocation, &config.groups.groups)?;
        if safe.weights().len() != groups.len() {
            return Err(AllocatorError::ConstraintViolation(format!(
                "safe allocation has {} entries for {} groups",
                safe.weights().len(),
                groups.len()
            )));
        }

        let offset = FixedOffset::east_opt(config.schedule.session_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        let rng = match config.learning.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_add(1)),
            None => ChaCha8Rng::from_entropy(),
        };

        Ok(Self {
            builder: StateBuilder::new(&config.schedule),
            projector: ConstraintProjector::new(&groups),
            supervisor: SafetySupervisor::new(&config.risk, &config.schedule, safe),
            reward: RewardCalculator::new(&config.reward),
            groups,
            params,
            source,
            dispatcher,
            transitions,
            persistence: None,
            offset,
            tick_interval: Duration::from_secs(config.schedule.tick_interval_secs.max(1)),
            snapshot_timeout: Duration::from_secs(config.schedule.snapshot_timeout_secs.max(1)),
            explore: config.learning.explore_live,
            rng,
            pending: None,
            last_valid: None,
            last_snapshot_at: None,
            current_session: None,
            metrics: LoopMetrics::default(),
        })
    }

    /// Persist risk events alongside emitting them.
    pub fn with_persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn supervisor_state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    pub fn metrics(&self) -> &LoopMetrics {
        &self.metrics
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Tick until the source is exhausted or shutdown is signalled.
    ///
    /// Dropping the shutdown sender also stops the loop.
    pub async fn run(
        mut self,
        mut control: mpsc::Receiver<ControlCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> LoopMetrics {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "🚀 Decision loop started (tick every {}s, {} groups)",
            self.tick_interval.as_secs(),
            self.groups.len()
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("🛑 Decision loop shutting down");
                        break;
                    }
                }
                Some(command) = control.recv() => self.handle_command(command),
                _ = ticker.tick() => {
                    if let TickOutcome::Exhausted = self.tick().await {
                        info!("📭 Snapshot source exhausted after {} ticks", self.metrics.ticks);
                        break;
                    }
                }
            }
        }

        self.metrics
    }

    pub fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Resume => match self.supervisor.acknowledge(Utc::now()) {
                Some(event) => self.report_events(vec![event]),
                None => info!("Resume requested while not paused, ignoring"),
            },
        }
    }

    /// Run one decision tick to completion.
    pub async fn tick(&mut self) -> TickOutcome {
        let snapshot = match timeout(self.snapshot_timeout, self.source.next_snapshot()).await {
            Ok(Ok(Some(snapshot))) => snapshot,
            Ok(Ok(None)) => return TickOutcome::Exhausted,
            Ok(Err(e)) => return self.skip_tick(format!("snapshot error: {e:#}")),
            Err(_) => {
                let reason = AllocatorError::SnapshotUnavailable(format!(
                    "no snapshot within {}s",
                    self.snapshot_timeout.as_secs()
                ));
                return self.skip_tick(reason.to_string());
            }
        };
        self.metrics.ticks += 1;
        self.last_snapshot_at = Some(snapshot.timestamp);

        let features = self.builder.build(&snapshot);
        let policy = self.params.snapshot();

        let (proposed, raw_action, fallback_reason) = match self.infer(&policy, &features) {
            Ok((action, allocation)) => (allocation, Some(action), None),
            Err(e) => {
                let fallback = self
                    .last_valid
                    .clone()
                    .unwrap_or_else(|| self.groups.equal_weight());
                (fallback, None, Some(e.to_string()))
            }
        };

        let mut events = Vec::new();
        if let Some(reason) = &fallback_reason {
            self.metrics.fallbacks += 1;
            events.push(RiskEvent::new(
                snapshot.timestamp,
                RiskEventKind::InferenceFallback {
                    reason: reason.clone(),
                },
                AlertSeverity::Warning,
                Some(self.supervisor.state()),
                format!("Policy output unusable, dispatching fallback: {reason}"),
            ));
        }

        let signals = RiskSignals::from_tick(&features, &snapshot);
        let decision = self.supervisor.review(proposed, &signals);
        events.extend(decision.events);
        self.report_events(events);

        let report = match self.dispatcher.dispatch(&decision.directive, &snapshot).await {
            Ok(report) => report,
            Err(e) => {
                error!("❌ [DISPATCH] Failed: {:#}", e);
                self.metrics.skipped += 1;
                return TickOutcome::Skipped {
                    reason: format!("dispatch failed: {e:#}"),
                };
            }
        };
        self.metrics.dispatched += 1;
        if decision.directive.is_override() {
            self.metrics.overrides += 1;
        }

        let reward = self.complete_pending(&snapshot, &features, &report);

        self.pending = match (&decision.directive, raw_action) {
            (Directive::Allocate(allocation), Some(action)) => {
                self.last_valid = Some(allocation.clone());
                Some(PendingDecision {
                    state: features.values.clone(),
                    action,
                    session: self.session_of(snapshot.timestamp),
                    decided_at: snapshot.timestamp,
                })
            }
            _ => None,
        };

        debug!(
            state = ?decision.state,
            version = policy.version,
            degraded = features.is_degraded(),
            fallback = fallback_reason.is_some(),
            orders = report.orders_submitted,
            "Tick complete"
        );

        TickOutcome::Dispatched {
            directive: decision.directive,
            state: decision.state,
            fallback: fallback_reason.is_some(),
            degraded: features.is_degraded(),
            policy_version: policy.version,
            reward,
        }
    }

    fn infer(
        &mut self,
        policy: &PolicySnapshot,
        features: &FeatureVector,
    ) -> AllocatorResult<(Vec<f64>, Allocation)> {
        let action = policy
            .actor
            .act(&features.values, self.explore, &mut self.rng)?;
        let allocation = self.projector.project(&action)?;
        Ok((action, allocation))
    }

    /// Score the window since the previous tick and, if a policy decision was
    /// pending, hand the completed transition to the learner.
    fn complete_pending(
        &mut self,
        snapshot: &MarketSnapshot,
        features: &FeatureVector,
        report: &DispatchReport,
    ) -> Option<f64> {
        let session = self.session_of(snapshot.timestamp);
        if self.current_session != Some(session) {
            self.reward.reset_window();
            self.current_session = Some(session);
        }

        let (_, reward) = self.reward.observe(&snapshot.portfolio, report.realized_pnl);
        let pending = self.pending.take()?;

        if !reward.is_finite() {
            self.metrics.transitions_dropped += 1;
            warn!(decided_at = %pending.decided_at, "Non-finite reward, dropping transition");
            return None;
        }

        debug!(
            decided_at = %pending.decided_at,
            reward,
            "Completed pending decision"
        );
        let transition = Transition::new(
            pending.state,
            pending.action,
            reward,
            features.values.clone(),
            pending.session != session,
            snapshot.timestamp,
        )
        .with_groups_version(self.groups.version());

        match self.transitions.try_send(transition) {
            Ok(()) => self.metrics.transitions_sent += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.transitions_dropped += 1;
                warn!("Learner backlog full, dropping transition");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.transitions_dropped += 1;
                debug!("Learner channel closed, dropping transition");
            }
        }

        Some(reward)
    }

    fn skip_tick(&mut self, reason: String) -> TickOutcome {
        warn!("⏭️  [TICK] Skipped: {}", reason);
        self.metrics.skipped += 1;

        // Market clock estimate so replayed feeds keep their own calendar.
        let at = self
            .last_snapshot_at
            .map(|t| t + ChronoDuration::seconds(self.tick_interval.as_secs() as i64))
            .unwrap_or_else(Utc::now);
        self.last_snapshot_at = Some(at);

        let events = self.supervisor.record_data_gap(at, &reason);
        self.report_events(events);
        TickOutcome::Skipped { reason }
    }

    fn session_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    fn report_events(&self, events: Vec<RiskEvent>) {
        for event in events {
            event.emit();
            if let Some(persistence) = &self.persistence {
                if let Err(e) = persistence.record_risk_event(&event) {
                    warn!("Failed to persist risk event {}: {:#}", event.event_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::validate_weights;
    use crate::engine::dispatcher::PaperDispatcher;
    use crate::market::{fixtures, VecFeed};
    use crate::policy::SacTrainer;
    use crate::state::STATE_DIM;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    /// Dispatcher that records every directive it receives.
    #[derive(Clone, Default)]
    struct RecordingDispatcher {
        log: Arc<Mutex<Vec<Directive>>>,
    }

    #[async_trait]
    impl StrategyDispatcher for RecordingDispatcher {
        async fn dispatch(
            &mut self,
            directive: &Directive,
            snapshot: &MarketSnapshot,
        ) -> Result<DispatchReport> {
            self.log.lock().push(directive.clone());
            Ok(DispatchReport {
                orders_submitted: 0,
                realized_pnl: snapshot.portfolio.realized_pnl,
            })
        }
    }

    /// Never yields a snapshot.
    struct StallingFeed;

    #[async_trait]
    impl SnapshotSource for StallingFeed {
        async fn next_snapshot(&mut self) -> Result<Option<MarketSnapshot>> {
            std::future::pending().await
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.learning.hidden_sizes = vec![16, 16];
        config.learning.seed = Some(11);
        config
    }

    fn store_for(config: &Config, state_dim: usize) -> Arc<ParameterStore> {
        let trainer = SacTrainer::new(&config.learning, state_dim, config.groups.groups.len());
        Arc::new(ParameterStore::new(trainer.current_snapshot()))
    }

    fn build_loop<S: SnapshotSource>(
        config: &Config,
        params: Arc<ParameterStore>,
        source: S,
    ) -> (
        DecisionLoop<S, RecordingDispatcher>,
        RecordingDispatcher,
        mpsc::Receiver<Transition>,
    ) {
        let groups = GroupTable::from_config(&config.groups).unwrap();
        let dispatcher = RecordingDispatcher::default();
        let (tx, rx) = mpsc::channel(64);
        let decision_loop =
            DecisionLoop::new(config, groups, params, source, dispatcher.clone(), tx).unwrap();
        (decision_loop, dispatcher, rx)
    }

    fn at_minutes(minutes: i64) -> DateTime<Utc> {
        fixtures::monday_midday() + ChronoDuration::minutes(minutes)
    }

    #[tokio::test]
    async fn test_missing_open_interest_still_allocates() {
        let config = test_config();
        let mut snapshot = fixtures::complete_snapshot(at_minutes(0));
        snapshot.oi_changes = None;

        let (mut decision_loop, _, _rx) = build_loop(
            &config,
            store_for(&config, STATE_DIM),
            VecFeed::new(vec![Ok(snapshot)]),
        );

        match decision_loop.tick().await {
            TickOutcome::Dispatched {
                directive,
                degraded,
                fallback,
                ..
            } => {
                assert!(degraded);
                assert!(!fallback);
                let Directive::Allocate(allocation) = directive else {
                    panic!("expected policy allocation");
                };
                let groups = GroupTable::from_config(&config.groups).unwrap();
                assert!(validate_weights(allocation.weights(), &groups, true).is_ok());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(decision_loop.supervisor_state(), SupervisorState::Normal);
    }

    #[tokio::test]
    async fn test_daily_loss_pauses_until_resume() {
        let config = test_config();
        let calm = |m| fixtures::complete_snapshot(at_minutes(m));
        let mut losing = calm(5);
        losing.portfolio.daily_pnl_fraction = dec!(-0.03);

        let feed = VecFeed::new(vec![Ok(calm(0)), Ok(losing), Ok(calm(10)), Ok(calm(15))]);
        let (mut decision_loop, dispatcher, _rx) =
            build_loop(&config, store_for(&config, STATE_DIM), feed);

        decision_loop.tick().await;
        decision_loop.tick().await;
        assert_eq!(decision_loop.supervisor_state(), SupervisorState::Paused);

        // Loss recovered, still paused.
        decision_loop.tick().await;
        assert_eq!(decision_loop.supervisor_state(), SupervisorState::Paused);

        decision_loop.handle_command(ControlCommand::Resume);
        decision_loop.tick().await;

        let log = dispatcher.log.lock();
        assert_eq!(log.len(), 4);
        assert!(!log[0].is_override());
        assert!(log[1].is_override());
        assert!(log[2].is_override());
        assert!(log[1].weights().iter().all(|w| *w == 0.0));
        assert!(!log[3].is_override());
        assert_eq!(decision_loop.metrics().overrides, 2);
    }

    #[tokio::test]
    async fn test_pending_decision_pairs_with_next_tick() {
        let config = test_config();
        let first = fixtures::complete_snapshot(at_minutes(0));
        let second = fixtures::complete_snapshot(at_minutes(5));
        // Tuesday 09:30 local.
        let next_day = fixtures::complete_snapshot(Utc.with_ymd_and_hms(2024, 3, 5, 4, 0, 0).unwrap());

        let builder = StateBuilder::new(&config.schedule);
        let first_state = builder.build(&first).values;
        let second_state = builder.build(&second).values;

        let feed = VecFeed::new(vec![Ok(first), Ok(second), Ok(next_day)]);
        let (mut decision_loop, _, mut rx) =
            build_loop(&config, store_for(&config, STATE_DIM), feed);

        let TickOutcome::Dispatched { reward, .. } = decision_loop.tick().await else {
            panic!("first tick should dispatch");
        };
        assert!(reward.is_none());
        assert!(rx.try_recv().is_err());

        let TickOutcome::Dispatched { reward, .. } = decision_loop.tick().await else {
            panic!("second tick should dispatch");
        };
        let transition = rx.try_recv().unwrap();
        assert_eq!(transition.state, first_state);
        assert_eq!(transition.next_state, second_state);
        assert_eq!(transition.action.len(), 9);
        assert_eq!(transition.groups_version, config.groups.groups_version);
        assert_eq!(Some(transition.reward), reward);
        assert!(!transition.terminal);

        decision_loop.tick().await;
        let overnight = rx.try_recv().unwrap();
        assert!(overnight.terminal);
        assert_eq!(overnight.state, second_state);
        assert_eq!(decision_loop.metrics().transitions_sent, 2);
    }

    #[tokio::test]
    async fn test_non_finite_delta_pauses_and_is_not_learned() {
        let config = test_config();
        let mut corrupt = fixtures::complete_snapshot(at_minutes(5));
        corrupt.portfolio.normalized_delta = Some(f64::NAN);
        let feed = VecFeed::new(vec![Ok(fixtures::complete_snapshot(at_minutes(0))), Ok(corrupt)]);
        let (mut decision_loop, dispatcher, mut rx) =
            build_loop(&config, store_for(&config, STATE_DIM), feed);

        decision_loop.tick().await;
        let TickOutcome::Dispatched { state, reward, .. } = decision_loop.tick().await else {
            panic!("expected dispatch");
        };

        assert_eq!(state, SupervisorState::Paused);
        assert!(dispatcher.log.lock()[1].is_override());
        assert!(reward.is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(decision_loop.metrics().transitions_dropped, 1);
    }

    #[tokio::test]
    async fn test_data_gap_pauses_and_keeps_pending() {
        let config = test_config();
        let feed = VecFeed::new(vec![
            Ok(fixtures::complete_snapshot(at_minutes(0))),
            Err(anyhow::anyhow!("provider down")),
            Ok(fixtures::complete_snapshot(at_minutes(10))),
        ]);
        let (mut decision_loop, dispatcher, mut rx) =
            build_loop(&config, store_for(&config, STATE_DIM), feed);

        decision_loop.tick().await;
        let outcome = decision_loop.tick().await;
        assert!(matches!(outcome, TickOutcome::Skipped { .. }));
        assert_eq!(decision_loop.supervisor_state(), SupervisorState::Paused);

        let outcome = decision_loop.tick().await;
        assert!(matches!(
            outcome,
            TickOutcome::Dispatched {
                state: SupervisorState::Paused,
                ..
            }
        ));
        assert!(dispatcher.log.lock()[1].is_override());

        // The decision from before the gap is completed by the next good tick.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_timeout_skips_tick() {
        let config = test_config();
        let (mut decision_loop, dispatcher, _rx) =
            build_loop(&config, store_for(&config, STATE_DIM), StallingFeed);

        let outcome = decision_loop.tick().await;
        let TickOutcome::Skipped { reason } = outcome else {
            panic!("expected skipped tick");
        };
        assert!(reason.contains("snapshot unavailable"));
        assert!(dispatcher.log.lock().is_empty());
        assert_eq!(decision_loop.supervisor_state(), SupervisorState::Paused);
    }

    #[tokio::test]
    async fn test_inference_failure_falls_back_to_equal_weight() {
        let config = test_config();
        // Actor built for the wrong feature layout.
        let params = store_for(&config, STATE_DIM - 4);
        let feed = VecFeed::new(vec![
            Ok(fixtures::complete_snapshot(at_minutes(0))),
            Ok(fixtures::complete_snapshot(at_minutes(5))),
        ]);
        let (mut decision_loop, dispatcher, mut rx) = build_loop(&config, params, feed);

        let TickOutcome::Dispatched { fallback, .. } = decision_loop.tick().await else {
            panic!("fallback should still dispatch");
        };
        assert!(fallback);
        decision_loop.tick().await;

        let log = dispatcher.log.lock();
        for w in log[0].weights() {
            assert!((w - 1.0 / 9.0).abs() < 1e-9);
        }
        // Fallback ticks are excluded from training.
        assert!(rx.try_recv().is_err());
        assert_eq!(decision_loop.metrics().fallbacks, 2);
    }

    #[tokio::test]
    async fn test_policy_version_reported() {
        let config = test_config();
        let mut trainer = SacTrainer::new(&config.learning, STATE_DIM, 9);
        let params = Arc::new(ParameterStore::new(trainer.current_snapshot()));
        let published: PolicySnapshot = trainer.publish_snapshot();
        assert!(params.publish(published));

        let feed = VecFeed::new(vec![Ok(fixtures::complete_snapshot(at_minutes(0)))]);
        let (mut decision_loop, _, _rx) = build_loop(&config, params, feed);

        let TickOutcome::Dispatched { policy_version, .. } = decision_loop.tick().await else {
            panic!("expected dispatch");
        };
        assert_eq!(policy_version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_feed_exhausted() {
        let config = test_config();
        let groups = GroupTable::from_config(&config.groups).unwrap();
        let feed = VecFeed::new(
            (0..3)
                .map(|i| Ok(fixtures::complete_snapshot(at_minutes(i * 5))))
                .collect(),
        );
        let (tx, mut rx) = mpsc::channel(16);
        let decision_loop = DecisionLoop::new(
            &config,
            groups.clone(),
            store_for(&config, STATE_DIM),
            feed,
            PaperDispatcher::new(&groups),
            tx,
        )
        .unwrap();

        let (_control_tx, control_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = decision_loop.run(control_rx, shutdown_rx).await;

        assert_eq!(metrics.ticks, 3);
        assert_eq!(metrics.dispatched, 3);
        assert_eq!(metrics.transitions_sent, 2);
        assert!(rx.try_recv().is_ok());
    }
}
