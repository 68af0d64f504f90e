//! Cycle runner.
//!
//! One cycle: load active rules, drop ineligible ones, fetch one snapshot per
//! distinct symbol, evaluate, rate-limit and commit triggers, then dispatch.

use crate::config::EngineConfig;
use crate::cooldown::CooldownPolicy;
use crate::db::{Database, DbError};
use crate::dispatcher::Dispatcher;
use crate::evaluator::{evaluate, EvaluationError};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::report::{CycleReport, RateLimitedTrigger, SkipReason};
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use futures_util::stream::{self, StreamExt};
use sentinel_core::{
    AlertRule, LookbackPeriod, Lookup, MarketSnapshot, TriggerEvent, UserProfile, VolumeBaseline,
};
use sentinel_feeds::{FeedError, FeedResult, MarketDataProvider};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Conditions that abort a whole cycle. Nothing is committed when they occur.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("A cycle is already running")]
    CycleInProgress,
    #[error("Rule store unavailable: {0}")]
    Store(#[from] DbError),
    #[error("Market data provider unreachable: {0}")]
    ProviderUnreachable(String),
}

/// Extra data a symbol's rules need beyond the quote.
#[derive(Debug, Default)]
struct SymbolNeeds {
    periods: HashSet<LookbackPeriod>,
    baselines: HashSet<VolumeBaseline>,
    news_window_hours: Option<u32>,
}

impl SymbolNeeds {
    fn from_rules(rules: &[AlertRule]) -> Self {
        let mut needs = Self::default();
        for rule in rules {
            if let Some(period) = rule.condition.lookback() {
                needs.periods.insert(period);
            }
            if let Some(baseline) = rule.condition.volume_baseline() {
                needs.baselines.insert(baseline);
            }
            if let Some(hours) = rule.condition.news_window_hours() {
                needs.news_window_hours = Some(needs.news_window_hours.map_or(hours, |h| h.max(hours)));
            }
        }
        needs
    }
}

fn lookup<T>(result: FeedResult<T>) -> Lookup<T> {
    match result {
        Ok(value) => Lookup::Available(value),
        Err(e) => Lookup::Unavailable(e.to_string()),
    }
}

/// Runs evaluation cycles.
pub struct CycleRunner {
    db: Database,
    provider: Arc<dyn MarketDataProvider>,
    dispatcher: Arc<Dispatcher>,
    rate_limiter: RateLimiter,
    cooldown: CooldownPolicy,
    config: EngineConfig,
    run_guard: Mutex<()>,
}

impl CycleRunner {
    pub fn new(
        db: Database,
        provider: Arc<dyn MarketDataProvider>,
        dispatcher: Arc<Dispatcher>,
        rate_limiter: RateLimiter,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            provider,
            dispatcher,
            rate_limiter,
            cooldown: CooldownPolicy::new(config.always_min_interval),
            config,
            run_guard: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one cycle at the current time.
    pub async fn run_cycle(&self) -> Result<CycleReport, EngineError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle treating `now` as the evaluation instant.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport, EngineError> {
        let _guard = self
            .run_guard
            .try_lock()
            .map_err(|_| EngineError::CycleInProgress)?;

        let started = Instant::now();
        let deadline = started + self.config.max_cycle_duration;
        let mut report = CycleReport::new(now);

        // 1. Load
        let loaded = self.db.list_active_rules().await?;
        report.rules_considered = loaded.rules.len() + loaded.malformed.len();
        for malformed in &loaded.malformed {
            warn!(
                rule_id = malformed.rule_id,
                reason = %malformed.reason,
                "Skipping malformed rule"
            );
            report.skip(
                malformed.rule_id,
                "",
                SkipReason::EvaluationError(malformed.reason.clone()),
            );
        }

        // 2. Cooldown, before any fetch
        let mut groups: BTreeMap<CompactString, Vec<AlertRule>> = BTreeMap::new();
        for rule in loaded.rules {
            if self.cooldown.is_eligible(&rule, now) {
                groups.entry(rule.symbol.clone()).or_default().push(rule);
            } else {
                report.ineligible += 1;
            }
        }

        // 3. One fetch per distinct symbol
        let (snapshots, unreachable) = self.fetch_snapshots(&groups, now, deadline).await;
        report.symbols_fetched = snapshots.len();

        if !groups.is_empty() && snapshots.is_empty() && unreachable.len() == groups.len() {
            let detail = unreachable
                .values()
                .next()
                .map(|e| e.to_string())
                .unwrap_or_default();
            error!(symbols = groups.len(), error = %detail, "Market data provider unreachable, aborting cycle");
            return Err(EngineError::ProviderUnreachable(detail));
        }

        // 4-5. Evaluate and commit
        let mut profiles: HashMap<String, UserProfile> = HashMap::new();
        let mut to_dispatch: Vec<(TriggerEvent, UserProfile)> = Vec::new();

        for (symbol, rules) in &groups {
            let snapshot = match (snapshots.get(symbol), unreachable.get(symbol)) {
                (Some(snapshot), _) => snapshot,
                (None, Some(e)) => {
                    for rule in rules {
                        report.skip(rule.id, symbol, SkipReason::DataUnavailable(e.to_string()));
                    }
                    continue;
                }
                (None, None) => {
                    report.deferred.extend(rules.iter().map(|r| r.id));
                    continue;
                }
            };

            for rule in rules {
                if Instant::now() >= deadline {
                    report.deferred.push(rule.id);
                    continue;
                }

                let evaluation = match evaluate(rule, snapshot) {
                    Ok(evaluation) => evaluation,
                    Err(EvaluationError::DataUnavailable(reason)) => {
                        debug!(rule_id = rule.id, symbol = %symbol, reason = %reason, "Data unavailable");
                        report.skip(rule.id, symbol, SkipReason::DataUnavailable(reason));
                        continue;
                    }
                    Err(e) => {
                        warn!(rule_id = rule.id, symbol = %symbol, error = %e, "Evaluation error");
                        report.skip(rule.id, symbol, SkipReason::EvaluationError(e.to_string()));
                        continue;
                    }
                };

                if !evaluation.triggered {
                    report.not_triggered += 1;
                    continue;
                }

                let event = TriggerEvent::new(rule, evaluation.condition, snapshot.summary(), now);
                if let Some(committed) = self
                    .commit_trigger(rule, event, &mut profiles, &mut report)
                    .await
                {
                    to_dispatch.push(committed);
                }
            }
        }

        // Dispatch committed triggers
        let deliveries: Vec<_> = stream::iter(to_dispatch)
            .map(|(event, profile)| {
                let dispatcher = Arc::clone(&self.dispatcher);
                async move { dispatcher.dispatch(&event, &profile).await }
            })
            .buffer_unordered(self.config.max_concurrent_dispatches.max(1))
            .collect()
            .await;
        report.deliveries = deliveries.into_iter().flatten().collect();

        if !report.deferred.is_empty() {
            warn!(
                deferred = report.deferred.len(),
                "Cycle deadline reached, rules deferred to next cycle"
            );
        }
        report.duration = started.elapsed();
        report.log_summary();
        Ok(report)
    }

    /// Rate-limit and persist a trigger. Returns it with its profile when committed.
    async fn commit_trigger(
        &self,
        rule: &AlertRule,
        event: TriggerEvent,
        profiles: &mut HashMap<String, UserProfile>,
        report: &mut CycleReport,
    ) -> Option<(TriggerEvent, UserProfile)> {
        let symbol = rule.symbol.as_str();

        let profile = match profiles.get(&rule.user_id) {
            Some(profile) => profile.clone(),
            None => match self.db.user_profile(&rule.user_id).await {
                Ok(profile) => {
                    profiles.insert(rule.user_id.clone(), profile.clone());
                    profile
                }
                Err(e) => {
                    error!(rule_id = rule.id, error = %e, "Failed to load user profile");
                    report.skip(rule.id, symbol, SkipReason::Store(e.to_string()));
                    return None;
                }
            },
        };

        match self.rate_limiter.consume_for(&profile, event.triggered_at).await {
            Ok(RateDecision::Allowed { .. }) => {}
            Ok(RateDecision::Limited { ceiling }) => {
                info!(
                    rule_id = rule.id,
                    user_id = %rule.user_id,
                    ceiling = ceiling,
                    "Trigger suppressed by daily limit"
                );
                if let Err(e) = self.db.record_suppressed(&event, ceiling).await {
                    error!(rule_id = rule.id, error = %e, "Failed to record suppressed trigger");
                }
                report.rate_limited.push(RateLimitedTrigger {
                    rule_id: rule.id,
                    user_id: rule.user_id.clone(),
                    ceiling,
                });
                return None;
            }
            Err(e) => {
                error!(rule_id = rule.id, error = %e, "Rate limiter unavailable");
                report.skip(rule.id, symbol, SkipReason::Store(e.to_string()));
                return None;
            }
        }

        match self.db.record_trigger(&event, rule.last_triggered_at).await {
            Ok(Some(stored)) => {
                info!(
                    rule_id = rule.id,
                    trigger_id = stored.id,
                    symbol = %symbol,
                    kind = %stored.kind,
                    "Rule triggered"
                );
                report.triggered.push(stored.clone());
                Some((stored, profile))
            }
            Ok(None) => {
                warn!(rule_id = rule.id, "Rule changed since load, not firing");
                self.release_unit(&profile, &event).await;
                report.skip(rule.id, symbol, SkipReason::AlreadyFired);
                None
            }
            Err(e) => {
                error!(rule_id = rule.id, error = %e, "Failed to commit trigger");
                self.release_unit(&profile, &event).await;
                report.skip(rule.id, symbol, SkipReason::Store(e.to_string()));
                None
            }
        }
    }

    /// Hand back the rate unit of a trigger that was not committed.
    async fn release_unit(&self, profile: &UserProfile, event: &TriggerEvent) {
        if let Err(e) = self.rate_limiter.release_for(profile, event.triggered_at).await {
            warn!(
                rule_id = event.rule_id,
                user_id = %profile.user_id,
                error = %e,
                "Failed to release rate-limit unit"
            );
        }
    }

    /// Fetch snapshots with bounded parallelism until done or `deadline`.
    ///
    /// Returns fetched snapshots and the symbols whose provider was unreachable.
    /// Symbols in neither map were not fetched in time.
    async fn fetch_snapshots(
        &self,
        groups: &BTreeMap<CompactString, Vec<AlertRule>>,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> (
        HashMap<CompactString, MarketSnapshot>,
        HashMap<CompactString, FeedError>,
    ) {
        let mut snapshots = HashMap::new();
        let mut unreachable = HashMap::new();

        let mut fetches = stream::iter(groups.iter())
            .map(|(symbol, rules)| {
                let needs = SymbolNeeds::from_rules(rules);
                async move { (symbol.clone(), self.fetch_snapshot(symbol, &needs, now).await) }
            })
            .buffer_unordered(self.config.max_concurrent_fetches.max(1));

        loop {
            match tokio::time::timeout_at(deadline, fetches.next()).await {
                Ok(Some((symbol, Ok(snapshot)))) => {
                    snapshots.insert(symbol, snapshot);
                }
                Ok(Some((symbol, Err(e)))) => {
                    warn!(symbol = %symbol, error = %e, "Market data unreachable");
                    unreachable.insert(symbol, e);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        fetched = snapshots.len(),
                        total = groups.len(),
                        "Cycle deadline reached while fetching market data"
                    );
                    break;
                }
            }
        }

        (snapshots, unreachable)
    }

    /// Everything the symbol's rules need. Fails only when the provider is unreachable.
    async fn fetch_snapshot(
        &self,
        symbol: &str,
        needs: &SymbolNeeds,
        now: DateTime<Utc>,
    ) -> FeedResult<MarketSnapshot> {
        let quote = match self.provider.get_quote(symbol).await {
            Ok(quote) => Lookup::Available(quote),
            Err(e) if e.is_unreachable() => return Err(e),
            Err(e) => Lookup::Unavailable(e.to_string()),
        };
        let quote_avg_volume = quote.available().and_then(|q| q.avg_volume);
        let mut snapshot = MarketSnapshot::new(symbol, now, quote);

        for period in &needs.periods {
            let price = self.provider.get_historical_price(symbol, *period).await;
            snapshot = snapshot.with_reference_price(*period, lookup(price));
        }

        for baseline in &needs.baselines {
            if *baseline == VolumeBaseline::Avg30d && quote_avg_volume.is_some() {
                continue;
            }
            let volume = self.provider.get_average_volume(symbol, baseline.days()).await;
            snapshot = snapshot.with_volume_baseline(*baseline, lookup(volume));
        }

        if let Some(hours) = needs.news_window_hours {
            let news = self.provider.get_recent_news(symbol, hours).await;
            snapshot = snapshot.with_news(lookup(news));
        }

        Ok(snapshot)
    }

    /// Prune history past the retention window.
    pub async fn cleanup(&self) -> Result<u64, EngineError> {
        let deleted = self
            .db
            .cleanup_old_history(self.config.history_retention_days)
            .await?;
        if deleted > 0 {
            info!(deleted = deleted, "Cleaned up old trigger history");
        }
        Ok(deleted)
    }
}
