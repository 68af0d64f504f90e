//! Condition evaluation.
//!
//! Pure and deterministic: the result depends only on the rule and the
//! snapshot (news windows are measured from `snapshot.fetched_at`).

use sentinel_core::{
    AlertRule, Comparison, ConditionMet, Direction, InvalidCondition, LookbackPeriod, Lookup,
    MarketSnapshot, Quote, RuleCondition, Sentiment, VolumeBaseline,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// Required market data is missing; retry next cycle.
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(#[from] InvalidCondition),
}

impl EvaluationError {
    pub fn is_data_unavailable(&self) -> bool {
        matches!(self, EvaluationError::DataUnavailable(_))
    }
}

/// Result of evaluating one rule against one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub triggered: bool,
    pub condition: ConditionMet,
}

impl Evaluation {
    fn new(triggered: bool, condition: ConditionMet) -> Self {
        Self {
            triggered,
            condition,
        }
    }
}

/// Evaluate `rule` against `snapshot`.
pub fn evaluate(rule: &AlertRule, snapshot: &MarketSnapshot) -> Result<Evaluation, EvaluationError> {
    rule.condition.validate()?;

    match &rule.condition {
        RuleCondition::PriceAbove { threshold } => {
            let q = quote(snapshot)?;
            Ok(Evaluation::new(
                q.price >= *threshold,
                ConditionMet::Price {
                    price: q.price,
                    threshold: *threshold,
                    comparison: Comparison::Above,
                },
            ))
        }
        RuleCondition::PriceBelow { threshold } => {
            let q = quote(snapshot)?;
            Ok(Evaluation::new(
                q.price <= *threshold,
                ConditionMet::Price {
                    price: q.price,
                    threshold: *threshold,
                    comparison: Comparison::Below,
                },
            ))
        }
        RuleCondition::PriceChangePct {
            percent,
            period,
            direction,
        } => evaluate_price_change(snapshot, *percent, *period, *direction),
        RuleCondition::VolumeAbove { threshold } => {
            let q = quote(snapshot)?;
            Ok(Evaluation::new(
                q.volume >= *threshold,
                ConditionMet::Volume {
                    volume: q.volume,
                    threshold: *threshold,
                    comparison: Comparison::Above,
                },
            ))
        }
        RuleCondition::VolumeBelow { threshold } => {
            let q = quote(snapshot)?;
            Ok(Evaluation::new(
                q.volume <= *threshold,
                ConditionMet::Volume {
                    volume: q.volume,
                    threshold: *threshold,
                    comparison: Comparison::Below,
                },
            ))
        }
        RuleCondition::VolumeSpike {
            multiplier,
            baseline,
        } => evaluate_volume_spike(snapshot, *multiplier, *baseline),
        RuleCondition::NewsKeyword {
            keywords,
            sentiment,
            window_hours,
        } => evaluate_news(snapshot, keywords, *sentiment, *window_hours),
    }
}

fn quote(snapshot: &MarketSnapshot) -> Result<&Quote, EvaluationError> {
    match &snapshot.quote {
        Lookup::Available(q) if q.price.is_finite() && q.price > 0.0 => Ok(q),
        Lookup::Available(q) => Err(EvaluationError::DataUnavailable(format!(
            "{}: unusable price {}",
            snapshot.symbol, q.price
        ))),
        Lookup::Unavailable(reason) => Err(EvaluationError::DataUnavailable(format!(
            "{}: quote unavailable: {}",
            snapshot.symbol, reason
        ))),
    }
}

fn evaluate_price_change(
    snapshot: &MarketSnapshot,
    percent: f64,
    period: LookbackPeriod,
    direction: Direction,
) -> Result<Evaluation, EvaluationError> {
    let current = quote(snapshot)?.price;
    let reference = match snapshot.reference_prices.get(&period) {
        Some(Lookup::Available(p)) if p.is_finite() && *p > 0.0 => *p,
        Some(Lookup::Available(p)) => {
            return Err(EvaluationError::DataUnavailable(format!(
                "{}: unusable {} reference price {}",
                snapshot.symbol,
                period.as_str(),
                p
            )))
        }
        Some(Lookup::Unavailable(reason)) => {
            return Err(EvaluationError::DataUnavailable(format!(
                "{}: {} reference price unavailable: {}",
                snapshot.symbol,
                period.as_str(),
                reason
            )))
        }
        None => {
            return Err(EvaluationError::DataUnavailable(format!(
                "{}: {} reference price not fetched",
                snapshot.symbol,
                period.as_str()
            )))
        }
    };

    let change_pct = (current - reference) / reference * 100.0;
    let triggered = match direction {
        Direction::Up => change_pct >= percent,
        Direction::Down => change_pct <= -percent,
        Direction::Either => change_pct.abs() >= percent,
    };

    Ok(Evaluation::new(
        triggered,
        ConditionMet::PriceChange {
            current,
            reference,
            change_pct,
            percent,
            period: period.as_str().to_string(),
            direction: direction.as_str().to_string(),
        },
    ))
}

fn evaluate_volume_spike(
    snapshot: &MarketSnapshot,
    multiplier: f64,
    baseline: VolumeBaseline,
) -> Result<Evaluation, EvaluationError> {
    let q = quote(snapshot)?;

    // The quote carries the 30-day average; anything else is fetched separately.
    let from_quote = match baseline {
        VolumeBaseline::Avg30d => q.avg_volume,
        VolumeBaseline::Avg90d => None,
    };
    let average = match (from_quote, snapshot.volume_baselines.get(&baseline)) {
        (Some(v), _) => v,
        (None, Some(Lookup::Available(v))) => *v,
        (None, Some(Lookup::Unavailable(reason))) => {
            return Err(EvaluationError::DataUnavailable(format!(
                "{}: {} baseline unavailable: {}",
                snapshot.symbol,
                baseline.as_str(),
                reason
            )))
        }
        (None, None) => {
            return Err(EvaluationError::DataUnavailable(format!(
                "{}: {} baseline not fetched",
                snapshot.symbol,
                baseline.as_str()
            )))
        }
    };
    if !average.is_finite() || average <= 0.0 {
        return Err(EvaluationError::DataUnavailable(format!(
            "{}: unusable {} baseline {}",
            snapshot.symbol,
            baseline.as_str(),
            average
        )));
    }

    let ratio = q.volume / average;
    Ok(Evaluation::new(
        ratio >= multiplier,
        ConditionMet::VolumeSpike {
            volume: q.volume,
            baseline: average,
            ratio,
            multiplier,
        },
    ))
}

fn evaluate_news(
    snapshot: &MarketSnapshot,
    keywords: &[String],
    sentiment: Option<Sentiment>,
    window_hours: u32,
) -> Result<Evaluation, EvaluationError> {
    let articles = match snapshot.recent_news(window_hours) {
        Some(Ok(articles)) => articles,
        Some(Err(reason)) => {
            return Err(EvaluationError::DataUnavailable(format!(
                "{}: news unavailable: {}",
                snapshot.symbol, reason
            )))
        }
        None => {
            return Err(EvaluationError::DataUnavailable(format!(
                "{}: news not fetched",
                snapshot.symbol
            )))
        }
    };

    let needles: Vec<String> = keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();

    for article in &articles {
        if let Some(wanted) = sentiment {
            if article.sentiment != Some(wanted) {
                continue;
            }
        }
        let headline = article.headline.to_lowercase();
        let summary = article.summary.to_lowercase();
        if let Some(hit) = needles
            .iter()
            .find(|k| headline.contains(k.as_str()) || summary.contains(k.as_str()))
        {
            return Ok(Evaluation::new(
                true,
                ConditionMet::News {
                    keyword: Some(hit.clone()),
                    headline: Some(article.headline.clone()),
                    sentiment: article.sentiment,
                    published_at: Some(article.published_at),
                    articles_scanned: articles.len(),
                },
            ));
        }
    }

    Ok(Evaluation::new(
        false,
        ConditionMet::News {
            keyword: None,
            headline: None,
            sentiment: None,
            published_at: None,
            articles_scanned: articles.len(),
        },
    ))
}
