//! Pre-entry filters. A failing filter turns the whole tick into WAIT.

use crate::domain::strategy::{Filter, TradingDay, TradingSession};
use crate::domain::types::{Bar, SymbolInfo};
use crate::indicators;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use std::time::Duration;

/// External economic-calendar collaborator. Absent collaborator = pass.
#[async_trait]
pub trait NewsCalendar: Send + Sync {
    async fn high_impact_within(&self, symbol: &str, window: Duration) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterVerdict {
    pub passed: bool,
    pub reason: String,
}

impl FilterVerdict {
    fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

pub struct FilterContext<'a> {
    pub now: DateTime<Utc>,
    pub symbol: &'a str,
    pub symbol_info: Option<&'a SymbolInfo>,
    pub bars: &'a [Bar],
    pub news: Option<&'a dyn NewsCalendar>,
}

/// Session windows by UTC hour: ASIAN [0,9), LONDON [8,17), NEWYORK [17,24).
/// Overlaps resolve in that order, so hour 8 is ASIAN.
pub fn current_session(now: DateTime<Utc>) -> TradingSession {
    let hour = now.hour();
    if hour < 9 {
        TradingSession::Asian
    } else if hour < 17 {
        TradingSession::London
    } else {
        TradingSession::NewYork
    }
}

fn weekday_to_trading_day(weekday: Weekday) -> TradingDay {
    match weekday {
        Weekday::Mon => TradingDay::Mon,
        Weekday::Tue => TradingDay::Tue,
        Weekday::Wed => TradingDay::Wed,
        Weekday::Thu => TradingDay::Thu,
        Weekday::Fri => TradingDay::Fri,
        Weekday::Sat => TradingDay::Sat,
        Weekday::Sun => TradingDay::Sun,
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

const DEFAULT_NEWS_WINDOW_MINUTES: u32 = 30;

pub async fn evaluate_filter(filter: &Filter, ctx: &FilterContext<'_>) -> FilterVerdict {
    match filter {
        Filter::Time { start, end } => {
            let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
                return FilterVerdict::fail("time filter has invalid HH:MM bounds");
            };
            let now = ctx.now.time();
            let inside = if start <= end {
                now >= start && now <= end
            } else {
                // Overnight window, e.g. 22:00-06:00.
                now >= start || now <= end
            };
            if inside {
                FilterVerdict::pass("inside trading window")
            } else {
                FilterVerdict::fail(format!(
                    "outside trading window {}-{}",
                    start.format("%H:%M"),
                    end.format("%H:%M")
                ))
            }
        }
        Filter::Session { allowed } => {
            let session = current_session(ctx.now);
            if allowed.contains(&session) {
                FilterVerdict::pass(format!("session {:?} allowed", session))
            } else {
                FilterVerdict::fail(format!("session {:?} not allowed", session))
            }
        }
        Filter::Spread { max_pips } => match ctx.symbol_info {
            Some(info) => {
                let spread = info.spread_pips();
                if spread <= *max_pips {
                    FilterVerdict::pass(format!("spread {:.1} pips ok", spread))
                } else {
                    FilterVerdict::fail(format!(
                        "spread {:.1} pips exceeds {:.1}",
                        spread, max_pips
                    ))
                }
            }
            None => FilterVerdict::pass("no quote, spread filter skipped"),
        },
        Filter::Volatility { min, max } => {
            let atr_series = indicators::atr(ctx.bars, 14);
            match indicators::latest(&atr_series, 0) {
                Some(atr) => {
                    if let Some(min) = min {
                        if atr < *min {
                            return FilterVerdict::fail(format!(
                                "ATR {:.5} below volatility floor {:.5}",
                                atr, min
                            ));
                        }
                    }
                    if let Some(max) = max {
                        if atr > *max {
                            return FilterVerdict::fail(format!(
                                "ATR {:.5} above volatility ceiling {:.5}",
                                atr, max
                            ));
                        }
                    }
                    FilterVerdict::pass(format!("ATR {:.5} within bounds", atr))
                }
                // Missing data passes.
                None => FilterVerdict::pass("no ATR yet, volatility filter skipped"),
            }
        }
        Filter::DayOfWeek { allowed } => {
            let today = weekday_to_trading_day(ctx.now.weekday());
            if allowed.contains(&today) {
                FilterVerdict::pass(format!("{:?} allowed", today))
            } else {
                FilterVerdict::fail(format!("{:?} not a trading day", today))
            }
        }
        Filter::News { window_minutes } => match ctx.news {
            Some(calendar) => {
                let window = Duration::from_secs(
                    u64::from(window_minutes.unwrap_or(DEFAULT_NEWS_WINDOW_MINUTES)) * 60,
                );
                match calendar.high_impact_within(ctx.symbol, window).await {
                    Ok(true) => FilterVerdict::fail("high-impact news within window"),
                    Ok(false) => FilterVerdict::pass("no high-impact news"),
                    // Calendar errors do not block trading.
                    Err(_) => FilterVerdict::pass("news calendar unavailable"),
                }
            }
            None => FilterVerdict::pass("no news calendar configured"),
        },
    }
}

/// Run every filter, stopping at the first failure.
pub async fn evaluate_filters(
    filters: &[Filter],
    ctx: &FilterContext<'_>,
) -> (bool, Vec<FilterVerdict>) {
    let mut verdicts = Vec::with_capacity(filters.len());
    for filter in filters {
        let verdict = evaluate_filter(filter, ctx).await;
        let failed = !verdict.passed;
        verdicts.push(verdict);
        if failed {
            return (false, verdicts);
        }
    }
    (true, verdicts)
}
