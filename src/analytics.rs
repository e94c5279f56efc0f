use crate::models::{
    ChartSeries, DailyBucket, PeriodSummary, SeriesProjection, TimeWindow, TokenSeriesKind,
    UsageLevel, UsageLogEntry,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub fn filter_window<'a>(
    entries: &'a [UsageLogEntry],
    window: TimeWindow,
    now: DateTime<Utc>,
) -> Vec<&'a UsageLogEntry> {
    match window.cutoff(now) {
        None => entries.iter().collect(),
        Some(cutoff) => entries.iter().filter(|e| e.created_at >= cutoff).collect(),
    }
}

pub fn day_key(entry: &UsageLogEntry) -> NaiveDate {
    entry.created_at.date_naive()
}

pub fn group_by_day<'a, I>(entries: I) -> BTreeMap<NaiveDate, DailyBucket>
where
    I: IntoIterator<Item = &'a UsageLogEntry>,
{
    let mut days: BTreeMap<NaiveDate, DailyBucket> = BTreeMap::new();
    for entry in entries {
        let date = day_key(entry);
        let bucket = days
            .entry(date)
            .or_insert_with(|| DailyBucket::empty(date));
        bucket.request_count = bucket.request_count.saturating_add(1);
        bucket.input_tokens = bucket.input_tokens.saturating_add(entry.input_tokens);
        bucket.output_tokens = bucket.output_tokens.saturating_add(entry.output_tokens);
        bucket.total_tokens = bucket.total_tokens.saturating_add(entry.total_tokens);
    }
    days
}

// Ascending by date; days without entries are not emitted.
pub fn sorted_buckets<'a, I>(entries: I) -> Vec<DailyBucket>
where
    I: IntoIterator<Item = &'a UsageLogEntry>,
{
    group_by_day(entries).into_values().collect()
}

pub fn summarize<'a, I>(entries: I) -> PeriodSummary
where
    I: IntoIterator<Item = &'a UsageLogEntry>,
{
    entries
        .into_iter()
        .fold(PeriodSummary::default(), |acc, e| PeriodSummary {
            request_count: acc.request_count.saturating_add(1),
            input_tokens: acc.input_tokens.saturating_add(e.input_tokens),
            output_tokens: acc.output_tokens.saturating_add(e.output_tokens),
            total_tokens: acc.total_tokens.saturating_add(e.total_tokens),
        })
}

pub fn project(buckets: &[DailyBucket], kind: TokenSeriesKind) -> SeriesProjection {
    if buckets.len() <= 1 {
        return SeriesProjection::InsufficientData {
            points: buckets.len(),
        };
    }

    let (labels, values) = buckets
        .iter()
        .map(|b| (b.date.format("%Y-%m-%d").to_string(), kind.value_of(b)))
        .unzip();
    SeriesProjection::Series(ChartSeries { labels, values })
}

pub fn classify(request_count: u64) -> UsageLevel {
    match request_count {
        0 => UsageLevel::NoUsage,
        1..=4 => UsageLevel::Low,
        5..=19 => UsageLevel::Moderate,
        20..=49 => UsageLevel::High,
        _ => UsageLevel::Intensive,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub window: TimeWindow,
    pub series_kind: TokenSeriesKind,
    pub summary: PeriodSummary,
    pub level: UsageLevel,
    pub buckets: Vec<DailyBucket>,
    pub chart: SeriesProjection,
}

pub fn build_report(
    entries: &[UsageLogEntry],
    window: TimeWindow,
    kind: TokenSeriesKind,
    now: DateTime<Utc>,
) -> UsageReport {
    let filtered = filter_window(entries, window, now);
    let buckets = sorted_buckets(filtered.iter().copied());
    let summary = summarize(filtered.iter().copied());
    UsageReport {
        window,
        series_kind: kind,
        level: classify(summary.request_count),
        chart: project(&buckets, kind),
        summary,
        buckets,
    }
}

impl UsageReport {
    pub fn with_series(mut self, kind: TokenSeriesKind) -> Self {
        self.series_kind = kind;
        self.chart = project(&self.buckets, kind);
        self
    }
}
