use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLogEntry {
    #[serde(deserialize_with = "opaque_id")]
    pub id: String,
    #[serde(default, deserialize_with = "opaque_id")]
    pub user_id: String,
    #[serde(default, deserialize_with = "token_count")]
    pub input_tokens: u64,
    #[serde(default, deserialize_with = "token_count")]
    pub output_tokens: u64,
    #[serde(default, deserialize_with = "token_count")]
    pub total_tokens: u64,
    pub created_at: DateTime<Utc>,
}

fn opaque_id<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
        Null(()),
    }

    Ok(match RawId::deserialize(de)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
        RawId::Null(()) => String::new(),
    })
}

// Null counts show up for rows written before the total column existed.
fn token_count<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(de)?.unwrap_or(0))
}

// Days are UTC calendar days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub date: NaiveDate,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl DailyBucket {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            request_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodSummary {
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageResponse {
    #[serde(default)]
    pub logs: Vec<UsageLogEntry>,
    #[serde(rename = "totalMetrics", default)]
    pub total_metrics: Option<PeriodSummary>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogUsageRequest {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub logs: Vec<UsageLogEntry>,
    pub server_totals: Option<PeriodSummary>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
    #[serde(rename = "90d")]
    NinetyDays,
    All,
}

impl TimeWindow {
    pub const ALL: [TimeWindow; 4] = [
        TimeWindow::SevenDays,
        TimeWindow::ThirtyDays,
        TimeWindow::NinetyDays,
        TimeWindow::All,
    ];

    pub fn as_label(self) -> &'static str {
        match self {
            TimeWindow::SevenDays => "7d",
            TimeWindow::ThirtyDays => "30d",
            TimeWindow::NinetyDays => "90d",
            TimeWindow::All => "all",
        }
    }

    pub fn from_label(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|w| w.as_label().eq_ignore_ascii_case(input.trim()))
    }

    pub fn as_days(self) -> Option<i64> {
        match self {
            TimeWindow::SevenDays => Some(7),
            TimeWindow::ThirtyDays => Some(30),
            TimeWindow::NinetyDays => Some(90),
            TimeWindow::All => None,
        }
    }

    pub fn cutoff(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.as_days().map(|days| now - Duration::days(days))
    }

    pub fn next(self) -> Self {
        match self {
            TimeWindow::SevenDays => TimeWindow::ThirtyDays,
            TimeWindow::ThirtyDays => TimeWindow::NinetyDays,
            TimeWindow::NinetyDays => TimeWindow::All,
            TimeWindow::All => TimeWindow::SevenDays,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenSeriesKind {
    Total,
    Input,
    Output,
}

impl TokenSeriesKind {
    pub const ALL: [TokenSeriesKind; 3] = [
        TokenSeriesKind::Total,
        TokenSeriesKind::Input,
        TokenSeriesKind::Output,
    ];

    pub fn as_label(self) -> &'static str {
        match self {
            TokenSeriesKind::Total => "total",
            TokenSeriesKind::Input => "input",
            TokenSeriesKind::Output => "output",
        }
    }

    pub fn from_label(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_label().eq_ignore_ascii_case(input.trim()))
    }

    pub fn title(self) -> &'static str {
        match self {
            TokenSeriesKind::Total => "Total Tokens",
            TokenSeriesKind::Input => "Input Tokens",
            TokenSeriesKind::Output => "Output Tokens",
        }
    }

    pub fn value_of(self, bucket: &DailyBucket) -> u64 {
        match self {
            TokenSeriesKind::Total => bucket.total_tokens,
            TokenSeriesKind::Input => bucket.input_tokens,
            TokenSeriesKind::Output => bucket.output_tokens,
        }
    }

    pub fn next(self) -> Self {
        match self {
            TokenSeriesKind::Total => TokenSeriesKind::Input,
            TokenSeriesKind::Input => TokenSeriesKind::Output,
            TokenSeriesKind::Output => TokenSeriesKind::Total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub values: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeriesProjection {
    Series(ChartSeries),
    // Fewer than two days of data.
    InsufficientData { points: usize },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageLevel {
    NoUsage,
    Low,
    Moderate,
    High,
    Intensive,
}

impl UsageLevel {
    pub const GAUGE_CEILING: u64 = 50;

    pub fn label(self) -> &'static str {
        match self {
            UsageLevel::NoUsage => "No usage",
            UsageLevel::Low => "Low",
            UsageLevel::Moderate => "Moderate",
            UsageLevel::High => "High",
            UsageLevel::Intensive => "Intensive",
        }
    }

    pub fn fill_percent(request_count: u64) -> u16 {
        let pct = request_count.saturating_mul(100) / Self::GAUGE_CEILING;
        pct.min(100) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_defaults_missing_and_null_counts_to_zero() {
        let entry: UsageLogEntry = serde_json::from_value(json!({
            "id": 42,
            "user_id": "u-1",
            "input_tokens": 12,
            "output_tokens": null,
            "created_at": "2025-03-01T23:59:59.123456+00:00"
        }))
        .expect("entry should parse");
        assert_eq!(entry.id, "42");
        assert_eq!(entry.input_tokens, 12);
        assert_eq!(entry.output_tokens, 0);
        assert_eq!(entry.total_tokens, 0);
    }

    #[test]
    fn entry_timestamps_are_normalized_to_utc() {
        let entry: UsageLogEntry = serde_json::from_value(json!({
            "id": "a",
            "user_id": "u-1",
            "created_at": "2025-03-02T01:30:00+02:00"
        }))
        .expect("entry should parse");
        assert_eq!(entry.created_at.to_rfc3339(), "2025-03-01T23:30:00+00:00");
    }

    #[test]
    fn usage_response_reads_camel_case_totals() {
        let body: UsageResponse = serde_json::from_value(json!({
            "logs": [],
            "totalMetrics": {
                "request_count": 0,
                "input_tokens": 0,
                "output_tokens": 0,
                "total_tokens": 0
            }
        }))
        .expect("response should parse");
        assert!(body.logs.is_empty());
        assert_eq!(body.total_metrics, Some(PeriodSummary::default()));
    }

    #[test]
    fn window_labels_round_trip_and_cycle() {
        for w in TimeWindow::ALL {
            assert_eq!(TimeWindow::from_label(w.as_label()), Some(w));
        }
        assert_eq!(TimeWindow::from_label("ALL"), Some(TimeWindow::All));
        assert_eq!(TimeWindow::from_label("2d"), None);
        assert_eq!(TimeWindow::All.next(), TimeWindow::SevenDays);
        assert!(TimeWindow::All.cutoff(Utc::now()).is_none());
    }

    #[test]
    fn gauge_fill_caps_at_one_hundred() {
        assert_eq!(UsageLevel::fill_percent(0), 0);
        assert_eq!(UsageLevel::fill_percent(25), 50);
        assert_eq!(UsageLevel::fill_percent(50), 100);
        assert_eq!(UsageLevel::fill_percent(u64::MAX), 100);
    }
}
