//! Helpers for reading world-state payload fields.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

/// Parse a timestamp in any of the shapes the feeds use:
/// `{"$date": {"$numberLong": "1700000000000"}}`, `{"$date": 1700000000000}`,
/// a bare millisecond number, or an RFC 3339 string.
pub fn parse_mongo_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Object(map) => map.get("$date").and_then(|inner| match inner {
            Value::Object(date) => date.get("$numberLong").and_then(parse_millis),
            other => parse_millis(other),
        }),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_millis(value)),
        Value::Number(_) => parse_millis(value),
        _ => None,
    }
}

fn parse_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

/// Compact countdown such as `1d 4h 12m`, `45m`, or `expired`.
pub fn format_remaining(remaining: Duration) -> String {
    if remaining <= Duration::zero() {
        return "expired".to_string();
    }
    let days = remaining.num_days();
    let hours = remaining.num_hours() % 24;
    let minutes = remaining.num_minutes() % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(format!("{}m", minutes));
    }
    parts.join(" ")
}

/// String field or empty.
pub fn str_field<'a>(value: &'a Value, field: &str) -> &'a str {
    value.get(field).and_then(Value::as_str).unwrap_or("")
}
