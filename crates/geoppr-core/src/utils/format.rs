/// Kilometres with one decimal and a comma separator, as shown on the
/// dashboard (`12,5 km`).
pub fn format_km(km: f64) -> String {
    if !km.is_finite() {
        return "0,0 km".to_string();
    }
    format!("{:.1} km", km).replace('.', ",")
}

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Fit `s` into exactly `width` columns.
pub fn pad_right(s: &str, width: usize) -> String {
    let fitted = truncate_string(s, width);
    let len = fitted.chars().count();
    format!("{}{}", fitted, " ".repeat(width.saturating_sub(len)))
}

/// Format a date string to a more readable format
pub fn format_date(date: &str) -> String {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(date) {
        dt.format("%d/%m/%Y").to_string()
    } else if let Ok(d) = chrono::NaiveDate::parse_from_str(date.get(..10).unwrap_or(date), "%Y-%m-%d") {
        d.format("%d/%m/%Y").to_string()
    } else {
        date.to_string()
    }
}
