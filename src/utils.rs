use std::time::Duration;

/// Converts a Duration to a human-readable string with at most 2 units
/// e.g., "1 h, 30 m", "5 m, 20 s", "1 s, 133 ms", "10 ms"
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(&str, u128); 5] = [
        ("d", 86_400_000),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
        ("ms", 1),
    ];

    let mut remaining = duration.as_millis();
    if remaining == 0 {
        return "0 ms".to_string();
    }

    let mut parts = Vec::with_capacity(2);
    for (unit, size) in UNITS {
        let amount = remaining / size;
        remaining %= size;
        if amount > 0 {
            parts.push(format!("{} {}", amount, unit));
        }
        if parts.len() == 2 || (!parts.is_empty() && remaining == 0) {
            break;
        }
    }

    parts.join(", ")
}

/// Escapes text for inclusion in HTML element content and attributes
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// 8 character id used to correlate the log lines of one execution
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
