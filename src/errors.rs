use regex::{RegexSet, RegexSetBuilder};
use std::sync::LazyLock;

use crate::delivery::DeliveryError;
use crate::query::QueryError;

// Failures caused by the query itself, retrying them cannot succeed
static INVALID_QUERY: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSetBuilder::new([
        r"syntax error",
        r"incorrect syntax",
        r"unknown (table|column)",
        r"invalid object name",
        r"no such (table|column|function)",
        r"(table|column|relation)\b.*\b(doesn't|does not) exist",
        r"driver\b.*\bnot found",
    ])
    .case_insensitive(true)
    .build()
    .expect("invalid query patterns must compile")
});

/// True when any error in the chain looks like a malformed or unresolvable query.
/// Delivery failures never qualify, their text comes from the remote server.
pub fn is_invalid_query(error: &anyhow::Error) -> bool {
    if error.chain().any(|cause| cause.is::<DeliveryError>()) {
        return false;
    }
    error
        .chain()
        .any(|cause| INVALID_QUERY.is_match(&cause.to_string()))
}

/// Short type label used in alert payloads
pub fn kind(error: &anyhow::Error) -> &'static str {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<QueryError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<DeliveryError>() {
            return e.kind();
        }
        if cause.is::<std::io::Error>() {
            return "IoError";
        }
        if cause.is::<serde_json::Error>() {
            return "SerializationError";
        }
    }
    "Error"
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::time::Duration;

    #[test]
    fn test_invalid_query_signatures() {
        let invalid = [
            "SQLite failure: `near \"SELEC\": syntax error`",
            "Incorrect syntax near 'FROM'",
            "Unknown column 'foo' in 'field list'",
            "Table 'shop.orders' doesn't exist",
            "relation \"orders\" does not exist",
            "Invalid object name 'dbo.Orders'",
            "no such table: orders",
            "Data source name not found and no default driver specified; driver not found",
        ];
        for message in invalid {
            assert!(is_invalid_query(&anyhow!(message)), "{}", message);
        }

        let transient = ["connection reset by peer", "database is locked", "timed out"];
        for message in transient {
            assert!(!is_invalid_query(&anyhow!(message)), "{}", message);
        }
    }

    #[test]
    fn test_invalid_query_in_context_chain() {
        let error = anyhow!("no such column: total").context("Query 'orders' failed");
        assert!(is_invalid_query(&error));
    }

    #[test]
    fn test_delivery_response_is_not_an_invalid_query() {
        let error = anyhow::Error::new(DeliveryError::Status {
            status: reqwest::StatusCode::BAD_GATEWAY,
            body: "upstream: JSON syntax error at line 1".to_string(),
        })
        .context("Chunk 1/1 to endpoint 'api' failed");
        assert!(!is_invalid_query(&error));
        assert_eq!(kind(&error), "HttpStatusError");
    }

    #[test]
    fn test_kind() {
        let timeout = anyhow::Error::new(QueryError::Timeout(Duration::from_secs(5))).context("attempt 1");
        assert_eq!(kind(&timeout), "QueryTimeout");
        assert_eq!(kind(&anyhow!("plain")), "Error");
        let io = anyhow::Error::new(std::io::Error::other("disk"));
        assert_eq!(kind(&io), "IoError");
    }
}
