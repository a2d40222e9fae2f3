//! # Storage Error Classifier
//!
//! Maps low-level database and transport errors onto the failure taxonomy.
//! Every storage-backed operation routes its errors through here before
//! deciding between retry-with-backoff and surface-to-caller.
//!
//! Classification is case-insensitive on messages and tolerates absent
//! SQLSTATE codes; anything unrecognized defaults to transient so that an
//! unknown blip is retried rather than parked.

use super::FailureKind;

/// SQLSTATE class prefixes that indicate a transient condition
const TRANSIENT_SQLSTATE_PREFIXES: &[&str] = &["08", "40"];

/// Specific SQLSTATE codes that indicate a transient condition
const TRANSIENT_SQLSTATES: &[&str] = &["57P03", "40001", "08003", "08006"];

/// SQLSTATE class prefixes that indicate a permanent condition
const PERMANENT_SQLSTATE_PREFIXES: &[&str] = &["22", "23", "42", "3D", "3F"];

/// Message fragments (lowercase) that indicate a transient condition
const TRANSIENT_MESSAGE_FRAGMENTS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "deadlock",
    "lock timeout",
    "lock wait timeout",
    "pool exhausted",
    "pool timed out",
    "timed out",
    "too many connections",
];

/// Message fragments (lowercase) that indicate a permanent condition
const PERMANENT_MESSAGE_FRAGMENTS: &[&str] = &[
    "does not exist",
    "not found",
    "unknown column",
    "unknown table",
    "unique constraint",
    "duplicate key",
    "foreign key",
    "syntax error",
    "type mismatch",
    "invalid input syntax",
    "violates check constraint",
    "violates not-null constraint",
];

/// Classify a bare SQLSTATE code.
///
/// `None` (driver gave no state) is treated as unknown, hence transient.
pub fn classify_sqlstate(state: Option<&str>) -> FailureKind {
    let Some(state) = state else {
        return FailureKind::Transient;
    };
    let state = state.trim().to_uppercase();
    if state.is_empty() {
        return FailureKind::Transient;
    }

    if TRANSIENT_SQLSTATES.contains(&state.as_str()) {
        return FailureKind::Transient;
    }
    if TRANSIENT_SQLSTATE_PREFIXES
        .iter()
        .any(|p| state.starts_with(p))
    {
        return FailureKind::Transient;
    }
    if PERMANENT_SQLSTATE_PREFIXES
        .iter()
        .any(|p| state.starts_with(p))
    {
        return FailureKind::Permanent;
    }

    FailureKind::Transient
}

/// Classify an error message by fragment matching, case-insensitively.
pub fn classify_message(message: Option<&str>) -> FailureKind {
    let Some(message) = message else {
        return FailureKind::Transient;
    };
    let lower = message.to_lowercase();

    if PERMANENT_MESSAGE_FRAGMENTS.iter().any(|f| lower.contains(f)) {
        return FailureKind::Permanent;
    }
    if TRANSIENT_MESSAGE_FRAGMENTS.iter().any(|f| lower.contains(f)) {
        return FailureKind::Transient;
    }

    FailureKind::Transient
}

/// Classify an `sqlx::Error`.
///
/// SQLSTATE takes precedence when the driver exposes one; the message
/// heuristics are the fallback for driver-level failures (I/O, pool).
pub fn classify_db_error(error: &sqlx::Error) -> FailureKind {
    match error {
        sqlx::Error::Database(db) => {
            let code = db.code();
            match code.as_deref() {
                Some(state) => {
                    let by_state = classify_sqlstate(Some(state));
                    // A recognized permanent state is authoritative; an
                    // unrecognized one falls back to the message text.
                    if by_state == FailureKind::Permanent {
                        FailureKind::Permanent
                    } else if TRANSIENT_SQLSTATES.contains(&state.to_uppercase().as_str())
                        || TRANSIENT_SQLSTATE_PREFIXES
                            .iter()
                            .any(|p| state.to_uppercase().starts_with(p))
                    {
                        FailureKind::Transient
                    } else {
                        classify_message(Some(db.message()))
                    }
                }
                None => classify_message(Some(db.message())),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            FailureKind::Transient
        }
        sqlx::Error::RowNotFound => FailureKind::Permanent,
        sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnIndexOutOfBounds { .. } => {
            FailureKind::Permanent
        }
        sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => FailureKind::Permanent,
        sqlx::Error::Configuration(_) => FailureKind::Permanent,
        other => classify_message(Some(&other.to_string())),
    }
}

/// True when an `sqlx::Error` is a unique-constraint violation.
///
/// The partial unique index on `command.idempotency_key` surfaces duplicate
/// submissions through this check.
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("23505")
                || db.message().to_lowercase().contains("duplicate key")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- SQLSTATE classification ----

    #[test]
    fn test_connection_class_is_transient() {
        assert_eq!(classify_sqlstate(Some("08001")), FailureKind::Transient);
        assert_eq!(classify_sqlstate(Some("08006")), FailureKind::Transient);
    }

    #[test]
    fn test_serialization_class_is_transient() {
        assert_eq!(classify_sqlstate(Some("40001")), FailureKind::Transient);
        assert_eq!(classify_sqlstate(Some("40P01")), FailureKind::Transient);
    }

    #[test]
    fn test_cannot_connect_now_is_transient() {
        assert_eq!(classify_sqlstate(Some("57P03")), FailureKind::Transient);
    }

    #[test]
    fn test_data_exception_is_permanent() {
        assert_eq!(classify_sqlstate(Some("22001")), FailureKind::Permanent);
    }

    #[test]
    fn test_integrity_violation_is_permanent() {
        assert_eq!(classify_sqlstate(Some("23505")), FailureKind::Permanent);
        assert_eq!(classify_sqlstate(Some("23503")), FailureKind::Permanent);
    }

    #[test]
    fn test_syntax_class_is_permanent() {
        assert_eq!(classify_sqlstate(Some("42601")), FailureKind::Permanent);
        assert_eq!(classify_sqlstate(Some("42P01")), FailureKind::Permanent);
    }

    #[test]
    fn test_invalid_catalog_and_schema_are_permanent() {
        assert_eq!(classify_sqlstate(Some("3D000")), FailureKind::Permanent);
        assert_eq!(classify_sqlstate(Some("3F000")), FailureKind::Permanent);
    }

    #[test]
    fn test_lowercase_sqlstate_tolerated() {
        assert_eq!(classify_sqlstate(Some("42p01")), FailureKind::Permanent);
        assert_eq!(classify_sqlstate(Some("57p03")), FailureKind::Transient);
    }

    #[test]
    fn test_missing_sqlstate_defaults_transient() {
        assert_eq!(classify_sqlstate(None), FailureKind::Transient);
        assert_eq!(classify_sqlstate(Some("")), FailureKind::Transient);
        assert_eq!(classify_sqlstate(Some("  ")), FailureKind::Transient);
    }

    #[test]
    fn test_unrecognized_sqlstate_defaults_transient() {
        assert_eq!(classify_sqlstate(Some("P0001")), FailureKind::Transient);
    }

    // ---- Message classification ----

    #[test]
    fn test_connection_refused_is_transient() {
        assert_eq!(
            classify_message(Some("Connection refused (os error 111)")),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_deadlock_message_is_transient() {
        assert_eq!(
            classify_message(Some("Deadlock detected while waiting for lock")),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_pool_exhausted_is_transient() {
        assert_eq!(
            classify_message(Some("connection POOL EXHAUSTED")),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_missing_relation_is_permanent() {
        assert_eq!(
            classify_message(Some("relation \"outbox\" does not exist")),
            FailureKind::Permanent
        );
    }

    #[test]
    fn test_unique_violation_message_is_permanent() {
        assert_eq!(
            classify_message(Some("duplicate key value violates unique constraint")),
            FailureKind::Permanent
        );
    }

    #[test]
    fn test_syntax_error_message_is_permanent() {
        assert_eq!(
            classify_message(Some("SYNTAX ERROR at or near \"selec\"")),
            FailureKind::Permanent
        );
    }

    #[test]
    fn test_null_message_defaults_transient() {
        assert_eq!(classify_message(None), FailureKind::Transient);
    }

    #[test]
    fn test_unknown_message_defaults_transient() {
        assert_eq!(
            classify_message(Some("something entirely novel happened")),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_permanent_fragment_wins_over_transient_fragment() {
        // "could not connect: relation does not exist" is nonsense, but the
        // permanent signal must not be masked by the transient one.
        assert_eq!(
            classify_message(Some("timed out: relation does not exist")),
            FailureKind::Permanent
        );
    }

    // ---- sqlx::Error classification ----

    #[test]
    fn test_pool_timeout_is_transient() {
        assert_eq!(
            classify_db_error(&sqlx::Error::PoolTimedOut),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_pool_closed_is_transient() {
        assert_eq!(
            classify_db_error(&sqlx::Error::PoolClosed),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_row_not_found_is_permanent() {
        assert_eq!(
            classify_db_error(&sqlx::Error::RowNotFound),
            FailureKind::Permanent
        );
    }

    #[test]
    fn test_column_not_found_is_permanent() {
        assert_eq!(
            classify_db_error(&sqlx::Error::ColumnNotFound("status".into())),
            FailureKind::Permanent
        );
    }

    #[test]
    fn test_io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify_db_error(&sqlx::Error::Io(io)), FailureKind::Transient);
    }

    #[test]
    fn test_non_database_error_not_unique_violation() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_unique_violation(&sqlx::Error::PoolTimedOut));
    }
}
