use serde_json::json;

use super::*;
use crate::transport::FailureClass;

// ==================== ConnectionOptions Tests ====================

#[test]
fn test_connection_options_default() {
    let opts = ConnectionOptions::default();

    assert!(opts.auto_reconnect, "auto_reconnect should default to true");
    assert_eq!(opts.primary_base_delay_secs, 60, "primary base should default to 60s");
    assert_eq!(opts.min_base_delay_secs, 5);
    assert_eq!(
        opts.max_reconnect_delay_secs, 900,
        "max_reconnect_delay_secs should default to 900"
    );
    assert_eq!(opts.max_backoff_exponent, 6);
    assert_eq!(opts.max_reconnect_attempts, Some(10));
}

#[test]
fn test_connection_options_builder_pattern() {
    let opts = ConnectionOptions::new()
        .with_auto_reconnect(false)
        .with_primary_base_delay_secs(10)
        .with_escalated_base_delays_secs(20, 40)
        .with_max_reconnect_delay_secs(120)
        .with_max_reconnect_attempts(None);

    assert!(!opts.auto_reconnect);
    assert_eq!(opts.base_delay_secs(FailureClass::Primary), 10);
    assert_eq!(opts.base_delay_secs(FailureClass::Elevated), 20);
    assert_eq!(opts.base_delay_secs(FailureClass::Severe), 40);
    assert_eq!(opts.max_reconnect_delay_secs, 120);
    assert!(opts.max_reconnect_attempts.is_none());
}

#[test]
fn test_connection_options_retry_ceiling() {
    let opts = ConnectionOptions::new().with_max_reconnect_attempts(Some(3));
    assert!(opts.can_retry(0));
    assert!(opts.can_retry(2));
    assert!(!opts.can_retry(3));

    let disabled = ConnectionOptions::new().with_max_reconnect_attempts(Some(0));
    assert!(!disabled.can_retry(0));

    let infinite = ConnectionOptions::new().with_max_reconnect_attempts(None);
    assert!(infinite.can_retry(10_000));

    let manual = ConnectionOptions::new().with_auto_reconnect(false);
    assert!(!manual.can_retry(0));
}

#[test]
fn test_connection_options_partial_deserialization() {
    let parsed: ConnectionOptions =
        serde_json::from_value(json!({"primary_base_delay_secs": 15})).unwrap();
    assert_eq!(parsed.primary_base_delay_secs, 15);
    assert_eq!(parsed.max_reconnect_delay_secs, 900);
    assert!(parsed.auto_reconnect);
}

// ==================== TableCacheOptions Tests ====================

#[test]
fn test_table_cache_options_default() {
    let opts = TableCacheOptions::default();
    assert_eq!(opts.page_size, 1000);
    assert_eq!(opts.max_rows, None);
    assert_eq!(opts.id_column, "id");
    assert_eq!(opts.soft_delete_column.as_deref(), Some("deleted_at"));
    assert_eq!(opts.reconciliation.min_comparable_fields, 3);
    assert!((opts.reconciliation.match_ratio - 0.9).abs() < f64::EPSILON);
    assert_eq!(opts.reconciliation.timestamp_tolerance_ms, 500);
}

#[test]
fn test_reconciliation_system_fields() {
    let policy = ReconciliationPolicy::default();
    assert!(policy.is_system_field("id"));
    assert!(policy.is_system_field("created_at"));
    assert!(policy.is_system_field("updated_at"));
    assert!(!policy.is_system_field("due_date"));
}

// ==================== Status Tests ====================

#[test]
fn test_status_serialization() {
    assert_eq!(serde_json::to_value(ConnectionStatus::Partial).unwrap(), json!("partial"));
    assert_eq!(serde_json::to_value(ChannelStatus::TimedOut).unwrap(), json!("timed_out"));
    assert_eq!(serde_json::to_value(ChangeOperation::Delete).unwrap(), json!("DELETE"));
    assert_eq!(
        serde_json::to_value(SecondaryKey::HelpQueue(4)).unwrap(),
        json!({"kind": "help_queue", "id": 4})
    );
}
