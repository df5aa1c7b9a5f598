use std::time::Duration;

use resilio::{ResilioError, Result};

#[test]
fn test_error_display() {
    let err = ResilioError::Throttled {
        route: "/analisar_logs".to_string(),
        retry_after: Duration::from_secs(30),
    };
    assert!(err.to_string().contains("/analisar_logs"));
}

#[test]
fn test_result_alias() {
    fn returns_error() -> Result<()> {
        Err(ResilioError::PoolClosed)
    }
    assert!(returns_error().is_err());
}

#[test]
fn json_errors_convert() {
    fn parse() -> Result<serde_json::Value> {
        Ok(serde_json::from_str("{not json")?)
    }
    assert!(matches!(parse(), Err(ResilioError::Json(_))));
}

// ============================================================================
// Transient error classification
// ============================================================================

#[test]
fn transient_errors() {
    assert!(
        ResilioError::PoolExhausted {
            waited: Duration::from_secs(5)
        }
        .is_transient()
    );
    assert!(ResilioError::Connect("refused".into()).is_transient());
    assert!(ResilioError::Http("connection reset".into()).is_transient());
    assert!(ResilioError::Timeout("read".into()).is_transient());
    assert!(ResilioError::Transient("deadlock detected".into()).is_transient());
    assert!(ResilioError::UpstreamRateLimited { retry_after: None }.is_transient());
    for status in [408, 429, 500, 502, 503, 504] {
        assert!(
            ResilioError::Api {
                status,
                message: "upstream".into()
            }
            .is_transient(),
            "{status} should be transient"
        );
    }
}

#[test]
fn permanent_errors() {
    assert!(!ResilioError::AuthenticationFailed.is_transient());
    assert!(!ResilioError::InvalidInput("x".into()).is_transient());
    assert!(!ResilioError::Configuration("x".into()).is_transient());
    assert!(!ResilioError::PoolClosed.is_transient());
    assert!(!ResilioError::Cancelled.is_transient());
    assert!(
        !ResilioError::Throttled {
            route: "/".into(),
            retry_after: Duration::from_secs(1),
        }
        .is_transient()
    );
    for status in [400, 401, 403, 404, 422] {
        assert!(
            !ResilioError::Api {
                status,
                message: "client error".into()
            }
            .is_transient(),
            "{status} should be permanent"
        );
    }
}

// ============================================================================
// retry_after extraction
// ============================================================================

#[test]
fn retry_after_from_upstream_rate_limit() {
    let duration = Duration::from_secs(5);
    let err = ResilioError::UpstreamRateLimited {
        retry_after: Some(duration),
    };
    assert_eq!(err.retry_after(), Some(duration));
    assert_eq!(
        ResilioError::UpstreamRateLimited { retry_after: None }.retry_after(),
        None
    );
}

#[test]
fn retry_after_from_throttle() {
    let err = ResilioError::Throttled {
        route: "/".into(),
        retry_after: Duration::from_secs(12),
    };
    assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
}

#[test]
fn retry_after_none_for_other_errors() {
    assert_eq!(ResilioError::Http("timeout".into()).retry_after(), None);
    assert_eq!(ResilioError::AuthenticationFailed.retry_after(), None);
}

// ============================================================================
// HTTP status mapping
// ============================================================================

#[test]
fn http_status_mapping() {
    let throttled = ResilioError::Throttled {
        route: "/".into(),
        retry_after: Duration::from_secs(1),
    };
    assert_eq!(throttled.http_status(), 429);
    assert_eq!(
        ResilioError::PoolExhausted {
            waited: Duration::from_secs(5)
        }
        .http_status(),
        503
    );
    assert_eq!(ResilioError::PoolClosed.http_status(), 503);
    assert_eq!(ResilioError::Timeout("ai".into()).http_status(), 504);
    assert_eq!(ResilioError::AuthenticationFailed.http_status(), 401);
    assert_eq!(ResilioError::InvalidInput("x".into()).http_status(), 400);
    assert_eq!(
        ResilioError::Api {
            status: 503,
            message: "x".into()
        }
        .http_status(),
        502
    );
    assert_eq!(
        ResilioError::Api {
            status: 404,
            message: "x".into()
        }
        .http_status(),
        404
    );
}
