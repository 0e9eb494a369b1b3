//! Audit trail assertions.

use trellis_transport::{Audit, AuditEvent};

/// Events of `trail` paired with the port they concern.
pub fn audit_events(trail: &[Audit]) -> Vec<(AuditEvent, Option<u16>)> {
    trail.iter().map(|a| (a.event, a.port())).collect()
}

/// Assert that `trail` holds exactly `expected`, in order.
#[track_caller]
pub fn assert_audits(trail: &[Audit], expected: &[(AuditEvent, Option<u16>)]) {
    let actual = audit_events(trail);
    assert_eq!(
        actual,
        expected,
        "audit trail mismatch:\n{}",
        trail
            .iter()
            .map(|a| format!("  {a}"))
            .collect::<Vec<_>>()
            .join("\n")
    );
}

/// Number of `event` entries in `trail`.
pub fn count_events(trail: &[Audit], event: AuditEvent) -> usize {
    trail.iter().filter(|a| a.event == event).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use url::Url;

    #[test]
    fn test_audit_events() {
        let node = Url::parse("http://localhost:9201/").ok();
        let trail = vec![
            Audit::new(AuditEvent::PingFailure, node.clone(), Utc::now()),
            Audit::new(AuditEvent::AllNodesDead, None, Utc::now()),
        ];
        assert_audits(
            &trail,
            &[(AuditEvent::PingFailure, Some(9201)), (AuditEvent::AllNodesDead, None)],
        );
        assert_eq!(count_events(&trail, AuditEvent::PingFailure), 1);
    }
}
