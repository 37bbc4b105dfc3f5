//! Kill switch durability across handles and reopen

use std::sync::Arc;
use trade_guard::audit::RecordingSink;
use trade_guard::risk::{KillSwitch, KillSwitchError, KillSwitchState};
use trade_guard::AuditEventKind;

#[test]
fn test_trigger_then_check_always_raises() {
    let ks = KillSwitch::open_in_memory().unwrap();
    ks.trigger("stream failure limit").unwrap();
    for _ in 0..3 {
        let err = ks.check_and_raise().unwrap_err();
        assert!(err.to_string().contains("stream failure limit"));
    }
    ks.reset("ops-bob").unwrap();
    for _ in 0..3 {
        assert!(ks.check_and_raise().is_ok());
    }
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("guard.db");

    {
        let ks = KillSwitch::open(&path).unwrap();
        ks.trigger("broker circuit breaker").unwrap();
    }

    let reopened = KillSwitch::open(&path).unwrap();
    match reopened.check_and_raise() {
        Err(KillSwitchError::Active { reason, triggered_at }) => {
            assert_eq!(reason, "broker circuit breaker");
            assert!(!triggered_at.is_empty());
        }
        other => panic!("expected active kill switch, got {:?}", other),
    }

    reopened.reset("ops-carol").unwrap();
    drop(reopened);

    let again = KillSwitch::open(&path).unwrap();
    let status = again.status().unwrap();
    assert_eq!(status.state, KillSwitchState::Inactive);
    assert_eq!(status.reset_by.as_deref(), Some("ops-carol"));
}

#[test]
fn test_second_handle_sees_trigger_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guard.db");
    let trader = KillSwitch::open(&path).unwrap();
    let operator = KillSwitch::open(&path).unwrap();

    assert!(!trader.is_active().unwrap());
    operator.trigger("manual halt").unwrap();
    assert!(trader.is_active().unwrap());
    operator.reset("ops").unwrap();
    assert!(!trader.is_active().unwrap());
}

#[test]
fn test_concurrent_triggers_leave_switch_active() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guard.db");
    let sink = Arc::new(RecordingSink::default());

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let path = path.clone();
            std::thread::spawn(move || {
                let ks = KillSwitch::open(&path).unwrap();
                ks.trigger(&format!("worker {}", i)).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let ks = KillSwitch::open(&path).unwrap().with_sink(sink.clone());
    let status = ks.status().unwrap();
    assert!(status.is_active());
    assert!(status.reason.unwrap().starts_with("worker "));

    ks.reset("ops").unwrap();
    assert_eq!(sink.count(AuditEventKind::KillSwitchReset), 1);
}
