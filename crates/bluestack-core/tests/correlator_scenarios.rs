//! End-to-end correlator scenarios on a virtual clock
//!
//! Each test drives a correlator through a sequence of sends, responses and
//! timer expirations and checks which callbacks fired, and when.

use bluestack_core::{
    Correlation, CorrelatorConfig, Opcode, OutboundRequest, RequestError,
};
use std::time::Duration;

use test_utils::{advance, create_test_correlator, peer, OutcomeRecorder};

#[test]
fn test_response_before_timeout_resolves_once() {
    let (mut correlator, transport, timer) = create_test_correlator(CorrelatorConfig::default());
    let recorder = OutcomeRecorder::new();

    let id = correlator
        .send_request(
            OutboundRequest::new(0x10u32, peer(0x0005), vec![0x01])
                .with_timeout(Duration::from_millis(2000)),
            recorder.callback(1),
        )
        .unwrap();

    assert_eq!(transport.frames().len(), 1);
    assert_eq!(transport.frames()[0].opcode, Opcode::new(0x10));

    // Response at 500ms
    assert_eq!(advance(&mut correlator, &timer, 500), 0);
    let correlation = correlator.on_message_received(peer(0x0005), Opcode::new(0x80), vec![0xAA]);
    assert_eq!(correlation, Correlation::Resolved(id));
    assert_eq!(recorder.outcomes(), vec![(1, Ok(vec![0xAA]))]);

    // The timer was cancelled; nothing fires at or after 2000ms
    assert_eq!(timer.armed_count(), 0);
    assert_eq!(advance(&mut correlator, &timer, 5000), 0);
    assert_eq!(recorder.count_for(1), 1);
}

#[test]
fn test_timeout_then_stray_response_is_unsolicited() {
    let (mut correlator, _transport, timer) = create_test_correlator(CorrelatorConfig::default());
    let recorder = OutcomeRecorder::new();

    let id = correlator
        .send_request(
            OutboundRequest::new(0x10u32, peer(0x0005), vec![])
                .with_timeout(Duration::from_millis(2000)),
            recorder.callback(1),
        )
        .unwrap();

    assert_eq!(advance(&mut correlator, &timer, 1999), 0);
    assert!(correlator.is_outstanding(id));

    assert_eq!(advance(&mut correlator, &timer, 1), 1);
    assert!(!correlator.is_outstanding(id));
    assert_eq!(
        recorder.outcomes(),
        vec![(
            1,
            Err(RequestError::ResponseTimeout {
                expected: Opcode::new(0x80),
                timeout_ms: 2000,
            })
        )]
    );

    let stray = correlator.on_message_received(peer(0x0005), Opcode::new(0x80), vec![0x01]);
    match stray {
        Correlation::Unsolicited(message) => {
            assert_eq!(message.context, peer(0x0005));
            assert_eq!(message.opcode, Opcode::new(0x80));
            assert_eq!(message.payload, vec![0x01]);
        }
        other => panic!("expected unsolicited, got {:?}", other),
    }
    assert_eq!(recorder.count_for(1), 1);
}

#[test]
fn test_identical_expected_opcodes_resolve_oldest_first() {
    let (mut correlator, _transport, timer) = create_test_correlator(CorrelatorConfig::default());
    let recorder = OutcomeRecorder::new();

    let r1 = correlator
        .send_request(
            OutboundRequest::new(0x11u32, peer(0x0007), vec![]),
            recorder.callback(1),
        )
        .unwrap();
    let r2 = correlator
        .send_request(
            OutboundRequest::new(0x12u32, peer(0x0007), vec![]),
            recorder.callback(2),
        )
        .unwrap();

    assert_eq!(
        correlator.on_message_received(peer(0x0007), Opcode::new(0x81), vec![1]),
        Correlation::Resolved(r1)
    );
    assert!(correlator.is_outstanding(r2));
    assert_eq!(recorder.count_for(2), 0);

    // R2 completes on its own timeout
    advance(&mut correlator, &timer, 4000);
    assert!(matches!(
        recorder.outcomes()[1],
        (2, Err(RequestError::ResponseTimeout { .. }))
    ));
}

#[test]
fn test_second_response_resolves_next_request() {
    let (mut correlator, _transport, _timer) = create_test_correlator(CorrelatorConfig::default());
    let recorder = OutcomeRecorder::new();

    let r1 = correlator
        .send_request(
            OutboundRequest::new(0x11u32, peer(0x0007), vec![]),
            recorder.callback(1),
        )
        .unwrap();
    let r2 = correlator
        .send_request(
            OutboundRequest::new(0x11u32, peer(0x0007), vec![]),
            recorder.callback(2),
        )
        .unwrap();

    let first = correlator.on_message_received(peer(0x0007), Opcode::new(0x81), vec![1]);
    let second = correlator.on_message_received(peer(0x0007), Opcode::new(0x81), vec![2]);

    assert_eq!(first, Correlation::Resolved(r1));
    assert_eq!(second, Correlation::Resolved(r2));
    assert_eq!(
        recorder.outcomes(),
        vec![(1, Ok(vec![1])), (2, Ok(vec![2]))]
    );
}

#[test]
fn test_cancel_context_silences_later_events() {
    let (mut correlator, _transport, timer) = create_test_correlator(CorrelatorConfig::default());
    let recorder = OutcomeRecorder::new();

    correlator
        .send_request(
            OutboundRequest::new(0x10u32, peer(1), vec![]),
            recorder.callback(1),
        )
        .unwrap();
    correlator
        .send_request(
            OutboundRequest::new(0x11u32, peer(1), vec![]),
            recorder.callback(2),
        )
        .unwrap();
    let other = correlator
        .send_request(
            OutboundRequest::new(0x10u32, peer(2), vec![]),
            recorder.callback(3),
        )
        .unwrap();

    assert_eq!(correlator.cancel_context(&peer(1)), 2);
    assert!(!correlator.contains_context(&peer(1)));
    assert!(correlator.is_outstanding(other));

    let cancelled: Vec<_> = recorder.outcomes();
    assert_eq!(
        cancelled,
        vec![
            (1, Err(RequestError::Cancelled)),
            (2, Err(RequestError::Cancelled)),
        ]
    );

    // Late responses and timers for the cancelled context change nothing
    assert!(!correlator
        .on_message_received(peer(1), Opcode::new(0x80), vec![])
        .is_resolved());
    advance(&mut correlator, &timer, 10_000);
    assert_eq!(recorder.count_for(1), 1);
    assert_eq!(recorder.count_for(2), 1);
    assert_eq!(recorder.count_for(3), 1);
}

#[test]
fn test_response_wins_over_pending_timer() {
    let (mut correlator, _transport, timer) = create_test_correlator(CorrelatorConfig::default());
    let recorder = OutcomeRecorder::new();

    let id = correlator
        .send_request(
            OutboundRequest::new(0x10u32, peer(3), vec![])
                .with_timeout(Duration::from_millis(100)),
            recorder.callback(1),
        )
        .unwrap();

    // Timer expires, but the response is processed before the expiry is
    // delivered to the correlator
    let expired = timer.advance(100);
    assert_eq!(expired, vec![id]);
    assert!(correlator
        .on_message_received(peer(3), Opcode::new(0x80), vec![9])
        .is_resolved());
    assert!(!correlator.on_timeout(id));

    assert_eq!(recorder.outcomes(), vec![(1, Ok(vec![9]))]);
}

#[test]
fn test_send_failure_consumes_callback() {
    let (mut correlator, transport, timer) = create_test_correlator(CorrelatorConfig::default());
    let recorder = OutcomeRecorder::new();
    transport.refuse_sends(true);

    let id = correlator
        .send_request(
            OutboundRequest::new(0x10u32, peer(4), vec![]),
            recorder.callback(1),
        )
        .unwrap();

    assert!(!correlator.is_outstanding(id));
    assert!(matches!(
        recorder.outcomes()[0],
        (1, Err(RequestError::SendFailed(_)))
    ));
    assert_eq!(advance(&mut correlator, &timer, 10_000), 0);
    assert_eq!(recorder.count_for(1), 1);
}
