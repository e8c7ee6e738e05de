//! Client model scenarios on paused tokio time
//!
//! The client executor runs inside the test runtime; its timers are tokio
//! sleeps, so with time paused every timeout fires at an exact virtual
//! instant.

use bluestack_core::{
    ContextKey, CorrelatorConfig, CorrelatorError, ExecutorConfig, Opcode, OpcodePairTable,
    OutboundFrame, OutboundRequest, PeerAddr, RequestError, RequestOutcome, StackError,
    Transport, TransportError,
};
use bluestack_runtime::{new_client_model, ClientHandle, ClientModelState, PublicationReceiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

/// Transport that forwards frames to the test
struct ChannelTransport(mpsc::UnboundedSender<OutboundFrame>);

impl Transport for ChannelTransport {
    fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.0.send(frame).map_err(|_| TransportError::Closed)
    }
}

struct TestClient {
    client: ClientHandle,
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
    publications: PublicationReceiver,
    task: JoinHandle<ClientModelState<ChannelTransport>>,
}

fn peer(addr: u16) -> ContextKey {
    ContextKey::new(PeerAddr::from_unicast(addr), 0)
}

fn start_client(config: CorrelatorConfig) -> TestClient {
    let pairs = Arc::new(OpcodePairTable::from_pairs([
        (0x10u32, 0x80u32),
        (0x11, 0x81),
        (0x12, 0x81),
    ]));
    let (frame_tx, frames) = mpsc::unbounded_channel();
    let (executor, client, publications) = new_client_model(
        ExecutorConfig::client(),
        config,
        pairs,
        move |_| ChannelTransport(frame_tx),
    );
    TestClient {
        client,
        frames,
        publications,
        task: tokio::spawn(executor.run_forever()),
    }
}

type Outcomes = Arc<Mutex<Vec<(u32, RequestOutcome, Instant)>>>;

fn recorder(outcomes: &Outcomes, tag: u32) -> impl FnOnce(RequestOutcome) + Send + 'static {
    let outcomes = outcomes.clone();
    move |outcome| outcomes.lock().unwrap().push((tag, outcome, Instant::now()))
}

fn tags(outcomes: &Outcomes) -> Vec<u32> {
    outcomes.lock().unwrap().iter().map(|(tag, _, _)| *tag).collect()
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_response_at_500ms_resolves_and_never_times_out() {
    let mut test = start_client(CorrelatorConfig::default());
    let outcomes = Outcomes::default();
    let started = Instant::now();

    test.client
        .send_request(
            OutboundRequest::new(0x10u32, peer(5), vec![0x01])
                .with_timeout(Duration::from_millis(2000)),
            recorder(&outcomes, 1),
        )
        .await
        .unwrap();

    let frame = test.frames.recv().await.unwrap();
    assert_eq!(frame.opcode, Opcode::new(0x10));
    assert_eq!(frame.context, peer(5));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(test
        .client
        .deliver(peer(5), Opcode::new(0x80), vec![0xAA])
        .await
        .is_success());

    // Well past the original deadline
    tokio::time::sleep(Duration::from_millis(3000)).await;
    test.client.cancel_all().await.unwrap();

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    let (_, outcome, at) = &outcomes[0];
    assert_eq!(outcome, &Ok(vec![0xAA]));
    assert_eq!(*at - started, Duration::from_millis(500));
    assert!(test.publications.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_at_2000ms_then_stray_response_is_published() {
    let mut test = start_client(CorrelatorConfig::default());
    let outcomes = Outcomes::default();
    let started = Instant::now();

    test.client
        .send_request(
            OutboundRequest::new(0x10u32, peer(5), vec![])
                .with_timeout(Duration::from_millis(2000)),
            recorder(&outcomes, 1),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    {
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0].1,
            Err(RequestError::ResponseTimeout {
                expected: Opcode::new(0x80),
                timeout_ms: 2000,
            })
        );
        assert!(outcomes[0].2 - started >= Duration::from_millis(2000));
        assert!(outcomes[0].2 - started < Duration::from_millis(2100));
    }

    test.client
        .deliver(peer(5), Opcode::new(0x80), vec![0x02])
        .await;
    let published = test.publications.recv().await.unwrap();
    assert_eq!(published.context, peer(5));
    assert_eq!(published.opcode, Opcode::new(0x80));
    assert_eq!(published.payload, vec![0x02]);
    assert_eq!(outcomes.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_identical_expected_opcodes_resolve_in_send_order() {
    let test = start_client(CorrelatorConfig::default());
    let outcomes = Outcomes::default();

    let r1 = test
        .client
        .send_request(
            OutboundRequest::new(0x11u32, peer(7), vec![]),
            recorder(&outcomes, 1),
        )
        .await
        .unwrap();
    let r2 = test
        .client
        .send_request(
            OutboundRequest::new(0x12u32, peer(7), vec![]),
            recorder(&outcomes, 2),
        )
        .await
        .unwrap();
    assert_ne!(r1, r2);

    test.client.deliver(peer(7), Opcode::new(0x81), vec![1]).await;
    test.client.cancel_request(r1).await.unwrap();
    assert_eq!(tags(&outcomes), vec![1]);
    assert_eq!(outcomes.lock().unwrap()[0].1, Ok(vec![1]));

    test.client.deliver(peer(7), Opcode::new(0x81), vec![2]).await;
    test.client.cancel_request(r2).await.unwrap();
    assert_eq!(tags(&outcomes), vec![1, 2]);
    assert_eq!(outcomes.lock().unwrap()[1].1, Ok(vec![2]));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_context_stops_every_callback_for_that_peer() {
    let mut test = start_client(CorrelatorConfig::default());
    let outcomes = Outcomes::default();

    for (tag, opcode, addr) in [(1, 0x10u32, 1), (2, 0x11, 1), (3, 0x10, 2)] {
        test.client
            .send_request(
                OutboundRequest::new(opcode, peer(addr), vec![]),
                recorder(&outcomes, tag),
            )
            .await
            .unwrap();
    }

    test.client.cancel_context(peer(1)).await.unwrap();
    assert_eq!(tags(&outcomes), vec![1, 2]);
    assert!(outcomes
        .lock()
        .unwrap()
        .iter()
        .all(|(_, outcome, _)| *outcome == Err(RequestError::Cancelled)));

    // A late response for the torn-down peer is a publication
    test.client.deliver(peer(1), Opcode::new(0x80), vec![]).await;
    assert_eq!(test.publications.recv().await.unwrap().context, peer(1));

    // Only peer 2's request is left to time out
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(tags(&outcomes), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_request_round_trip() {
    let TestClient {
        client,
        mut frames,
        publications: _publications,
        task: _task,
    } = start_client(CorrelatorConfig::default());

    let responder = tokio::spawn({
        let client = client.clone();
        async move {
            let frame = frames.recv().await.unwrap();
            client
                .deliver(frame.context, Opcode::new(0x80), frame.payload)
                .await;
        }
    });

    let payload = client
        .request(OutboundRequest::new(0x10u32, peer(9), vec![4, 2]))
        .await
        .unwrap();
    assert_eq!(payload, vec![4, 2]);
    responder.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_request_surfaces_timeout_as_error() {
    let test = start_client(CorrelatorConfig::testing());

    let result = test
        .client
        .request(OutboundRequest::new(0x10u32, peer(9), vec![]))
        .await;
    assert!(matches!(&result, Err(e) if e.is_timeout()));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_opcode_is_refused_synchronously() {
    let test = start_client(CorrelatorConfig::default());
    let outcomes = Outcomes::default();

    let result = test
        .client
        .send_request(
            OutboundRequest::new(0x55u32, peer(1), vec![]),
            recorder(&outcomes, 1),
        )
        .await;

    assert!(matches!(
        result,
        Err(StackError::Correlator(CorrelatorError::UnknownOpcode { .. }))
    ));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(outcomes.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_closed_transport_reports_send_failure() {
    let TestClient {
        client,
        frames,
        publications: _publications,
        task: _task,
    } = start_client(CorrelatorConfig::default());
    drop(frames);
    let outcomes = Outcomes::default();

    let id = client
        .send_request(
            OutboundRequest::new(0x10u32, peer(1), vec![]),
            recorder(&outcomes, 1),
        )
        .await;
    assert!(id.is_ok());

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        outcomes[0].1,
        Err(RequestError::SendFailed(TransportError::Closed))
    );
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_send_reaches_transport() {
    let mut test = start_client(CorrelatorConfig::default());

    test.client
        .send_unacknowledged(0x40u32, peer(3), vec![1])
        .await
        .unwrap();

    let frame = test.frames.recv().await.unwrap();
    assert_eq!(frame.opcode, Opcode::new(0x40));
    assert_eq!(frame.payload, vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_busy_policy_refuses_second_request_to_peer() {
    let test = start_client(CorrelatorConfig::serialized());

    test.client
        .send_request(OutboundRequest::new(0x10u32, peer(1), vec![]), |_| {})
        .await
        .unwrap();
    let second = test
        .client
        .send_request(OutboundRequest::new(0x11u32, peer(1), vec![]), |_| {})
        .await;

    assert!(matches!(
        second,
        Err(StackError::Correlator(CorrelatorError::Busy { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_outstanding_requests() {
    let test = start_client(CorrelatorConfig::default());
    let outcomes = Outcomes::default();

    test.client
        .send_request(
            OutboundRequest::new(0x10u32, peer(1), vec![]),
            recorder(&outcomes, 1),
        )
        .await
        .unwrap();

    assert!(test.client.shutdown().await.is_success());
    let state = test.task.await.unwrap();
    assert_eq!(state.correlator().outstanding_count(), 1);
    drop(state);

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].1, Err(RequestError::Cancelled));

    // Later calls fail fast instead of hanging
    drop(outcomes);
    assert!(test
        .client
        .send_request(OutboundRequest::new(0x10u32, peer(1), vec![]), |_| {})
        .await
        .is_err());
}
