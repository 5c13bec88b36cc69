use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::*;
use crate::ddms;
use crate::filter::FilterId;
use crate::session::SessionOptions;
use crate::wire::{PacketHeader, Payload, HANDSHAKE, HEADER_LEN};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .expect("timed out waiting for shared session")
}

/// The VM end of a duplex socket.
struct FakeVm {
    stream: DuplexStream,
}

impl FakeVm {
    async fn expect_handshake(&mut self) {
        let mut buf = [0u8; 14];
        within(self.stream.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, HANDSHAKE);
    }

    async fn handshake(&mut self) {
        self.expect_handshake().await;
        self.stream.write_all(HANDSHAKE).await.unwrap();
    }

    async fn send(&mut self, packet: &Packet) {
        packet.write_to(&mut self.stream).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        let mut header = [0u8; HEADER_LEN];
        within(self.stream.read_exact(&mut header)).await.unwrap();
        let header = PacketHeader::parse(&header).unwrap();
        let mut payload = vec![0u8; header.payload_len()];
        within(self.stream.read_exact(&mut payload)).await.unwrap();
        Packet::new(header, Payload::from_bytes(payload)).unwrap()
    }
}

fn shared_pair_with(options: SharedSessionOptions) -> (SharedJdwpSession, FakeVm) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let session = JdwpSession::open(ours, SessionOptions::named("vm"));
    (SharedJdwpSession::new(session, options), FakeVm { stream: theirs })
}

fn shared_pair() -> (SharedJdwpSession, FakeVm) {
    shared_pair_with(SharedSessionOptions::default())
}

fn event(id: u32) -> Packet {
    Packet::command(id, 64, 100, vec![id as u8; 4]).unwrap()
}

async fn ready_flow(receiver: PacketReceiver) -> PacketFlow {
    let (ready, registered) = oneshot::channel();
    let flow = receiver
        .with_activation(move || async move {
            let _ = ready.send(());
            Ok(())
        })
        .flow();
    within(registered).await.unwrap();
    flow
}

async fn next_id(flow: &mut PacketFlow) -> u32 {
    within(flow.next()).await.unwrap().unwrap().id()
}

fn ignore_all(_: Packet) -> impl Future<Output = Result<ControlFlow<()>>> {
    async { Ok(ControlFlow::Continue(())) }
}

#[tokio::test]
async fn every_active_receiver_sees_every_packet_in_order() {
    let (shared, mut vm) = shared_pair();
    let mut flows = Vec::new();
    for i in 0..3 {
        flows.push(ready_flow(shared.new_receiver().with_name(format!("r{i}"))).await);
    }
    assert_eq!(shared.receiver_count(), 3);

    vm.handshake().await;
    for id in 1..=3 {
        vm.send(&event(id)).await;
    }

    for flow in &mut flows {
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(next_id(flow).await);
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }
}

#[tokio::test]
async fn late_receiver_gets_replay_then_live_packets_only() {
    let (shared, mut vm) = shared_pair();
    let mut early = ready_flow(shared.new_receiver().with_name("early")).await;

    vm.handshake().await;
    vm.send(&event(1)).await;
    vm.send(&event(2)).await;
    let first = within(early.next()).await.unwrap().unwrap();
    assert_eq!(first.id(), 1);
    assert_eq!(next_id(&mut early).await, 2);
    shared.add_replay_packet(&first).await.unwrap();

    let mut late = ready_flow(shared.new_receiver().with_name("late")).await;
    vm.send(&event(3)).await;

    let replayed = within(late.next()).await.unwrap().unwrap();
    assert_eq!(replayed.id(), 1);
    assert_eq!(&replayed.payload_bytes().await.unwrap()[..], &[1, 1, 1, 1]);
    assert_eq!(next_id(&mut late).await, 3);
    assert_eq!(next_id(&mut early).await, 3);
}

#[tokio::test]
async fn receiver_registered_after_ddms_traffic_sees_only_later_packets() {
    let (shared, mut vm) = shared_pair();
    let mut a = ready_flow(shared.new_receiver().with_name("a")).await;

    vm.handshake().await;
    vm.send(&ddms::command_packet(1, *b"HELO", &[0, 0, 0, 1]).unwrap()).await;
    vm.send(&ddms::command_packet(2, *b"FEAT", &[]).unwrap()).await;

    let helo = within(a.next()).await.unwrap().unwrap();
    assert!(ddms::is_ddms_command(helo.header()));
    assert_eq!(ddms::chunk_type(&helo).await.unwrap(), Some(*b"HELO"));
    assert_eq!(next_id(&mut a).await, 2);

    let mut b = ready_flow(shared.new_receiver().with_name("b")).await;
    vm.send(&event(3)).await;
    vm.send(&event(4)).await;

    for flow in [&mut a, &mut b] {
        assert_eq!(next_id(flow).await, 3);
        assert_eq!(next_id(flow).await, 4);
    }
}

#[tokio::test]
async fn end_of_stream_reaches_current_and_future_receivers() {
    let (shared, mut vm) = shared_pair();
    let mut current = ready_flow(shared.new_receiver()).await;

    vm.handshake().await;
    vm.send(&event(1)).await;
    assert_eq!(next_id(&mut current).await, 1);
    drop(vm);

    assert!(within(current.next()).await.is_none());
    let late = within(shared.new_receiver().receive(ignore_all)).await;
    assert!(matches!(late, Ok(None)), "{late:?}");
    let again = within(shared.new_receiver().receive(ignore_all)).await;
    assert!(matches!(again, Ok(None)), "{again:?}");
}

#[tokio::test]
async fn transport_failure_is_an_error_for_everyone() {
    let (shared, mut vm) = shared_pair();
    let mut current = ready_flow(shared.new_receiver()).await;

    vm.handshake().await;
    vm.stream.write_all(&[0, 0, 0]).await.unwrap();
    drop(vm);

    let err = within(current.next()).await.unwrap().unwrap_err();
    assert!(matches!(err, JdwpError::Io(_)), "{err:?}");
    let late = within(shared.new_receiver().receive(ignore_all)).await;
    assert!(matches!(late, Err(JdwpError::Io(_))), "{late:?}");
}

#[tokio::test]
async fn handle_command_returns_matching_reply() {
    let (shared, mut vm) = shared_pair();
    let id = shared.next_packet_id().unwrap();
    let command = Packet::command(id, 1, 1, Bytes::new()).unwrap();

    let request = tokio::spawn({
        let shared = shared.clone();
        async move { shared.handle_command(command).await }
    });

    vm.handshake().await;
    let received = vm.recv().await;
    assert_eq!(received.id(), id);
    assert!(received.is_command_of(1, 1));

    vm.send(&event(5)).await;
    vm.send(&Packet::reply(id, 0, vec![1, 2, 3]).unwrap()).await;

    let reply = within(request).await.unwrap().unwrap();
    assert!(reply.is_reply_to(&received));
    assert!(reply.is_offline());
    assert_eq!(&reply.payload_bytes().await.unwrap()[..], &[1, 2, 3]);
}

#[tokio::test]
async fn handle_command_fails_when_vm_disconnects_first() {
    let (shared, mut vm) = shared_pair();
    let command = Packet::command(shared.next_packet_id().unwrap(), 1, 1, Bytes::new()).unwrap();
    let request = tokio::spawn({
        let shared = shared.clone();
        async move { shared.handle_command(command).await }
    });

    vm.handshake().await;
    let _ = vm.recv().await;
    drop(vm);

    let result = within(request).await.unwrap();
    assert!(matches!(result, Err(JdwpError::Protocol(_))), "{result:?}");

    let not_a_command = Packet::reply(1, 0, Bytes::new()).unwrap();
    assert!(matches!(
        shared.handle_command(not_a_command).await,
        Err(JdwpError::InvalidPacketKind(_))
    ));
}

#[tokio::test]
async fn no_ddms_filter_hides_ddms_traffic() {
    let (shared, mut vm) = shared_pair();
    let mut filtered = ready_flow(shared.new_receiver().with_filter(FilterId::NO_DDMS)).await;
    let mut unfiltered = ready_flow(shared.new_receiver()).await;

    vm.handshake().await;
    let ddms_id = shared.next_packet_id().unwrap();
    shared
        .send_packet(ddms::command_packet(ddms_id, *b"HELO", &[]).unwrap())
        .await
        .unwrap();
    assert_eq!(vm.recv().await.id(), ddms_id);

    vm.send(&ddms::command_packet(7, *b"APNM", &[1]).unwrap()).await;
    vm.send(&Packet::reply(ddms_id, 0, Bytes::new()).unwrap()).await;
    vm.send(&event(8)).await;

    assert_eq!(next_id(&mut unfiltered).await, 7);
    assert_eq!(next_id(&mut unfiltered).await, ddms_id);
    assert_eq!(next_id(&mut unfiltered).await, 8);
    assert_eq!(next_id(&mut filtered).await, 8);
}

#[tokio::test]
async fn reader_parks_while_nobody_listens() {
    let (shared, mut vm) = shared_pair();

    let first = shared.new_receiver().receive_first(|_| true);
    let vm_side = async {
        vm.handshake().await;
        vm.send(&event(1)).await;
    };
    let (first, ()) = tokio::join!(within(first), vm_side);
    assert_eq!(first.unwrap().unwrap().id(), 1);
    assert_eq!(shared.receiver_count(), 0);

    // Sent while nobody listens: it must stay on the wire, not be dropped.
    vm.send(&event(2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = within(shared.new_receiver().receive_first(|_| true)).await;
    assert_eq!(second.unwrap().unwrap().id(), 2);
}

#[tokio::test]
async fn dropping_one_receiver_leaves_others_running() {
    let (shared, mut vm) = shared_pair();
    let gone = ready_flow(shared.new_receiver().with_name("gone")).await;
    let mut stays = ready_flow(shared.new_receiver().with_name("stays")).await;
    drop(gone);

    vm.handshake().await;
    vm.send(&event(1)).await;
    vm.send(&event(2)).await;
    assert_eq!(next_id(&mut stays).await, 1);
    assert_eq!(next_id(&mut stays).await, 2);
    assert_eq!(shared.receiver_count(), 1);
}

#[tokio::test]
async fn close_cancels_pending_receivers() {
    let (shared, _vm) = shared_pair();
    let pending = tokio::spawn({
        let shared = shared.clone();
        async move { shared.new_receiver().receive(ignore_all).await }
    });
    while shared.receiver_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shared.close();
    let result = within(pending).await.unwrap();
    assert!(matches!(result, Err(JdwpError::Cancelled)), "{result:?}");
    assert!(shared.is_closed());
    assert!(matches!(
        shared.send_packet(event(1)).await,
        Err(JdwpError::Closed(_))
    ));
    assert!(matches!(
        shared.new_receiver().receive(ignore_all).await,
        Err(JdwpError::Closed(_))
    ));
}

#[tokio::test]
async fn activation_failure_ends_receive() {
    let (shared, _vm) = shared_pair();
    let result = within(
        shared
            .new_receiver()
            .with_activation(|| async { Err(JdwpError::Protocol("no".into())) })
            .receive(ignore_all),
    )
    .await;
    assert!(matches!(result, Err(JdwpError::Protocol(_))), "{result:?}");
    assert_eq!(shared.receiver_count(), 0);
}

#[tokio::test]
async fn concurrent_sends_are_never_interleaved() {
    let (shared, mut vm) = shared_pair();
    let mut sends = Vec::new();
    for fill in 0..8u8 {
        let shared = shared.clone();
        sends.push(tokio::spawn(async move {
            let id = shared.next_packet_id()?;
            shared
                .send_packet(Packet::command(id, 1, 1, vec![fill; 512])?)
                .await
        }));
    }

    vm.expect_handshake().await;
    let mut ids = Vec::new();
    for _ in 0..8 {
        let packet = vm.recv().await;
        let payload = packet.payload_bytes().await.unwrap();
        assert_eq!(payload.len(), 512);
        assert!(payload.iter().all(|&b| b == payload[0]));
        ids.push(packet.id());
    }
    for send in sends {
        within(send).await.unwrap().unwrap();
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
}

#[tokio::test]
async fn replay_list_is_bounded() {
    let (shared, _vm) = shared_pair_with(SharedSessionOptions {
        max_replay_packets: 1,
        ..SharedSessionOptions::default()
    });
    shared.add_replay_packet(&event(1)).await.unwrap();
    shared.add_replay_packet(&event(2)).await.unwrap();

    let mut flow = ready_flow(shared.new_receiver()).await;
    assert_eq!(next_id(&mut flow).await, 1);
    assert!(tokio::time::timeout(Duration::from_millis(50), flow.next())
        .await
        .is_err());
}

#[derive(Default)]
struct CountingMonitor {
    sent: AtomicUsize,
    received: AtomicUsize,
    closed: AtomicBool,
}

impl PacketMonitor for CountingMonitor {
    fn on_send_packet(&self, _header: &crate::wire::PacketHeader) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }

    fn on_receive_packet(&self, _header: &crate::wire::PacketHeader) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn monitors_observe_both_directions() {
    let monitor = Arc::new(CountingMonitor::default());
    let (shared, mut vm) = shared_pair_with(SharedSessionOptions {
        monitors: vec![monitor.clone()],
        ..SharedSessionOptions::default()
    });

    let mut flow = ready_flow(shared.new_receiver()).await;
    vm.handshake().await;
    shared.send_packet(event(1)).await.unwrap();
    let _ = vm.recv().await;
    vm.send(&event(2)).await;
    assert_eq!(next_id(&mut flow).await, 2);

    shared.close();
    assert_eq!(monitor.sent.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.received.load(Ordering::SeqCst), 1);
    assert!(monitor.closed.load(Ordering::SeqCst));
}
