use std::ops::ControlFlow;

use nova_jdwp_mux::wire::Packet;
use nova_jdwp_mux::{ddms, JdwpProcess, JdwpProxy, ProxyConfig, ProxyState};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::support::{event, within, FakeVm, WireEnd};

struct RunningProxy {
    addr: std::net::SocketAddr,
    state: watch::Receiver<ProxyState>,
    cancel: CancellationToken,
    task: JoinHandle<nova_jdwp_mux::Result<()>>,
}

impl RunningProxy {
    async fn start(process: JdwpProcess) -> Self {
        let proxy = JdwpProxy::bind(process, ProxyConfig::default())
            .await
            .unwrap();
        let addr = proxy.local_addr();
        let state = proxy.state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(proxy.run(cancel.clone()));
        let mut running = Self {
            addr,
            state,
            cancel,
            task,
        };
        running.wait_awaiting().await;
        running
    }

    async fn wait_awaiting(&mut self) {
        let port = self.addr.port();
        within(
            self.state
                .wait_for(|state| *state == ProxyState::AwaitingConnection { port }),
        )
        .await
        .unwrap();
    }

    async fn wait_proxying(&mut self) {
        within(
            self.state
                .wait_for(|state| matches!(state, ProxyState::Proxying { .. })),
        )
        .await
        .unwrap();
    }

    async fn stopped(self) -> ProxyState {
        within(self.task).await.unwrap().unwrap();
        let state = self.state.borrow().clone();
        state
    }
}

/// Holds the shared session for the whole test and records the ids of the
/// VM events it sees.
fn spawn_collector(
    process: &JdwpProcess,
) -> (
    oneshot::Receiver<()>,
    mpsc::UnboundedReceiver<u32>,
    JoinHandle<nova_jdwp_mux::Result<Option<()>>>,
) {
    let (ready_tx, ready) = oneshot::channel();
    let (ids_tx, ids) = mpsc::unbounded_channel();
    let process = process.clone();
    let task = tokio::spawn(async move {
        process
            .with_jdwp_session(|shared| async move {
                shared
                    .new_receiver()
                    .with_name("collector")
                    .with_activation(move || async move {
                        let _ = ready_tx.send(());
                        Ok(())
                    })
                    .receive(|packet| {
                        if packet.is_command_of(64, 100) {
                            let _ = ids_tx.send(packet.id());
                        }
                        async { Ok(ControlFlow::<()>::Continue(())) }
                    })
                    .await
            })
            .await
    });
    (ready, ids, task)
}

#[tokio::test]
async fn debugger_coexists_with_in_process_user() {
    let vm = FakeVm::bind().await;
    let process = vm.process(200);
    let (ready, mut collected, collector) = spawn_collector(&process);
    within(ready).await.unwrap();
    let mut vm_end = vm.accept().await;

    let mut proxy = RunningProxy::start(process.clone()).await;
    let mut debugger = WireEnd::connect_debugger(proxy.addr).await;
    proxy.wait_proxying().await;

    // VirtualMachine.IDSizes from the debugger, answered by the VM.
    debugger
        .send(&Packet::command(1, 1, 7, Vec::new()).unwrap())
        .await;
    let command = vm_end.recv().await;
    assert!(command.is_command_of(1, 7));
    assert_eq!(command.id(), 1);
    vm_end
        .send(&Packet::reply(1, 0, vec![0u8; 20]).unwrap())
        .await;
    let reply = debugger.recv().await;
    assert!(reply.is_reply());
    assert_eq!(reply.id(), 1);

    // DDMS traffic stays hidden from the debugger, events do not.
    vm_end
        .send(&ddms::command_packet(0x10, *b"APNM", b"com.example").unwrap())
        .await;
    vm_end.send(&event(2)).await;
    assert_eq!(debugger.recv().await.id(), 2);
    assert_eq!(within(collected.recv()).await, Some(2));

    // The debugger leaves; the collector keeps going on the same connection.
    drop(debugger);
    proxy.wait_awaiting().await;
    vm_end.send(&event(3)).await;
    assert_eq!(within(collected.recv()).await, Some(3));
    assert!(process.is_session_active());

    // A second debugger attaches to the same VM connection.
    let mut debugger = WireEnd::connect_debugger(proxy.addr).await;
    proxy.wait_proxying().await;
    vm_end.send(&event(4)).await;
    assert_eq!(debugger.recv().await.id(), 4);
    assert_eq!(within(collected.recv()).await, Some(4));

    proxy.cancel.cancel();
    assert_eq!(proxy.stopped().await, ProxyState::Idle);
    debugger.expect_eof().await;

    drop(vm_end);
    let result = within(collector).await.unwrap();
    assert!(matches!(result, Ok(None)), "{result:?}");
}

#[tokio::test]
async fn detaching_sole_debugger_closes_vm_connection() {
    let vm = FakeVm::bind().await;
    let process = vm.process(201);
    let mut proxy = RunningProxy::start(process.clone()).await;

    let debugger = WireEnd::connect_debugger(proxy.addr).await;
    let mut vm_end = vm.accept().await;
    proxy.wait_proxying().await;
    assert!(process.is_session_active());

    drop(debugger);
    proxy.wait_awaiting().await;
    vm_end.expect_eof().await;

    proxy.cancel.cancel();
    assert_eq!(proxy.stopped().await, ProxyState::Idle);
}

#[tokio::test]
async fn vm_disconnect_stops_proxy() {
    let vm = FakeVm::bind().await;
    let process = vm.process(202);
    let proxy = RunningProxy::start(process.clone()).await;

    let mut debugger = WireEnd::connect_debugger(proxy.addr).await;
    let mut vm_end = vm.accept().await;
    vm_end.send(&event(7)).await;
    assert_eq!(debugger.recv().await.id(), 7);

    drop(vm_end);
    assert_eq!(proxy.stopped().await, ProxyState::Idle);
    debugger.expect_eof().await;
    assert!(!process.is_session_active());
}

#[tokio::test]
async fn cancel_stops_idle_proxy() {
    let vm = FakeVm::bind().await;
    let proxy = RunningProxy::start(vm.process(203)).await;
    proxy.cancel.cancel();
    assert_eq!(proxy.stopped().await, ProxyState::Idle);
}

#[tokio::test]
async fn closing_process_stops_proxy() {
    let vm = FakeVm::bind().await;
    let process = vm.process(204);
    let proxy = RunningProxy::start(process.clone()).await;
    process.close().await;
    assert_eq!(proxy.stopped().await, ProxyState::Idle);
}
