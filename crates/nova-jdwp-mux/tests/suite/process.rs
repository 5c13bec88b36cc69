use std::ops::ControlFlow;

use nova_jdwp_mux::wire::Packet;
use nova_jdwp_mux::JdwpError;
use tokio::sync::mpsc;

use super::support::{event, within, FakeVm};

#[tokio::test]
async fn handle_command_round_trip_over_tcp() {
    let vm = FakeVm::bind().await;
    let process = vm.process(100);

    let request = tokio::spawn({
        let process = process.clone();
        async move {
            process
                .with_jdwp_session(|shared| async move {
                    let id = shared.next_packet_id()?;
                    // VirtualMachine.Version
                    shared.handle_command(Packet::command(id, 1, 1, Vec::new())?).await
                })
                .await
        }
    });

    let mut peer = vm.accept().await;
    let command = peer.recv().await;
    assert!(command.is_command_of(1, 1));
    peer.send(&Packet::reply(command.id(), 0, b"17.0.2".to_vec()).unwrap())
        .await;

    let reply = within(request).await.unwrap().unwrap();
    assert!(reply.is_reply_to(&command));
    assert_eq!(&reply.payload_bytes().await.unwrap()[..], b"17.0.2");

    // Last user gone: orderly shutdown, the VM sees a clean end of stream.
    peer.expect_eof().await;
    assert!(!process.is_session_active());
}

#[tokio::test]
async fn vm_disconnect_is_reported_to_every_user() {
    let vm = FakeVm::bind().await;
    let process = vm.process(101);
    let (ids_tx, mut ids) = mpsc::unbounded_channel();

    let collector = tokio::spawn({
        let process = process.clone();
        async move {
            process
                .with_jdwp_session(|shared| async move {
                    shared
                        .new_receiver()
                        .with_name("collector")
                        .receive(|packet| {
                            let _ = ids_tx.send(packet.id());
                            async { Ok(ControlFlow::<()>::Continue(())) }
                        })
                        .await
                })
                .await
        }
    });

    let mut peer = vm.accept().await;
    peer.send(&event(1)).await;
    assert_eq!(within(ids.recv()).await, Some(1));
    drop(peer);

    let result = within(collector).await.unwrap();
    assert!(matches!(result, Ok(None)), "{result:?}");

    // A new user gets a fresh connection.
    let again = tokio::spawn({
        let process = process.clone();
        async move {
            process
                .with_jdwp_session(|shared| async move {
                    shared.new_receiver().receive_first(|_| true).await
                })
                .await
        }
    });
    let mut peer = vm.accept().await;
    peer.send(&event(2)).await;
    let packet = within(again).await.unwrap().unwrap().unwrap();
    assert_eq!(packet.id(), 2);
}

#[tokio::test]
async fn refused_connection_surfaces_as_io_error() {
    let vm = FakeVm::bind().await;
    let process = vm.process(102);
    drop(vm);

    let result = process.with_jdwp_session(|_| async { Ok(()) }).await;
    assert!(matches!(result, Err(JdwpError::Io(_))), "{result:?}");
    assert!(!process.is_session_active());
}
