use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nova_jdwp_mux::wire::{Packet, PacketHeader, Payload, HANDSHAKE, HEADER_LEN};
use nova_jdwp_mux::{JdwpProcess, ProcessId, ProcessOptions, TcpConnector};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .expect("timed out waiting for JDWP traffic")
}

/// A listening socket standing in for a JVM's `dt_socket` transport.
pub struct FakeVm {
    listener: TcpListener,
    addr: SocketAddr,
}

impl FakeVm {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    /// A process handle whose shared session connects to this VM.
    pub fn process(&self, pid: u32) -> JdwpProcess {
        JdwpProcess::new(
            ProcessId::new("test-device", pid),
            Arc::new(TcpConnector::new(self.addr)),
            ProcessOptions::default(),
        )
    }

    /// Accept the next connection and answer the handshake like a JVM: wait
    /// for the debugger side's magic, then echo it.
    pub async fn accept(&self) -> WireEnd {
        let (stream, _) = within(self.listener.accept()).await.unwrap();
        let mut end = WireEnd { stream };
        end.expect_handshake().await;
        end.send_handshake().await;
        end
    }
}

/// One end of a raw JDWP connection, scripted by the test.
pub struct WireEnd {
    stream: TcpStream,
}

impl WireEnd {
    /// Connect like a debugger: send the magic first, then wait for the echo.
    pub async fn connect_debugger(addr: SocketAddr) -> Self {
        let stream = within(TcpStream::connect(addr)).await.unwrap();
        stream.set_nodelay(true).unwrap();
        let mut end = Self { stream };
        end.send_handshake().await;
        end.expect_handshake().await;
        end
    }

    pub async fn send_handshake(&mut self) {
        self.stream.write_all(HANDSHAKE).await.unwrap();
    }

    pub async fn expect_handshake(&mut self) {
        let mut buf = [0u8; 14];
        within(self.stream.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, HANDSHAKE);
    }

    pub async fn send(&mut self, packet: &Packet) {
        packet.write_to(&mut self.stream).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn recv(&mut self) -> Packet {
        let mut header = [0u8; HEADER_LEN];
        within(self.stream.read_exact(&mut header)).await.unwrap();
        let header = PacketHeader::parse(&header).unwrap();
        let mut payload = vec![0u8; header.payload_len()];
        within(self.stream.read_exact(&mut payload)).await.unwrap();
        Packet::new(header, Payload::from_bytes(payload)).unwrap()
    }

    /// Wait for the peer to close its side without sending anything else.
    pub async fn expect_eof(&mut self) {
        let mut buf = [0u8; 1];
        let n = within(self.stream.read(&mut buf)).await.unwrap();
        assert_eq!(n, 0, "expected end of stream, got byte {:#04x}", buf[0]);
    }
}

/// A VM event packet (`Event.Composite`) with a recognizable payload.
pub fn event(id: u32) -> Packet {
    Packet::command(id, 64, 100, id.to_be_bytes().to_vec()).unwrap()
}
