//! Minimal SA-MP style RCON client over UDP.
//!
//! Only command delivery is implemented; replies from the server are not read.
use std::{
    net::{Ipv4Addr, SocketAddrV4, UdpSocket},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use tracing::{debug, warn};

use crate::{
    error::TransportError,
    transport::{AdminConnection, AdminConnector, AdminEvent, AdminSink, AdminTarget},
};

const PACKET_MAGIC: &[u8; 4] = b"SAMP";
const OPCODE_RCON: u8 = b'x';

/// Default [`AdminConnector`] speaking RCON over UDP.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpRconConnector;

impl AdminConnector for UdpRconConnector {
    fn connect(
        &self,
        target: &AdminTarget,
        events: AdminSink,
    ) -> Result<Box<dyn AdminConnection>, TransportError> {
        let server = server_address(target)?;
        let conn = UdpRcon {
            server,
            password: target.password.clone(),
            socket: Arc::new(Mutex::new(None)),
            ready: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let listen = format!("{}:0", target.listen);
        let socket = Arc::clone(&conn.socket);
        let ready = Arc::clone(&conn.ready);
        let closed = Arc::clone(&conn.closed);

        thread::Builder::new()
            .name("sampd-rcon".into())
            .spawn(move || match UdpSocket::bind(&listen) {
                Ok(bound) => {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    debug!("RCON socket bound on {:?} for {server}", bound.local_addr());
                    *socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(bound);
                    ready.store(true, Ordering::SeqCst);
                    events(AdminEvent::Ready);
                }
                Err(source) => {
                    warn!("Failed to bind RCON socket on {listen}: {source}");
                    events(AdminEvent::Error(TransportError::Bind {
                        address: listen,
                        source,
                    }));
                }
            })
            .map_err(TransportError::Io)?;

        Ok(Box::new(conn))
    }
}

struct UdpRcon {
    server: SocketAddrV4,
    password: String,
    socket: Arc<Mutex<Option<UdpSocket>>>,
    ready: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl AdminConnection for UdpRcon {
    fn send(&mut self, command: &str) -> Result<(), TransportError> {
        let packet = encode_packet(self.server, &self.password, command)?;
        let guard = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        let socket = guard.as_ref().ok_or(TransportError::NotConnected)?;
        socket.send_to(&packet, self.server)?;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn server_address(target: &AdminTarget) -> Result<SocketAddrV4, TransportError> {
    let ip: Ipv4Addr = target
        .bind
        .parse()
        .map_err(|_| TransportError::Address(target.bind.clone()))?;
    // A wildcard bind is reachable on loopback.
    let ip = if ip.is_unspecified() { Ipv4Addr::LOCALHOST } else { ip };
    Ok(SocketAddrV4::new(ip, target.port))
}

fn encode_packet(
    server: SocketAddrV4,
    password: &str,
    command: &str,
) -> Result<Vec<u8>, TransportError> {
    let command = command.trim_end_matches(['\r', '\n']);
    let password_len = u16::try_from(password.len())
        .map_err(|_| TransportError::Address("password too long".into()))?;
    let command_len = u16::try_from(command.len())
        .map_err(|_| TransportError::Address("command too long".into()))?;

    let mut packet = Vec::with_capacity(15 + password.len() + command.len());
    packet.extend_from_slice(PACKET_MAGIC);
    packet.extend_from_slice(&server.ip().octets());
    packet.extend_from_slice(&server.port().to_le_bytes());
    packet.push(OPCODE_RCON);
    packet.extend_from_slice(&password_len.to_le_bytes());
    packet.extend_from_slice(password.as_bytes());
    packet.extend_from_slice(&command_len.to_le_bytes());
    packet.extend_from_slice(command.as_bytes());
    Ok(packet)
}
