//! Multicast transport: a `Receiver` that joins one or more groups and hands datagrams to a
//! callback on a background task, and a `Sender` that writes to a multicast group with a
//! configurable TTL. Built on `tokio::net::UdpSocket` with `socket2` for the
//! reuse-address/reuse-port/TTL socket options tokio does not expose directly.

use crate::error::MulticastError;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const WAITBACK_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_TTL: u32 = 4;

fn validate_multicast(ip: Ipv4Addr) -> Result<(), MulticastError> {
    let octet = ip.octets()[0];
    if (224..=239).contains(&octet) {
        Ok(())
    } else {
        Err(MulticastError::InvalidMulticastAddress(ip))
    }
}

fn bound_socket(host: SocketAddrV4, reuse_addr: bool, reuse_port: bool) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(reuse_addr)?;
    #[cfg(unix)]
    socket.set_reuse_port(reuse_port)?;
    socket.set_nonblocking(true)?;
    socket.bind(&host.into())?;
    Ok(socket.into())
}

/// Multicast listener. Binds once, joins zero or more groups, and streams received
/// datagrams to a consumer on a background task. The empty IP (`0.0.0.0`) binds any
/// interface.
pub struct Receiver {
    socket: Arc<UdpSocket>,
    groups: Mutex<HashSet<Ipv4Addr>>,
    stop: Arc<AtomicBool>,
    recv_buffer: usize,
}

impl Receiver {
    pub fn bind(host: SocketAddrV4, reuse_addr: bool, reuse_port: bool, recv_buffer: usize) -> Result<Self, MulticastError> {
        let std_socket = bound_socket(host, reuse_addr, reuse_port)?;
        let socket = UdpSocket::from_std(std_socket)?;
        Ok(Self {
            socket: Arc::new(socket),
            groups: Mutex::new(HashSet::new()),
            stop: Arc::new(AtomicBool::new(false)),
            recv_buffer,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Join a multicast group. Fails with `InvalidMulticastAddress` outside 224.0.0.0/4 and
    /// with `AddressAlreadyRegistered` for a group already joined by this receiver.
    pub fn join_group(&self, ip: Ipv4Addr) -> Result<(), MulticastError> {
        validate_multicast(ip)?;
        let mut groups = self.groups.lock().expect("groups lock poisoned");
        if groups.contains(&ip) {
            return Err(MulticastError::AddressAlreadyRegistered(ip));
        }
        self.socket.join_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)?;
        groups.insert(ip);
        Ok(())
    }

    pub fn drop_group(&self, ip: Ipv4Addr) -> Result<(), MulticastError> {
        validate_multicast(ip)?;
        let mut groups = self.groups.lock().expect("groups lock poisoned");
        if !groups.remove(&ip) {
            return Err(MulticastError::AddressNotRegistered(ip));
        }
        self.socket.leave_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)?;
        Ok(())
    }

    /// Start the receive loop. `on_receive(payload, local_addr, remote_addr)` runs on the
    /// spawned task for every datagram; the read itself is non-blocking with a 500ms poll
    /// so `stop()` is responsive without a forced cancellation.
    pub fn start<F>(self: Arc<Self>, on_receive: F) -> JoinHandle<()>
    where
        F: Fn(Vec<u8>, SocketAddr, SocketAddr) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut buf = vec![0u8; self.recv_buffer];
            let local = self.socket.local_addr().ok();
            loop {
                if self.stop.load(Ordering::Relaxed) {
                    break;
                }
                match tokio::time::timeout(POLL_INTERVAL, self.socket.recv_from(&mut buf)).await {
                    Ok(Ok((n, remote))) if n > 0 => {
                        if let Some(local) = local {
                            on_receive(buf[..n].to_vec(), local, remote);
                        }
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        warn!(error = %err, "multicast receive error, stopping listener");
                        break;
                    }
                    Err(_) => continue,
                }
            }
            debug!("multicast receive loop stopped");
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Multicast sender. Wraps an IPv4 UDP socket with a configurable TTL; `send` can
/// optionally wait up to 1s for a single reply datagram (used by M-SEARCH's unicast
/// response pattern).
pub struct Sender {
    socket: UdpSocket,
}

impl Sender {
    pub fn new(ttl: u32) -> Result<Self, MulticastError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_multicast_ttl_v4(ttl)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        Ok(Self {
            socket: UdpSocket::from_std(std_socket)?,
        })
    }

    pub fn with_default_ttl() -> Result<Self, MulticastError> {
        Self::new(DEFAULT_TTL)
    }

    pub async fn send(
        &self,
        remote: SocketAddrV4,
        payload: &[u8],
        wait_reply: bool,
    ) -> Result<Option<Vec<u8>>, MulticastError> {
        validate_multicast(*remote.ip())?;
        self.socket.send_to(payload, remote).await?;
        if !wait_reply {
            return Ok(None);
        }
        let mut buf = vec![0u8; 1024];
        match tokio::time::timeout(WAITBACK_TIMEOUT, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) if n > 0 => Ok(Some(buf[..n].to_vec())),
            _ => Ok(None),
        }
    }

    /// Collect every reply datagram arriving within `duration` (unicast responses to a
    /// probe sent with `send(.., wait_reply: false)`), used by WS-Discovery collection
    /// which needs more than one reply per probe.
    pub async fn recv_for(&self, duration: Duration) -> Vec<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + duration;
        let mut out = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((n, _))) if n > 0 => out.push(buf[..n].to_vec()),
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
        out
    }
}
