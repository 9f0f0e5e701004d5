//! SSDP device table and engine: one multicast receiver, one device table keyed by remote
//! IP, and a pair of periodic tasks (`search_forever`/`notify_forever`) driven by a cycle
//! interval and a stop flag checked at the head of each tick, so cancellation is prompt
//! without thread-join machinery.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{EventBus, SsdpEvent};
use crate::net::{Receiver, Sender};

use super::message::{build_notify, build_search, Nts, SsdpMessage, MULTICAST_PORT};

const EVICTION_SWEEP: Duration = Duration::from_secs(5);

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// A row of the device table, reconstructed from the most recent M-SEARCH response or
/// NOTIFY seen from that remote IP. `last_seen` is refreshed on every subsequent ALIVE for
/// the same IP; a sweep compares it against `max_age` to evict entries whose advertised
/// cache lifetime has elapsed without a fresh ALIVE, since `ssdp:alive` is the device's only
/// positive signal — nothing else tells the table an entry is stale short of an explicit
/// BYEBYE.
#[derive(Debug, Clone)]
pub struct SsdpDevice {
    pub remote_ip: String,
    pub location: Option<String>,
    pub usn: Option<String>,
    pub server: Option<String>,
    pub last_nts: Option<Nts>,
    pub max_age: Option<u32>,
    pub last_seen: u64,
}

#[derive(Default)]
struct Devices {
    table: HashMap<String, SsdpDevice>,
}

/// The SSDP engine: joins the standard SSDP multicast group, answers/observes M-SEARCH and
/// NOTIFY traffic, and maintains the device table. Device-table mutation and event emission
/// happen under a single lock.
pub struct SsdpService {
    devices: Arc<Mutex<Devices>>,
    events: EventBus<SsdpEvent>,
    receiver: Arc<Receiver>,
    sender: Arc<Sender>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    st_filter: Option<Regex>,
    usn_filter: Option<Regex>,
}

impl SsdpService {
    /// `st_filter`/`usn_filter` gate M-SEARCH's `ST` and NOTIFY's `USN` headers
    /// respectively; `None` passes everything.
    pub fn new(
        events: EventBus<SsdpEvent>,
        st_filter: Option<Regex>,
        usn_filter: Option<Regex>,
    ) -> Result<Self, crate::error::SsdpError> {
        let receiver = Receiver::bind(
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT),
            true,
            true,
            2048,
        )?;
        receiver.join_group(Ipv4Addr::new(239, 255, 255, 250))?;
        let sender = Sender::with_default_ttl()?;
        Ok(Self {
            devices: Arc::new(Mutex::new(Devices::default())),
            events,
            receiver: Arc::new(receiver),
            sender: Arc::new(sender),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            st_filter,
            usn_filter,
        })
    }

    pub async fn devices(&self) -> Vec<SsdpDevice> {
        self.devices.lock().await.table.values().cloned().collect()
    }

    /// Empty the device table, matching `Agent::clear()`'s contract to wipe both the SSDP
    /// table and the camera registry. Does not emit `DeviceLeaved` — this is an explicit
    /// reset, not a per-device departure.
    pub async fn clear(&self) {
        self.devices.lock().await.table.clear();
    }

    /// Clone of the event bus, for subscribers constructed after this service (e.g. the
    /// Agent wiring its JOIN/BYEBYE reconciliation).
    pub fn events_handle(&self) -> EventBus<SsdpEvent> {
        self.events.clone()
    }

    /// Start the receive loop plus the periodic search/notify tasks. `search_targets` are
    /// sent every `search_cycle`; a rootdevice NOTIFY is sent every `notify_cycle` at
    /// `own_location`.
    pub async fn start(
        self: &Arc<Self>,
        search_targets: Vec<String>,
        search_cycle: Duration,
        own_usn: String,
        own_location: String,
        notify_cycle: Duration,
    ) {
        self.running.store(true, Ordering::Relaxed);

        let this = Arc::clone(self);
        let recv_task = Arc::clone(&self.receiver).start(move |payload, local, remote| {
            let this = Arc::clone(&this);
            tokio::spawn(async move {
                this.handle_datagram(&payload, local, remote).await;
            });
        });

        let search_task = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(search_cycle);
                while this.running.load(Ordering::Relaxed) {
                    ticker.tick().await;
                    if !this.running.load(Ordering::Relaxed) {
                        break;
                    }
                    this.send_search(&search_targets).await;
                }
            })
        };

        let notify_task = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(notify_cycle);
                while this.running.load(Ordering::Relaxed) {
                    ticker.tick().await;
                    if !this.running.load(Ordering::Relaxed) {
                        break;
                    }
                    this.send_notify(&own_usn, &own_location).await;
                }
            })
        };

        let eviction_task = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(EVICTION_SWEEP);
                while this.running.load(Ordering::Relaxed) {
                    ticker.tick().await;
                    if !this.running.load(Ordering::Relaxed) {
                        break;
                    }
                    this.evict_expired().await;
                }
            })
        };

        self.events.emit(SsdpEvent::Started).await;
        let mut tasks = self.tasks.lock().await;
        tasks.push(recv_task);
        tasks.push(search_task);
        tasks.push(notify_task);
        tasks.push(eviction_task);
    }

    /// Remove every entry whose `max_age` has elapsed since its last ALIVE and emit
    /// `DeviceLeaved` for each, independent of BYEBYE removal. An entry with no `max_age`
    /// (never observed in practice, but the wire format doesn't forbid it) never expires
    /// this way.
    async fn evict_expired(&self) {
        let now = now_secs();
        let expired: Vec<String> = {
            let devices = self.devices.lock().await;
            devices
                .table
                .values()
                .filter(|d| matches!(d.max_age, Some(max_age) if now.saturating_sub(d.last_seen) > max_age as u64))
                .map(|d| d.remote_ip.clone())
                .collect()
        };
        for remote_ip in expired {
            let existed = self.devices.lock().await.table.remove(&remote_ip).is_some();
            if existed {
                debug!(%remote_ip, "ssdp entry expired, evicting");
                self.events.emit(SsdpEvent::DeviceLeaved { remote_ip }).await;
            }
        }
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.receiver.stop();
        let mut tasks = self.tasks.lock().await;
        for t in tasks.drain(..) {
            t.abort();
        }
        self.events.emit(SsdpEvent::Stopped).await;
    }

    async fn send_search(&self, targets: &[String]) {
        for st in targets {
            let datagram = build_search(st, 3);
            let remote = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), MULTICAST_PORT);
            if let Err(err) = self.sender.send(remote, datagram.as_bytes(), false).await {
                warn!(error = %err, "failed to send M-SEARCH");
                continue;
            }
        }
        self.events.emit(SsdpEvent::SentSearch).await;
    }

    async fn send_notify(&self, usn: &str, location: &str) {
        let datagram = build_notify(
            "upnp:rootdevice",
            usn,
            location,
            Nts::Alive,
            super::message::DEFAULT_MAX_AGE,
        );
        let remote = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), MULTICAST_PORT);
        if let Err(err) = self.sender.send(remote, datagram.as_bytes(), false).await {
            warn!(error = %err, "failed to send NOTIFY");
            return;
        }
        self.events.emit(SsdpEvent::SentNotify).await;
    }

    async fn handle_datagram(&self, payload: &[u8], _local: SocketAddr, remote: SocketAddr) {
        let Ok(text) = std::str::from_utf8(payload) else {
            return;
        };
        let Ok(msg) = SsdpMessage::parse(text) else {
            return;
        };
        let remote_ip = remote.ip().to_string();

        if msg.is_search() {
            let st = msg.header("ST").unwrap_or_default();
            if !Self::passes(&self.st_filter, st) {
                return;
            }
            self.events
                .emit(SsdpEvent::ReceivedSearch {
                    remote_ip,
                    st: st.to_string(),
                })
                .await;
            return;
        }

        if !msg.is_notify() {
            return;
        }

        let usn = msg.header("USN").unwrap_or_default();
        if !Self::passes(&self.usn_filter, usn) {
            return;
        }

        match msg.nts() {
            Some(Nts::Alive) => {
                if msg.max_age().is_none() {
                    warn!(%remote_ip, "NOTIFY ssdp:alive missing CACHE-CONTROL max-age, dropping");
                    return;
                }
                self.events
                    .emit(SsdpEvent::ReceivedNotify {
                        remote_ip: remote_ip.clone(),
                    })
                    .await;
                let is_new = {
                    let mut devices = self.devices.lock().await;
                    let is_new = !devices.table.contains_key(&remote_ip);
                    devices.table.insert(
                        remote_ip.clone(),
                        SsdpDevice {
                            remote_ip: remote_ip.clone(),
                            location: msg.header("LOCATION").map(String::from),
                            usn: msg.header("USN").map(String::from),
                            server: msg.header("SERVER").map(String::from),
                            last_nts: Some(Nts::Alive),
                            max_age: msg.max_age(),
                            last_seen: now_secs(),
                        },
                    );
                    is_new
                };
                if is_new {
                    debug!(%remote_ip, "device joined via SSDP");
                    self.events.emit(SsdpEvent::DeviceJoined { remote_ip }).await;
                }
            }
            Some(Nts::Byebye) => {
                self.events
                    .emit(SsdpEvent::ReceivedByebye {
                        remote_ip: remote_ip.clone(),
                    })
                    .await;
                let existed = self.devices.lock().await.table.remove(&remote_ip).is_some();
                if existed {
                    self.events.emit(SsdpEvent::DeviceLeaved { remote_ip }).await;
                }
            }
            None => {}
        }
    }

    fn passes(filter: &Option<Regex>, value: &str) -> bool {
        match filter {
            Some(re) => re.is_match(value),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, SocketAddrV4};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn remote(ip: &str) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(ip.parse().unwrap(), 54321))
    }

    fn local() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT))
    }

    fn alive_packet(usn: &str) -> String {
        format!(
            "NOTIFY * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nNT: upnp_NetworkCamera\r\nNTS: ssdp:alive\r\nUSN: {usn}\r\nLOCATION: http://10.0.0.5/desc.xml\r\nCACHE-CONTROL: max-age=1800\r\n\r\n"
        )
    }

    /// An ALIVE matching the USN filter joins the device table exactly once.
    #[tokio::test]
    async fn matching_alive_joins_device_table() {
        let events = EventBus::<SsdpEvent>::new();
        let joined = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&joined);
        events
            .subscribe(move |e: &SsdpEvent| {
                if matches!(e, SsdpEvent::DeviceJoined { .. }) {
                    counter.fetch_add(1, AtomicOrdering::Relaxed);
                }
            })
            .await;
        let usn_filter = Regex::new("upnp_NetworkCamera").unwrap();
        let service = SsdpService::new(events, None, Some(usn_filter)).expect("bind ssdp socket");

        let packet = alive_packet("upnp_NetworkCamera::uuid:abc");
        service.handle_datagram(packet.as_bytes(), local(), remote("10.0.0.5")).await;

        let devices = service.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].remote_ip, "10.0.0.5");
        assert_eq!(joined.load(AtomicOrdering::Relaxed), 1);
    }

    /// A USN that misses the filter leaves the table untouched.
    #[tokio::test]
    async fn filter_miss_leaves_table_empty() {
        let events = EventBus::<SsdpEvent>::new();
        let usn_filter = Regex::new("upnp_NetworkCamera").unwrap();
        let service = SsdpService::new(events, None, Some(usn_filter)).expect("bind ssdp socket");

        let packet = alive_packet("uuid:xyz");
        service.handle_datagram(packet.as_bytes(), local(), remote("10.0.0.9")).await;

        assert!(service.devices().await.is_empty());
    }

    /// Two ALIVEs from the same IP within `max_age` leave the table size unchanged.
    #[tokio::test]
    async fn repeated_alive_is_idempotent_on_table_size() {
        let events = EventBus::<SsdpEvent>::new();
        let service = SsdpService::new(events, None, None).expect("bind ssdp socket");

        let packet = alive_packet("uuid:abc");
        service.handle_datagram(packet.as_bytes(), local(), remote("10.0.0.5")).await;
        service.handle_datagram(packet.as_bytes(), local(), remote("10.0.0.5")).await;

        assert_eq!(service.devices().await.len(), 1);
    }

    #[tokio::test]
    async fn byebye_removes_the_entry() {
        let events = EventBus::<SsdpEvent>::new();
        let service = SsdpService::new(events, None, None).expect("bind ssdp socket");

        service
            .handle_datagram(alive_packet("uuid:abc").as_bytes(), local(), remote("10.0.0.5"))
            .await;
        assert_eq!(service.devices().await.len(), 1);

        let byebye = "NOTIFY * HTTP/1.1\r\nNTS: ssdp:byebye\r\nUSN: uuid:abc\r\n\r\n";
        service.handle_datagram(byebye.as_bytes(), local(), remote("10.0.0.5")).await;
        assert!(service.devices().await.is_empty());
    }

    #[tokio::test]
    async fn evict_expired_removes_stale_entries_and_emits_leaved() {
        let events = EventBus::<SsdpEvent>::new();
        let left = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&left);
        events
            .subscribe(move |e: &SsdpEvent| {
                if matches!(e, SsdpEvent::DeviceLeaved { .. }) {
                    counter.fetch_add(1, AtomicOrdering::Relaxed);
                }
            })
            .await;
        let service = SsdpService::new(events, None, None).expect("bind ssdp socket");
        {
            let mut devices = service.devices.lock().await;
            devices.table.insert(
                "10.0.0.5".to_string(),
                SsdpDevice {
                    remote_ip: "10.0.0.5".to_string(),
                    location: None,
                    usn: None,
                    server: None,
                    last_nts: Some(Nts::Alive),
                    max_age: Some(1),
                    last_seen: now_secs().saturating_sub(10),
                },
            );
        }
        service.evict_expired().await;
        assert!(service.devices().await.is_empty());
        assert_eq!(left.load(AtomicOrdering::Relaxed), 1);
    }

    #[tokio::test]
    async fn clear_empties_the_table() {
        let events = EventBus::<SsdpEvent>::new();
        let service = SsdpService::new(events, None, None).expect("bind ssdp socket");
        service
            .handle_datagram(alive_packet("uuid:abc").as_bytes(), local(), remote("10.0.0.5"))
            .await;
        service.clear().await;
        assert!(service.devices().await.is_empty());
    }
}
