//! The Agent: owns the camera registry, starts the SSDP engine, reconciles SSDP JOIN/BYEBYE
//! against it, and runs ONVIF probes for the seed list and for ad hoc WS-Discovery sweeps.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use roxmltree::Document;
use tracing::{debug, warn};

use crate::error::OnvifError;
use crate::events::{AgentEvent, EventBus, SsdpEvent};
use crate::net::Sender;
use crate::onvif::{self, wsdiscovery, OnvifInfo};
use crate::registry::{Camera, CameraRegistry};
use crate::seed::SeedCamera;
use crate::ssdp::SsdpService;

const SEED_PROBE_DEADLINE: Duration = Duration::from_secs(5);

pub struct Agent {
    registry: Arc<CameraRegistry>,
    ssdp: Arc<SsdpService>,
    events: EventBus<AgentEvent>,
    wsdiscovery_sender: Arc<Sender>,
    http: Client,
}

impl Agent {
    pub fn new(ssdp: Arc<SsdpService>, wsdiscovery_sender: Arc<Sender>, events: EventBus<AgentEvent>) -> Self {
        Self {
            registry: Arc::new(CameraRegistry::new()),
            ssdp,
            events,
            wsdiscovery_sender,
            http: Client::builder()
                .timeout(Duration::from_secs(5))
                .danger_accept_invalid_certs(true)
                .build()
                .expect("static reqwest client config"),
        }
    }

    pub fn registry(&self) -> Arc<CameraRegistry> {
        Arc::clone(&self.registry)
    }

    /// Start the SSDP engine and wire its JOIN/BYEBYE events into the registry. Does not run
    /// the initial seed-list probe — callers should call `renew_seed_list` separately once
    /// seeds are loaded, so a pure-SSDP session can start without a seed list at all.
    pub async fn start(
        self: &Arc<Self>,
        search_targets: Vec<String>,
        search_cycle: Duration,
        own_usn: String,
        own_location: String,
        notify_cycle: Duration,
    ) {
        let this = Arc::clone(self);
        self.ssdp
            .events_handle()
            .subscribe(move |event: &SsdpEvent| {
                let this = Arc::clone(&this);
                let event = event.clone();
                tokio::spawn(async move {
                    this.on_ssdp_event(event).await;
                });
            })
            .await;
        self.ssdp
            .start(search_targets, search_cycle, own_usn, own_location, notify_cycle)
            .await;
    }

    pub async fn stop(&self) {
        self.ssdp.stop().await;
        self.registry.clear().await;
    }

    /// `clear()`: empty both the SSDP device table and the camera registry.
    pub async fn clear(&self) {
        self.ssdp.clear().await;
        self.registry.clear().await;
    }

    pub async fn discover(&self, timeout: Duration) -> Vec<String> {
        wsdiscovery::discover(&self.wsdiscovery_sender, timeout).await
    }

    pub async fn get_onvif_info(&self, url: &str, auths: Option<Vec<(String, String)>>) -> Result<Option<OnvifInfo>, OnvifError> {
        onvif::probe(url, auths).await
    }

    pub async fn find(&self, ip: Option<&str>, name: Option<&str>) -> Vec<Camera> {
        match (ip, name) {
            (Some(ip), _) => self.registry.find_by_ip(ip).await.into_iter().collect(),
            (None, Some(name)) => self.registry.find_by_name(name).await,
            (None, None) => self.registry.all().await,
        }
    }

    /// `discover_and_probe`: probe each WS-Discovery URL, reconciling against the
    /// registry by IP. FOUND for a genuinely new IP; UPDATE when an existing record either
    /// has no profiles yet or `by_proc` is false (forcing a refresh even if it does).
    pub async fn discover_and_probe(&self, timeout: Duration, by_proc: bool) {
        let urls = self.discover(timeout).await;
        for url in urls {
            let info = match onvif::probe(&url, None).await {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(err) => {
                    debug!(%url, error = %err, "onvif probe failed during discover_and_probe");
                    continue;
                }
            };
            let Some((ip, port)) = parse_ip_port(&url) else { continue };
            let existing = self.registry.find_by_ip(&ip).await;
            match existing {
                None => {
                    let mut camera = Camera::new(ip.clone(), port, url.clone());
                    camera.apply_onvif_info(info);
                    self.registry.insert(camera).await;
                    self.events.emit(AgentEvent::Found { ip, service_url: url }).await;
                }
                Some(existing) => {
                    let needs_update = existing.profiles.is_none() || !by_proc;
                    self.registry
                        .with_mut(&ip, port, |c| {
                            c.touch();
                            c.host_name = info.host_name.clone();
                            if needs_update {
                                c.service_url = url.clone();
                                c.apply_onvif_info(info.clone());
                            }
                        })
                        .await;
                    if needs_update {
                        self.events.emit(AgentEvent::Updated { ip }).await;
                    }
                }
            }
        }
    }

    /// Probe every seed camera with a per-task 5s join budget. Stragglers past the deadline
    /// are orphaned — their (possibly late) result is dropped rather than cancelled or
    /// awaited further.
    pub async fn renew_seed_list(&self, seeds: &[SeedCamera]) {
        for seed in seeds {
            let service_url = seed.service_url();
            let auths = seed.credentials();
            let probe = onvif::probe(&service_url, auths);
            let result = tokio::time::timeout(SEED_PROBE_DEADLINE, probe).await;
            let info = match result {
                Ok(Ok(Some(info))) => info,
                Ok(Ok(None)) => continue,
                Ok(Err(err)) => {
                    warn!(ip = %seed.ip, error = %err, "seed onvif probe failed");
                    continue;
                }
                Err(_) => {
                    warn!(ip = %seed.ip, "seed onvif probe exceeded 5s join budget, dropping result");
                    continue;
                }
            };
            let mut camera = Camera::new(seed.ip.clone(), seed.port, service_url.clone());
            camera.id = seed.id.clone();
            let mut info = info;
            for profile in info.profiles.iter_mut() {
                profile.selected = profile.name == seed.profile;
            }
            camera.apply_onvif_info(info);
            let is_new = self.registry.upsert(camera).await;
            if is_new {
                self.events
                    .emit(AgentEvent::Found {
                        ip: seed.ip.clone(),
                        service_url,
                    })
                    .await;
            } else {
                self.events
                    .emit(AgentEvent::Updated { ip: seed.ip.clone() })
                    .await;
            }
        }
    }

    /// On BYEBYE, marks the matching record `alive = false` but keeps it in the registry —
    /// losing a probed camera's profiles on every transient BYEBYE would force a full
    /// re-probe on rejoin, and the SSDP engine's own device-table removal already handles
    /// departure at the transport layer. Full removal is left to `clear()`.
    async fn on_ssdp_event(&self, event: SsdpEvent) {
        match event {
            SsdpEvent::DeviceJoined { remote_ip } => self.on_device_joined(remote_ip).await,
            SsdpEvent::DeviceLeaved { remote_ip } => {
                if let Some(existing) = self.registry.find_by_ip(&remote_ip).await {
                    if existing.alive {
                        self.registry
                            .with_mut(&remote_ip, existing.port, |c| c.alive = false)
                            .await;
                        self.events.emit(AgentEvent::Offline { ip: remote_ip }).await;
                    }
                }
            }
            _ => {}
        }
    }

    async fn on_device_joined(&self, remote_ip: String) {
        let devices = self.ssdp.devices().await;
        let Some(device) = devices.into_iter().find(|d| d.remote_ip == remote_ip) else {
            return;
        };
        let Some(location) = device.location else {
            return;
        };

        let existing = self.registry.find_by_ip(&remote_ip).await;
        if let Some(existing) = existing {
            let needs_probe = existing.profiles.is_none();
            let was_offline = !existing.alive;
            self.registry
                .with_mut(&remote_ip, existing.port, |c| c.touch())
                .await;
            if was_offline {
                self.events.emit(AgentEvent::Online { ip: remote_ip.clone() }).await;
            }
            if needs_probe {
                if let Ok(Some(info)) = onvif::probe(&existing.service_url, None).await {
                    self.registry
                        .with_mut(&remote_ip, existing.port, |c| c.apply_onvif_info(info))
                        .await;
                    self.events.emit(AgentEvent::Updated { ip: remote_ip }).await;
                }
            }
            return;
        }

        let description = match self.http.get(&location).send().await {
            Ok(res) => match res.text().await {
                Ok(text) => text,
                Err(_) => return,
            },
            Err(err) => {
                debug!(%location, error = %err, "failed to fetch SSDP LOCATION document");
                return;
            }
        };

        let (host, _friendly_name) = parse_device_description(&description, &remote_ip);
        let service_url = format!("http://{host}/onvif/device_service");

        let info = match onvif::probe(&service_url, None).await {
            Ok(Some(info)) => Some(info),
            Ok(None) => None,
            Err(err) => {
                debug!(%service_url, error = %err, "onvif probe failed for ssdp-joined device");
                None
            }
        };

        let mut camera = Camera::new(remote_ip.clone(), 80, service_url.clone());
        camera.max_age = device.max_age;
        if let Some(info) = info {
            camera.apply_onvif_info(info);
        }
        self.registry.insert(camera).await;
        self.events
            .emit(AgentEvent::Joined { ip: remote_ip })
            .await;
    }
}

/// Parse `presentationURL` (falls back to the SSDP remote IP) and `friendlyName` out of a
/// UPnP-style device description document via a tree walk rather than a fragile regex.
fn parse_device_description(xml: &str, fallback_ip: &str) -> (String, String) {
    let Ok(doc) = Document::parse(xml) else {
        return (fallback_ip.to_string(), String::new());
    };
    let presentation_url = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "presentationURL")
        .and_then(|n| n.text())
        .map(str::trim);
    let friendly_name = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "friendlyName")
        .and_then(|n| n.text())
        .unwrap_or_default()
        .to_string();

    let host = presentation_url
        .and_then(|u| url::Url::parse(u).ok())
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| fallback_ip.to_string());

    (host, friendly_name)
}

fn parse_ip_port(service_url: &str) -> Option<(String, u16)> {
    let url = url::Url::parse(service_url).ok()?;
    let ip = url.host_str()?.to_string();
    let port = url.port().unwrap_or(80);
    Some((ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_presentation_url_and_friendly_name() {
        let xml = r#"<root xmlns="urn:schemas-upnp-org:device-1-0">
<device><friendlyName>Hallway Cam</friendlyName><presentationURL>http://10.0.0.5:8080/</presentationURL></device>
</root>"#;
        let (host, name) = parse_device_description(xml, "10.0.0.5");
        assert_eq!(host, "10.0.0.5");
        assert_eq!(name, "Hallway Cam");
    }

    #[test]
    fn falls_back_to_ssdp_ip_without_presentation_url() {
        let xml = r#"<root><device><friendlyName>Cam</friendlyName></device></root>"#;
        let (host, _) = parse_device_description(xml, "192.168.1.9");
        assert_eq!(host, "192.168.1.9");
    }

    #[test]
    fn parses_ip_and_port_from_service_url() {
        assert_eq!(
            parse_ip_port("http://10.0.0.5:8080/onvif/device_service"),
            Some(("10.0.0.5".to_string(), 8080))
        );
        assert_eq!(
            parse_ip_port("http://10.0.0.5/onvif/device_service"),
            Some(("10.0.0.5".to_string(), 80))
        );
    }

    fn test_agent() -> Arc<Agent> {
        let ssdp = Arc::new(SsdpService::new(EventBus::new(), None, None).expect("bind ssdp socket"));
        let sender = Arc::new(Sender::with_default_ttl().expect("open wsdiscovery socket"));
        Arc::new(Agent::new(ssdp, sender, EventBus::new()))
    }

    /// BYEBYE marks the record offline rather than leaving `alive` untouched.
    #[tokio::test]
    async fn byebye_marks_existing_record_offline_and_emits_once() {
        let agent = test_agent();
        let mut camera = Camera::new("10.0.0.5", 80, "http://10.0.0.5/onvif/device_service");
        camera.alive = true;
        agent.registry.insert(camera).await;

        agent
            .on_ssdp_event(SsdpEvent::DeviceLeaved { remote_ip: "10.0.0.5".to_string() })
            .await;
        assert!(!agent.registry.find_by_ip("10.0.0.5").await.unwrap().alive);

        // A second LEAVED for an already-offline record must not re-emit OFFLINE.
        let offline_events = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&offline_events);
        agent
            .events
            .subscribe(move |e: &AgentEvent| {
                if matches!(e, AgentEvent::Offline { .. }) {
                    counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            })
            .await;
        agent
            .on_ssdp_event(SsdpEvent::DeviceLeaved { remote_ip: "10.0.0.5".to_string() })
            .await;
        assert_eq!(offline_events.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn clear_empties_both_tables() {
        let agent = test_agent();
        agent
            .registry
            .insert(Camera::new("10.0.0.5", 80, "http://10.0.0.5/onvif/device_service"))
            .await;
        agent.clear().await;
        assert!(agent.registry.all().await.is_empty());
    }
}
