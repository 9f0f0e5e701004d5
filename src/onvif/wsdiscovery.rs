//! WS-Discovery probe: a SOAP probe body keyed by a fresh `uuid::Uuid`, a
//! `tokio::time::timeout`-bounded read loop collecting and deduping XAddrs, sent through the
//! shared multicast `Sender` rather than a one-off socket since WS-Discovery traffic rides
//! the same multicast transport SSDP uses.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use roxmltree::Document;
use tracing::warn;
use uuid::Uuid;

use crate::net::Sender;

pub const WS_DISCOVERY_PORT: u16 = 3702;
pub const WS_DISCOVERY_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

fn probe_body() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://www.w3.org/2003/05/soap-envelope" xmlns:dn="http://www.onvif.org/ver10/network/wsdl">
  <Header>
    <wsa:MessageID xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing">urn:uuid:{}</wsa:MessageID>
    <wsa:To xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing">urn:schemas-xmlsoap-org:ws:2005:04:discovery</wsa:To>
    <wsa:Action xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing">http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</wsa:Action>
  </Header>
  <Body>
    <Probe xmlns="http://schemas.xmlsoap.org/ws/2005/04/discovery">
      <Types>dn:NetworkVideoTransmitter</Types>
      <Scopes/>
    </Probe>
  </Body>
</Envelope>"#,
        Uuid::new_v4()
    )
}

fn extract_xaddrs(xml: &str) -> Vec<String> {
    let Ok(doc) = Document::parse(xml) else {
        return Vec::new();
    };
    doc.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "XAddrs")
        .and_then(|n| n.text())
        .map(|text| text.split_whitespace().map(String::from).collect())
        .unwrap_or_default()
}

/// Collect unique XAddrs for `timeout` (default 3s) by probing over the shared multicast
/// `Sender`. Errors are swallowed and logged — the returned list may be empty.
pub async fn discover(sender: &Sender, timeout: Duration) -> Vec<String> {
    let remote = SocketAddrV4::new(WS_DISCOVERY_ADDR, WS_DISCOVERY_PORT);
    let body = probe_body();
    if let Err(err) = sender.send(remote, body.as_bytes(), false).await {
        warn!(error = %err, "failed to send WS-Discovery probe");
        return Vec::new();
    }

    let mut found = HashSet::new();
    for payload in sender.recv_for(timeout).await {
        if let Ok(text) = std::str::from_utf8(&payload) {
            for xaddr in extract_xaddrs(text) {
                found.insert(xaddr);
            }
        }
    }

    let mut result: Vec<String> = found.into_iter().collect();
    result.sort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_splits_xaddrs() {
        let xml = r#"<Envelope xmlns="http://www.w3.org/2003/05/soap-envelope">
<Body><ProbeMatches xmlns="http://schemas.xmlsoap.org/ws/2005/04/discovery">
<ProbeMatch><XAddrs>http://10.0.0.5/onvif/device_service http://10.0.0.5:8080/onvif/device_service</XAddrs></ProbeMatch>
</ProbeMatches></Body></Envelope>"#;
        let xaddrs = extract_xaddrs(xml);
        assert_eq!(xaddrs.len(), 2);
        assert_eq!(xaddrs[0], "http://10.0.0.5/onvif/device_service");
    }
}
