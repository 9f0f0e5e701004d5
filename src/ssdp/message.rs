//! SSDP wire format: header parsing for M-SEARCH/NOTIFY requests and builders that produce
//! the exact header casing/ordering a real ONVIF device's SSDP responder expects.

use std::collections::HashMap;
use std::fmt;

use crate::error::SsdpError;

pub const MULTICAST_ADDR: &str = "239.255.255.250";
pub const MULTICAST_PORT: u16 = 1900;
pub const DEFAULT_MAX_AGE: u32 = 1800;

/// The notification sub-type carried in a NOTIFY's `NTS` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nts {
    Alive,
    Byebye,
}

impl fmt::Display for Nts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nts::Alive => write!(f, "ssdp:alive"),
            Nts::Byebye => write!(f, "ssdp:byebye"),
        }
    }
}

impl std::str::FromStr for Nts {
    type Err = SsdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssdp:alive" => Ok(Nts::Alive),
            "ssdp:byebye" => Ok(Nts::Byebye),
            _ => Err(SsdpError::MissingHeader("NTS")),
        }
    }
}

/// The parsed method line and headers of an SSDP datagram. Header lookups are
/// case-insensitive: every key is upper-cased on insert.
#[derive(Debug, Clone, Default)]
pub struct SsdpMessage {
    pub method: String,
    pub headers: HashMap<String, String>,
}

impl SsdpMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_uppercase()).map(String::as_str)
    }

    pub fn is_search(&self) -> bool {
        self.method.starts_with("M-SEARCH")
    }

    pub fn is_notify(&self) -> bool {
        self.method.starts_with("NOTIFY")
    }

    pub fn nts(&self) -> Option<Nts> {
        self.header("NTS").and_then(|v| v.parse().ok())
    }

    /// `CACHE-CONTROL: max-age=N` is mandatory on `ssdp:alive`; callers should warn and drop
    /// the datagram when it is absent.
    pub fn max_age(&self) -> Option<u32> {
        self.header("CACHE-CONTROL")
            .and_then(|v| v.split('=').nth(1))
            .and_then(|n| n.trim().parse().ok())
    }

    pub fn parse(raw: &str) -> Result<Self, SsdpError> {
        let mut lines = raw.split("\r\n").filter(|l| !l.is_empty());
        let method = lines.next().unwrap_or_default().to_string();
        let mut headers = HashMap::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
            }
        }
        Ok(Self { method, headers })
    }
}

/// Build an `M-SEARCH * HTTP/1.1` request for service type `st`, matching
/// `createSearchContent` header-for-header.
pub fn build_search(st: &str, mx: u8) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {addr}:{port}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {mx}\r\n\
         ST: {st}\r\n\
         \r\n",
        addr = MULTICAST_ADDR,
        port = MULTICAST_PORT,
    )
}

/// Build a `NOTIFY * HTTP/1.1` request announcing `nts` for `usn`/`nt`/`location`, matching
/// `createNotifyContent`.
pub fn build_notify(nt: &str, usn: &str, location: &str, nts: Nts, max_age: u32) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: {addr}:{port}\r\n\
         CACHE-CONTROL: max-age={max_age}\r\n\
         LOCATION: {location}\r\n\
         NT: {nt}\r\n\
         NTS: {nts}\r\n\
         USN: {usn}\r\n\
         \r\n",
        addr = MULTICAST_ADDR,
        port = MULTICAST_PORT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search() {
        let raw = "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp:discover\"\r\nMX: 3\r\nST: urn:schemas-upnp-org:device:NetworkVideoTransmitter:1\r\n\r\n";
        let msg = SsdpMessage::parse(raw).unwrap();
        assert!(msg.is_search());
        assert_eq!(msg.header("MX"), Some("3"));
    }

    #[test]
    fn alive_without_max_age_is_none() {
        let raw = "NOTIFY * HTTP/1.1\r\nNTS: ssdp:alive\r\nUSN: uuid:abc\r\n\r\n";
        let msg = SsdpMessage::parse(raw).unwrap();
        assert_eq!(msg.nts(), Some(Nts::Alive));
        assert_eq!(msg.max_age(), None);
    }

    #[test]
    fn round_trips_search() {
        let raw = build_search("urn:schemas-onvif-org:device:NetworkVideoTransmitter:1", 3);
        let msg = SsdpMessage::parse(&raw).unwrap();
        assert!(msg.is_search());
        assert_eq!(msg.method, "M-SEARCH * HTTP/1.1");
        assert_eq!(msg.header("MAN"), Some("\"ssdp:discover\""));
        assert_eq!(msg.header("MX"), Some("3"));
        assert_eq!(msg.header("ST"), Some("urn:schemas-onvif-org:device:NetworkVideoTransmitter:1"));
    }

    #[test]
    fn round_trips_notify() {
        let raw = build_notify("upnp:rootdevice", "uuid:abc::upnp:rootdevice", "http://192.168.1.10/onvif/device_service", Nts::Alive, 1800);
        let msg = SsdpMessage::parse(&raw).unwrap();
        assert!(msg.is_notify());
        assert_eq!(msg.nts(), Some(Nts::Alive));
        assert_eq!(msg.max_age(), Some(1800));
        assert_eq!(msg.header("LOCATION"), Some("http://192.168.1.10/onvif/device_service"));
    }
}
