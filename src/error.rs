use thiserror::Error;

/// Errors raised by the multicast transport.
#[derive(Debug, Error)]
pub enum MulticastError {
    #[error("multicast address {0} is outside 224.0.0.0-239.255.255.255")]
    InvalidMulticastAddress(std::net::Ipv4Addr),
    #[error("group {0} is already registered")]
    AddressAlreadyRegistered(std::net::Ipv4Addr),
    #[error("group {0} is not registered")]
    AddressNotRegistered(std::net::Ipv4Addr),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while parsing or handling SSDP wire content.
#[derive(Debug, Error)]
pub enum SsdpError {
    #[error("message is missing required header {0}")]
    MissingHeader(&'static str),
    #[error(transparent)]
    Multicast(#[from] MulticastError),
}

/// Errors raised by the ONVIF probe.
#[derive(Debug, Error)]
pub enum OnvifError {
    #[error("service url {0} does not use the http scheme")]
    UnsupportedScheme(String),
    #[error("no credential in the supplied list authenticated")]
    AuthExhausted,
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("malformed SOAP response: {0}")]
    Xml(String),
}
