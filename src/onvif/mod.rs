pub mod model;
pub mod probe;
pub mod soap;
pub mod wsdiscovery;
mod xml;

pub use model::{Encoding, OnvifInfo, Profile, Resolution, VideoSource};
pub use probe::{default_credentials, probe};
