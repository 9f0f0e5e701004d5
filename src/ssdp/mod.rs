pub mod message;
pub mod service;

pub use message::{Nts, SsdpMessage};
pub use service::{SsdpDevice, SsdpService};
