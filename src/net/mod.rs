pub mod multicast;

pub use multicast::{Receiver, Sender};
