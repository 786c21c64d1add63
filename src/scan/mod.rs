//! Discovery scanners populating the state store.

pub mod arp;
pub mod device;
pub mod interface;
pub mod network;

pub use device::DeviceScanner;
pub use interface::InterfaceScanner;
pub use network::{AccessPoint, NetworkScanner};
