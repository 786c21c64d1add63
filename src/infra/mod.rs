//! Rogue access point infrastructure managers.
//!
//! Each manager owns one external process (or the iptables reversal log) for
//! the duration of a workflow and knows how to reverse its own setup.

pub mod ap;
pub mod dhcp;
pub mod portal;
pub mod redirect;

pub use ap::ApManager;
pub use dhcp::DhcpDnsManager;
pub use portal::WebPortal;
pub use redirect::TrafficRedirector;
