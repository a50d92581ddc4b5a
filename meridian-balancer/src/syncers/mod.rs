//! Command-driven backend syncers.
//!
//! The forwarding, firewall and VIP syncers read the live configuration at
//! the start of every pass and issue only the commands needed to reach the
//! desired state. The route advertiser tracks what it announced, since
//! `gobgp` adds and deletes are safe to repeat.

pub mod bgp;
pub mod command;
pub mod iptables;
pub mod ipvs;
mod plan;
pub mod vip;

pub use bgp::BgpSyncer;
pub use command::{CommandRunner, DryRunRunner, SystemRunner};
pub use iptables::IptablesSyncer;
pub use ipvs::IpvsSyncer;
pub use vip::VipSyncer;
