//! Packet forwarding through IPVS, driven with `ipvsadm`.
//!
//! Every pass reads the live table with `ipvsadm -Sn` and issues only the
//! commands that move it to the desired one, so a command that landed
//! after its pass gave up is simply found on the next read.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use meridian_core::{ForwardingMode, Protocol, Scheduler, StateSnapshot, SyncError, Syncer};

use super::command::{args, CommandRunner};
use super::plan::diff;

const IPVSADM: &str = "ipvsadm";

/// A virtual service as IPVS keys it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct VirtualKey {
    protocol: Protocol,
    address: IpAddr,
    port: u16,
}

impl VirtualKey {
    fn service_args(&self) -> [String; 2] {
        let flag = match self.protocol {
            Protocol::Tcp => "-t",
            Protocol::Udp => "-u",
        };
        [flag.to_string(), SocketAddr::new(self.address, self.port).to_string()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RealServer {
    weight: u32,
    mode: ForwardingMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VirtualService {
    /// `None` for a live service using a scheduler we do not manage.
    scheduler: Option<Scheduler>,
    reals: BTreeMap<SocketAddr, RealServer>,
}

type Table = BTreeMap<VirtualKey, VirtualService>;

fn mode_flag(mode: ForwardingMode) -> &'static str {
    match mode {
        ForwardingMode::Nat => "-m",
        ForwardingMode::Route => "-g",
        ForwardingMode::Tunnel => "-i",
    }
}

fn parse_scheduler(name: &str) -> Option<Scheduler> {
    [
        Scheduler::Rr,
        Scheduler::Wrr,
        Scheduler::Lc,
        Scheduler::Wlc,
        Scheduler::Sh,
        Scheduler::Dh,
    ]
    .into_iter()
    .find(|s| s.as_str() == name)
}

/// The IPVS table `state` asks for.
///
/// Services sharing a protocol, address and port cannot coexist in IPVS;
/// the one whose name sorts first is kept.
fn desired_table(state: &StateSnapshot) -> Table {
    let mut owners: BTreeMap<VirtualKey, (String, VirtualService)> = BTreeMap::new();
    for (svc, dsts) in state.pools() {
        let key = VirtualKey {
            protocol: svc.protocol,
            address: svc.address,
            port: svc.port,
        };
        let reals = dsts
            .into_iter()
            .map(|d| {
                let real = RealServer {
                    weight: d.weight,
                    mode: d.mode,
                };
                (d.socket_addr(), real)
            })
            .collect();
        let value = VirtualService {
            scheduler: Some(svc.scheduler),
            reals,
        };

        match owners.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert((svc.name.clone(), value));
            }
            Entry::Occupied(mut slot) => {
                let kept = &slot.get().0;
                let (winner, loser) = if svc.name < *kept {
                    (svc.name.clone(), kept.clone())
                } else {
                    (kept.clone(), svc.name.clone())
                };
                warn!(
                    %winner,
                    %loser,
                    address = %SocketAddr::new(key.address, key.port),
                    protocol = %key.protocol,
                    "services share a virtual address, ignoring one"
                );
                if winner == svc.name {
                    slot.insert((winner, value));
                }
            }
        }
    }
    owners.into_iter().map(|(key, (_, value))| (key, value)).collect()
}

/// One line of `ipvsadm -Sn` output.
enum Rule {
    Service(VirtualKey, Option<Scheduler>),
    Real(VirtualKey, SocketAddr, RealServer),
    /// Firewall-mark and other services this syncer does not manage.
    Foreign,
}

fn parse_rule(line: &str) -> Option<Rule> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next()?;
    let mut key = None;
    let mut scheduler = None;
    let mut real = None;
    let mut mode = ForwardingMode::Route;
    let mut weight = 1;

    while let Some(flag) = tokens.next() {
        match flag {
            "-t" | "-u" => {
                let addr: SocketAddr = tokens.next()?.parse().ok()?;
                let protocol = if flag == "-t" { Protocol::Tcp } else { Protocol::Udp };
                key = Some(VirtualKey {
                    protocol,
                    address: addr.ip(),
                    port: addr.port(),
                });
            }
            "-s" => scheduler = parse_scheduler(tokens.next()?),
            "-r" => real = Some(tokens.next()?.parse::<SocketAddr>().ok()?),
            "-w" => weight = tokens.next()?.parse().ok()?,
            "-g" => mode = ForwardingMode::Route,
            "-m" => mode = ForwardingMode::Nat,
            "-i" => mode = ForwardingMode::Tunnel,
            _ => {}
        }
    }

    let Some(key) = key else {
        return Some(Rule::Foreign);
    };
    match verb {
        "-A" => Some(Rule::Service(key, scheduler)),
        "-a" => Some(Rule::Real(key, real?, RealServer { weight, mode })),
        _ => None,
    }
}

/// Parse the output of `ipvsadm -Sn`.
fn parse_table(output: &str) -> Result<Table, SyncError> {
    let mut table = Table::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let rule = parse_rule(line)
            .ok_or_else(|| SyncError::Backend(format!("unexpected ipvsadm output: {line}")))?;
        match rule {
            Rule::Service(key, scheduler) => {
                table.insert(
                    key,
                    VirtualService {
                        scheduler,
                        reals: BTreeMap::new(),
                    },
                );
            }
            Rule::Real(key, addr, real) => {
                if let Some(svc) = table.get_mut(&key) {
                    svc.reals.insert(addr, real);
                }
            }
            Rule::Foreign => debug!(line, "ignoring unmanaged ipvs entry"),
        }
    }
    Ok(table)
}

/// Keeps the kernel IPVS table equal to the virtual services in state.
pub struct IpvsSyncer {
    runner: Arc<dyn CommandRunner>,
    serial: Mutex<()>,
}

impl IpvsSyncer {
    /// Clear the IPVS table and start from nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be cleared.
    pub async fn new(runner: Arc<dyn CommandRunner>) -> Result<Self, SyncError> {
        runner.run(IPVSADM, &args(["-C"])).await?;
        info!("ipvs table cleared");
        Ok(Self {
            runner,
            serial: Mutex::new(()),
        })
    }

    async fn ipvsadm(&self, argv: Vec<String>) -> Result<(), SyncError> {
        self.runner.run(IPVSADM, &argv).await?;
        Ok(())
    }

    async fn live_table(&self) -> Result<Table, SyncError> {
        let output = self.runner.run(IPVSADM, &args(["-Sn"])).await?;
        parse_table(&output)
    }

    async fn apply_reals(
        &self,
        key: &VirtualKey,
        live: &BTreeMap<SocketAddr, RealServer>,
        desired: &BTreeMap<SocketAddr, RealServer>,
    ) -> Result<(), SyncError> {
        let changes = diff(live, desired);
        let service = key.service_args();

        for (addr, _) in changes.removed {
            let mut argv = vec!["-d".to_string()];
            argv.extend(service.iter().cloned());
            argv.extend(args(["-r".to_string(), addr.to_string()]));
            self.ipvsadm(argv).await?;
        }
        for (verb, batch) in [("-a", changes.added), ("-e", changes.changed)] {
            for (addr, real) in batch {
                let mut argv = vec![verb.to_string()];
                argv.extend(service.iter().cloned());
                argv.extend(args([
                    "-r".to_string(),
                    addr.to_string(),
                    mode_flag(real.mode).to_string(),
                    "-w".to_string(),
                    real.weight.to_string(),
                ]));
                self.ipvsadm(argv).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Syncer for IpvsSyncer {
    async fn sync(&self, state: &StateSnapshot) -> Result<(), SyncError> {
        let desired = desired_table(state);
        let _serial = self.serial.lock().await;
        let live = self.live_table().await?;

        let services = diff(&live, &desired);
        for (key, _) in &services.removed {
            let mut argv = vec!["-D".to_string()];
            argv.extend(key.service_args());
            self.ipvsadm(argv).await?;
        }

        let no_reals = BTreeMap::new();
        for (key, want) in &desired {
            let scheduler = want.scheduler.unwrap_or_default();
            let live_reals = match live.get(key) {
                None => {
                    let mut argv = vec!["-A".to_string()];
                    argv.extend(key.service_args());
                    argv.extend(args(["-s", scheduler.as_str()]));
                    self.ipvsadm(argv).await?;
                    &no_reals
                }
                Some(have) => {
                    if have.scheduler != want.scheduler {
                        let mut argv = vec!["-E".to_string()];
                        argv.extend(key.service_args());
                        argv.extend(args(["-s", scheduler.as_str()]));
                        self.ipvsadm(argv).await?;
                    }
                    &have.reals
                }
            };
            self.apply_reals(key, live_reals, &want.reals).await?;
        }

        debug!(services = desired.len(), "ipvs in sync");
        Ok(())
    }
}
