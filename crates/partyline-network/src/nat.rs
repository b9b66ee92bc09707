//! NAT status detection via libp2p AutoNAT and the bounded startup
//! diagnostic built on it.
//!
//! AutoNAT probes connected peers to determine whether the local node is
//! publicly reachable. [`NatManager`] maps those events to [`NatReport`]s
//! the host forwards to the startup sequence, which waits until a fixed
//! number of transports is classified with [`await_nat_classification`].
//!
//! AutoNAT keeps one status per node. A public verdict names the
//! external address it was confirmed on, and so classifies that
//! address's transport. A private verdict is node-wide and classifies
//! every transport at once.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use libp2p::autonat;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use tokio::sync::mpsc;

use partyline_types::{PartyLineError, Result};

// ---------------------------------------------------------------------------
// NatStatus
// ---------------------------------------------------------------------------

/// Observed NAT status of the local node.
///
/// Derived from `libp2p::autonat::NatStatus` but decoupled from libp2p
/// internals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NatStatus {
    /// Node is publicly reachable.
    Public,
    /// Node is behind a NAT/firewall and needs relaying or hole punching.
    BehindNat,
    /// NAT status has not been determined yet.
    Unknown,
}

impl NatStatus {
    /// Returns whether this is a definitive classification.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for NatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "Public"),
            Self::BehindNat => write!(f, "BehindNat"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// NatReport
// ---------------------------------------------------------------------------

/// One NAT classification as forwarded by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatReport {
    /// New status.
    pub status: NatStatus,
    /// Confirmed external address, when public.
    pub external_addr: Option<Multiaddr>,
}

impl NatReport {
    /// Transport of the confirmed external address (`tcp`, `udp`), or
    /// `None` when not public.
    pub fn transport(&self) -> Option<&'static str> {
        self.external_addr.as_ref().and_then(transport_of)
    }
}

/// Names the transport-layer protocol of `addr`.
pub fn transport_of(addr: &Multiaddr) -> Option<&'static str> {
    addr.iter().find_map(|p| match p {
        Protocol::Tcp(_) => Some("tcp"),
        Protocol::Udp(_) => Some("udp"),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// NatManager
// ---------------------------------------------------------------------------

/// Tracks the current NAT status from AutoNAT events.
pub struct NatManager {
    current_status: NatStatus,
    external_addr: Option<Multiaddr>,
}

impl NatManager {
    /// Creates a new `NatManager` with `Unknown` status.
    pub fn new() -> Self {
        Self {
            current_status: NatStatus::Unknown,
            external_addr: None,
        }
    }

    /// Returns the current NAT status.
    pub fn current_status(&self) -> &NatStatus {
        &self.current_status
    }

    /// Returns the confirmed external address, if any.
    pub fn external_address(&self) -> Option<&Multiaddr> {
        self.external_addr.as_ref()
    }

    /// Processes an AutoNAT event and returns a report if the status or
    /// the confirmed external address changed.
    pub fn on_autonat_event(&mut self, event: autonat::Event) -> Option<NatReport> {
        match event {
            autonat::Event::StatusChanged { old: _, new } => {
                let mapped = from_libp2p_status(&new);
                let external_addr = match new {
                    autonat::NatStatus::Public(addr) => Some(addr),
                    _ => None,
                };

                if self.current_status == mapped && self.external_addr == external_addr {
                    return None;
                }
                self.current_status = mapped;
                self.external_addr = external_addr;

                let report = NatReport {
                    status: self.current_status.clone(),
                    external_addr: self.external_addr.clone(),
                };
                tracing::info!(
                    status = %report.status,
                    external_addr = ?report.external_addr,
                    "NAT status changed"
                );
                Some(report)
            }
            autonat::Event::InboundProbe(probe) => {
                tracing::debug!(?probe, "autonat inbound probe");
                None
            }
            autonat::Event::OutboundProbe(probe) => {
                tracing::debug!(?probe, "autonat outbound probe");
                None
            }
        }
    }
}

impl Default for NatManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a libp2p `autonat::NatStatus` to our [`NatStatus`].
pub fn from_libp2p_status(status: &autonat::NatStatus) -> NatStatus {
    match status {
        autonat::NatStatus::Public(_) => NatStatus::Public,
        autonat::NatStatus::Private => NatStatus::BehindNat,
        autonat::NatStatus::Unknown => NatStatus::Unknown,
    }
}

/// Builds an `autonat::Config`.
///
/// `confidence_max` is the number of confirmations before a status is
/// stable. The first probe runs shortly after startup so a verdict can
/// arrive inside the diagnostic window.
pub fn build_autonat_config(confidence_max: usize) -> autonat::Config {
    autonat::Config {
        confidence_max,
        boot_delay: Duration::from_secs(5),
        ..autonat::Config::default()
    }
}

// ---------------------------------------------------------------------------
// Startup diagnostic
// ---------------------------------------------------------------------------

/// Waits until `expected` distinct transports have been classified.
///
/// A `Public` report classifies the transport of its external address;
/// repeats for the same transport do not count again. A `BehindNat`
/// report classifies every transport and ends the wait. `Unknown`
/// reports do not count. Each classification is logged with what it
/// means for hole punching.
///
/// # Errors
///
/// Returns `NatDiagnosticTimeout` if not enough transports are
/// classified within `timeout`, or if the report channel closes first.
pub async fn await_nat_classification(
    reports: &mut mpsc::Receiver<NatReport>,
    expected: usize,
    timeout: Duration,
) -> Result<Vec<NatReport>> {
    let mut received = Vec::new();
    let mut classified: BTreeSet<&'static str> = BTreeSet::new();
    let deadline = tokio::time::Instant::now() + timeout;

    while classified.len() < expected {
        let next = tokio::time::timeout_at(deadline, reports.recv()).await;
        let report = match next {
            Ok(Some(report)) => report,
            Ok(None) | Err(_) => {
                return Err(PartyLineError::NatDiagnosticTimeout {
                    waited_secs: timeout.as_secs(),
                    received: classified.len(),
                    expected,
                });
            }
        };
        match report.status {
            NatStatus::Unknown => continue,
            NatStatus::BehindNat => {
                log_classification(&report);
                received.push(report);
                break;
            }
            NatStatus::Public => {
                // A public verdict without an address names no transport.
                let transport = report.transport().unwrap_or("unknown");
                if classified.insert(transport) {
                    log_classification(&report);
                    received.push(report);
                }
            }
        }
    }
    Ok(received)
}

fn log_classification(report: &NatReport) {
    let transport = report.transport().unwrap_or("any");
    match report.status {
        NatStatus::Public => tracing::info!(
            transport,
            external_addr = ?report.external_addr,
            "publicly reachable; peers can dial this node directly"
        ),
        _ => tracing::info!(
            transport,
            "behind NAT; inbound peers will arrive via relay and hole punching"
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
