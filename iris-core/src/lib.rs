//! Engines shared by the Iris daemons.
//!
//! Everything here is I/O-free or I/O-light: the wire codecs are pure
//! functions over byte buffers, the stores are internally synchronized, and
//! the detection/fusion engines are single-threaded state machines their
//! host wraps in an actor loop. The daemons in `iris-proxy` and `irisctl`
//! own sockets, timers, and processes.

pub mod ca;
pub mod codec;
pub mod conn;
pub mod detect;
pub mod firewall;
pub mod fusion;
pub mod ipc;
pub mod ring;
pub mod scan;

pub use ca::{CaError, CertAuthority, IssuedLeaf, LeafIdentity};
pub use codec::CodecError;
pub use conn::ConnectionTable;
pub use detect::{
    DetectionEngine, EventNormalizer, RuleError, RuleSet, SigningOracle,
};
pub use firewall::{Firewall, FirewallError, FlowDescriptor};
pub use fusion::FusionEngine;
pub use ring::{RingStore, Sequenced};
pub use scan::{Scanner, ScannerRuntime};
