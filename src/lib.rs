//! A peer-to-peer distributed hash table node speaking the Chord protocol:
//! consistent hashing on a 160-bit ring, logarithmic-hop lookups through a
//! finger table, successor-list replication, and periodic stabilization to
//! heal the ring under churn.

mod bucket;
mod config;
mod error;
mod id;
mod peer;
mod rpc;
mod store;

pub use bucket::{Bucket, Liveness, MAX_HOPS};
pub use config::Config;
pub use error::{Error, Result};
pub use id::{Id, ID_BITS};
pub use peer::{is_address, is_port, Peer};
pub use rpc::{RingState, RPC_TIMEOUT};
pub use store::Store;
