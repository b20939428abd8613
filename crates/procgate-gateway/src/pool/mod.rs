//! Backend session pooling
//!
//! - [`manager`]: per-location slot array, leases, purge
//! - [`registry`]: cross-process utilization counters in a shared region
//! - [`slot`]: slot states and counts

pub mod manager;
pub mod registry;
pub mod slot;

pub use manager::{ConnectionPool, PoolStats, SlotLease};
#[cfg(unix)]
pub use registry::MappedRegion;
pub use registry::{MemoryRegion, RecordIndex, RegistryRecord, RegistryRegion, SharedPoolRegistry};
pub use slot::{PoolSlot, SlotCounts, SlotIndex, SlotState};
