//! Shared Pool Registry
//!
//! A fixed-size shared region where every process publishes slot counts per
//! location, so operators (and sibling processes) can see pool utilization
//! across a multi-process deployment. It is telemetry only: the authoritative
//! slot state lives in each process's [`ConnectionPool`](super::ConnectionPool).
//!
//! ## Region layout (little-endian)
//!
//! ```text
//! 0      magic        u32   0x50475247
//! 4      version      u16
//! 6      record_size  u16   32
//! 8      capacity     u32   number of records
//! 12     strtab_len   u32
//! 16     string table       NUL-terminated location names
//! 16+N   records            capacity x { pid u32, name_offset u32, counts [u32; 6] }
//! ```
//!
//! A record whose counts are all zero is free and may be claimed by any
//! process.

use super::slot::{SlotCounts, SlotState};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use procgate_common::{GatewayError, Result};
use std::path::Path;
use tracing::{debug, info};

pub const MAGIC: u32 = 0x5047_5247;
pub const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 16;
pub const RECORD_SIZE: usize = 32;
const MAX_STRTAB: usize = 8 * 1024;
const MIN_STRTAB: usize = 64;

/// Typed index of a record in the region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordIndex(pub usize);

/// Region header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    pub version: u16,
    pub record_size: u16,
    pub capacity: u32,
    pub strtab_len: u32,
}

impl RegionHeader {
    /// Layout for a region of `size` bytes
    pub fn for_size(size: usize) -> Result<Self> {
        let strtab_len = (size / 8).clamp(MIN_STRTAB, MAX_STRTAB);
        let capacity = size.saturating_sub(HEADER_SIZE + strtab_len) / RECORD_SIZE;
        if capacity == 0 {
            return Err(GatewayError::Config(format!(
                "registry region of {} bytes holds no records",
                size
            )));
        }
        Ok(Self {
            version: VERSION,
            record_size: RECORD_SIZE as u16,
            capacity: capacity as u32,
            strtab_len: strtab_len as u32,
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        let mut buf = &mut out[..HEADER_SIZE];
        buf.put_u32_le(MAGIC);
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.record_size);
        buf.put_u32_le(self.capacity);
        buf.put_u32_le(self.strtab_len);
    }

    /// Decode a header; `None` when the region was never formatted
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() < HEADER_SIZE {
            return Err(GatewayError::Config("registry region smaller than its header".into()));
        }
        let mut buf = &bytes[..HEADER_SIZE];
        if buf.get_u32_le() != MAGIC {
            return Ok(None);
        }
        let header = Self {
            version: buf.get_u16_le(),
            record_size: buf.get_u16_le(),
            capacity: buf.get_u32_le(),
            strtab_len: buf.get_u32_le(),
        };
        if header.version != VERSION || header.record_size as usize != RECORD_SIZE {
            return Err(GatewayError::Config(format!(
                "registry region has version {} / record size {}, expected {} / {}",
                header.version, header.record_size, VERSION, RECORD_SIZE
            )));
        }
        let needed = HEADER_SIZE + header.strtab_len as usize + header.capacity as usize * RECORD_SIZE;
        if needed > bytes.len() {
            return Err(GatewayError::Config(format!(
                "registry header describes {} bytes but region has {}",
                needed,
                bytes.len()
            )));
        }
        Ok(Some(header))
    }

    fn strtab_range(&self) -> std::ops::Range<usize> {
        HEADER_SIZE..HEADER_SIZE + self.strtab_len as usize
    }

    fn record_range(&self, index: RecordIndex) -> std::ops::Range<usize> {
        let start = HEADER_SIZE + self.strtab_len as usize + index.0 * RECORD_SIZE;
        start..start + RECORD_SIZE
    }
}

/// One (process, location) record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryRecord {
    pub pid: u32,
    pub name_offset: u32,
    pub counts: SlotCounts,
}

impl RegistryRecord {
    pub fn encode(&self, out: &mut [u8]) {
        let mut buf = &mut out[..RECORD_SIZE];
        buf.put_u32_le(self.pid);
        buf.put_u32_le(self.name_offset);
        for count in self.counts.0 {
            buf.put_u32_le(count);
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut buf = &bytes[..RECORD_SIZE];
        let pid = buf.get_u32_le();
        let name_offset = buf.get_u32_le();
        let mut counts = SlotCounts::default();
        for count in counts.0.iter_mut() {
            *count = buf.get_u32_le();
        }
        Self {
            pid,
            name_offset,
            counts,
        }
    }

    pub fn is_free(&self) -> bool {
        self.counts.is_zero()
    }
}

/// Find or append `name` in the string table, returning its offset
fn intern(strtab: &mut [u8], name: &str) -> Result<u32> {
    if name.is_empty() || name.as_bytes().contains(&0) {
        return Err(GatewayError::Config(format!("invalid registry location name {:?}", name)));
    }
    let mut pos = 0;
    while pos < strtab.len() && strtab[pos] != 0 {
        let end = strtab[pos..]
            .iter()
            .position(|b| *b == 0)
            .map(|n| pos + n)
            .unwrap_or(strtab.len());
        if &strtab[pos..end] == name.as_bytes() {
            return Ok(pos as u32);
        }
        pos = end + 1;
    }
    let needed = name.len() + 1;
    if pos + needed > strtab.len() {
        return Err(GatewayError::Config(format!(
            "registry string table full, cannot add '{}'",
            name
        )));
    }
    strtab[pos..pos + name.len()].copy_from_slice(name.as_bytes());
    strtab[pos + name.len()] = 0;
    Ok(pos as u32)
}

fn read_name(strtab: &[u8], offset: u32) -> Option<String> {
    let start = offset as usize;
    let rest = strtab.get(start..)?;
    let end = rest.iter().position(|b| *b == 0)?;
    String::from_utf8(rest[..end].to_vec()).ok()
}

/// Backing storage of the registry
pub trait RegistryRegion: Send + Sync {
    fn len(&self) -> usize;

    /// Run `f` with exclusive access to the region bytes
    fn with_exclusive(&self, f: &mut dyn FnMut(&mut [u8]) -> Result<()>) -> Result<()>;
}

/// Process-local region
pub struct MemoryRegion {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryRegion {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
        }
    }
}

impl RegistryRegion for MemoryRegion {
    fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    fn with_exclusive(&self, f: &mut dyn FnMut(&mut [u8]) -> Result<()>) -> Result<()> {
        let mut bytes = self.bytes.lock();
        f(&mut bytes)
    }
}

/// File-backed shared mapping, locked across processes with `flock`
#[cfg(unix)]
pub struct MappedRegion {
    file: std::fs::File,
    map: Mutex<memmap2::MmapMut>,
}

#[cfg(unix)]
impl MappedRegion {
    pub fn open(path: &Path, size: usize) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.metadata()?.len() < size as u64 {
            file.set_len(size as u64)?;
        }
        // SAFETY: the file is only modified through this mapping (or another
        // process's mapping of it) while holding the exclusive flock.
        let map = unsafe { memmap2::MmapMut::map_mut(&file)? };
        info!(path = %path.display(), size = map.len(), "Mapped shared pool registry");
        Ok(Self {
            file,
            map: Mutex::new(map),
        })
    }
}

#[cfg(unix)]
impl RegistryRegion for MappedRegion {
    fn len(&self) -> usize {
        self.map.lock().len()
    }

    fn with_exclusive(&self, f: &mut dyn FnMut(&mut [u8]) -> Result<()>) -> Result<()> {
        use nix::fcntl::{flock, FlockArg};
        use std::os::unix::io::AsRawFd;

        let mut map = self.map.lock();
        let fd = self.file.as_raw_fd();
        flock(fd, FlockArg::LockExclusive)
            .map_err(|e| GatewayError::internal(format!("registry flock failed: {}", e)))?;
        let result = f(&mut map[..]);
        if let Err(e) = flock(fd, FlockArg::Unlock) {
            debug!("registry unlock failed: {}", e);
        }
        result
    }
}

/// Cross-process registry of pool utilization
pub struct SharedPoolRegistry {
    region: Box<dyn RegistryRegion>,
    pid: u32,
}

impl SharedPoolRegistry {
    /// Open a registry over `region`, formatting it when blank
    pub fn new(region: Box<dyn RegistryRegion>) -> Result<Self> {
        let registry = Self {
            region,
            pid: std::process::id(),
        };
        let size = registry.region.len();
        registry.locked(|bytes| {
            if RegionHeader::decode(bytes)?.is_none() {
                let header = RegionHeader::for_size(size)?;
                bytes.fill(0);
                header.encode(bytes);
                debug!(capacity = header.capacity, "Formatted shared pool registry");
            }
            Ok(())
        })?;
        Ok(registry)
    }

    /// Process-local registry of `size` bytes
    pub fn in_memory(size: usize) -> Result<Self> {
        Self::new(Box::new(MemoryRegion::new(size)))
    }

    /// Registry shared through a file mapping
    #[cfg(unix)]
    pub fn mapped(path: &Path, size: usize) -> Result<Self> {
        Self::new(Box::new(MappedRegion::open(path, size)?))
    }

    /// Registry for a pid other than the current process
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn locked<T>(&self, f: impl FnOnce(&mut [u8]) -> Result<T>) -> Result<T> {
        let mut f = Some(f);
        let mut out = None;
        self.region.with_exclusive(&mut |bytes| {
            if let Some(f) = f.take() {
                out = Some(f(bytes)?);
            }
            Ok(())
        })?;
        out.ok_or_else(|| GatewayError::internal("registry callback did not run"))
    }

    fn header(bytes: &[u8]) -> Result<RegionHeader> {
        RegionHeader::decode(bytes)?
            .ok_or_else(|| GatewayError::internal("registry region is not formatted"))
    }

    /// Claim the record for (this process, `location`), publishing `initial`
    pub fn register(&self, location: &str, initial: SlotCounts) -> Result<RecordIndex> {
        let pid = self.pid;
        self.locked(|bytes| {
            let header = Self::header(bytes)?;
            let name_offset = intern(&mut bytes[header.strtab_range()], location)?;

            let mut free = None;
            for i in 0..header.capacity as usize {
                let index = RecordIndex(i);
                let record = RegistryRecord::decode(&bytes[header.record_range(index)]);
                if !record.is_free() && record.pid == pid && record.name_offset == name_offset {
                    free = Some(index);
                    break;
                }
                if record.is_free() && free.is_none() {
                    free = Some(index);
                }
            }
            let index = free.ok_or_else(|| {
                GatewayError::Config(format!("registry full, no record for location '{}'", location))
            })?;

            let record = RegistryRecord {
                pid,
                name_offset,
                counts: initial,
            };
            record.encode(&mut bytes[header.record_range(index)]);
            Ok(index)
        })
    }

    /// Overwrite the counts of a claimed record
    pub fn publish(&self, index: RecordIndex, counts: SlotCounts) -> Result<()> {
        let pid = self.pid;
        self.locked(|bytes| {
            let header = Self::header(bytes)?;
            if index.0 >= header.capacity as usize {
                return Err(GatewayError::internal(format!("registry record {} out of range", index.0)));
            }
            let range = header.record_range(index);
            let mut record = RegistryRecord::decode(&bytes[range.clone()]);
            record.pid = pid;
            record.counts = counts;
            record.encode(&mut bytes[range]);
            Ok(())
        })
    }

    /// Zero a record so any process may reuse it
    pub fn clear(&self, index: RecordIndex) -> Result<()> {
        self.locked(|bytes| {
            let header = Self::header(bytes)?;
            if index.0 >= header.capacity as usize {
                return Ok(());
            }
            RegistryRecord::default().encode(&mut bytes[header.record_range(index)]);
            Ok(())
        })
    }

    /// All claimed records with their location names
    pub fn records(&self) -> Result<Vec<(String, RegistryRecord)>> {
        self.locked(|bytes| {
            let header = Self::header(bytes)?;
            let strtab = &bytes[header.strtab_range()];
            let mut records = Vec::new();
            for i in 0..header.capacity as usize {
                let record = RegistryRecord::decode(&bytes[header.record_range(RecordIndex(i))]);
                if record.is_free() {
                    continue;
                }
                let name = read_name(strtab, record.name_offset).unwrap_or_default();
                records.push((name, record));
            }
            Ok(records)
        })
    }

    /// Counts for `location` summed over every process
    pub fn totals(&self, location: &str) -> Result<SlotCounts> {
        let mut totals = SlotCounts::default();
        for (name, record) in self.records()? {
            if name == location {
                totals.merge(&record.counts);
            }
        }
        Ok(totals)
    }

    pub fn capacity(&self) -> Result<usize> {
        self.locked(|bytes| Ok(Self::header(bytes)?.capacity as usize))
    }
}

/// Counts where every slot of a fresh pool is unused
pub fn initial_counts(capacity: usize) -> SlotCounts {
    let mut counts = SlotCounts::default();
    counts.add(SlotState::Unused, capacity as u32);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = RegionHeader::for_size(4096).unwrap();
        assert_eq!(header.strtab_len, 512);
        assert_eq!(header.capacity as usize, (4096 - 16 - 512) / 32);

        let mut bytes = vec![0u8; 4096];
        assert_eq!(RegionHeader::decode(&bytes).unwrap(), None);
        header.encode(&mut bytes);
        assert_eq!(&bytes[..4], &MAGIC.to_le_bytes());
        assert_eq!(RegionHeader::decode(&bytes).unwrap(), Some(header));
    }

    #[test]
    fn test_too_small_region_rejected() {
        assert!(RegionHeader::for_size(HEADER_SIZE + MIN_STRTAB).is_err());
    }

    #[test]
    fn test_record_codec() {
        let mut counts = SlotCounts::default();
        counts.add(SlotState::InUse, 3);
        counts.add(SlotState::Available, 2);
        let record = RegistryRecord {
            pid: 4242,
            name_offset: 17,
            counts,
        };
        let mut bytes = [0u8; RECORD_SIZE];
        record.encode(&mut bytes);
        assert_eq!(&bytes[..4], &4242u32.to_le_bytes());
        assert_eq!(RegistryRecord::decode(&bytes), record);
    }

    #[test]
    fn test_register_publish_and_reuse() {
        let registry = SharedPoolRegistry::in_memory(2048).unwrap();
        let app = registry.register("app", initial_counts(4)).unwrap();
        let shop = registry.register("shop", initial_counts(2)).unwrap();
        assert_ne!(app, shop);
        // Re-registering the same location from the same process reuses the record
        assert_eq!(registry.register("app", initial_counts(4)).unwrap(), app);

        let mut counts = initial_counts(3);
        counts.add(SlotState::InUse, 1);
        registry.publish(app, counts).unwrap();

        let records = registry.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(registry.totals("app").unwrap().get(SlotState::InUse), 1);

        registry.clear(app).unwrap();
        assert_eq!(registry.records().unwrap().len(), 1);
        // Freed record is claimed by the next registration
        assert_eq!(registry.register("other", initial_counts(1)).unwrap(), app);
    }

    #[test]
    fn test_totals_across_processes() {
        let region = std::sync::Arc::new(MemoryRegion::new(2048));

        struct Shared(std::sync::Arc<MemoryRegion>);
        impl RegistryRegion for Shared {
            fn len(&self) -> usize {
                self.0.len()
            }
            fn with_exclusive(&self, f: &mut dyn FnMut(&mut [u8]) -> Result<()>) -> Result<()> {
                self.0.with_exclusive(f)
            }
        }

        let first = SharedPoolRegistry::new(Box::new(Shared(region.clone()))).unwrap().with_pid(100);
        let second = SharedPoolRegistry::new(Box::new(Shared(region))).unwrap().with_pid(200);

        let a = first.register("app", initial_counts(2)).unwrap();
        let b = second.register("app", initial_counts(2)).unwrap();
        assert_ne!(a, b);

        let mut busy = SlotCounts::default();
        busy.add(SlotState::InUse, 2);
        second.publish(b, busy).unwrap();

        let totals = first.totals("app").unwrap();
        assert_eq!(totals.get(SlotState::Unused), 2);
        assert_eq!(totals.get(SlotState::InUse), 2);
    }

    #[test]
    fn test_string_table_full() {
        let mut strtab = [0u8; 8];
        assert_eq!(intern(&mut strtab, "ab").unwrap(), 0);
        assert_eq!(intern(&mut strtab, "cd").unwrap(), 3);
        assert_eq!(intern(&mut strtab, "ab").unwrap(), 0);
        assert!(intern(&mut strtab, "efg").is_err());
        assert_eq!(read_name(&strtab, 3).as_deref(), Some("cd"));
    }

    #[cfg(unix)]
    #[test]
    fn test_mapped_region_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.shm");
        {
            let registry = SharedPoolRegistry::mapped(&path, 4096).unwrap().with_pid(7);
            registry.register("app", initial_counts(5)).unwrap();
        }
        let reopened = SharedPoolRegistry::mapped(&path, 4096).unwrap();
        let records = reopened.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "app");
        assert_eq!(records[0].1.pid, 7);
        assert_eq!(records[0].1.counts.get(SlotState::Unused), 5);
    }
}
