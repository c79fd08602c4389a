//! Named shared-memory segment implementation

use std::{
    fs::File,
    sync::atomic::{AtomicU64, Ordering},
};

use memmap2::{MmapMut, MmapOptions};
use nix::{
    fcntl::OFlag,
    sys::mman::{shm_open, shm_unlink},
    sys::stat::Mode,
};

use crate::error::{PortError, Result};

/// Magic value identifying a segment created by this crate
const SEGMENT_MAGIC: u64 = 0x53484d_504f525431; // "SHMPORT1"

/// Maximum number of named objects per segment
const MAX_NAMED_OBJECTS: usize = 4;

/// Maximum length of a named-object name in bytes
const MAX_OBJECT_NAME_LENGTH: usize = 32;

/// Alignment of the first allocatable byte
const DATA_ALIGNMENT: usize = 64;

#[repr(C)]
struct NamedEntry {
    used: u32,
    name_len: u32,
    name: [u8; MAX_OBJECT_NAME_LENGTH],
    offset: u64,
}

#[repr(C)]
struct SegmentHeader {
    magic: u64,
    total_size: u64,
    alloc_cursor: AtomicU64,
    named: [NamedEntry; MAX_NAMED_OBJECTS],
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

const fn data_start() -> usize {
    align_up(std::mem::size_of::<SegmentHeader>(), DATA_ALIGNMENT)
}

/// A named host-wide shared-memory segment with an in-place allocator
///
/// The creating process writes the header and zero-fills the whole mapping
/// once (forcing physical page commit); attaching processes validate the
/// magic and size before touching anything else. Allocation is bump-only:
/// segments are sized exactly for their contents at create time and
/// destroyed as a whole.
pub struct SharedSegment {
    name: String,
    mmap: MmapMut,
    _file: File,
}

unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a new segment with `payload_size` allocatable bytes.
    ///
    /// Fails if a segment with the same name already exists.
    pub fn create(name: &str, payload_size: usize) -> Result<Self> {
        let total = data_start() + align_up(payload_size, DATA_ALIGNMENT);

        let fd = shm_open(
            Self::shm_name(name).as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| PortError::platform(format!("shm_open('{}') failed: {}", name, e)))?;

        let file = File::from(fd);
        file.set_len(total as u64)
            .map_err(|e| PortError::from_io(e, "failed to size segment"))?;

        let mut mmap = unsafe {
            MmapOptions::new()
                .len(total)
                .map_mut(&file)
                .map_err(|e| PortError::from_io(e, "failed to map segment"))?
        };

        // Touch every page up front so the data plane never faults.
        mmap[..].fill(0);

        let header = mmap.as_mut_ptr() as *mut SegmentHeader;
        unsafe {
            (*header).magic = SEGMENT_MAGIC;
            (*header).total_size = total as u64;
            (*header).alloc_cursor = AtomicU64::new(data_start() as u64);
        }

        Ok(Self {
            name: name.to_string(),
            mmap,
            _file: file,
        })
    }

    /// Attach to an existing segment by name
    pub fn open(name: &str) -> Result<Self> {
        let fd = match shm_open(Self::shm_name(name).as_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::ENOENT) => {
                return Err(PortError::segment_not_found(name));
            }
            Err(e) => {
                return Err(PortError::platform(format!(
                    "shm_open('{}') failed: {}",
                    name, e
                )));
            }
        };

        let file = File::from(fd);
        let total = file
            .metadata()
            .map_err(|e| PortError::from_io(e, "failed to stat segment"))?
            .len() as usize;

        if total < data_start() {
            return Err(PortError::corrupt(format!(
                "segment '{}' smaller than its header",
                name
            )));
        }

        let mmap = unsafe {
            MmapOptions::new()
                .len(total)
                .map_mut(&file)
                .map_err(|e| PortError::from_io(e, "failed to map segment"))?
        };

        let header = mmap.as_ptr() as *const SegmentHeader;
        let (magic, recorded) = unsafe { ((*header).magic, (*header).total_size) };
        if magic != SEGMENT_MAGIC || recorded != total as u64 {
            return Err(PortError::corrupt(format!(
                "segment '{}' has an invalid header",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            mmap,
            _file: file,
        })
    }

    /// Remove a named segment from the system.
    ///
    /// Existing mappings stay valid until unmapped; a missing segment is
    /// not an error.
    pub fn remove(name: &str) -> Result<()> {
        match shm_unlink(Self::shm_name(name).as_str()) {
            Ok(()) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(PortError::platform(format!(
                "shm_unlink('{}') failed: {}",
                name, e
            ))),
        }
    }

    /// Check whether a segment with this name currently exists
    pub fn exists(name: &str) -> bool {
        shm_open(Self::shm_name(name).as_str(), OFlag::O_RDWR, Mode::empty()).is_ok()
    }

    fn shm_name(name: &str) -> String {
        format!("/{}", name)
    }

    /// Name of the segment
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total mapped size in bytes
    pub fn total_size(&self) -> usize {
        self.mmap.len()
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.mmap.as_ptr() as *const SegmentHeader) }
    }

    fn header_mut_ptr(&self) -> *mut SegmentHeader {
        self.mmap.as_ptr() as *mut SegmentHeader
    }

    /// Allocate `size` bytes with the given alignment, returning the offset
    pub fn alloc(&self, size: usize, align: usize) -> Result<u64> {
        if size == 0 {
            return Err(PortError::invalid_parameter(
                "size",
                "allocation size must be greater than 0",
            ));
        }
        if !align.is_power_of_two() {
            return Err(PortError::invalid_parameter(
                "align",
                "alignment must be a power of 2",
            ));
        }

        let total = self.total_size();
        let cursor = &self.header().alloc_cursor;
        loop {
            let current = cursor.load(Ordering::Acquire) as usize;
            let aligned = align_up(current, align);
            let end = aligned + size;
            if end > total {
                return Err(PortError::insufficient_space(size, total - current));
            }
            match cursor.compare_exchange_weak(
                current as u64,
                end as u64,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(aligned as u64),
                Err(_) => continue,
            }
        }
    }

    /// Allocate and register an object under a well-known name.
    ///
    /// The named table is only mutated during segment construction, which
    /// the open protocol serializes with the segment's named mutex.
    pub fn alloc_named(&self, name: &str, size: usize, align: usize) -> Result<u64> {
        if name.len() > MAX_OBJECT_NAME_LENGTH {
            return Err(PortError::invalid_parameter(
                "name",
                "object name too long",
            ));
        }
        if self.find_named(name).is_some() {
            return Err(PortError::invalid_parameter(
                "name",
                "object name already registered",
            ));
        }

        let offset = self.alloc(size, align)?;

        let header = self.header_mut_ptr();
        let named = unsafe { &mut (*header).named };
        for entry in named.iter_mut() {
            if entry.used == 0 {
                entry.name_len = name.len() as u32;
                entry.name[..name.len()].copy_from_slice(name.as_bytes());
                entry.offset = offset;
                entry.used = 1;
                return Ok(offset);
            }
        }

        Err(PortError::insufficient_space(1, 0))
    }

    /// Look up the offset of an object registered with [`alloc_named`]
    ///
    /// [`alloc_named`]: Self::alloc_named
    pub fn find_named(&self, name: &str) -> Option<u64> {
        let header = self.header();
        header.named.iter().find_map(|entry| {
            if entry.used != 0
                && entry.name_len as usize == name.len()
                && &entry.name[..name.len()] == name.as_bytes()
            {
                Some(entry.offset)
            } else {
                None
            }
        })
    }

    /// Convert an offset into a typed pointer to `count` consecutive `T`s,
    /// validating bounds and alignment
    pub fn ptr_from_offset<T>(&self, offset: u64, count: usize) -> Result<*mut T> {
        let offset = offset as usize;
        let size = std::mem::size_of::<T>()
            .checked_mul(count)
            .ok_or_else(|| PortError::corrupt("object size overflow"))?;
        if offset < data_start() || offset + size > self.total_size() {
            return Err(PortError::corrupt(format!(
                "offset {} out of bounds for segment '{}'",
                offset, self.name
            )));
        }
        let addr = unsafe { self.mmap.as_ptr().add(offset) };
        if addr as usize % std::mem::align_of::<T>() != 0 {
            return Err(PortError::corrupt(format!(
                "offset {} misaligned in segment '{}'",
                offset, self.name
            )));
        }
        Ok(addr as *mut T)
    }

    /// Convert a pointer inside this segment back into its offset
    pub fn offset_from_ptr<T>(&self, ptr: *const T) -> Result<u64> {
        let base = self.mmap.as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base + data_start() || addr >= base + self.total_size() {
            return Err(PortError::corrupt(format!(
                "address outside segment '{}'",
                self.name
            )));
        }
        Ok((addr - base) as u64)
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("total_size", &self.total_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::AtomicU32;
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "shmport_test_{}_{}_{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_create_open_remove() {
        let name = unique_name("seg");
        let segment = SharedSegment::create(&name, 4096).unwrap();
        assert!(SharedSegment::exists(&name));
        assert!(segment.total_size() >= 4096);

        let attached = SharedSegment::open(&name).unwrap();
        assert_eq!(attached.total_size(), segment.total_size());

        drop(attached);
        drop(segment);
        SharedSegment::remove(&name).unwrap();
        assert!(!SharedSegment::exists(&name));
        // Removing twice is not an error.
        SharedSegment::remove(&name).unwrap();
    }

    #[test]
    fn test_open_missing_segment() {
        let err = SharedSegment::open(&unique_name("missing")).unwrap_err();
        assert!(matches!(err, PortError::SegmentNotFound { .. }));
    }

    #[test]
    fn test_named_objects_visible_across_attaches() {
        let name = unique_name("named");
        let segment = SharedSegment::create(&name, 4096).unwrap();

        let offset = segment.alloc_named("control", 128, 64).unwrap();
        assert_eq!(segment.find_named("control"), Some(offset));
        assert_eq!(segment.find_named("absent"), None);

        let attached = SharedSegment::open(&name).unwrap();
        assert_eq!(attached.find_named("control"), Some(offset));

        drop(attached);
        drop(segment);
        SharedSegment::remove(&name).unwrap();
    }

    #[test]
    fn test_alloc_alignment_and_exhaustion() {
        let name = unique_name("alloc");
        let segment = SharedSegment::create(&name, 1024).unwrap();

        let a = segment.alloc(10, 64).unwrap();
        let b = segment.alloc(10, 64).unwrap();
        assert_eq!(a % 64, 0);
        assert_eq!(b % 64, 0);
        assert!(b >= a + 10);

        let err = segment.alloc(1 << 20, 8).unwrap_err();
        assert!(matches!(err, PortError::InsufficientSpace { .. }));

        drop(segment);
        SharedSegment::remove(&name).unwrap();
    }

    #[test]
    fn test_offset_pointer_roundtrip() {
        let name = unique_name("ptr");
        let segment = SharedSegment::create(&name, 4096).unwrap();

        let offset = segment.alloc(std::mem::size_of::<u64>(), 8).unwrap();
        let ptr = segment.ptr_from_offset::<u64>(offset, 1).unwrap();
        unsafe { ptr.write(0xdead_beef) };
        assert_eq!(segment.offset_from_ptr(ptr).unwrap(), offset);

        let attached = SharedSegment::open(&name).unwrap();
        let other = attached.ptr_from_offset::<u64>(offset, 1).unwrap();
        assert_eq!(unsafe { other.read() }, 0xdead_beef);

        // Out-of-bounds offsets are rejected.
        let err = segment
            .ptr_from_offset::<u64>(segment.total_size() as u64, 1)
            .unwrap_err();
        assert!(matches!(err, PortError::Corrupt { .. }));

        drop(attached);
        drop(segment);
        SharedSegment::remove(&name).unwrap();
    }
}
