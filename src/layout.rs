// src/layout.rs

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::Error;
use crate::shm::SharedMemory;
use crate::state::INITIATOR_ACTIVE;

/// Size of the packet header preceding the payload area.
pub const PACKET_HEADER_BYTES: usize = 16;

/// Required alignment of a packet inside its mapping.
pub const PACKET_ALIGNMENT: usize = 8;

/// Largest payload area a packet may have.
pub const MAX_DATA_CAP: usize = u32::MAX as usize;

/// Packet header (16 bytes, at offset 0 of every packet)
#[repr(C, align(8))]
pub struct PacketHeader {
    /// Whose turn it is. Holds one of the two role-defined active values.
    pub conn_state: AtomicU32,
    /// Payload length written by the endpoint that last yielded control.
    pub data_len: AtomicU32,
    pub _reserved: [u32; 2],
}

// Compile-time size checks
const _: () = {
    assert!(std::mem::size_of::<PacketHeader>() == PACKET_HEADER_BYTES);
    assert!(std::mem::align_of::<PacketHeader>() == PACKET_ALIGNMENT);
};

impl PacketHeader {
    /// Reset the header so that `initial` holds control.
    ///
    /// Must run before either endpoint starts waiting.
    pub fn init(&self, initial: u32) {
        self.data_len.store(0, Ordering::Relaxed);
        self.conn_state.store(initial, Ordering::Release);
    }
}

impl std::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("conn_state", &self.conn_state.load(Ordering::Relaxed))
            .field("data_len", &self.data_len.load(Ordering::Relaxed))
            .finish()
    }
}

/// Bytes needed for a packet with `data_cap` bytes of payload.
pub const fn packet_size_for(data_cap: usize) -> usize {
    PACKET_HEADER_BYTES + data_cap
}

/// One packet inside a shared memory mapping.
#[derive(Debug, Clone)]
pub struct PacketWindow {
    shm: Arc<SharedMemory>,
    offset: usize,
    len: usize,
}

impl PacketWindow {
    /// Describe the packet at `offset..offset + len` of `shm`.
    pub fn new(shm: Arc<SharedMemory>, offset: usize, len: usize) -> Result<Self, Error> {
        if len < PACKET_HEADER_BYTES {
            return Err(Error::PacketTooSmall {
                len,
                min: PACKET_HEADER_BYTES,
            });
        }
        if offset % PACKET_ALIGNMENT != 0 {
            return Err(Error::Misaligned { offset });
        }
        // Payload lengths travel in the 32-bit `data_len` field.
        if len - PACKET_HEADER_BYTES > MAX_DATA_CAP {
            return Err(Error::PacketTooLarge {
                len: len - PACKET_HEADER_BYTES,
                max: MAX_DATA_CAP,
            });
        }
        match offset.checked_add(len) {
            Some(end) if end <= shm.len() => {}
            _ => {
                return Err(Error::OutOfBounds {
                    offset,
                    len,
                    size: shm.len(),
                })
            }
        }

        Ok(Self { shm, offset, len })
    }

    /// Create a fresh segment holding one packet with `data_cap` bytes of
    /// payload, initialised so the initiator holds control.
    pub fn create(name: &str, data_cap: usize) -> Result<Self, Error> {
        let len = packet_size_for(data_cap);
        let shm = SharedMemory::create(name, len).map_err(Error::Map)?;
        let window = Self::new(Arc::new(shm), 0, len)?;
        window.header().init(INITIATOR_ACTIVE);
        Ok(window)
    }

    /// Map a packet segment created by the peer.
    ///
    /// The header is left untouched; the creator initialised it.
    pub fn from_fd(fd: std::os::fd::OwnedFd, len: usize) -> Result<Self, Error> {
        let shm = SharedMemory::from_fd(fd, len).map_err(Error::Map)?;
        Self::new(Arc::new(shm), 0, len)
    }

    pub fn header(&self) -> &PacketHeader {
        // Safety: `new` checked bounds and alignment, and the mapping lives as
        // long as `self.shm`.
        unsafe { &*(self.shm.as_ptr().add(self.offset) as *const PacketHeader) }
    }

    /// Pointer to the first payload byte.
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { self.shm.as_ptr().add(self.offset + PACKET_HEADER_BYTES) }
    }

    pub fn data_cap(&self) -> usize {
        self.len - PACKET_HEADER_BYTES
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a header-only packet.
    pub fn is_empty(&self) -> bool {
        self.data_cap() == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn shm(&self) -> &Arc<SharedMemory> {
        &self.shm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(size: usize) -> Arc<SharedMemory> {
        Arc::new(SharedMemory::create("layout", size).unwrap())
    }

    #[test]
    fn create_initialises_header() {
        let window = PacketWindow::create("layout-create", 256).unwrap();

        assert_eq!(window.data_cap(), 256);
        assert_eq!(window.len(), packet_size_for(256));
        assert_eq!(
            window.header().conn_state.load(Ordering::Acquire),
            INITIATOR_ACTIVE
        );
        assert_eq!(window.header().data_len.load(Ordering::Acquire), 0);
        assert_eq!(
            window.data_ptr() as usize - window.shm().as_ptr() as usize,
            PACKET_HEADER_BYTES
        );
    }

    #[test]
    fn header_only_packet_has_no_payload() {
        let window = PacketWindow::new(segment(4096), 0, PACKET_HEADER_BYTES).unwrap();
        assert_eq!(window.data_cap(), 0);
        assert!(window.is_empty());

        let window = PacketWindow::new(segment(4096), 0, PACKET_HEADER_BYTES + 1).unwrap();
        assert!(!window.is_empty());
    }

    #[test]
    fn rejects_short_packet() {
        let err = PacketWindow::new(segment(4096), 0, PACKET_HEADER_BYTES - 1).unwrap_err();
        assert!(matches!(err, Error::PacketTooSmall { len: 15, min: 16 }));
    }

    #[test]
    fn rejects_misaligned_offset() {
        let err = PacketWindow::new(segment(4096), 4, 64).unwrap_err();
        assert!(matches!(err, Error::Misaligned { offset: 4 }));
    }

    #[test]
    fn rejects_window_past_end() {
        let err = PacketWindow::new(segment(4096), 4032, 128).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfBounds {
                offset: 4032,
                len: 128,
                size: 4096
            }
        ));

        let err = PacketWindow::new(segment(4096), usize::MAX - 7, 64).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn rejects_payload_beyond_length_field() {
        let len = PACKET_HEADER_BYTES + u32::MAX as usize + 1;
        let err = PacketWindow::new(segment(4096), 0, len).unwrap_err();
        assert!(matches!(
            err,
            Error::PacketTooLarge { len: l, max } if l == u32::MAX as usize + 1 && max == u32::MAX as usize
        ));

        // The largest payload the field can carry is only refused by the mapping size.
        let len = PACKET_HEADER_BYTES + u32::MAX as usize;
        let err = PacketWindow::new(segment(4096), 0, len).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
    }

    #[test]
    fn windows_at_different_offsets_do_not_overlap() {
        let shm = segment(4096);
        let a = PacketWindow::new(shm.clone(), 0, 1024).unwrap();
        let b = PacketWindow::new(shm, 1024, 1024).unwrap();

        a.header().init(1);
        b.header().init(2);

        assert_eq!(a.header().conn_state.load(Ordering::Acquire), 1);
        assert_eq!(b.header().conn_state.load(Ordering::Acquire), 2);
        assert_eq!(b.offset(), 1024);
    }
}
