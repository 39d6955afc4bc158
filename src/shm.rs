//! Cross-process bounded ring queue over POSIX shared memory
//!
//! A fixed-capacity circular buffer of fixed-shape frames, shared between
//! the relay process and the inference worker. One `shm_open` segment
//! holds a `#[repr(C)]` header (ring pointers, stop flag, process-shared
//! semaphores and mutexes), a per-slot frame-id array, and the slot data.
//!
//! `put` and `get` block on the semaphores; there is no spinning. The
//! producer lock guards the tail, the consumer lock guards the head, so a
//! producer and a consumer never contend. A slot's bytes are fully copied
//! before the full semaphore is released, so consumers only ever observe
//! committed frames.
//!
//! `stop()` releases the full semaphore `capacity` times; any `get` that
//! wakes with the flag set puts its tokens back and reports
//! [`ShmError::Stopped`]. A process that dies while holding a lock is not
//! recoverable here; the session controller tears the rings down and
//! recreates them.

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd};
use std::ptr::{addr_of_mut, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

const RING_MAGIC: u32 = 0x464C_5251; // "FLRQ"

#[derive(Error, Debug)]
pub enum ShmError {
    #[error("shared memory error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("queue stopped")]
    Stopped,

    #[error("frame size mismatch: slot is {slot} bytes, frame is {frame}")]
    WrongSize { slot: usize, frame: usize },

    #[error("segment {0} is not a frame ring")]
    BadMagic(String),

    #[error("segment {name} too small: {actual} < {expected}")]
    Truncated {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Fixed slot shape; every frame in the ring has exactly these dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl FrameShape {
    pub const fn bgr(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            channels: 3,
        }
    }

    pub fn slot_size(&self) -> usize {
        (self.width * self.height * self.channels) as usize
    }
}

#[repr(C)]
struct RingHeader {
    magic: u32,
    capacity: u32,
    slot_size: u32,
    width: u32,
    height: u32,
    channels: u32,
    stopping: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
    _pad: [u32; 3],
    sem_full: libc::sem_t,
    sem_empty: libc::sem_t,
    put_lock: libc::pthread_mutex_t,
    get_lock: libc::pthread_mutex_t,
}

fn segment_size(capacity: usize, slot_size: usize) -> usize {
    std::mem::size_of::<RingHeader>() + capacity * std::mem::size_of::<u32>() + capacity * slot_size
}

/// One endpoint of the shared ring. The creating side owns the segment
/// and unlinks it on drop; openers just unmap.
pub struct ShmRing {
    name: String,
    owner: bool,
    base: NonNull<libc::c_void>,
    map_len: usize,
    capacity: usize,
    slot_size: usize,
}

// The raw pointer is into a MAP_SHARED region whose concurrent access is
// mediated by the in-segment semaphores and mutexes.
unsafe impl Send for ShmRing {}
unsafe impl Sync for ShmRing {}

impl ShmRing {
    /// Creates and initializes a new segment. Fails if the name exists.
    pub fn create(name: &str, shape: FrameShape, capacity: usize) -> Result<Self, ShmError> {
        let slot_size = shape.slot_size();
        let map_len = segment_size(capacity, slot_size);

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        ftruncate(&fd, map_len as libc::off_t)?;
        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(map_len).expect("segment size is nonzero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )?
        };

        let ring = Self {
            name: name.to_string(),
            owner: true,
            base,
            map_len,
            capacity,
            slot_size,
        };

        unsafe {
            let hdr = ring.header_ptr();
            sem_init(addr_of_mut!((*hdr).sem_full), 0)?;
            sem_init(addr_of_mut!((*hdr).sem_empty), capacity as u32)?;
            mutex_init(addr_of_mut!((*hdr).put_lock))?;
            mutex_init(addr_of_mut!((*hdr).get_lock))?;

            (*hdr).capacity = capacity as u32;
            (*hdr).slot_size = slot_size as u32;
            (*hdr).width = shape.width;
            (*hdr).height = shape.height;
            (*hdr).channels = shape.channels;
            (*hdr).head = AtomicU32::new(0);
            (*hdr).tail = AtomicU32::new(0);
            (*hdr).stopping = AtomicU32::new(0);
            // Magic last: openers treat it as the init barrier.
            (*hdr).magic = RING_MAGIC;
        }

        debug!(name, capacity, slot_size, "shared ring created");
        Ok(ring)
    }

    /// Opens an existing segment created by another process.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())?;
        let stat = nix::sys::stat::fstat(fd.as_raw_fd())?;
        let map_len = stat.st_size as usize;
        if map_len < std::mem::size_of::<RingHeader>() {
            return Err(ShmError::Truncated {
                name: name.to_string(),
                expected: std::mem::size_of::<RingHeader>(),
                actual: map_len,
            });
        }

        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(map_len).expect("segment size is nonzero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )?
        };

        let mut ring = Self {
            name: name.to_string(),
            owner: false,
            base,
            map_len,
            capacity: 0,
            slot_size: 0,
        };

        let (magic, capacity, slot_size) = {
            let hdr = unsafe { ring.header() };
            (hdr.magic, hdr.capacity as usize, hdr.slot_size as usize)
        };
        if magic != RING_MAGIC {
            return Err(ShmError::BadMagic(name.to_string()));
        }
        ring.capacity = capacity;
        ring.slot_size = slot_size;

        let expected = segment_size(ring.capacity, ring.slot_size);
        if map_len < expected {
            return Err(ShmError::Truncated {
                name: name.to_string(),
                expected,
                actual: map_len,
            });
        }

        debug!(
            name,
            capacity = ring.capacity,
            slot_size = ring.slot_size,
            "shared ring opened"
        );
        Ok(ring)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// The fixed shape every slot was created with.
    pub fn shape(&self) -> FrameShape {
        let hdr = unsafe { self.header() };
        FrameShape {
            width: hdr.width,
            height: hdr.height,
            channels: hdr.channels,
        }
    }

    /// Blocks until a slot is free, then commits `frame` under `frame_id`.
    pub fn put(&self, frame: &[u8], frame_id: u32) -> Result<(), ShmError> {
        if frame.len() != self.slot_size {
            return Err(ShmError::WrongSize {
                slot: self.slot_size,
                frame: frame.len(),
            });
        }
        let hdr = unsafe { self.header() };
        if hdr.stopping.load(Ordering::SeqCst) != 0 {
            return Err(ShmError::Stopped);
        }

        sem_wait(self.sem_empty())?;
        if hdr.stopping.load(Ordering::SeqCst) != 0 {
            sem_post(self.sem_empty());
            return Err(ShmError::Stopped);
        }

        mutex_lock(self.put_lock());
        let idx = hdr.tail.load(Ordering::Relaxed);
        hdr.tail
            .store((idx + 1) % self.capacity as u32, Ordering::Relaxed);
        mutex_unlock(self.put_lock());

        unsafe {
            std::ptr::copy_nonoverlapping(
                frame.as_ptr(),
                self.slot_ptr(idx as usize),
                self.slot_size,
            );
            self.frame_id_slot(idx as usize)
                .store(frame_id, Ordering::Release);
        }

        sem_post(self.sem_full());
        Ok(())
    }

    /// Blocks until a frame is available, then returns a copy of it.
    pub fn get(&self) -> Result<(Vec<u8>, u32), ShmError> {
        let hdr = unsafe { self.header() };

        sem_wait(self.sem_full())?;
        if hdr.stopping.load(Ordering::SeqCst) != 0 {
            // Put the tokens back so sibling consumers also wake.
            sem_post(self.sem_full());
            sem_post(self.sem_empty());
            return Err(ShmError::Stopped);
        }

        mutex_lock(self.get_lock());
        let idx = hdr.head.load(Ordering::Relaxed);
        hdr.head
            .store((idx + 1) % self.capacity as u32, Ordering::Relaxed);
        mutex_unlock(self.get_lock());

        let mut frame = vec![0u8; self.slot_size];
        let frame_id = unsafe {
            std::ptr::copy_nonoverlapping(
                self.slot_ptr(idx as usize),
                frame.as_mut_ptr(),
                self.slot_size,
            );
            self.frame_id_slot(idx as usize).load(Ordering::Acquire)
        };

        sem_post(self.sem_empty());
        Ok((frame, frame_id))
    }

    /// Stops the queue and wakes every blocked consumer. Idempotent.
    pub fn stop(&self) {
        let hdr = unsafe { self.header() };
        if hdr.stopping.swap(1, Ordering::SeqCst) != 0 {
            return;
        }
        for _ in 0..self.capacity {
            sem_post(self.sem_full());
        }
        debug!(name = %self.name, "shared ring stopped");
    }

    pub fn is_stopped(&self) -> bool {
        let hdr = unsafe { self.header() };
        hdr.stopping.load(Ordering::SeqCst) != 0
    }

    /// Current occupancy. Takes both locks so an in-flight pointer advance
    /// cannot be observed halfway.
    pub fn len(&self) -> usize {
        let hdr = unsafe { self.header() };
        mutex_lock(self.put_lock());
        mutex_lock(self.get_lock());
        let head = hdr.head.load(Ordering::Relaxed);
        let tail = hdr.tail.load(Ordering::Relaxed);
        mutex_unlock(self.get_lock());
        mutex_unlock(self.put_lock());
        ((tail + self.capacity as u32 - head) % self.capacity as u32) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    fn header_ptr(&self) -> *mut RingHeader {
        self.base.as_ptr() as *mut RingHeader
    }

    unsafe fn header(&self) -> &RingHeader {
        &*(self.header_ptr() as *const RingHeader)
    }

    fn sem_full(&self) -> *mut libc::sem_t {
        unsafe { addr_of_mut!((*self.header_ptr()).sem_full) }
    }

    fn sem_empty(&self) -> *mut libc::sem_t {
        unsafe { addr_of_mut!((*self.header_ptr()).sem_empty) }
    }

    fn put_lock(&self) -> *mut libc::pthread_mutex_t {
        unsafe { addr_of_mut!((*self.header_ptr()).put_lock) }
    }

    fn get_lock(&self) -> *mut libc::pthread_mutex_t {
        unsafe { addr_of_mut!((*self.header_ptr()).get_lock) }
    }

    unsafe fn frame_id_slot(&self, idx: usize) -> &AtomicU32 {
        let ids = (self.base.as_ptr() as *const u8).add(std::mem::size_of::<RingHeader>());
        &*(ids as *const AtomicU32).add(idx)
    }

    unsafe fn slot_ptr(&self, idx: usize) -> *mut u8 {
        let slots = (self.base.as_ptr() as *mut u8)
            .add(std::mem::size_of::<RingHeader>())
            .add(self.capacity * std::mem::size_of::<u32>());
        slots.add(idx * self.slot_size)
    }
}

impl Drop for ShmRing {
    fn drop(&mut self) {
        if self.owner {
            unsafe {
                libc::sem_destroy(self.sem_full());
                libc::sem_destroy(self.sem_empty());
                libc::pthread_mutex_destroy(self.put_lock());
                libc::pthread_mutex_destroy(self.get_lock());
            }
        }
        if let Err(e) = unsafe { munmap(self.base, self.map_len) } {
            warn!(name = %self.name, error = %e, "munmap failed");
        }
        if self.owner {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                warn!(name = %self.name, error = %e, "shm_unlink failed");
            }
        }
    }
}

fn sem_init(sem: *mut libc::sem_t, value: u32) -> Result<(), ShmError> {
    // pshared = 1: the semaphore lives in shared memory.
    let rc = unsafe { libc::sem_init(sem, 1, value) };
    if rc != 0 {
        return Err(nix::errno::Errno::last().into());
    }
    Ok(())
}

fn sem_wait(sem: *mut libc::sem_t) -> Result<(), ShmError> {
    loop {
        let rc = unsafe { libc::sem_wait(sem) };
        if rc == 0 {
            return Ok(());
        }
        let errno = nix::errno::Errno::last();
        if errno != nix::errno::Errno::EINTR {
            return Err(errno.into());
        }
    }
}

fn sem_post(sem: *mut libc::sem_t) {
    unsafe {
        libc::sem_post(sem);
    }
}

fn mutex_init(mutex: *mut libc::pthread_mutex_t) -> Result<(), ShmError> {
    unsafe {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        if libc::pthread_mutexattr_init(&mut attr) != 0 {
            return Err(nix::errno::Errno::last().into());
        }
        if libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(nix::errno::Errno::last().into());
        }
        let rc = libc::pthread_mutex_init(mutex, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(nix::errno::Errno::last().into());
        }
    }
    Ok(())
}

fn mutex_lock(mutex: *mut libc::pthread_mutex_t) {
    unsafe {
        libc::pthread_mutex_lock(mutex);
    }
}

fn mutex_unlock(mutex: *mut libc::pthread_mutex_t) {
    unsafe {
        libc::pthread_mutex_unlock(mutex);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn unique_name(tag: &str) -> String {
        format!("/framelink-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_put_get_roundtrip() {
        let shape = FrameShape::bgr(4, 2);
        let ring = ShmRing::create(&unique_name("rt"), shape, 4).unwrap();

        let frame: Vec<u8> = (0..shape.slot_size() as u8).collect();
        ring.put(&frame, 17).unwrap();
        assert_eq!(ring.len(), 1);

        let (out, frame_id) = ring.get().unwrap();
        assert_eq!(out, frame);
        assert_eq!(frame_id, 17);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_fifo_order_and_capacity() {
        let shape = FrameShape::bgr(2, 2);
        let ring = ShmRing::create(&unique_name("fifo"), shape, 3).unwrap();

        for id in 0..3u32 {
            let frame = vec![id as u8; shape.slot_size()];
            ring.put(&frame, id).unwrap();
        }
        // Full: no free-slot tokens remain, so the next put would block.
        let mut free = 0;
        unsafe {
            libc::sem_getvalue(ring.sem_empty(), &mut free);
        }
        assert_eq!(free, 0);

        for id in 0..3u32 {
            let (frame, got) = ring.get().unwrap();
            assert_eq!(got, id);
            assert_eq!(frame[0], id as u8);
        }
    }

    #[test]
    fn test_wrong_size_rejected() {
        let ring = ShmRing::create(&unique_name("size"), FrameShape::bgr(2, 2), 2).unwrap();
        let err = ring.put(&[0u8; 3], 0).unwrap_err();
        assert!(matches!(err, ShmError::WrongSize { .. }));
    }

    #[test]
    fn test_open_sees_created_state() {
        let name = unique_name("open");
        let shape = FrameShape::bgr(4, 4);
        let ring = ShmRing::create(&name, shape, 8).unwrap();

        let other = ShmRing::open(&name).unwrap();
        assert_eq!(other.capacity(), 8);
        assert_eq!(other.slot_size(), shape.slot_size());

        ring.put(&vec![9u8; shape.slot_size()], 5).unwrap();
        let (frame, id) = other.get().unwrap();
        assert_eq!(id, 5);
        assert_eq!(frame[0], 9);
    }

    #[test]
    fn test_stop_wakes_blocked_consumer() {
        let ring = Arc::new(
            ShmRing::create(&unique_name("stop"), FrameShape::bgr(2, 2), 2).unwrap(),
        );
        let consumer = Arc::clone(&ring);
        let handle = std::thread::spawn(move || consumer.get());

        std::thread::sleep(Duration::from_millis(50));
        ring.stop();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(ShmError::Stopped)));
    }

    #[test]
    fn test_semaphore_token_conservation() {
        // full + empty == capacity at every quiescent point.
        let shape = FrameShape::bgr(2, 2);
        let ring = ShmRing::create(&unique_name("tokens"), shape, 4).unwrap();

        let read = |sem: *mut libc::sem_t| {
            let mut value = 0;
            unsafe {
                libc::sem_getvalue(sem, &mut value);
            }
            value
        };

        assert_eq!(read(ring.sem_full()) + read(ring.sem_empty()), 4);
        ring.put(&vec![0u8; shape.slot_size()], 0).unwrap();
        ring.put(&vec![0u8; shape.slot_size()], 1).unwrap();
        assert_eq!(read(ring.sem_full()) + read(ring.sem_empty()), 4);
        ring.get().unwrap();
        assert_eq!(read(ring.sem_full()) + read(ring.sem_empty()), 4);

        // stop() releases exactly `capacity` full tokens and nothing else.
        ring.stop();
        assert_eq!(read(ring.sem_full()), 1 + 4);
        assert_eq!(read(ring.sem_empty()), 3);
    }
}
