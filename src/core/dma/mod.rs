use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info};

use crate::core::interrupt::{InterruptController, InterruptKind};
use crate::core::memory::Memory;
use crate::core::word::Word;

pub const DISK_TRACKS: usize = 10;
pub const DISK_CYLINDERS: usize = 10;
pub const DISK_SECTORS: usize = 100;
// 8 zero-padded decimal digits plus terminator
pub const SECTOR_BYTES: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaOperation {
    Read = 0,
    Write = 1,
}

impl DmaOperation {
    pub fn from_word(word: Word) -> DmaOperation {
        if word == 0 {
            DmaOperation::Read
        } else {
            DmaOperation::Write
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DmaOperation::Read => "LEER",
            DmaOperation::Write => "ESCRIBIR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    Ok = 0,
    Error = 1,
}

/// Simulated rotating disk: character sectors addressed by
/// (track, cylinder, sector), each holding one word as ASCII decimal.
pub struct Disk {
    sectors: Vec<[u8; SECTOR_BYTES]>,
}

impl Disk {
    pub fn new() -> Self {
        Disk {
            sectors: vec![[0u8; SECTOR_BYTES]; DISK_TRACKS * DISK_CYLINDERS * DISK_SECTORS],
        }
    }

    fn index(track: usize, cylinder: usize, sector: usize) -> usize {
        (track * DISK_CYLINDERS + cylinder) * DISK_SECTORS + sector
    }

    pub fn read_word(&self, track: usize, cylinder: usize, sector: usize) -> Word {
        let raw = &self.sectors[Self::index(track, cylinder, sector)];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(SECTOR_BYTES);
        std::str::from_utf8(&raw[..end])
            .ok()
            .and_then(|text| text.parse().ok())
            .unwrap_or(0)
    }

    pub fn write_word(&mut self, track: usize, cylinder: usize, sector: usize, word: Word) {
        let formatted = format!("{:08}", word);
        let slot = &mut self.sectors[Self::index(track, cylinder, sector)];
        slot.fill(0);
        let bytes = formatted.as_bytes();
        let n = bytes.len().min(SECTOR_BYTES - 1);
        slot[..n].copy_from_slice(&bytes[..n]);
    }
}

/// Geometry and target for the next transfer, filled in by the SDMAx
/// instructions.
#[derive(Debug, Clone, Copy)]
struct TransferRequest {
    track: Word,
    cylinder: Word,
    sector: Word,
    operation: DmaOperation,
    address: Word,
}

struct DmaShared {
    disk: Mutex<Disk>,
    active: AtomicBool,
    status: Mutex<DmaStatus>,
}

/// Transfers one word between the disk and main memory on a worker thread,
/// contending for the bus with the CPU and raising INT_IO_DONE when finished.
pub struct DmaController {
    request: TransferRequest,
    shared: Arc<DmaShared>,
    bus: Arc<Mutex<Memory>>,
    interrupts: Arc<InterruptController>,
    worker: Option<JoinHandle<()>>,
    latency: Duration,
}

impl DmaController {
    pub fn new(
        bus: Arc<Mutex<Memory>>,
        interrupts: Arc<InterruptController>,
        latency: Duration,
    ) -> Self {
        DmaController {
            request: TransferRequest {
                track: 0,
                cylinder: 0,
                sector: 0,
                operation: DmaOperation::Read,
                address: 0,
            },
            shared: Arc::new(DmaShared {
                disk: Mutex::new(Disk::new()),
                active: AtomicBool::new(false),
                status: Mutex::new(DmaStatus::Ok),
            }),
            bus,
            interrupts,
            worker: None,
            latency,
        }
    }

    pub fn set_track(&mut self, track: Word) {
        self.request.track = track;
        info!("DMA: track = {}", track);
    }

    pub fn set_cylinder(&mut self, cylinder: Word) {
        self.request.cylinder = cylinder;
        info!("DMA: cylinder = {}", cylinder);
    }

    pub fn set_sector(&mut self, sector: Word) {
        self.request.sector = sector;
        info!("DMA: sector = {}", sector);
    }

    pub fn set_operation(&mut self, operation: Word) {
        self.request.operation = DmaOperation::from_word(operation);
        info!("DMA: operation = {}", self.request.operation.name());
    }

    pub fn set_address(&mut self, address: Word) {
        self.request.address = address;
        info!("DMA: memory address = {}", address);
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> DmaStatus {
        *self.shared.status.lock().unwrap()
    }

    /// Launches the configured transfer. At most one is in flight; starting
    /// another while active is a no-op error.
    pub fn start(&mut self) {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            error!("DMA transfer already in progress");
            return;
        }
        // a finished worker may still hold its handle
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        let request = self.request;
        let shared = self.shared.clone();
        let bus = self.bus.clone();
        let interrupts = self.interrupts.clone();
        let latency = self.latency;

        info!(
            "DMA: {} started (track {} cylinder {} sector {} <-> memory[{}])",
            request.operation.name(),
            request.track,
            request.cylinder,
            request.sector,
            request.address
        );
        self.worker = Some(thread::spawn(move || {
            run_transfer(request, shared, bus, interrupts, latency)
        }));
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("DMA worker panicked");
            }
        }
    }
}

impl Drop for DmaController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_transfer(
    request: TransferRequest,
    shared: Arc<DmaShared>,
    bus: Arc<Mutex<Memory>>,
    interrupts: Arc<InterruptController>,
    latency: Duration,
) {
    if request.track < 0
        || request.track as usize >= DISK_TRACKS
        || request.cylinder < 0
        || request.cylinder as usize >= DISK_CYLINDERS
        || request.sector < 0
        || request.sector as usize >= DISK_SECTORS
    {
        error!(
            "DMA: invalid disk geometry (track {} cylinder {} sector {})",
            request.track, request.cylinder, request.sector
        );
        *shared.status.lock().unwrap() = DmaStatus::Error;
        shared.active.store(false, Ordering::SeqCst);
        interrupts.raise(InterruptKind::IoDone);
        return;
    }

    // seek plus rotational delay
    thread::sleep(latency);

    let (track, cylinder, sector) = (
        request.track as usize,
        request.cylinder as usize,
        request.sector as usize,
    );
    {
        let mut memory = bus.lock().unwrap();
        let mut disk = shared.disk.lock().unwrap();
        match request.operation {
            DmaOperation::Read => {
                let word = disk.read_word(track, cylinder, sector);
                memory.write(request.address, word);
                info!("DMA: disk read completed, memory[{}] = {:08}", request.address, word);
            }
            DmaOperation::Write => {
                let word = memory.read(request.address);
                disk.write_word(track, cylinder, sector, word);
                info!("DMA: disk write completed, sector = {:08}", word);
            }
        }
    }

    *shared.status.lock().unwrap() = DmaStatus::Ok;
    shared.active.store(false, Ordering::SeqCst);
    interrupts.raise(InterruptKind::IoDone);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fixture(latency: Duration) -> (Arc<Mutex<Memory>>, Arc<InterruptController>, DmaController) {
        let bus = Arc::new(Mutex::new(Memory::new()));
        let interrupts = Arc::new(InterruptController::new());
        let dma = DmaController::new(bus.clone(), interrupts.clone(), latency);
        (bus, interrupts, dma)
    }

    fn wait_io_done(interrupts: &InterruptController) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while interrupts.pending() != Some(InterruptKind::IoDone) {
            assert!(Instant::now() < deadline, "timed out waiting for INT_IO_DONE");
            thread::sleep(Duration::from_millis(1));
        }
        interrupts.clear();
    }

    #[test]
    fn sector_encoding_round_trip() {
        let mut disk = Disk::new();
        disk.write_word(1, 2, 3, 42);
        assert_eq!(disk.read_word(1, 2, 3), 42);
        assert_eq!(disk.read_word(0, 0, 0), 0);
        disk.write_word(9, 9, 99, 12345678);
        assert_eq!(disk.read_word(9, 9, 99), 12345678);
    }

    #[test]
    fn write_then_read_round_trips_through_the_disk() {
        let (bus, interrupts, mut dma) = fixture(Duration::from_millis(1));
        bus.lock().unwrap().write(400, 12345678);

        dma.set_track(1);
        dma.set_cylinder(2);
        dma.set_sector(3);
        dma.set_operation(DmaOperation::Write as Word);
        dma.set_address(400);
        dma.start();
        wait_io_done(&interrupts);
        assert_eq!(dma.status(), DmaStatus::Ok);
        assert!(!dma.is_active());

        dma.set_operation(DmaOperation::Read as Word);
        dma.set_address(401);
        dma.start();
        wait_io_done(&interrupts);
        assert_eq!(dma.status(), DmaStatus::Ok);
        assert_eq!(bus.lock().unwrap().read(401), 12345678);
    }

    #[test]
    fn invalid_geometry_fails_with_io_done() {
        let (_bus, interrupts, mut dma) = fixture(Duration::from_millis(1));
        dma.set_track(10);
        dma.set_sector(3);
        dma.start();
        wait_io_done(&interrupts);
        assert_eq!(dma.status(), DmaStatus::Error);
        assert!(!dma.is_active());
    }

    #[test]
    fn second_start_while_active_is_rejected() {
        let (bus, interrupts, mut dma) = fixture(Duration::from_millis(100));
        bus.lock().unwrap().write(10, 11111111);
        dma.set_operation(DmaOperation::Write as Word);
        dma.set_address(10);
        dma.start();
        assert!(dma.is_active());
        dma.start();
        wait_io_done(&interrupts);
        // exactly one completion: the latch is clear again
        thread::sleep(Duration::from_millis(20));
        assert!(!interrupts.is_pending());
        assert!(!dma.is_active());
    }
}
