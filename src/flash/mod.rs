//! Writing and verifying the inactive slot
//!
//! Write policy:
//! - Refuses any slot not marked inactive and any device mounted at `/`
//! - Size is checked against capacity before anything touches the device
//! - A target mounted elsewhere is unmounted first; failure is `MountBusy`
//! - MTD partitions are erased first (failure is logged, read-back decides)
//! - Sequential fixed-size chunks from offset 0, opened `O_SYNC` so every
//!   chunk is on the medium before the next one starts
//!
//! Verification reads back exactly `image.size` bytes and compares MD5 with
//! the source image digest.

mod mount;
mod mtd;

pub use mount::{unescape_mount_field, MountControl, SystemMounts};
pub use mtd::is_mtd_device;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::FailureKind;
use crate::signal::CancelToken;
use crate::slot::{Slot, SlotState};
use crate::validate::md5_reader;

/// Default write chunk (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Errors from flashing a slot
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("refusing to write {0}: it is the active or mounted root slot")]
    TargetIsActive(PathBuf),

    #[error("{0} is not a block-addressable device")]
    NotBlockAddressable(PathBuf),

    #[error("image of {image} bytes exceeds slot capacity of {capacity} bytes")]
    TooLarge { image: u64, capacity: u64 },

    #[error("cannot unmount {mount_point}: {source}")]
    MountBusy {
        mount_point: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write to {path} failed at offset {offset}: {source}")]
    Write {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("image read failed: {0}")]
    ImageRead(#[source] io::Error),

    #[error("image is {actual} bytes, expected {expected}")]
    ImageSizeChanged { expected: u64, actual: u64 },

    #[error("read-back of {path} failed: {source}")]
    ReadBack {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read-back mismatch: image {expected}, slot {actual} over {bytes} bytes")]
    VerifyMismatch {
        expected: String,
        actual: String,
        bytes: u64,
    },

    #[error("flash cancelled after {written} bytes")]
    Cancelled { written: u64 },
}

impl FlashError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FlashError::TooLarge { .. } => FailureKind::FirmwareTooLarge,
            FlashError::MountBusy { .. } => FailureKind::MountBusy,
            FlashError::ReadBack { .. } | FlashError::VerifyMismatch { .. } => {
                FailureKind::FlashVerifyFailed
            }
            FlashError::Cancelled { .. } => FailureKind::Cancelled,
            _ => FailureKind::FlashWriteFailed,
        }
    }
}

/// Image to be written, with its validated digest
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub path: PathBuf,
    pub size: u64,

    /// Hex MD5 of the image file
    pub md5: String,
}

/// Receives progress notifications; purely observational
pub trait ProgressSink: Send + Sync {
    fn progress(&self, written: u64, total: u64);
}

/// Logs progress at INFO
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn progress(&self, written: u64, total: u64) {
        info!(bytes = written, total, "written {} of {} bytes", written, total);
    }
}

#[derive(Debug, Clone)]
pub struct FlashOptions {
    pub chunk_size: usize,

    /// Bytes between progress notifications
    pub progress_interval: u64,
    pub erase_mtd: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_CHUNK_SIZE as u64,
            erase_mtd: true,
        }
    }
}

/// Outcome of a completed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub bytes_written: u64,
    pub chunks: u64,
    pub capacity: u64,
    pub erased: bool,
}

/// Outcome of write + read-back verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashResult {
    pub write: WriteReport,
    pub verified_md5: String,
}

pub struct Flasher<'a> {
    options: FlashOptions,
    mounts: &'a dyn MountControl,
    progress: &'a dyn ProgressSink,
    cancel: CancelToken,
}

impl<'a> Flasher<'a> {
    pub fn new(
        options: FlashOptions,
        mounts: &'a dyn MountControl,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            options,
            mounts,
            progress,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Write then verify
    pub fn flash(&self, image: &FirmwareImage, target: &Slot) -> Result<FlashResult, FlashError> {
        let write = self.write(image, target)?;
        let verified_md5 = self.verify(image, target)?;
        Ok(FlashResult {
            write,
            verified_md5,
        })
    }

    /// Copy the image onto the target slot
    pub fn write(&self, image: &FirmwareImage, target: &Slot) -> Result<WriteReport, FlashError> {
        let device = &target.device;
        if target.state != SlotState::Inactive {
            return Err(FlashError::TargetIsActive(device.clone()));
        }
        check_block_addressable(device)?;

        let capacity = match target.capacity {
            Some(capacity) => capacity,
            None => probe_capacity(device)?,
        };
        if image.size > capacity {
            return Err(FlashError::TooLarge {
                image: image.size,
                capacity,
            });
        }

        self.ensure_unmounted(device)?;
        let erased = self.erase_if_mtd(device, capacity);

        let mut source = File::open(&image.path).map_err(FlashError::ImageRead)?;
        let mut sink = open_sync(device).map_err(|source| FlashError::Open {
            path: device.clone(),
            source,
        })?;

        info!(
            slot = %target.id,
            device = %device.display(),
            bytes = image.size,
            chunk = self.options.chunk_size,
            "writing firmware"
        );

        let chunk_size = self.options.chunk_size.max(1);
        let mut buffer = vec![0u8; chunk_size];
        let mut written = 0u64;
        let mut chunks = 0u64;
        let mut next_report = self.options.progress_interval;

        loop {
            if self.cancel.is_cancelled() {
                return Err(FlashError::Cancelled { written });
            }

            let n = read_chunk(&mut source, &mut buffer).map_err(FlashError::ImageRead)?;
            if n == 0 {
                break;
            }
            if written + n as u64 > capacity {
                return Err(FlashError::ImageSizeChanged {
                    expected: image.size,
                    actual: written + n as u64,
                });
            }

            sink.write_all(&buffer[..n]).map_err(|source| FlashError::Write {
                path: device.clone(),
                offset: written,
                source,
            })?;
            written += n as u64;
            chunks += 1;

            if self.options.progress_interval > 0 && written >= next_report {
                self.progress.progress(written, image.size);
                while next_report <= written {
                    next_report += self.options.progress_interval;
                }
            }
        }

        sink.flush()
            .and_then(|()| sink.sync_all())
            .map_err(|source| FlashError::Write {
                path: device.clone(),
                offset: written,
                source,
            })?;

        if written != image.size {
            return Err(FlashError::ImageSizeChanged {
                expected: image.size,
                actual: written,
            });
        }

        info!(slot = %target.id, bytes = written, chunks, "firmware written");
        Ok(WriteReport {
            bytes_written: written,
            chunks,
            capacity,
            erased,
        })
    }

    /// Read back `image.size` bytes from the target and compare digests
    pub fn verify(&self, image: &FirmwareImage, target: &Slot) -> Result<String, FlashError> {
        let read_back_err = |source| FlashError::ReadBack {
            path: target.device.clone(),
            source,
        };

        let device = File::open(&target.device).map_err(read_back_err)?;
        let (actual, count) = md5_reader(device.take(image.size)).map_err(read_back_err)?;

        if count != image.size || actual != image.md5 {
            return Err(FlashError::VerifyMismatch {
                expected: image.md5.clone(),
                actual,
                bytes: count,
            });
        }

        info!(slot = %target.id, md5 = %actual, "read-back verified");
        Ok(actual)
    }

    fn ensure_unmounted(&self, device: &Path) -> Result<(), FlashError> {
        let mount_points = self
            .mounts
            .mount_points(device)
            .map_err(|source| FlashError::MountBusy {
                mount_point: device.to_path_buf(),
                source,
            })?;

        if mount_points.iter().any(|mp| mp == Path::new("/")) {
            return Err(FlashError::TargetIsActive(device.to_path_buf()));
        }

        for mount_point in mount_points {
            warn!(device = %device.display(), mount_point = %mount_point.display(), "target slot is mounted, unmounting");
            self.mounts
                .unmount(&mount_point)
                .map_err(|source| FlashError::MountBusy {
                    mount_point: mount_point.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    fn erase_if_mtd(&self, device: &Path, capacity: u64) -> bool {
        if !self.options.erase_mtd || !is_mtd_device(device) {
            debug!(device = %device.display(), "not an MTD device, skipping erase");
            return false;
        }

        info!(device = %device.display(), bytes = capacity, "erasing MTD partition");
        match mtd::erase(device, capacity) {
            Ok(()) => true,
            Err(e) => {
                warn!(device = %device.display(), error = %e, "MTD erase failed, continuing");
                false
            }
        }
    }
}

fn check_block_addressable(device: &Path) -> Result<(), FlashError> {
    let metadata = std::fs::metadata(device).map_err(|source| FlashError::Open {
        path: device.to_path_buf(),
        source,
    })?;
    let file_type = metadata.file_type();

    #[cfg(unix)]
    let is_device = {
        use std::os::unix::fs::FileTypeExt;
        file_type.is_block_device() || file_type.is_char_device()
    };
    #[cfg(not(unix))]
    let is_device = false;

    if is_device || file_type.is_file() {
        Ok(())
    } else {
        Err(FlashError::NotBlockAddressable(device.to_path_buf()))
    }
}

/// Size of a block device or image file, via seek to end
fn probe_capacity(device: &Path) -> Result<u64, FlashError> {
    let open_err = |source| FlashError::Open {
        path: device.to_path_buf(),
        source,
    };
    let mut file = File::open(device).map_err(open_err)?;
    file.seek(SeekFrom::End(0)).map_err(open_err)
}

/// Existing device opened for synchronous writes; never created or truncated
fn open_sync(device: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_SYNC);
    }
    options.open(device)
}

/// Fill `buffer` unless EOF comes first
fn read_chunk(source: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match source.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotId;
    use crate::validate::md5_file;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeMounts {
        mounted: Mutex<Vec<(PathBuf, PathBuf)>>,
        busy: bool,
        unmounted: Mutex<Vec<PathBuf>>,
    }

    impl FakeMounts {
        fn with(device: &Path, mount_point: &str, busy: bool) -> Self {
            Self {
                mounted: Mutex::new(vec![(device.to_path_buf(), PathBuf::from(mount_point))]),
                busy,
                unmounted: Mutex::default(),
            }
        }
    }

    impl MountControl for FakeMounts {
        fn mount_points(&self, device: &Path) -> io::Result<Vec<PathBuf>> {
            Ok(self
                .mounted
                .lock()
                .unwrap()
                .iter()
                .filter(|(d, _)| d == device)
                .map(|(_, m)| m.clone())
                .collect())
        }

        fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
            Ok(self.mounted.lock().unwrap().iter().any(|(_, m)| m == path))
        }

        fn unmount(&self, mount_point: &Path) -> io::Result<()> {
            if self.busy {
                return Err(io::Error::new(io::ErrorKind::Other, "device busy"));
            }
            self.mounted.lock().unwrap().retain(|(_, m)| m != mount_point);
            self.unmounted.lock().unwrap().push(mount_point.to_path_buf());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingProgress(Mutex<Vec<u64>>);

    impl ProgressSink for RecordingProgress {
        fn progress(&self, written: u64, _total: u64) {
            self.0.lock().unwrap().push(written);
        }
    }

    struct Setup {
        temp: TempDir,
        image: FirmwareImage,
        slot: Slot,
    }

    fn setup(image_bytes: &[u8], slot_size: usize) -> Setup {
        let temp = TempDir::new().unwrap();
        let image_path = temp.path().join("firmware.img");
        fs::write(&image_path, image_bytes).unwrap();
        let slot_path = temp.path().join("slot_b");
        fs::write(&slot_path, vec![0xFFu8; slot_size]).unwrap();

        Setup {
            image: FirmwareImage {
                md5: md5_file(&image_path).unwrap(),
                size: image_bytes.len() as u64,
                path: image_path,
            },
            slot: Slot {
                id: SlotId::B,
                device: slot_path,
                capacity: None,
                state: SlotState::Inactive,
            },
            temp,
        }
    }

    fn options(chunk_size: usize) -> FlashOptions {
        FlashOptions {
            chunk_size,
            progress_interval: 1000,
            erase_mtd: true,
        }
    }

    #[test]
    fn test_flash_round_trip() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let s = setup(&data, 8192);
        let mounts = FakeMounts::default();
        let progress = RecordingProgress::default();

        let result = Flasher::new(options(1024), &mounts, &progress)
            .flash(&s.image, &s.slot)
            .unwrap();

        assert_eq!(result.write.bytes_written, 5000);
        assert_eq!(result.write.chunks, 5);
        assert_eq!(result.write.capacity, 8192);
        assert!(!result.write.erased);
        assert_eq!(result.verified_md5, s.image.md5);

        let slot = fs::read(&s.slot.device).unwrap();
        assert_eq!(slot.len(), 8192, "slot must not be truncated");
        assert_eq!(&slot[..5000], &data[..]);
        assert!(slot[5000..].iter().all(|b| *b == 0xFF));
        assert_eq!(*progress.0.lock().unwrap(), vec![1024, 2048, 3072, 4096, 5000]);
    }

    #[test]
    fn test_exactly_capacity_fits() {
        let s = setup(&[0x5A; 4096], 4096);
        let mounts = FakeMounts::default();
        Flasher::new(options(1000), &mounts, &LogProgress)
            .flash(&s.image, &s.slot)
            .unwrap();
    }

    #[test]
    fn test_too_large_leaves_slot_untouched() {
        let s = setup(&[0x11; 4097], 4096);
        let mounts = FakeMounts::default();

        let err = Flasher::new(options(1024), &mounts, &LogProgress)
            .flash(&s.image, &s.slot)
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::FirmwareTooLarge);
        assert!(fs::read(&s.slot.device).unwrap().iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_configured_capacity_wins() {
        let mut s = setup(&[0x11; 3000], 8192);
        s.slot.capacity = Some(2048);
        let mounts = FakeMounts::default();

        let err = Flasher::new(options(1024), &mounts, &LogProgress)
            .write(&s.image, &s.slot)
            .unwrap_err();
        assert!(matches!(err, FlashError::TooLarge { image: 3000, capacity: 2048 }));
    }

    #[test]
    fn test_active_slot_refused() {
        let mut s = setup(b"abc", 4096);
        s.slot.state = SlotState::Active;
        let mounts = FakeMounts::default();

        let err = Flasher::new(options(1024), &mounts, &LogProgress)
            .flash(&s.image, &s.slot)
            .unwrap_err();
        assert!(matches!(err, FlashError::TargetIsActive(_)));
        assert!(fs::read(&s.slot.device).unwrap().iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_mounted_as_root_refused() {
        let s = setup(b"abc", 4096);
        let mounts = FakeMounts::with(&s.slot.device, "/", false);

        let err = Flasher::new(options(1024), &mounts, &LogProgress)
            .flash(&s.image, &s.slot)
            .unwrap_err();
        assert!(matches!(err, FlashError::TargetIsActive(_)));
        assert!(mounts.unmounted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_mounted_target_is_unmounted_first() {
        let s = setup(b"abc", 4096);
        let mounts = FakeMounts::with(&s.slot.device, "/mnt/slot_b", false);

        Flasher::new(options(1024), &mounts, &LogProgress)
            .flash(&s.image, &s.slot)
            .unwrap();
        assert_eq!(
            *mounts.unmounted.lock().unwrap(),
            vec![PathBuf::from("/mnt/slot_b")]
        );
    }

    #[test]
    fn test_busy_mount_aborts_before_write() {
        let s = setup(b"abc", 4096);
        let mounts = FakeMounts::with(&s.slot.device, "/mnt/slot_b", true);

        let err = Flasher::new(options(1024), &mounts, &LogProgress)
            .flash(&s.image, &s.slot)
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::MountBusy);
        assert!(fs::read(&s.slot.device).unwrap().iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let s = setup(&[0x42; 2048], 4096);
        let mounts = FakeMounts::default();
        let flasher = Flasher::new(options(512), &mounts, &LogProgress);
        flasher.write(&s.image, &s.slot).unwrap();

        // Flip one byte on the "medium" after the write.
        let mut slot = fs::read(&s.slot.device).unwrap();
        slot[100] ^= 0x01;
        fs::write(&s.slot.device, slot).unwrap();

        let err = flasher.verify(&s.image, &s.slot).unwrap_err();
        assert_eq!(err.kind(), FailureKind::FlashVerifyFailed);
    }

    #[test]
    fn test_cancel_stops_before_first_chunk() {
        let s = setup(&[0x42; 2048], 4096);
        let mounts = FakeMounts::default();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = Flasher::new(options(512), &mounts, &LogProgress)
            .with_cancel(cancel)
            .flash(&s.image, &s.slot)
            .unwrap_err();
        assert!(matches!(err, FlashError::Cancelled { written: 0 }));
        assert_eq!(err.kind(), FailureKind::Cancelled);
    }

    #[test]
    fn test_directory_is_not_block_addressable() {
        let mut s = setup(b"abc", 16);
        s.slot.device = s.temp.path().to_path_buf();
        let mounts = FakeMounts::default();

        let err = Flasher::new(options(1024), &mounts, &LogProgress)
            .flash(&s.image, &s.slot)
            .unwrap_err();
        assert!(matches!(err, FlashError::NotBlockAddressable(_)));
    }

    #[test]
    fn test_missing_device() {
        let mut s = setup(b"abc", 16);
        s.slot.device = s.temp.path().join("no_such_slot");
        let mounts = FakeMounts::default();

        let err = Flasher::new(options(1024), &mounts, &LogProgress)
            .flash(&s.image, &s.slot)
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::FlashWriteFailed);
    }
}
