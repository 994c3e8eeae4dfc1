//! Shared session harness for integration tests
//!
//! - Slots are regular files under a temp dir
//! - Media is `<temp>/media/usb0/update.tar`
//! - Boot environment and version marker are in memory
//! - Signing keys are deterministic

#![allow(dead_code)]

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ab_flash_updater::bootenv::{MemoryEnvStore, MemoryVersionStore};
use ab_flash_updater::bundle::{MediaScanLocator, TarExtractor};
use ab_flash_updater::flash::{LogProgress, MountControl};
use ab_flash_updater::session::{Collaborators, Orchestrator, RebootScheduler};
use ab_flash_updater::slot::{BootSignal, SlotError, SlotId};
use ab_flash_updater::UpdaterConfig;
use ed25519_dalek::{Signer, SigningKey};
use md5::{Digest, Md5};
use tar::{Builder, Header};
use tempfile::TempDir;

pub const DEVICE_ID: &str = "dev-X";
pub const SLOT_SIZE: usize = 64 * 1024;
pub const ERASED: u8 = 0xFF;

/// Boot signal whose root device can be switched to simulate a reboot
pub struct FakeBoot {
    root: Mutex<PathBuf>,
}

impl FakeBoot {
    pub fn new(root: &Path) -> Self {
        Self {
            root: Mutex::new(root.to_path_buf()),
        }
    }

    pub fn set(&self, root: &Path) {
        *self.root.lock().unwrap() = root.to_path_buf();
    }
}

impl BootSignal for FakeBoot {
    fn root_device(&self) -> Result<PathBuf, SlotError> {
        Ok(self.root.lock().unwrap().clone())
    }
}

/// Nothing is ever mounted
pub struct NoMounts;

impl MountControl for NoMounts {
    fn mount_points(&self, _device: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn is_mount_point(&self, _path: &Path) -> io::Result<bool> {
        Ok(false)
    }

    fn unmount(&self, _mount_point: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Records requested reboot delays
#[derive(Default)]
pub struct RecordingReboot {
    pub requests: Mutex<Vec<Duration>>,
}

impl RecordingReboot {
    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl RebootScheduler for RecordingReboot {
    fn schedule(&self, delay: Duration) -> io::Result<()> {
        self.requests.lock().unwrap().push(delay);
        Ok(())
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

pub fn manifest(hardware_id: &str, version: &str, checksum: &str) -> Vec<u8> {
    format!(
        "{{\n  \"hardware_id\": \"{}\",\n  \"version\": \"{}\",\n  \"checksum_md5\": \"{}\"\n}}\n",
        hardware_id, version, checksum
    )
    .into_bytes()
}

pub fn image(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub struct Harness {
    pub temp: TempDir,
    pub media: PathBuf,
    pub slot_a: PathBuf,
    pub slot_b: PathBuf,
    pub signer: SigningKey,
    pub boot: Arc<FakeBoot>,
    pub env: Arc<MemoryEnvStore>,
    pub versions: Arc<MemoryVersionStore>,
    pub reboot: Arc<RecordingReboot>,
    pub config: UpdaterConfig,
}

impl Harness {
    /// Device running from `active`, slots erased, version 1.0.0 installed
    pub fn new(active: SlotId) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        let slot_a = root.join("dev").join("slot_a");
        let slot_b = root.join("dev").join("slot_b");
        fs::create_dir_all(root.join("dev")).unwrap();
        fs::write(&slot_a, vec![ERASED; SLOT_SIZE]).unwrap();
        fs::write(&slot_b, vec![ERASED; SLOT_SIZE]).unwrap();

        let signer = SigningKey::from_bytes(&[42u8; 32]);
        let key_path = root.join("update_key.pub");
        fs::write(&key_path, signer.verifying_key().to_bytes()).unwrap();

        let media_root = root.join("media");
        let media = media_root.join("usb0");

        let mut config = UpdaterConfig::defaults().unwrap();
        config.device.hardware_id = DEVICE_ID.to_string();
        config.device.public_key = key_path;
        config.media.search_roots = vec![media_root];
        config.slots.a.device = slot_a.clone();
        config.slots.b.device = slot_b.clone();
        config.flash.chunk_size = 4096;
        config.flash.progress_interval = 16 * 1024;
        config.state.work_dir = root.join("work");
        config.state.lock_file = root.join("run").join("ab-flash-updater.lock");
        config.state.summary_file = root.join("state").join("last_session.json");
        config.state.version_file = root.join("state").join("firmware_version");

        let active_device = match active {
            SlotId::A => slot_a.clone(),
            SlotId::B => slot_b.clone(),
        };

        Self {
            media,
            slot_a,
            slot_b,
            signer,
            boot: Arc::new(FakeBoot::new(&active_device)),
            env: Arc::new(MemoryEnvStore::with_entries([("active_slot", active.as_str())])),
            versions: Arc::new(MemoryVersionStore::new(Some("1.0.0"))),
            reboot: Arc::new(RecordingReboot::default()),
            config,
            temp,
        }
    }

    pub fn device(&self, id: SlotId) -> &Path {
        match id {
            SlotId::A => &self.slot_a,
            SlotId::B => &self.slot_b,
        }
    }

    pub fn slot_bytes(&self, id: SlotId) -> Vec<u8> {
        fs::read(self.device(id)).unwrap()
    }

    pub fn slot_untouched(&self, id: SlotId) -> bool {
        self.slot_bytes(id).iter().all(|b| *b == ERASED)
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.media.join("update.tar")
    }

    /// Write `update.tar` onto the media with the given members
    pub fn write_bundle(&self, members: &[(&str, &[u8])]) {
        fs::create_dir_all(&self.media).unwrap();
        let mut builder = Builder::new(File::create(self.bundle_path()).unwrap());
        for (name, data) in members {
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    /// Correctly signed bundle whose manifest declares `checksum`
    pub fn write_signed_bundle_with_checksum(
        &self,
        hardware_id: &str,
        version: &str,
        checksum: &str,
        image: &[u8],
    ) {
        let manifest = manifest(hardware_id, version, checksum);
        let signature = self.signer.sign(&manifest).to_bytes();
        self.write_bundle(&[
            ("manifest.json", manifest.as_slice()),
            ("manifest.sig", signature.as_slice()),
            ("firmware.img", image),
        ]);
    }

    /// Correctly signed bundle with a matching checksum
    pub fn write_signed_bundle(&self, hardware_id: &str, version: &str, image: &[u8]) {
        self.write_signed_bundle_with_checksum(hardware_id, version, &md5_hex(image), image);
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let parts = Collaborators {
            locator: Arc::new(
                MediaScanLocator::new(
                    self.config.media.search_roots.clone(),
                    &self.config.media.bundle_names,
                )
                .unwrap(),
            ),
            extractor: Arc::new(TarExtractor::new().unwrap()),
            boot_signal: self.boot.clone(),
            mounts: Arc::new(NoMounts),
            env_store: self.env.clone(),
            versions: self.versions.clone(),
            reboot: self.reboot.clone(),
            progress: Arc::new(LogProgress),
        };
        Orchestrator::new(self.config.clone(), parts)
    }

    pub fn env_value(&self, key: &str) -> Option<String> {
        self.env.snapshot().get(key).cloned()
    }

    pub fn installed_version(&self) -> Option<String> {
        use ab_flash_updater::bootenv::VersionStore;
        self.versions.current().unwrap()
    }

    /// Boot into whatever slot the environment points at
    pub fn reboot_into_committed_slot(&self) {
        let slot: SlotId = self.env_value("active_slot").unwrap().parse().unwrap();
        self.boot.set(self.device(slot));
    }

    /// Session work areas still on disk
    pub fn leftover_work_areas(&self) -> usize {
        match fs::read_dir(&self.config.state.work_dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}
