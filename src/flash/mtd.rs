//! Raw NAND/NOR (MTD) partitions must be erased before they are rewritten.

use std::io;
use std::path::Path;

const MTD_PREFIX: &str = "/dev/mtd";

/// `/dev/mtdN` and `/dev/mtdblockN`
pub fn is_mtd_device(path: &Path) -> bool {
    path.to_str().map_or(false, |p| p.starts_with(MTD_PREFIX))
}

#[cfg(target_os = "linux")]
mod ioctl {
    /// `struct erase_info_user` from `<mtd/mtd-abi.h>`
    #[repr(C)]
    pub struct EraseInfoUser {
        pub start: u32,
        pub length: u32,
    }

    nix::ioctl_write_ptr!(mem_erase, b'M', 2, EraseInfoUser);
}

/// Erase the first `length` bytes of an MTD partition (MEMERASE)
#[cfg(target_os = "linux")]
pub fn erase(path: &Path, length: u64) -> io::Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    let length = u32::try_from(length).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("erase length {} exceeds MTD limit", length),
        )
    })?;
    let device = OpenOptions::new().read(true).write(true).open(path)?;
    let info = ioctl::EraseInfoUser { start: 0, length };

    // SAFETY: fd is open for the duration of the call and `info` outlives it.
    unsafe { ioctl::mem_erase(device.as_raw_fd(), &info) }.map_err(io::Error::from)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn erase(path: &Path, _length: u64) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("MTD erase of {} unsupported on this platform", path.display()),
    ))
}
