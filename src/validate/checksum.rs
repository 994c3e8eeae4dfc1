//! MD5 digests of images and slot read-back

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUFFER: usize = 64 * 1024;

/// Hex MD5 of everything `reader` yields, with the byte count
pub fn md5_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Hex MD5 of a whole file
pub fn md5_file(path: &Path) -> io::Result<String> {
    md5_reader(File::open(path)?).map(|(digest, _)| digest)
}
