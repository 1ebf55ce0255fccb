//! Boot image validation.
//!
//! A card image must be an x86 bzImage whose compressed payload inflates to
//! an ELF kernel built for x86-64 or K1OM.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use async_trait::async_trait;

use crate::BootError;

const HEADER_WINDOW: usize = 4096;
const SETUP_MAGIC_OFFSET: usize = 514;
const SETUP_MAGIC: &[u8; 4] = b"HdrS";
const BOOT_FLAG_OFFSET: usize = 510;
const LOADFLAGS_OFFSET: usize = 529;
const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];
const ELF_MACHINE_OFFSET: usize = 18;
const EM_X86_64: u8 = 0x3e;
const EM_K1OM: u8 = 0xb5;

/// Decides whether a file is a bootable card image.
#[async_trait]
pub trait BootImageValidator: Send + Sync {
    async fn validate(&self, image: &Path) -> Result<(), BootError>;
}

/// Validates bzImage kernels by inspecting the setup header and inflating
/// the payload with an external gzip.
pub struct BzImageValidator {
    gzip: PathBuf,
    scratch_dir: PathBuf,
}

impl BzImageValidator {
    pub fn new(gzip: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            gzip: gzip.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    fn validate_blocking(&self, image: &Path) -> Result<(), String> {
        let data = std::fs::read(image).map_err(|e| format!("cannot read: {e}"))?;
        check_setup_header(&data[..data.len().min(HEADER_WINDOW)])?;
        let start = find_payload(&data).ok_or("no compressed payload")?;

        let mut tail = tempfile::Builder::new()
            .prefix("cardkeeper-bz")
            .suffix(".gz")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| format!("cannot create temp file: {e}"))?;
        tail.write_all(&data[start..])
            .and_then(|_| tail.flush())
            .map_err(|e| format!("cannot write temp file: {e}"))?;

        let inflated = tempfile::Builder::new()
            .prefix("cardkeeper-elf")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| format!("cannot create temp file: {e}"))?;
        let stdout = inflated
            .reopen()
            .map_err(|e| format!("cannot open temp file: {e}"))?;

        // Trailing data after the payload makes gzip exit non-zero even
        // though it inflated the kernel, so only the output is judged.
        let status = Command::new(&self.gzip)
            .arg("-dc")
            .arg(tail.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::null())
            .status()
            .map_err(|e| format!("cannot run {}: {e}", self.gzip.display()))?;
        tracing::debug!(image = %image.display(), %status, "payload inflated");

        let mut elf = [0u8; 40];
        let mut file = File::open(inflated.path()).map_err(|e| format!("cannot reopen: {e}"))?;
        let n = read_up_to(&mut file, &mut elf).map_err(|e| format!("cannot read payload: {e}"))?;
        check_machine(&elf[..n])
    }
}

#[async_trait]
impl BootImageValidator for BzImageValidator {
    async fn validate(&self, image: &Path) -> Result<(), BootError> {
        let validator = Self {
            gzip: self.gzip.clone(),
            scratch_dir: self.scratch_dir.clone(),
        };
        let path = image.to_path_buf();
        let result = tokio::task::spawn_blocking(move || validator.validate_blocking(&path))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r);
        result.map_err(|reason| BootError::InvalidImage {
            path: image.to_path_buf(),
            reason,
        })
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

pub(crate) fn check_setup_header(buf: &[u8]) -> Result<(), String> {
    if buf.len() <= LOADFLAGS_OFFSET {
        return Err("file too short".into());
    }
    if &buf[SETUP_MAGIC_OFFSET..SETUP_MAGIC_OFFSET + 4] != SETUP_MAGIC {
        return Err("missing Linux setup header".into());
    }
    if buf[BOOT_FLAG_OFFSET] != 0x55 || buf[BOOT_FLAG_OFFSET + 1] != 0xaa {
        return Err("missing boot sector signature".into());
    }
    if buf[LOADFLAGS_OFFSET] != 1 {
        return Err("not a bzImage".into());
    }
    Ok(())
}

pub(crate) fn find_payload(data: &[u8]) -> Option<usize> {
    data.windows(GZIP_MAGIC.len()).position(|w| w == GZIP_MAGIC)
}

pub(crate) fn check_machine(elf: &[u8]) -> Result<(), String> {
    match elf.get(ELF_MACHINE_OFFSET) {
        Some(&EM_X86_64) | Some(&EM_K1OM) => Ok(()),
        Some(other) => Err(format!("unsupported machine type {other:#04x}")),
        None => Err("payload too short".into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn setup_header() -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        buf[510] = 0x55;
        buf[511] = 0xaa;
        buf[514..518].copy_from_slice(b"HdrS");
        buf[529] = 1;
        buf
    }

    #[test]
    fn accepts_well_formed_header() {
        assert!(check_setup_header(&setup_header()).is_ok());
    }

    #[test]
    fn rejects_each_bad_header_field() {
        let mut no_magic = setup_header();
        no_magic[514] = b'X';
        assert!(check_setup_header(&no_magic).is_err());

        let mut no_sig = setup_header();
        no_sig[511] = 0;
        assert!(check_setup_header(&no_sig).is_err());

        let mut zimage = setup_header();
        zimage[529] = 0;
        assert!(check_setup_header(&zimage).is_err());

        assert!(check_setup_header(&[0u8; 100]).is_err());
    }

    #[test]
    fn finds_first_gzip_marker() {
        let mut data = vec![0x1f, 0x8b, 0x00, 0x1f];
        data.extend_from_slice(&GZIP_MAGIC);
        assert_eq!(find_payload(&data), Some(4));
        assert_eq!(find_payload(&GZIP_MAGIC), Some(0));
        assert_eq!(find_payload(&[0x1f, 0x8b]), None);
    }

    #[test]
    fn machine_byte_checked() {
        let mut elf = [0u8; 40];
        elf[18] = 0x3e;
        assert!(check_machine(&elf).is_ok());
        elf[18] = 0xb5;
        assert!(check_machine(&elf).is_ok());
        elf[18] = 0x28;
        assert!(check_machine(&elf).is_err());
        assert!(check_machine(&elf[..10]).is_err());
    }

    #[tokio::test]
    async fn validates_image_with_real_gzip() {
        let gzip = Path::new("/bin/gzip");
        if !gzip.exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();

        let mut elf = vec![0u8; 64];
        elf[..4].copy_from_slice(b"\x7fELF");
        elf[18] = EM_X86_64;
        let raw = dir.path().join("vmlinux");
        std::fs::write(&raw, &elf).unwrap();
        let out = Command::new(gzip).arg("-c").arg(&raw).output().unwrap();
        assert!(out.status.success());

        let mut image = setup_header();
        image.extend_from_slice(&out.stdout);
        image.extend_from_slice(&[0u8; 32]);
        let path = dir.path().join("bzImage");
        std::fs::write(&path, &image).unwrap();

        let validator = BzImageValidator::new(gzip, dir.path());
        validator.validate(&path).await.unwrap();

        // Only the image and the raw kernel remain; temp files are gone.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn missing_image_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let validator = BzImageValidator::new("/bin/gzip", dir.path());
        let err = validator
            .validate(&dir.path().join("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, BootError::InvalidImage { .. }));
    }
}
