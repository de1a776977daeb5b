//! APTPL Persistence
//!
//! Reservation state is persisted to a flat binary file so it can survive
//! a power loss. Updates are crash safe: the previous file is first copied
//! to a shadow (`<path>.1`), the new content is written with a zeroed
//! signature, synced, and only then is the real signature written and
//! synced again. A reader that finds a zeroed or torn signature falls back
//! to the shadow copy.
//!
//! Layout (fixed-width fields, little-endian; reservation keys keep their
//! big-endian wire form):
//!
//! ```text
//! offset  field
//!  0      8-byte signature (zero until commit)
//!  8      8-byte version (= 1)
//! 16      1-byte aptpl
//! 17      1-byte is_set
//! 18      1-byte type
//! 19      1-byte scope
//! 20..    registrant records:
//!           1-byte is_holder
//!           N-byte transport id (N = its encoded size)
//!           8-byte key
//!           2-byte rel_tgt_id
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::pr::{PrState, PrType, transport_id};
use crate::target::Device;

const PR_FILE_SIGN: u64 = 0xbbee_eeaa_eebb_dd77;
const PR_FILE_VERSION: u64 = 1;

/// Anti-corruption cap: a reservation file can never legitimately get
/// anywhere near this.
const PR_FILE_MAX_SIZE: u64 = 15 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PrFileError {
    #[error("no PR file path configured")]
    NoPath,
    #[error("invalid PR file path {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("PR file not found")]
    NotFound,
    #[error("invalid PR file size {0}")]
    BadSize(u64),
    #[error("invalid PR file signature {0:#018x}")]
    BadSignature(u64),
    #[error("invalid PR file version {0}")]
    BadVersion(u64),
    #[error("truncated or corrupt PR file")]
    Truncated,
    #[error("invalid reservation type {0:#04x} in PR file")]
    BadType(u8),
    #[error("zero reservation key in PR file")]
    ZeroKey,
    #[error("reservation holder missing from PR file")]
    NoHolder,
    #[error("duplicate registrant in PR file")]
    DuplicateRegistrant,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct FileHeader {
    sign: U64<LittleEndian>,
    version: U64<LittleEndian>,
    aptpl: u8,
    is_set: u8,
    pr_type: u8,
    scope: u8,
}

const HEADER_SIZE: usize = size_of::<FileHeader>();

struct LoadedReg {
    is_holder: bool,
    transport_id: Box<[u8]>,
    key: u64,
    rel_tgt_id: u16,
}

struct LoadedState {
    aptpl: bool,
    is_set: bool,
    pr_type: PrType,
    scope: u8,
    regs: Vec<LoadedReg>,
}

fn classify_io(e: io::Error) -> PrFileError {
    if e.kind() == io::ErrorKind::NotFound {
        PrFileError::NotFound
    } else {
        PrFileError::Io(e)
    }
}

/// Parse and fully validate one state file. Nothing is mutated here; the
/// caller commits the result only when parsing succeeded.
fn read_state_file(path: &Path) -> Result<LoadedState, PrFileError> {
    let file_size = fs::metadata(path).map_err(classify_io)?.len();
    if file_size == 0 || file_size >= PR_FILE_MAX_SIZE {
        log::error!("Invalid PR file size {file_size}");
        return Err(PrFileError::BadSize(file_size));
    }

    let buf = fs::read(path).map_err(classify_io)?;
    if buf.len() < HEADER_SIZE {
        log::error!("Invalid file '{}' - size too small", path.display());
        return Err(PrFileError::Truncated);
    }

    let header =
        FileHeader::read_from_bytes(&buf[..HEADER_SIZE]).map_err(|_| PrFileError::Truncated)?;

    let sign = header.sign.get();
    if sign != PR_FILE_SIGN {
        log::error!(
            "Invalid persistent file signature {:#018x} (expected {:#018x})",
            sign,
            PR_FILE_SIGN
        );
        return Err(PrFileError::BadSignature(sign));
    }

    let version = header.version.get();
    if version != PR_FILE_VERSION {
        log::error!("Invalid persistent file version {version} (expected {PR_FILE_VERSION})");
        return Err(PrFileError::BadVersion(version));
    }

    let pr_type = PrType::from_raw(header.pr_type).ok_or(PrFileError::BadType(header.pr_type))?;

    let mut regs: Vec<LoadedReg> = Vec::new();
    let mut pos = HEADER_SIZE;
    while pos + 1 < buf.len() {
        let is_holder = buf[pos] != 0;
        pos += 1;

        let tid_size = transport_id::parse_size(&buf[pos..]).ok_or(PrFileError::Truncated)?;
        if pos + tid_size + 8 + 2 > buf.len() {
            log::error!(
                "Invalid file '{}' - record extends past end of file",
                path.display()
            );
            return Err(PrFileError::Truncated);
        }

        let tid: Box<[u8]> = buf[pos..pos + tid_size].into();
        pos += tid_size;

        let key = u64::from_be_bytes(
            buf[pos..pos + 8]
                .try_into()
                .map_err(|_| PrFileError::Truncated)?,
        );
        pos += 8;

        let rel_tgt_id = u16::from_le_bytes(
            buf[pos..pos + 2]
                .try_into()
                .map_err(|_| PrFileError::Truncated)?,
        );
        pos += 2;

        if key == 0 {
            return Err(PrFileError::ZeroKey);
        }
        if regs
            .iter()
            .any(|r| r.rel_tgt_id == rel_tgt_id && transport_id::equal(&r.transport_id, &tid))
        {
            return Err(PrFileError::DuplicateRegistrant);
        }

        regs.push(LoadedReg {
            is_holder,
            transport_id: tid,
            key,
            rel_tgt_id,
        });
    }

    let is_set = header.is_set != 0;
    if is_set && !pr_type.is_all_reg() && !regs.iter().any(|r| r.is_holder) {
        return Err(PrFileError::NoHolder);
    }

    Ok(LoadedState {
        aptpl: header.aptpl != 0,
        is_set,
        pr_type,
        scope: header.scope,
        regs,
    })
}

fn open_truncated(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut opts, 0o644);
    opts.open(path)
}

fn write_state_file(path: &Path, state: &PrState) -> io::Result<()> {
    let mut file = open_truncated(path)?;

    // Body first, signature zeroed; the real signature lands only after
    // everything else is on stable storage.
    let header = FileHeader {
        sign: U64::new(0),
        version: U64::new(PR_FILE_VERSION),
        aptpl: u8::from(state.aptpl),
        is_set: u8::from(state.is_set),
        pr_type: state.pr_type.as_u8(),
        scope: state.scope,
    };
    file.write_all(header.as_bytes())?;

    for reg in &state.registrants {
        let is_holder = state.holder == Some(reg.id());
        file.write_all(&[u8::from(is_holder)])?;
        file.write_all(reg.transport_id())?;
        file.write_all(&reg.key().to_be_bytes())?;
        file.write_all(&reg.rel_tgt_id().to_le_bytes())?;
    }

    file.sync_data()?;

    file.seek(SeekFrom::Start(0))?;
    file.write_all(U64::<LittleEndian>::new(PR_FILE_SIGN).as_bytes())?;
    file.sync_data()?;

    Ok(())
}

fn remove_pr_files(name: &str, path: &Path, backup: &Path) {
    for p in [path, backup] {
        if let Err(e) = fs::remove_file(p) {
            if e.kind() != io::ErrorKind::NotFound {
                log::error!("{name}: unable to remove PR file '{}': {e}", p.display());
            }
        }
    }
}

impl Device {
    /// Bring the on-disk state in line with the in-memory state. Invoked
    /// under the device write lock after every mutation that touched the
    /// registrant set or the holder.
    ///
    /// A write failure is logged and swallowed: the in-memory operation
    /// already succeeded, and failing it now would leave the initiator
    /// worse off than a stale file the operator can repair.
    pub(crate) fn sync_file(&self, state: &PrState) {
        let (Some(path), Some(backup)) = (&state.file_path, &state.backup_path) else {
            if state.aptpl {
                log::error!("{}: APTPL set but no PR file path configured", self.name);
            }
            return;
        };

        if !state.aptpl || state.registrants.is_empty() {
            remove_pr_files(&self.name, path, backup);
            return;
        }

        if let Err(e) = fs::copy(path, backup) {
            if e.kind() != io::ErrorKind::NotFound {
                log::debug!("Unable to shadow PR file '{}': {e}", path.display());
            }
        }

        log::debug!("Updating pr file '{}'", path.display());

        if let Err(e) = write_state_file(path, state) {
            log::error!("Error writing to '{}': {e}", path.display());
            let _ = fs::remove_file(path);
            log::error!(
                "Unable to save persistent information (device {}), operator intervention required",
                self.name
            );
        }
    }

    /// Load reservation state at device bring-up, falling back from the
    /// primary file to the shadow copy. Missing files mean a clean device,
    /// not an error.
    pub fn load_pr_state(&self) -> Result<(), PrFileError> {
        let mut state = self.write_state();

        let (path, backup) = match (&state.file_path, &state.backup_path) {
            (Some(p), Some(b)) => (p.clone(), b.clone()),
            _ => {
                log::error!("Invalid PR file paths for '{}'", self.name);
                return Err(PrFileError::NoPath);
            }
        };

        log::debug!("Loading persistent file '{}'", path.display());

        let loaded = match read_state_file(&path) {
            Ok(l) => Some(l),
            Err(PrFileError::NotFound) => match read_state_file(&backup) {
                Ok(l) => Some(l),
                Err(PrFileError::NotFound) => None,
                Err(e) => {
                    log::error!("Unable to load PR backup file '{}': {e}", backup.display());
                    return Err(e);
                }
            },
            Err(primary_err) => {
                log::error!("Unable to load PR file '{}': {primary_err}", path.display());
                match read_state_file(&backup) {
                    Ok(l) => Some(l),
                    Err(e) => {
                        log::error!("Unable to load PR backup file '{}': {e}", backup.display());
                        return Err(primary_err);
                    }
                }
            }
        };

        self.remove_all_registrants(&mut state);
        if state.is_set {
            state.clear_reservation();
        }
        state.aptpl = false;

        let Some(loaded) = loaded else {
            log::debug!("No PR file for '{}', starting clean", self.name);
            return Ok(());
        };

        state.aptpl = loaded.aptpl;
        state.is_set = loaded.is_set;
        state.pr_type = loaded.pr_type;
        state.scope = loaded.scope;

        for rec in &loaded.regs {
            let Some(id) =
                self.add_registrant(&mut state, &rec.transport_id, rec.rel_tgt_id, rec.key)
            else {
                return Err(PrFileError::DuplicateRegistrant);
            };
            if rec.is_holder {
                state.holder = Some(id);
            }
        }

        self.log_state(&state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{TestHooks, device_with_hooks, iscsi_tid};
    use std::sync::Arc;

    fn dev_with_file(dir: &Path) -> crate::target::Device {
        let dev = device_with_hooks(Arc::new(TestHooks::default()));
        dev.set_pr_file_path(dir.join("pr")).unwrap();
        dev
    }

    fn populate(dev: &crate::target::Device, aptpl: bool) {
        let mut state = dev.write_state();
        let a = dev
            .add_registrant(&mut state, &iscsi_tid("iqn.a"), 1, 0xaa)
            .unwrap();
        dev.add_registrant(&mut state, &iscsi_tid("iqn.b"), 2, 0xbb)
            .unwrap();
        state.set_holder(Some(a), crate::pr::SCOPE_LU, PrType::WriteExclusive);
        state.aptpl = aptpl;
        state.generation = 7;
    }

    #[test]
    fn save_then_load_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dev_with_file(dir.path());
        populate(&dev, true);
        {
            let state = dev.read_state();
            dev.sync_file(&state);
        }

        let dev2 = dev_with_file(dir.path());
        dev2.load_pr_state().unwrap();
        let state = dev2.read_state();
        assert!(state.aptpl);
        assert!(state.is_set);
        assert_eq!(state.pr_type, PrType::WriteExclusive);
        assert_eq!(state.scope, crate::pr::SCOPE_LU);
        assert_eq!(state.registrants.len(), 2);
        assert_eq!(state.registrants[0].key(), 0xaa);
        assert_eq!(state.registrants[0].rel_tgt_id(), 1);
        assert_eq!(state.registrants[1].key(), 0xbb);
        let holder = state.holder.and_then(|id| state.reg(id)).unwrap();
        assert_eq!(holder.key(), 0xaa);
    }

    #[test]
    fn corrupt_primary_falls_back_to_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dev_with_file(dir.path());
        populate(&dev, true);
        // Two syncs so the shadow copy holds a full good state
        {
            let state = dev.read_state();
            dev.sync_file(&state);
            dev.sync_file(&state);
        }

        // Corrupt the primary body
        let primary = dir.path().join("pr");
        let mut bytes = fs::read(&primary).unwrap();
        let last = bytes.len() - 1;
        bytes.truncate(last);
        fs::write(&primary, &bytes).unwrap();

        let dev2 = dev_with_file(dir.path());
        dev2.load_pr_state().unwrap();
        let state = dev2.read_state();
        assert_eq!(state.registrants.len(), 2);
        assert!(state.is_set);
        assert_eq!(state.pr_type, PrType::WriteExclusive);
    }

    #[test]
    fn missing_files_mean_clean_state() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dev_with_file(dir.path());
        dev.load_pr_state().unwrap();
        let state = dev.read_state();
        assert!(!state.is_set);
        assert!(state.registrants.is_empty());
    }

    #[test]
    fn bad_signature_is_structural() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dev_with_file(dir.path());
        populate(&dev, true);
        {
            let state = dev.read_state();
            dev.sync_file(&state);
        }

        let primary = dir.path().join("pr");
        let mut bytes = fs::read(&primary).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&primary, &bytes).unwrap();
        // No shadow: first sync had nothing to copy
        fs::remove_file(dir.path().join("pr.1")).ok();

        let dev2 = dev_with_file(dir.path());
        assert!(matches!(
            dev2.load_pr_state(),
            Err(PrFileError::BadSignature(_))
        ));
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dev_with_file(dir.path());
        fs::write(dir.path().join("pr"), b"").unwrap();
        assert!(matches!(dev.load_pr_state(), Err(PrFileError::BadSize(0))));
    }

    #[test]
    fn zero_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dev_with_file(dir.path());
        populate(&dev, true);
        {
            let mut state = dev.write_state();
            state.registrants[1].set_key(0);
            dev.sync_file(&state);
        }

        let dev2 = dev_with_file(dir.path());
        assert!(matches!(dev2.load_pr_state(), Err(PrFileError::ZeroKey)));
    }

    #[test]
    fn files_removed_when_aptpl_clear_or_empty() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dev_with_file(dir.path());
        populate(&dev, true);
        {
            let state = dev.read_state();
            dev.sync_file(&state);
            dev.sync_file(&state);
        }
        assert!(dir.path().join("pr").exists());
        assert!(dir.path().join("pr.1").exists());

        {
            let mut state = dev.write_state();
            state.aptpl = false;
            dev.sync_file(&state);
        }
        assert!(!dir.path().join("pr").exists());
        assert!(!dir.path().join("pr.1").exists());
    }

    #[test]
    fn signature_lands_last() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dev_with_file(dir.path());
        populate(&dev, true);
        let state = dev.read_state();
        dev.sync_file(&state);

        let bytes = fs::read(dir.path().join("pr")).unwrap();
        assert_eq!(
            u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            PR_FILE_SIGN
        );
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 1);
        assert_eq!(bytes[16], 1); // aptpl
        assert_eq!(bytes[17], 1); // reserved
        assert_eq!(bytes[18], PrType::WriteExclusive.as_u8());
        assert_eq!(bytes[19], crate::pr::SCOPE_LU);
        // First record: holder flag then the transport id
        assert_eq!(bytes[20], 1);
        assert_eq!(bytes[21] & 0x0f, transport_id::PROTOCOL_ID_ISCSI);
    }
}
