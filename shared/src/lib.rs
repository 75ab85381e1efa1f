pub use anyhow::Error;
use std::{
    fs::{self, File, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::Path,
    time::{Duration, SystemTime},
};

pub mod deeplink;
pub mod interface_config;
pub mod key;
pub mod signal;
pub mod types;

pub use types::*;

/// Default WireGuard listen port rendered into device configurations.
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Well-known TCP port for direct peer-to-peer file transfers.
pub const TRANSFER_PORT: u16 = 3001;

/// Fixed chunk size used when streaming transfer payloads.
pub const TRANSFER_CHUNK_SIZE: usize = 32 * 1024;

/// Length of a transfer session id on the wire (canonical UUID form).
pub const SESSION_ID_LEN: usize = 36;

/// Connect deadline for outbound transfer dials.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an unanswered inbound transfer request is kept around.
pub const PENDING_REQUEST_TTL: Duration = Duration::from_secs(5 * 60);

/// Encoded length of an invite token (32 random bytes, URL-safe base64).
pub const INVITE_TOKEN_LEN: usize = 44;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Something is horribly wrong with system time.")
        .as_secs()
}

pub fn ensure_dirs_exist(dirs: &[&Path]) -> Result<(), WrappedIoError> {
    for dir in dirs {
        match fs::create_dir(dir).with_path(dir) {
            Ok(()) => {
                log::debug!("created dir {}", dir.to_string_lossy());
                std::fs::set_permissions(dir, Permissions::from_mode(0o700)).with_path(dir)?;
            },
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn_on_dangerous_mode(dir).with_path(dir)?;
            },
            Err(e) => {
                return Err(e);
            },
        }
    }
    Ok(())
}

pub fn warn_on_dangerous_mode(path: &Path) -> Result<(), io::Error> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o007 != 0 {
        log::warn!(
            "{} is world-accessible (mode is {:#05o}). This is probably not what you want.",
            path.to_string_lossy(),
            mode
        );
    }
    Ok(())
}

/// Updates the permissions of a file or directory. Returns `Ok(true)` if
/// permissions had to be changed, `Ok(false)` if permissions were already
/// correct.
pub fn chmod(file: &File, new_mode: u32) -> Result<bool, io::Error> {
    let metadata = file.metadata()?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode() & 0o777;
    let updated = if mode != new_mode {
        permissions.set_mode(new_mode);
        file.set_permissions(permissions)?;
        true
    } else {
        false
    };

    Ok(updated)
}
