//! File I/O utilities shared by the persistent stores.
//!
//! Every store replaces files through [`write_atomic`] so readers observe
//! either the previous or the new content, never a partial write.

use crate::Result;
use std::path::Path;

/// Write `data` to `target` via a uniquely named temp file in the same
/// directory followed by a rename.
///
/// # Errors
///
/// Returns `SpecimenError::Io` for I/O errors (these always bubble up).
pub fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let pid = std::process::id();
    let thread_id = std::thread::current().id();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let temp_path = dir.join(format!("{}.tmp.{}.{:?}.{}", file_name, pid, thread_id, timestamp));

    std::fs::write(&temp_path, data)?;

    if let Err(e) = std::fs::rename(&temp_path, target) {
        // Leftover temp file would otherwise linger until the next reconcile
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    Ok(())
}

/// Whether a file name belongs to an in-flight or abandoned [`write_atomic`].
pub fn is_temp_file(file_name: &str) -> bool {
    file_name.contains(".tmp.")
}

/// Read a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
