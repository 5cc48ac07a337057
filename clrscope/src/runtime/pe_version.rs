//! Runtime version stored in a managed PE image.
//!
//! Managed executables carry a CLI header (data directory 14) pointing at the
//! metadata root. The root starts with the `BSJB` signature and records the
//! version string of the runtime the image was built against.

use std::fs;
use std::path::Path;

use object::pe;
use object::read::pe::{ImageNtHeaders, PeFile};
use object::FileKind;

use crate::domain::RuntimeError;

const METADATA_SIGNATURE: u32 = 0x424A_5342;

/// Read the runtime version recorded in the managed image at `path`
///
/// # Errors
/// `Io` when the file cannot be read, `UnrecognizedRuntimeFile` when it is not
/// a managed image
pub fn runtime_version(path: &Path) -> Result<String, RuntimeError> {
    let data = fs::read(path)?;
    version_from_image(&data).map_err(|reason| RuntimeError::UnrecognizedRuntimeFile {
        path: path.to_path_buf(),
        reason,
    })
}

/// # Errors
/// Returns a description of why no version could be read
pub fn version_from_image(data: &[u8]) -> Result<String, String> {
    match FileKind::parse(data).map_err(|e| e.to_string())? {
        FileKind::Pe32 => metadata_version::<pe::ImageNtHeaders32>(data),
        FileKind::Pe64 => metadata_version::<pe::ImageNtHeaders64>(data),
        other => Err(format!("not a PE image ({other:?})")),
    }
}

fn metadata_version<Pe: ImageNtHeaders>(data: &[u8]) -> Result<String, String> {
    let file = PeFile::<Pe>::parse(data).map_err(|e| e.to_string())?;
    let directory = file
        .data_directory(pe::IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR)
        .ok_or("no CLI header (not a managed image)")?;

    let sections = file.section_table();
    let cli_header = directory.data(data, &sections).map_err(|e| e.to_string())?;

    // IMAGE_COR20_HEADER: cb, major, minor, then the metadata directory
    let metadata_rva = read_u32(cli_header, 8)?;
    let metadata_size = read_u32(cli_header, 12)? as usize;

    let metadata = sections
        .pe_data_at(data, metadata_rva)
        .ok_or("metadata root lies outside every section")?;
    let metadata = &metadata[..metadata_size.min(metadata.len())];

    parse_metadata_root(metadata)
}

/// Extract the version string from a metadata root
///
/// # Errors
/// Returns a description when the signature or the string is invalid
pub fn parse_metadata_root(root: &[u8]) -> Result<String, String> {
    if read_u32(root, 0)? != METADATA_SIGNATURE {
        return Err("bad metadata signature".to_string());
    }

    let length = read_u32(root, 12)? as usize;
    let raw = root
        .get(16..16 + length)
        .ok_or_else(|| format!("version string ({length} bytes) runs past the metadata root"))?;

    // Padded with NULs to a 4-byte boundary
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let version = std::str::from_utf8(&raw[..end]).map_err(|e| e.to_string())?;
    if version.is_empty() {
        return Err("empty runtime version".to_string());
    }
    Ok(version.to_string())
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, String> {
    data.get(offset..offset + 4)
        .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| format!("truncated at offset {offset}"))
}
