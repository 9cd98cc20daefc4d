//! Executable mappings of the process, recorded so that sampled addresses
//! can later be attributed to the object they fall in.

use crate::header::AddressRange;
use crate::util::now;

use perfcollect_proto::{BlobPayload, LinkedObject, PayloadKind};
use procfs::process::{MMPermissions, MMapPath, Process};
use prost::bytes::BufMut;
use prost::encoding::message;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// `time_end` of an object that is still loaded.
pub const STILL_LOADED: u64 = u64::MAX;

const OBJECTS_TAG: u32 = 1;

#[derive(Debug, Error)]
pub enum DsoError {
    #[error("could not read the process mappings: {0}")]
    Maps(#[from] procfs::ProcError),
}

/// Executable, file backed mappings of the calling process. With `library`,
/// only the first mapping whose file name starts with the library's file name
/// is returned.
pub fn linked_objects(library: Option<&str>) -> Result<Vec<LinkedObject>, DsoError> {
    let maps = Process::myself()?.maps()?;
    let executable = executable_path();
    let wanted = library.map(file_name);
    let loaded_at = now();

    let mut objects = Vec::new();
    for map in maps.iter() {
        if !map.perms.contains(MMPermissions::EXECUTE) {
            continue;
        }
        let MMapPath::Path(path) = &map.pathname else {
            continue;
        };
        if let Some(wanted) = &wanted {
            if !file_name(&path.to_string_lossy()).starts_with(wanted.as_str()) {
                continue;
            }
        }
        objects.push(LinkedObject {
            path: path.to_string_lossy().into_owned(),
            addr_begin: map.address.0,
            addr_end: map.address.1,
            time_begin: loaded_at,
            time_end: STILL_LOADED,
            is_executable: executable.as_deref() == Some(path.as_path()),
        });
        if wanted.is_some() {
            break;
        }
    }
    debug!("{} linked objects found for {:?}", objects.len(), library);
    Ok(objects)
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Addresses spanned by `objects`.
pub fn address_range(objects: &[LinkedObject]) -> AddressRange {
    let mut range = AddressRange::EMPTY;
    for object in objects {
        range.widen(object.addr_begin);
        if object.addr_end > object.addr_begin {
            range.widen(object.addr_end - 1);
        }
    }
    range
}

/// Borrowed group of linked objects, encoded as a `LinkedObjectGroup`.
pub struct LinkedObjectsView<'a>(pub &'a [LinkedObject]);

impl BlobPayload for LinkedObjectsView<'_> {
    fn kind(&self) -> PayloadKind {
        PayloadKind::LinkedObjects
    }

    fn encoded_len(&self) -> usize {
        message::encoded_len_repeated(OBJECTS_TAG, self.0)
    }

    fn encode_raw(&self, buf: &mut impl BufMut) {
        message::encode_repeated(OBJECTS_TAG, self.0, buf);
    }
}

/// Path of the running executable, as it appears in the mappings.
pub fn executable_path() -> Option<PathBuf> {
    std::env::current_exe().ok()
}
