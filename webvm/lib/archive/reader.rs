use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{WebVmError, WebVmResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The size of a tar header or data block.
pub const TAR_BLOCK_SIZE: usize = 512;

const NAME_RANGE: (usize, usize) = (0, 100);
const SIZE_RANGE: (usize, usize) = (124, 12);
const TYPEFLAG_OFFSET: usize = 156;
const MAGIC_RANGE: (usize, usize) = (257, 6);
const PREFIX_RANGE: (usize, usize) = (345, 155);

const USTAR_MAGIC: &[u8] = b"ustar\0";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kind of a tar entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TarEntryType {
    /// A regular file.
    File,

    /// A directory. Its name always ends with `/`.
    Directory,
}

/// An entry parsed out of a tar archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    /// The entry path as stored in the archive.
    pub name: String,

    /// The declared size in bytes.
    pub size: u64,

    /// File or directory.
    pub entry_type: TarEntryType,

    /// The contents, trimmed to `size`. Empty for directories.
    pub data: Bytes,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TarEntry {
    /// Returns `true` for regular files.
    pub fn is_file(&self) -> bool {
        self.entry_type == TarEntryType::File
    }

    /// Returns `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.entry_type == TarEntryType::Directory
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a POSIX tar byte stream into its file and directory entries.
///
/// Parsing stops at the first all-zero block, so archives terminated by a single zero block are
/// accepted. Entry types other than regular files (`'0'` or NUL) and directories (`'5'`) are
/// skipped. Empty input yields no entries.
///
/// ## Errors
///
/// Returns [`WebVmError::MalformedArchive`] if a header is cut short, a size field is not octal,
/// or a data section runs past the end of the input.
///
/// ## Examples
///
/// ```
/// use webvm::archive::parse_tar;
///
/// assert!(parse_tar(&[]).unwrap().is_empty());
/// assert!(parse_tar(&[0u8; 1024]).unwrap().is_empty());
/// ```
pub fn parse_tar(bytes: &[u8]) -> WebVmResult<Vec<TarEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let Some(header) = bytes.get(offset..offset + TAR_BLOCK_SIZE) else {
            return Err(WebVmError::MalformedArchive(format!(
                "truncated header at offset {offset}"
            )));
        };

        if header.iter().all(|b| *b == 0) {
            break;
        }

        let size = parse_octal(field(header, SIZE_RANGE)).ok_or_else(|| {
            WebVmError::MalformedArchive(format!("invalid size field at offset {offset}"))
        })?;

        let data_start = offset + TAR_BLOCK_SIZE;
        let data_end = usize::try_from(size)
            .ok()
            .and_then(|size| data_start.checked_add(size))
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                WebVmError::MalformedArchive(format!(
                    "entry at offset {offset} declares {size} bytes past the end of the archive"
                ))
            })?;

        let name = entry_name(header);
        match header[TYPEFLAG_OFFSET] {
            b'0' | 0 => entries.push(TarEntry {
                name,
                size,
                entry_type: TarEntryType::File,
                data: Bytes::copy_from_slice(&bytes[data_start..data_end]),
            }),
            b'5' => entries.push(TarEntry {
                name: if name.ends_with('/') {
                    name
                } else {
                    format!("{name}/")
                },
                size,
                entry_type: TarEntryType::Directory,
                data: Bytes::new(),
            }),
            flag => tracing::trace!("skipping tar entry {name} with type flag {flag:#x}"),
        }

        offset = data_start + padded_len(data_end - data_start);
    }

    Ok(entries)
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn field(header: &[u8], (start, len): (usize, usize)) -> &[u8] {
    &header[start..start + len]
}

/// Reads a NUL-terminated string field.
fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Joins the ustar prefix onto the name when the header carries one.
fn entry_name(header: &[u8]) -> String {
    let name = cstr(field(header, NAME_RANGE));
    if field(header, MAGIC_RANGE) != USTAR_MAGIC {
        return name;
    }

    let prefix = cstr(field(header, PREFIX_RANGE));
    if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    }
}

/// Decodes an octal number padded with leading spaces and terminated by NUL or space.
fn parse_octal(bytes: &[u8]) -> Option<u64> {
    let digits = bytes
        .iter()
        .skip_while(|b| **b == b' ')
        .take_while(|b| **b != 0 && **b != b' ');

    let mut value: u64 = 0;
    for digit in digits {
        if !(b'0'..=b'7').contains(digit) {
            return None;
        }
        value = value.checked_mul(8)?.checked_add(u64::from(digit - b'0'))?;
    }

    Some(value)
}

fn padded_len(size: usize) -> usize {
    size.div_ceil(TAR_BLOCK_SIZE) * TAR_BLOCK_SIZE
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
