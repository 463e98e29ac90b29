//! Disk persistence.
//!
//! Each cached entry serializes into one file below the persistence root,
//! fanned out by hash prefix:
//!
//! ```text
//! <root>/<hash[0..2]>/<hash[2..4]>/<hash-hex>-<nonce>
//! ```
//!
//! The file starts with a fixed header (magic, crc32, hash, expire, field
//! lengths, response info), followed by the variable-length meta fields in
//! declared order, followed by the body bytes. The crc covers everything
//! after the crc field itself. Files are written to a temporary sibling and
//! renamed into place, so a partially written file is never exposed.

use std::convert::TryInto;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

use crate::data::ResponseInfo;
use crate::tools;

pub const PERSIST_MAGIC: [u8; 8] = *b"LARDERF\x01";

const META_FIXED_LEN: usize = 72;

const FLAG_CHUNKED: u16 = 0x0001;
const FLAG_CONTENT_LENGTH: u16 = 0x0002;

lazy_static! {
    static ref ENTRY_FILE_NAME: Regex =
        Regex::new(r"^[0-9a-f]{16}-[0-9a-f]{8}$").unwrap();
}

static NONCE: AtomicU32 = AtomicU32::new(1);

/// Everything an entry needs to rematerialize, minus the body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistMeta {
    pub hash: u64,
    pub expire: u64,
    pub header_len: u32,
    pub etag: Option<Vec<u8>>,
    pub last_modified: Option<Vec<u8>>,
    pub host: Option<Vec<u8>>,
    pub path: Option<Vec<u8>>,
    pub key: Vec<u8>,
    pub info: ResponseInfo,
}

fn opt_len(field: &Option<Vec<u8>>) -> u32 {
    field.as_ref().map(|v| v.len() as u32).unwrap_or(0)
}

fn take_field(raw: &[u8], offset: &mut usize, len: u32) -> Result<Option<Vec<u8>>, Error> {
    let len = len as usize;

    if *offset + len > raw.len() {
        bail!("truncated meta field");
    }

    let field = if len == 0 {
        None
    } else {
        Some(raw[*offset..*offset + len].to_vec())
    };

    *offset += len;
    Ok(field)
}

/// Serialize meta + body into the file image.
pub fn encode(meta: &PersistMeta, body: &[u8]) -> Vec<u8> {
    let var_len = opt_len(&meta.etag)
        + opt_len(&meta.last_modified)
        + opt_len(&meta.host)
        + opt_len(&meta.path)
        + meta.key.len() as u32
        + opt_len(&meta.info.content_type)
        + opt_len(&meta.info.transfer_encoding);

    let mut raw = Vec::with_capacity(META_FIXED_LEN + var_len as usize + body.len());

    let mut flags = 0u16;
    if meta.info.chunked {
        flags |= FLAG_CHUNKED;
    }
    if meta.info.content_length.is_some() {
        flags |= FLAG_CONTENT_LENGTH;
    }

    raw.extend_from_slice(&PERSIST_MAGIC);
    raw.extend_from_slice(&[0u8; 4]); // crc placeholder
    raw.extend_from_slice(&meta.hash.to_le_bytes());
    raw.extend_from_slice(&meta.expire.to_le_bytes());
    raw.extend_from_slice(&meta.header_len.to_le_bytes());
    raw.extend_from_slice(&opt_len(&meta.etag).to_le_bytes());
    raw.extend_from_slice(&opt_len(&meta.last_modified).to_le_bytes());
    raw.extend_from_slice(&opt_len(&meta.host).to_le_bytes());
    raw.extend_from_slice(&opt_len(&meta.path).to_le_bytes());
    raw.extend_from_slice(&(meta.key.len() as u32).to_le_bytes());
    raw.extend_from_slice(&opt_len(&meta.info.content_type).to_le_bytes());
    raw.extend_from_slice(&opt_len(&meta.info.transfer_encoding).to_le_bytes());
    raw.extend_from_slice(&meta.info.status.to_le_bytes());
    raw.extend_from_slice(&flags.to_le_bytes());
    raw.extend_from_slice(&meta.info.content_length.unwrap_or(0).to_le_bytes());

    debug_assert_eq!(raw.len(), META_FIXED_LEN);

    if let Some(field) = &meta.etag {
        raw.extend_from_slice(field);
    }
    if let Some(field) = &meta.last_modified {
        raw.extend_from_slice(field);
    }
    if let Some(field) = &meta.host {
        raw.extend_from_slice(field);
    }
    if let Some(field) = &meta.path {
        raw.extend_from_slice(field);
    }
    raw.extend_from_slice(&meta.key);
    if let Some(field) = &meta.info.content_type {
        raw.extend_from_slice(field);
    }
    if let Some(field) = &meta.info.transfer_encoding {
        raw.extend_from_slice(field);
    }

    raw.extend_from_slice(body);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&raw[12..]);
    let crc = hasher.finalize();
    raw[8..12].copy_from_slice(&crc.to_le_bytes());

    raw
}

fn u32_at(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap())
}

fn u64_at(raw: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(raw[offset..offset + 8].try_into().unwrap())
}

/// Decode a full file image. Returns the meta and the body offset.
pub fn decode(raw: &[u8]) -> Result<(PersistMeta, usize), Error> {

    if raw.len() < META_FIXED_LEN {
        bail!("file shorter than the fixed meta header");
    }

    if raw[0..8] != PERSIST_MAGIC {
        bail!("bad magic");
    }

    let crc = u32_at(raw, 8);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&raw[12..]);
    if hasher.finalize() != crc {
        bail!("crc mismatch");
    }

    let hash = u64_at(raw, 12);
    let expire = u64_at(raw, 20);
    let header_len = u32_at(raw, 28);
    let etag_len = u32_at(raw, 32);
    let last_modified_len = u32_at(raw, 36);
    let host_len = u32_at(raw, 40);
    let path_len = u32_at(raw, 44);
    let key_len = u32_at(raw, 48);
    let content_type_len = u32_at(raw, 52);
    let transfer_encoding_len = u32_at(raw, 56);
    let status = u16::from_le_bytes(raw[60..62].try_into().unwrap());
    let flags = u16::from_le_bytes(raw[62..64].try_into().unwrap());
    let content_length = u64_at(raw, 64);

    if key_len == 0 {
        bail!("entry without a key");
    }

    let mut offset = META_FIXED_LEN;
    let etag = take_field(raw, &mut offset, etag_len)?;
    let last_modified = take_field(raw, &mut offset, last_modified_len)?;
    let host = take_field(raw, &mut offset, host_len)?;
    let path = take_field(raw, &mut offset, path_len)?;
    let key = take_field(raw, &mut offset, key_len)?
        .ok_or_else(|| format_err!("entry without a key"))?;
    let content_type = take_field(raw, &mut offset, content_type_len)?;
    let transfer_encoding = take_field(raw, &mut offset, transfer_encoding_len)?;

    let meta = PersistMeta {
        hash,
        expire,
        header_len,
        etag,
        last_modified,
        host,
        path,
        key,
        info: ResponseInfo {
            status,
            content_type,
            transfer_encoding,
            content_length: if flags & FLAG_CONTENT_LENGTH != 0 {
                Some(content_length)
            } else {
                None
            },
            chunked: flags & FLAG_CHUNKED != 0,
        },
    };

    Ok((meta, offset))
}

/// Target path for an entry file.
pub fn entry_path(root: &Path, hash: u64, nonce: u32) -> PathBuf {
    let hex = format!("{:016x}", hash);
    root.join(&hex[0..2])
        .join(&hex[2..4])
        .join(format!("{}-{:08x}", hex, nonce))
}

/// Write one entry file atomically, creating the fanout directories.
pub fn write_entry(root: &Path, meta: &PersistMeta, body: &[u8]) -> Result<PathBuf, Error> {
    let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
    let path = entry_path(root, meta.hash, nonce);

    if let Some(parent) = path.parent() {
        tools::create_path(parent)?;
    }

    let raw = encode(meta, body);
    tools::file_set_contents(&path, &raw, None)?;

    Ok(path)
}

/// A decoded entry file, body still on disk.
pub struct EntryFile {
    pub path: PathBuf,
    pub meta: PersistMeta,
    pub body_offset: u64,
    pub body_len: u64,
}

/// Read and verify one entry file's meta.
pub fn open_entry(path: &Path) -> Result<EntryFile, Error> {
    let mut raw = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut raw)?;

    let (meta, body_offset) = decode(&raw)?;

    Ok(EntryFile {
        path: path.to_path_buf(),
        meta,
        body_offset: body_offset as u64,
        body_len: (raw.len() - body_offset) as u64,
    })
}

/// Read an entry file's body.
pub fn read_body(path: &Path) -> Result<Vec<u8>, Error> {
    let mut raw = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut raw)?;

    let (_, body_offset) = decode(&raw)?;
    Ok(raw[body_offset..].to_vec())
}

fn is_entry_file(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_file()
        && entry
            .file_name()
            .to_str()
            .map(|name| ENTRY_FILE_NAME.is_match(name))
            .unwrap_or(false)
}

/// Bounded directory scanner shared by the startup loader and the disk
/// cleaner. Each call to `tick` yields at most `quota` decodable entry
/// files; undecodable ones are skipped and logged. `finished` flips once a
/// full sweep completed.
pub struct DiskScan {
    root: PathBuf,
    walker: Option<walkdir::IntoIter>,
    pub finished: bool,
}

impl DiskScan {

    pub fn new(root: &Path) -> DiskScan {
        DiskScan {
            root: root.to_path_buf(),
            walker: None,
            finished: false,
        }
    }

    /// Restart the sweep from the beginning.
    pub fn rewind(&mut self) {
        self.walker = None;
        self.finished = false;
    }

    pub fn tick(&mut self, quota: usize) -> Vec<EntryFile> {
        if self.finished {
            return Vec::new();
        }

        let root = self.root.clone();
        let walker = self
            .walker
            .get_or_insert_with(|| walkdir::WalkDir::new(root).into_iter());

        let mut found = Vec::new();

        while found.len() < quota {
            let entry = match walker.next() {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    log::warn!("disk scan: {}", err);
                    continue;
                }
                None => {
                    self.finished = true;
                    break;
                }
            };

            if !is_entry_file(&entry) {
                continue;
            }

            match open_entry(entry.path()) {
                Ok(file) => found.push(file),
                Err(err) => {
                    log::warn!("skipping {:?}: {}", entry.path(), err);
                }
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn sample_meta() -> PersistMeta {
        PersistMeta {
            hash: 0xfeed_beef_dead_cafe,
            expire: 1234,
            header_len: 99,
            etag: Some(b"\"abc\"".to_vec()),
            last_modified: None,
            host: Some(b"example.com".to_vec()),
            path: Some(b"/a".to_vec()),
            key: b"GET\x1fexample.com\x1f/a\x1f".to_vec(),
            info: ResponseInfo {
                status: 200,
                content_type: Some(b"text/plain".to_vec()),
                transfer_encoding: None,
                content_length: Some(2),
                chunked: false,
            },
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let meta = sample_meta();
        let raw = encode(&meta, b"hi");

        let (decoded, body_offset) = decode(&raw).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(&raw[body_offset..], b"hi");
    }

    #[test]
    fn crc_detects_corruption() {
        let raw = encode(&sample_meta(), b"hi");

        let mut bent = raw.clone();
        let last = bent.len() - 1;
        bent[last] ^= 0xff;
        assert!(decode(&bent).is_err());

        let mut magicless = raw;
        magicless[0] = b'X';
        assert!(decode(&magicless).is_err());
    }

    #[test]
    fn truncated_file_rejected() {
        let raw = encode(&sample_meta(), b"hi");
        assert!(decode(&raw[..20]).is_err());
        assert!(decode(&raw[..META_FIXED_LEN + 2]).is_err());
    }

    #[test]
    fn fanout_path_shape() {
        let root = PathBuf::from("/var/lib/larder");
        let path = entry_path(&root, 0xabcdef01_23456789, 7);
        assert_eq!(
            path,
            PathBuf::from("/var/lib/larder/ab/cd/abcdef0123456789-00000007")
        );
    }

    #[test]
    fn write_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let meta = sample_meta();

        let path = write_entry(dir.path(), &meta, b"body bytes").unwrap();
        assert!(path.exists());

        let file = open_entry(&path).unwrap();
        assert_eq!(file.meta, meta);
        assert_eq!(file.body_len, 10);
        assert_eq!(read_body(&path).unwrap(), b"body bytes");
    }

    #[test]
    fn scan_finds_entries_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let meta = sample_meta();

        write_entry(dir.path(), &meta, b"one").unwrap();

        let mut second = meta.clone();
        second.hash = 1;
        second.key = b"other\x1f".to_vec();
        write_entry(dir.path(), &second, b"two").unwrap();

        // corrupt file with a valid-looking name is skipped
        let junk = dir.path().join("aa");
        tools::create_path(&junk).unwrap();
        std::fs::write(junk.join("aaaaaaaaaaaaaaaa-00000000"), b"garbage").unwrap();
        std::fs::write(dir.path().join("README"), b"not an entry").unwrap();

        let mut scan = DiskScan::new(dir.path());
        let mut all = Vec::new();
        loop {
            let batch = scan.tick(1);
            if batch.is_empty() && scan.finished {
                break;
            }
            assert!(batch.len() <= 1);
            all.extend(batch);
        }

        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|f| f.meta.hash == meta.hash));
        assert!(all.iter().any(|f| f.meta.hash == 1));
    }

    #[test]
    fn scan_rewind_resweeps() {
        let dir = tempfile::tempdir().unwrap();
        write_entry(dir.path(), &sample_meta(), b"x").unwrap();

        let mut scan = DiskScan::new(dir.path());
        while !scan.finished {
            scan.tick(16);
        }

        scan.rewind();
        let again = scan.tick(16);
        assert_eq!(again.len(), 1);
    }
}
