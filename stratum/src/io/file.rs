//! File functions
//!
//! The file has the following structure
//!
//! Header (one 512 byte block at address 0)
//!   [Metadata images, at the addresses the file space allocator hands out]
//!
//! The Header is bincode encoded and records the file configuration, the end of allocated space,
//! the root object header and where each persisted free space manager lives. Everything else is
//! found by following addresses from there.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;

use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::cache::MetadataStore;
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::Addr;
use crate::freespace::{FsBucket, FsLocation};
use crate::BINCODER;

/// Space reserved for the file header.
pub(crate) const HEADER_SIZE: u64 = 512;

const SIGNATURE: [u8; 8] = *b"\x89STRAT\r\n";

const FORMAT_VERSION_1: u8 = 1;

const SUPPORTED_VERSIONS: &[u8] = &[FORMAT_VERSION_1];

/// Everything needed to find the rest of a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileHeader {
    signature: [u8; 8],
    pub(crate) version: u8,
    pub(crate) config: FileConfig,
    pub(crate) eoa: u64,
    pub(crate) root: Addr,
    pub(crate) fs_locations: BTreeMap<FsBucket, FsLocation>,
}

impl FileHeader {
    pub(crate) fn new(config: FileConfig) -> Self {
        Self {
            signature: SIGNATURE,
            version: FORMAT_VERSION_1,
            config,
            eoa: HEADER_SIZE,
            root: Addr::UNDEF,
            fs_locations: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct StorageFile {
    file: File,
    read_only: bool,
}

impl StorageFile {
    pub(crate) async fn try_new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;

        file.set_len(HEADER_SIZE).await?;

        Ok(Self {
            file,
            read_only: false,
        })
    }

    pub(crate) async fn try_open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(false)
            .open(path)
            .await?;

        Ok(Self { file, read_only })
    }

    pub(crate) async fn sync(&self) -> Result<()> {
        self.file.sync_all().await.map_err(|e| e.into())
    }

    pub(crate) async fn read_header(&mut self) -> Result<FileHeader> {
        let buf = self.read_at(0, HEADER_SIZE as usize).await?;

        // bincode puts the signature first
        if buf[..SIGNATURE.len()] != SIGNATURE {
            return Err(MetadataError::BadSignature("file header"));
        }
        let header: FileHeader = BINCODER.deserialize(&buf)?;

        if !SUPPORTED_VERSIONS.contains(&header.version) {
            return Err(MetadataError::BadVersion {
                what: "file header",
                found: header.version,
            });
        }
        header.config.validate()?;

        Ok(header)
    }

    pub(crate) async fn write_header(&mut self, header: &FileHeader) -> Result<()> {
        let s_header = BINCODER.serialize(header)?;
        if s_header.len() as u64 > HEADER_SIZE {
            return Err(MetadataError::bad_value(format!(
                "file header needs {} bytes, only {HEADER_SIZE} available",
                s_header.len()
            )));
        }
        self.write_at(0, &s_header).await
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < len {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                // past the end of the file reads as zero
                break;
            }
            filled += n;
        }
        Ok(buf)
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "file opened read only",
            )
            .into());
        }
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }
}

impl MetadataStore for StorageFile {
    async fn read(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        if !addr.is_defined() {
            return Err(MetadataError::bad_value("read from undefined address"));
        }
        self.read_at(addr.value(), len).await
    }

    async fn write(&mut self, addr: Addr, bytes: &[u8]) -> Result<()> {
        if !addr.is_defined() {
            return Err(MetadataError::bad_value("write to undefined address"));
        }
        self.write_at(addr.value(), bytes).await
    }
}
