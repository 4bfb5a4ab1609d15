use super::{decode_records, encode_records, MessageRecord, PREFIX_SIZE};
use crate::cache::{cache_thing, CacheClient, ClientContext, ClientId};
use crate::error::{MetadataError, Result};
use crate::format::{Decoder, Encoder};

pub(crate) const OHDR_VERSION: u8 = 1;

/// Prefix and first chunk of an object header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
    pub(crate) version: u8,
    pub(crate) nlink: u32,
    pub(crate) nmesgs: usize,
    pub(crate) chunk0_size: usize,
    pub(crate) messages: Vec<MessageRecord>,
}

impl ObjectHeader {
    /// Header version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Number of links to the object.
    pub fn nlink(&self) -> u32 {
        self.nlink
    }

    /// Number of messages in all chunks, as recorded in the prefix.
    pub fn nmesgs(&self) -> usize {
        self.nmesgs
    }

    /// Size of chunk 0, excluding the prefix.
    pub fn chunk0_size(&self) -> usize {
        self.chunk0_size
    }

    /// Messages in chunk 0.
    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }
}

fn check_version(version: u8) -> Result<()> {
    if version != OHDR_VERSION {
        return Err(MetadataError::BadVersion {
            what: "object header",
            found: version,
        });
    }
    Ok(())
}

impl CacheClient for ObjectHeader {
    const ID: ClientId = ClientId::ObjectHeader;

    type UserData = ();

    fn initial_load_size(_udata: &(), _ctx: &ClientContext<'_>) -> usize {
        PREFIX_SIZE
    }

    fn final_load_size(
        image: &[u8],
        _udata: &(),
        ctx: &ClientContext<'_>,
    ) -> Result<Option<usize>> {
        let mut dec = Decoder::new(image, ctx.config);
        check_version(dec.u8()?)?;
        dec.skip(1 + 2 + 4)?;
        let size = dec.u32()? as usize;
        Ok(Some(PREFIX_SIZE + size))
    }

    fn deserialize(image: &[u8], _udata: &(), ctx: &mut ClientContext<'_>) -> Result<Self> {
        let mut dec = Decoder::new(image, ctx.config);
        let version = dec.u8()?;
        check_version(version)?;
        dec.skip(1)?;
        let nmesgs = dec.u16()? as usize;
        let nlink = dec.u32()?;
        let chunk0_size = dec.u32()? as usize;
        dec.skip(4)?;
        let messages = decode_records(dec.bytes(chunk0_size)?, ctx.config)?;
        Ok(Self {
            version,
            nlink,
            nmesgs,
            chunk0_size,
            messages,
        })
    }

    fn image_len(&self, _ctx: &ClientContext<'_>) -> usize {
        PREFIX_SIZE + self.chunk0_size
    }

    fn serialize(&self, ctx: &ClientContext<'_>, image: &mut [u8]) -> Result<()> {
        let nmesgs = u16::try_from(self.nmesgs).map_err(|_| {
            MetadataError::bad_value(format!("{} messages in one object header", self.nmesgs))
        })?;
        let chunk0_size = u32::try_from(self.chunk0_size).map_err(|_| {
            MetadataError::bad_value(format!("object header chunk of {} bytes", self.chunk0_size))
        })?;
        let mut enc = Encoder::new(image, ctx.config);
        enc.u8(self.version)?;
        enc.u8(0)?;
        enc.u16(nmesgs)?;
        enc.u32(self.nlink)?;
        enc.u32(chunk0_size)?;
        enc.zeros(4)?;
        encode_records(&mut enc, &self.messages, self.chunk0_size)?;
        enc.zero_fill();
        Ok(())
    }

    cache_thing!(ObjectHeader);
}

/// What a chunk loader needs from the continuation message pointing at the chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkUdata {
    /// Chunk size
    pub size: usize,
    /// Chunk number
    pub chunkno: usize,
}

/// An object header chunk reached through a continuation message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OhdrChunk {
    pub(crate) chunkno: usize,
    pub(crate) size: usize,
    pub(crate) messages: Vec<MessageRecord>,
}

impl OhdrChunk {
    /// Chunk number.
    pub fn chunkno(&self) -> usize {
        self.chunkno
    }

    /// Chunk size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Messages in this chunk.
    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }
}

impl CacheClient for OhdrChunk {
    const ID: ClientId = ClientId::OhdrChunk;

    type UserData = ChunkUdata;

    fn initial_load_size(udata: &ChunkUdata, _ctx: &ClientContext<'_>) -> usize {
        udata.size
    }

    fn deserialize(
        image: &[u8],
        udata: &ChunkUdata,
        ctx: &mut ClientContext<'_>,
    ) -> Result<Self> {
        let mut dec = Decoder::new(image, ctx.config);
        let body = dec.bytes(udata.size)?;
        Ok(Self {
            chunkno: udata.chunkno,
            size: udata.size,
            messages: decode_records(body, ctx.config)?,
        })
    }

    fn image_len(&self, _ctx: &ClientContext<'_>) -> usize {
        self.size
    }

    fn serialize(&self, ctx: &ClientContext<'_>, image: &mut [u8]) -> Result<()> {
        let mut enc = Encoder::new(image, ctx.config);
        encode_records(&mut enc, &self.messages, self.size)?;
        enc.zero_fill();
        Ok(())
    }

    cache_thing!(OhdrChunk);
}
