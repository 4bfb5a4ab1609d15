//! Object headers
//!
//! Every object in a file has a header: a list of messages describing it. A version 1 header
//! starts with a 16 byte prefix followed by the first chunk of messages. When chunk 0 fills up, a
//! continuation message points at a further chunk, which can point at another, and so on.
//!
//! ```text
//! prefix: [version 1] [reserved] [nmesgs: u16] [nlink: u32] [chunk 0 size: u32] [4 reserved]
//! record: [type: u16] [size: u16] [flags] [3 reserved] [body padded to 8 bytes]
//! ```
//!
//! Chunks are always completely covered by message records. Unused space is held by null
//! messages. Message types this crate doesn't understand are kept as raw bytes and written back
//! unchanged.

#[cfg(any(test, feature = "bogus-message"))]
pub use self::bogus::{Bogus, BOGUS_VALUE};
pub use self::chunk::{ChunkUdata, ObjectHeader, OhdrChunk};
pub use self::cont::Continuation;
pub use self::mtime::{Mtime, MtimeNew};
pub use self::shmesg::SharedMessageTable;
pub use self::stab::SymbolTable;

#[cfg(any(test, feature = "bogus-message"))]
mod bogus;
mod chunk;
mod cont;
mod mtime;
mod shmesg;
mod stab;

use std::io::Write;

use crate::cache::{MetadataCache, MetadataStore};
use crate::config::FileConfig;
use crate::error::{MetadataError, Result};
use crate::format::{align8, Addr, Decoder, Encoder};
use crate::freespace::{FileAllocator, MemType};

pub(crate) const NULL_ID: u16 = 0x0000;
#[cfg(any(test, feature = "bogus-message"))]
pub(crate) const BOGUS_ID: u16 = 0x0009;
pub(crate) const MTIME_ID: u16 = 0x000e;
pub(crate) const SHMESG_ID: u16 = 0x000f;
pub(crate) const CONT_ID: u16 = 0x0010;
pub(crate) const STAB_ID: u16 = 0x0011;
pub(crate) const MTIME_NEW_ID: u16 = 0x0012;

const PREFIX_SIZE: usize = 16;
const RECORD_HEADER_SIZE: usize = 8;

/// Smallest chunk created for a new header or a header extension.
pub const MIN_CHUNK_SIZE: usize = 256;

/// Encoding and decoding of one kind of message body.
pub trait MessageCodec: Sized {
    /// Message type stored in the record header.
    const ID: u16;

    /// Name used in debug output.
    const NAME: &'static str;

    /// Decode a message body.
    fn decode(dec: &mut Decoder<'_>) -> Result<Self>;

    /// Encode a message body.
    fn encode(&self, enc: &mut Encoder<'_>) -> Result<()>;

    /// Body size before alignment.
    fn size(&self, config: &FileConfig) -> usize;

    /// Print the message fields.
    fn debug(&self, out: &mut dyn Write, indent: usize, fwidth: usize) -> std::io::Result<()>;

    /// Release file resources the message refers to. Called when the message is removed from
    /// its header.
    fn delete(&self, _cache: &mut MetadataCache, _space: &mut dyn FileAllocator) -> Result<()> {
        Ok(())
    }
}

/// Unused space in a chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Null;

impl MessageCodec for Null {
    const ID: u16 = NULL_ID;
    const NAME: &'static str = "null";

    fn decode(_dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Null)
    }

    fn encode(&self, _enc: &mut Encoder<'_>) -> Result<()> {
        Ok(())
    }

    fn size(&self, _config: &FileConfig) -> usize {
        0
    }

    fn debug(&self, _out: &mut dyn Write, _indent: usize, _fwidth: usize) -> std::io::Result<()> {
        Ok(())
    }
}

/// Every kind of message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Padding
    Null(Null),
    /// Pointer to the next chunk
    Continuation(Continuation),
    /// Legacy modification time
    Mtime(Mtime),
    /// Modification time
    MtimeNew(MtimeNew),
    /// Shared message table location
    SharedMessageTable(SharedMessageTable),
    /// Group B-tree and heap
    SymbolTable(SymbolTable),
    /// Test message
    #[cfg(any(test, feature = "bogus-message"))]
    Bogus(Bogus),
    /// A message type this crate doesn't decode
    Unknown {
        /// Message type
        id: u16,
        /// Body bytes
        raw: Vec<u8>,
    },
}

macro_rules! dispatch {
    ($msg:expr, $inner:ident => $body:expr, $unknown:pat => $other:expr) => {
        match $msg {
            Message::Null($inner) => $body,
            Message::Continuation($inner) => $body,
            Message::Mtime($inner) => $body,
            Message::MtimeNew($inner) => $body,
            Message::SharedMessageTable($inner) => $body,
            Message::SymbolTable($inner) => $body,
            #[cfg(any(test, feature = "bogus-message"))]
            Message::Bogus($inner) => $body,
            $unknown => $other,
        }
    };
}

fn id_of<T: MessageCodec>(_: &T) -> u16 {
    T::ID
}

fn name_of<T: MessageCodec>(_: &T) -> &'static str {
    T::NAME
}

impl Message {
    /// Message type.
    pub fn id(&self) -> u16 {
        dispatch!(self, m => id_of(m), Message::Unknown { id, .. } => *id)
    }

    /// Name used in debug output.
    pub fn name(&self) -> &'static str {
        dispatch!(self, m => name_of(m), Message::Unknown { .. } => "unknown")
    }

    /// Is this padding?
    pub fn is_null(&self) -> bool {
        matches!(self, Message::Null(_))
    }

    /// Body size before alignment.
    pub fn size(&self, config: &FileConfig) -> usize {
        dispatch!(self, m => m.size(config), Message::Unknown { raw, .. } => raw.len())
    }

    fn decode(id: u16, body: &[u8], config: &FileConfig) -> Result<Self> {
        let mut dec = Decoder::new(body, config);
        let message = match id {
            NULL_ID => Message::Null(Null::decode(&mut dec)?),
            CONT_ID => Message::Continuation(Continuation::decode(&mut dec)?),
            MTIME_ID => Message::Mtime(Mtime::decode(&mut dec)?),
            MTIME_NEW_ID => Message::MtimeNew(MtimeNew::decode(&mut dec)?),
            SHMESG_ID => Message::SharedMessageTable(SharedMessageTable::decode(&mut dec)?),
            STAB_ID => Message::SymbolTable(SymbolTable::decode(&mut dec)?),
            #[cfg(any(test, feature = "bogus-message"))]
            BOGUS_ID => Message::Bogus(Bogus::decode(&mut dec)?),
            _ => {
                tracing::debug!(id, len = body.len(), "keeping unknown message");
                Message::Unknown {
                    id,
                    raw: body.to_vec(),
                }
            }
        };
        Ok(message)
    }

    fn encode(&self, enc: &mut Encoder<'_>) -> Result<()> {
        dispatch!(self, m => m.encode(enc), Message::Unknown { raw, .. } => enc.bytes(raw))
    }

    /// Print the message fields.
    pub fn debug(&self, out: &mut dyn Write, indent: usize, fwidth: usize) -> std::io::Result<()> {
        dispatch!(self, m => m.debug(out, indent, fwidth), Message::Unknown { raw, .. } => {
            let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
            writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Raw data:", hex)
        })
    }

    fn delete(&self, cache: &mut MetadataCache, space: &mut dyn FileAllocator) -> Result<()> {
        dispatch!(self, m => m.delete(cache, space), Message::Unknown { .. } => Ok(()))
    }
}

/// A message and its framing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    /// Message flags
    pub flags: u8,
    /// Space reserved for the body. At least the aligned message size.
    pub raw_size: usize,
    /// The message
    pub message: Message,
}

impl MessageRecord {
    /// A record exactly large enough for `message`.
    pub fn new(message: Message, config: &FileConfig) -> Self {
        Self {
            flags: 0,
            raw_size: align8(message.size(config)),
            message,
        }
    }

    fn null(raw_size: usize) -> Self {
        Self {
            flags: 0,
            raw_size,
            message: Message::Null(Null),
        }
    }
}

pub(crate) fn decode_records(body: &[u8], config: &FileConfig) -> Result<Vec<MessageRecord>> {
    let mut dec = Decoder::new(body, config);
    let mut records = vec![];
    while dec.remaining() > 0 {
        let id = dec.u16()?;
        let raw_size = dec.u16()? as usize;
        let flags = dec.u8()?;
        dec.skip(3)?;
        if raw_size % 8 != 0 {
            return Err(MetadataError::bad_value(format!(
                "message {id:#06x} size {raw_size} is not a multiple of 8"
            )));
        }
        let raw = dec.bytes(raw_size)?;
        records.push(MessageRecord {
            flags,
            raw_size,
            message: Message::decode(id, raw, config)?,
        });
    }
    Ok(records)
}

pub(crate) fn encode_records(
    enc: &mut Encoder<'_>,
    records: &[MessageRecord],
    size: usize,
) -> Result<()> {
    let used: usize = records.iter().map(|r| RECORD_HEADER_SIZE + r.raw_size).sum();
    if used > size {
        return Err(MetadataError::bad_value(format!(
            "{used} bytes of messages don't fit in a {size} byte chunk"
        )));
    }
    for record in records {
        let raw_size = u16::try_from(record.raw_size).map_err(|_| {
            MetadataError::bad_value(format!("message size {} too large", record.raw_size))
        })?;
        enc.u16(record.message.id())?;
        enc.u16(raw_size)?;
        enc.u8(record.flags)?;
        enc.zeros(3)?;
        let start = enc.position();
        record.message.encode(enc)?;
        let written = enc.position() - start;
        if written > record.raw_size {
            return Err(MetadataError::bad_value(format!(
                "{} message needs {written} bytes, record holds {}",
                record.message.name(),
                record.raw_size
            )));
        }
        enc.zeros(record.raw_size - written)?;
    }
    Ok(())
}

/// One chunk of a loaded header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRef {
    /// Position in discovery order. Chunk 0 follows the prefix.
    pub chunkno: usize,
    /// Cache address of the chunk's entry
    pub addr: Addr,
    /// Chunk size, excluding the prefix
    pub size: usize,
}

/// Where a message sits in a header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageLoc {
    /// Chunk holding the message
    pub chunk: ChunkRef,
    /// Index of the record within the chunk
    pub index: usize,
}

fn records(cache: &MetadataCache, chunk: ChunkRef) -> Result<&[MessageRecord]> {
    if chunk.chunkno == 0 {
        Ok(cache.get::<ObjectHeader>(chunk.addr)?.messages())
    } else {
        Ok(cache.get::<OhdrChunk>(chunk.addr)?.messages())
    }
}

fn records_mut(cache: &mut MetadataCache, chunk: ChunkRef) -> Result<&mut Vec<MessageRecord>> {
    if chunk.chunkno == 0 {
        Ok(&mut cache.get_mut::<ObjectHeader>(chunk.addr)?.messages)
    } else {
        Ok(&mut cache.get_mut::<OhdrChunk>(chunk.addr)?.messages)
    }
}

/// Create a header holding `messages`. Returns its address.
///
/// Chunk 0 is at least [`MIN_CHUNK_SIZE`] bytes; space not needed by `messages` is left as a
/// null message for later additions.
pub fn create(
    cache: &mut MetadataCache,
    space: &mut dyn FileAllocator,
    messages: Vec<Message>,
) -> Result<Addr> {
    let config = cache.config();
    let mut records: Vec<MessageRecord> = messages
        .into_iter()
        .map(|m| MessageRecord::new(m, config))
        .collect();
    let used: usize = records.iter().map(|r| RECORD_HEADER_SIZE + r.raw_size).sum();
    let size = used.max(MIN_CHUNK_SIZE);
    if size > used {
        records.push(MessageRecord::null(size - used - RECORD_HEADER_SIZE));
    }
    if size > u32::MAX as usize || records.len() > u16::MAX as usize {
        return Err(MetadataError::bad_value(format!(
            "{} messages in {size} bytes is too large for an object header",
            records.len()
        )));
    }

    let total = (PREFIX_SIZE + size) as u64;
    let addr = space.alloc(MemType::Ohdr, total)?;
    let header = ObjectHeader {
        version: chunk::OHDR_VERSION,
        nlink: 1,
        nmesgs: records.len(),
        chunk0_size: size,
        messages: records,
    };
    if let Err(e) = cache.insert(addr, header, false) {
        space.free(MemType::Ohdr, addr, total)?;
        return Err(e);
    }
    tracing::debug!(%addr, size, "created object header");
    Ok(addr)
}

/// Load the header at `addr` and every chunk it continues into.
///
/// Chunks are numbered in the order their continuation messages are found, and each
/// continuation message is told the number of the chunk it points at.
pub async fn load<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    addr: Addr,
) -> Result<Vec<ChunkRef>> {
    cache.load::<ObjectHeader, S>(store, addr, &()).await?;
    let header = cache.get::<ObjectHeader>(addr)?;
    let expected = header.nmesgs;
    let mut chunks = vec![ChunkRef {
        chunkno: 0,
        addr,
        size: header.chunk0_size,
    }];

    let mut count = 0;
    let mut next = 0;
    while next < chunks.len() {
        let chunk = chunks[next];
        next += 1;

        let mut found = vec![];
        let first = chunks.len();
        let messages = records_mut(cache, chunk)?;
        count += messages.len();
        for record in messages.iter_mut() {
            if let Message::Continuation(cont) = &mut record.message {
                cont.chunkno = first + found.len();
                found.push(ChunkRef {
                    chunkno: cont.chunkno,
                    addr: cont.addr,
                    size: cont.size as usize,
                });
            }
        }

        for cont in found {
            if chunks.iter().any(|c| c.addr == cont.addr) {
                return Err(MetadataError::bad_value(format!(
                    "object header {addr} continues into chunk {} twice",
                    cont.addr
                )));
            }
            let udata = ChunkUdata {
                size: cont.size,
                chunkno: cont.chunkno,
            };
            cache.load::<OhdrChunk, S>(store, cont.addr, &udata).await?;
            chunks.push(cont);
        }
    }

    if count != expected {
        tracing::warn!(%addr, expected, found = count, "object header message count is wrong");
    }
    Ok(chunks)
}

/// Every message in the header at `addr` except nulls, with its location.
pub async fn read_messages<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    addr: Addr,
) -> Result<Vec<(MessageLoc, Message)>> {
    let chunks = load(cache, store, addr).await?;
    let mut out = vec![];
    for chunk in chunks {
        for (index, record) in records(cache, chunk)?.iter().enumerate() {
            if !record.message.is_null() {
                out.push((MessageLoc { chunk, index }, record.message.clone()));
            }
        }
    }
    Ok(out)
}

fn find_null(cache: &MetadataCache, chunks: &[ChunkRef], need: usize) -> Result<Option<MessageLoc>> {
    for chunk in chunks {
        let found = records(cache, *chunk)?
            .iter()
            .position(|r| r.message.is_null() && r.raw_size >= need);
        if let Some(index) = found {
            return Ok(Some(MessageLoc {
                chunk: *chunk,
                index,
            }));
        }
    }
    Ok(None)
}

// Put `message` in the null record at `loc`, splitting off any large enough remainder.
fn place(
    cache: &mut MetadataCache,
    header: Addr,
    loc: MessageLoc,
    message: Message,
    need: usize,
) -> Result<()> {
    let messages = records_mut(cache, loc.chunk)?;
    let slot = messages
        .get_mut(loc.index)
        .filter(|r| r.message.is_null() && r.raw_size >= need)
        .ok_or_else(|| MetadataError::bad_value("no free message slot at location"))?;
    let spare = slot.raw_size - need;
    slot.flags = 0;
    slot.message = message;
    let mut added = 0;
    if spare >= RECORD_HEADER_SIZE {
        slot.raw_size = need;
        messages.insert(
            loc.index + 1,
            MessageRecord::null(spare - RECORD_HEADER_SIZE),
        );
        added = 1;
    }
    cache.mark_dirty(loc.chunk.addr)?;
    if added > 0 {
        cache.get_mut::<ObjectHeader>(header)?.nmesgs += added;
        cache.mark_dirty(header)?;
    }
    Ok(())
}

fn cont_size(config: &FileConfig) -> usize {
    align8(config.sizeof_addr() + config.sizeof_size())
}

// A null record for a `need` byte message which still leaves somewhere to put a continuation.
fn find_slot(
    cache: &MetadataCache,
    chunks: &[ChunkRef],
    need: usize,
) -> Result<Option<MessageLoc>> {
    let cont_need = cont_size(cache.config());
    let mut nulls = vec![];
    for chunk in chunks {
        for (index, record) in records(cache, *chunk)?.iter().enumerate() {
            if record.message.is_null() {
                nulls.push((MessageLoc { chunk: *chunk, index }, record.raw_size));
            }
        }
    }
    for (i, (loc, raw_size)) in nulls.iter().enumerate() {
        if *raw_size < need {
            continue;
        }
        let leaves_room = raw_size - need >= RECORD_HEADER_SIZE + cont_need;
        let elsewhere = nulls
            .iter()
            .enumerate()
            .any(|(j, (_, other))| j != i && *other >= cont_need);
        if leaves_room || elsewhere {
            return Ok(Some(*loc));
        }
    }
    Ok(None)
}

/// Add a message to the header at `addr`, extending the header with a new chunk if no null
/// message is large enough.
pub async fn append_message<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    space: &mut dyn FileAllocator,
    addr: Addr,
    message: Message,
) -> Result<MessageLoc> {
    let chunks = load(cache, store, addr).await?;
    let need = align8(message.size(cache.config()));
    let loc = match find_slot(cache, &chunks, need)? {
        Some(loc) => loc,
        None => extend(cache, space, addr, &chunks, need)?,
    };
    place(cache, addr, loc, message, need)?;
    Ok(loc)
}

/// Allocate a new chunk with room for a `need` byte message and link it from the header with a
/// continuation message. Returns the new chunk's null record.
///
/// The continuation goes in the first null record large enough for it. Headers built by
/// [`create`] and [`append_message`] always have one.
pub fn extend(
    cache: &mut MetadataCache,
    space: &mut dyn FileAllocator,
    header: Addr,
    chunks: &[ChunkRef],
    need: usize,
) -> Result<MessageLoc> {
    let cont_need = cont_size(cache.config());
    let slot = find_null(cache, chunks, cont_need)?.ok_or_else(|| {
        MetadataError::bad_value(format!(
            "no room in object header {header} for a continuation message"
        ))
    })?;

    let size = (need + RECORD_HEADER_SIZE).max(MIN_CHUNK_SIZE);
    let addr = space.alloc(MemType::Ohdr, size as u64)?;
    let chunkno = chunks.len();
    let chunk = OhdrChunk {
        chunkno,
        size,
        messages: vec![MessageRecord::null(size - RECORD_HEADER_SIZE)],
    };
    if let Err(e) = cache.insert(addr, chunk, false) {
        space.free(MemType::Ohdr, addr, size as u64)?;
        return Err(e);
    }
    let cont = Continuation {
        addr,
        size: size as u64,
        chunkno,
    };
    place(cache, header, slot, Message::Continuation(cont), cont_need)?;
    cache.get_mut::<ObjectHeader>(header)?.nmesgs += 1;
    cache.mark_dirty(header)?;
    tracing::debug!(%header, chunk = %addr, size, chunkno, "extended object header");

    Ok(MessageLoc {
        chunk: ChunkRef {
            chunkno,
            addr,
            size,
        },
        index: 0,
    })
}

/// Remove the message at `loc` from the header at `addr`, returning it.
///
/// The record becomes a null message and the message's delete action runs. Removing a
/// continuation releases the chunk it points at, and any chunks that one continues into.
pub async fn remove_message<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    space: &mut dyn FileAllocator,
    addr: Addr,
    loc: MessageLoc,
) -> Result<Message> {
    load(cache, store, addr).await?;
    let messages = records_mut(cache, loc.chunk)?;
    let record = messages
        .get_mut(loc.index)
        .filter(|r| !r.message.is_null())
        .ok_or_else(|| {
            MetadataError::bad_value(format!(
                "no message at index {} of chunk {}",
                loc.index, loc.chunk.addr
            ))
        })?;
    let old = std::mem::replace(&mut record.message, Message::Null(Null));
    record.flags = 0;
    cache.mark_dirty(loc.chunk.addr)?;

    // chunks reachable through the removed continuation
    let mut released = vec![];
    let mut pending = vec![];
    if let Message::Continuation(cont) = &old {
        pending.push(cont.clone());
    }
    let mut lost = 0;
    while let Some(cont) = pending.pop() {
        let udata = ChunkUdata {
            size: cont.size as usize,
            chunkno: cont.chunkno,
        };
        cache.load::<OhdrChunk, S>(store, cont.addr, &udata).await?;
        let chunk = cache.get::<OhdrChunk>(cont.addr)?;
        lost += chunk.messages().len();
        for record in chunk.messages() {
            if let Message::Continuation(next) = &record.message {
                pending.push(next.clone());
            }
        }
        released.push(cont);
    }

    old.delete(cache, space)?;
    for cont in released.iter().skip(1) {
        cont.delete(cache, space)?;
    }
    if lost > 0 {
        let header = cache.get_mut::<ObjectHeader>(addr)?;
        header.nmesgs = header.nmesgs.saturating_sub(lost);
        cache.mark_dirty(addr)?;
    }
    tracing::debug!(%addr, message = old.name(), "removed object header message");
    Ok(old)
}

/// Print the header at `addr` and all of its messages.
pub async fn debug<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    addr: Addr,
    out: &mut dyn Write,
    indent: usize,
    fwidth: usize,
) -> Result<()> {
    let chunks = load(cache, store, addr).await?;
    let header = cache.get::<ObjectHeader>(addr)?;
    let dirty = if cache.is_dirty(addr)? { "TRUE" } else { "FALSE" };

    writeln!(out, "{:indent$}Object Header...", "")?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Dirty:", dirty)?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Version:", header.version())?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Header size (in bytes):", PREFIX_SIZE)?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Number of links:", header.nlink())?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Number of messages:", header.nmesgs())?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Number of chunks:", chunks.len())?;

    let (inner, inner_width) = (indent + 3, fwidth.saturating_sub(3));
    for chunk in &chunks {
        writeln!(out, "{:indent$}Chunk {}...", "", chunk.chunkno)?;
        writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Address:", chunk.addr)?;
        writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Size in bytes:", chunk.size)?;
    }

    let mut seq = 0;
    for chunk in &chunks {
        for record in records(cache, *chunk)? {
            let message = &record.message;
            writeln!(out, "{:indent$}Message {seq}...", "")?;
            writeln!(
                out,
                "{:inner$}{:<inner_width$} {:#06x} `{}' ({seq})",
                "",
                "Message ID (sequence number):",
                message.id(),
                message.name()
            )?;
            writeln!(out, "{:inner$}{:<inner_width$} {:#04x}", "", "Message flags:", record.flags)?;
            writeln!(out, "{:inner$}{:<inner_width$} {}", "", "Chunk number:", chunk.chunkno)?;
            writeln!(
                out,
                "{:inner$}{:<inner_width$} {}",
                "", "Raw size in bytes:", record.raw_size
            )?;
            message.debug(out, inner + 3, inner_width.saturating_sub(3))?;
            seq += 1;
        }
    }
    Ok(())
}
