//! On-page format for the tree.
//!
//! Every page carries a CRC32 over its payload so torn writes surface as
//! `Corrupt` instead of silent misreads. Page 0 holds the meta block; all
//! other pages are leaf, internal, overflow, or free-list nodes.
//!
//! Node page layout:
//! ```text
//! +-------------------+ 0
//! | crc32         (4) |
//! | type          (1) |
//! | flags         (1) |
//! | count         (2) |  entry count; chunk length for overflow pages
//! | extra         (4) |  leaf: next leaf / internal: leftmost child /
//! +-------------------+ 12  overflow: next page
//! | cells             |
//! +-------------------+ page size
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::{Result, TetherError};

/// Fixed node header: crc(4) + type(1) + flags(1) + count(2) + extra(4)
pub const PAGE_HDR: usize = 12;

/// Sentinel for "no page"; page 0 is the meta block and never a node
pub const NO_PAGE: u32 = 0;

/// Longest key accepted by the tree; an internal page must hold at least
/// two separator cells at the minimum page size
pub const MAX_KEY_SIZE: usize = 128;

const MAGIC: u32 = 0x5444_4231; // "TDB1"
const FORMAT_VERSION: u16 = 1;

/// Meta block: crc(4) + magic(4) + version(2) + page_size(4) + root(4) +
/// next_page(4) + free_head(4) + leaf_head(4)
pub const META_SIZE: usize = 30;

pub const PAGE_FREE: u8 = 0;
pub const PAGE_LEAF: u8 = 1;
pub const PAGE_INTERNAL: u8 = 2;
pub const PAGE_OVERFLOW: u8 = 3;

const LEAF_VALUE_INLINE: u8 = 0;
const LEAF_VALUE_OVERFLOW: u8 = 1;

/// Tree-wide bookkeeping persisted in the meta block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub page_size: u32,
    pub root: u32,
    pub next_page: u32,
    pub free_head: u32,
    pub leaf_head: u32,
}

impl Meta {
    pub fn encode(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        LittleEndian::write_u32(&mut buf[4..8], MAGIC);
        LittleEndian::write_u16(&mut buf[8..10], FORMAT_VERSION);
        LittleEndian::write_u32(&mut buf[10..14], self.page_size);
        LittleEndian::write_u32(&mut buf[14..18], self.root);
        LittleEndian::write_u32(&mut buf[18..22], self.next_page);
        LittleEndian::write_u32(&mut buf[22..26], self.free_head);
        LittleEndian::write_u32(&mut buf[26..30], self.leaf_head);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[4..]);
        LittleEndian::write_u32(&mut buf[0..4], hasher.finalize());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SIZE {
            return Err(TetherError::Corrupt("meta block truncated".into()));
        }

        let stored_crc = LittleEndian::read_u32(&buf[0..4]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[4..META_SIZE]);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            return Err(TetherError::Corrupt(
                format!("meta CRC mismatch: expected {stored_crc}, got {computed_crc}").into(),
            ));
        }

        let magic = LittleEndian::read_u32(&buf[4..8]);
        if magic != MAGIC {
            return Err(TetherError::Corrupt(format!("bad magic {magic:#010x}").into()));
        }

        let version = LittleEndian::read_u16(&buf[8..10]);
        if version != FORMAT_VERSION {
            return Err(TetherError::Corrupt(format!("unsupported format version {version}").into()));
        }

        Ok(Self {
            page_size: LittleEndian::read_u32(&buf[10..14]),
            root: LittleEndian::read_u32(&buf[14..18]),
            next_page: LittleEndian::read_u32(&buf[18..22]),
            free_head: LittleEndian::read_u32(&buf[22..26]),
            leaf_head: LittleEndian::read_u32(&buf[26..30]),
        })
    }
}

/// Where a leaf stores its value bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRef {
    Inline(Vec<u8>),
    /// Value spilled to an overflow chain starting at `head`
    Overflow { total_len: u32, head: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: ValueRef,
}

impl LeafEntry {
    /// Encoded cell size: key_len(2) + flag(1) + payload
    pub fn cell_size(&self) -> usize {
        let value_size = match &self.value {
            ValueRef::Inline(val) => 2 + val.len(),
            ValueRef::Overflow { .. } => 4 + 4,
        };
        2 + 1 + self.key.len() + value_size
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    pub entries: Vec<LeafEntry>,
    pub next_leaf: u32,
}

/// Internal node: `leftmost` covers keys below the first separator,
/// `entries[i].1` covers keys in `[entries[i].0, entries[i+1].0)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub leftmost: u32,
    pub entries: Vec<(Vec<u8>, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

/// Encoded size of an internal separator cell: key_len(2) + key + child(4)
pub fn internal_cell_size(key_len: usize) -> usize {
    2 + key_len + 4
}

impl Node {
    /// Bytes this node occupies when encoded, header included
    pub fn used_bytes(&self) -> usize {
        match self {
            Node::Leaf(leaf) => {
                PAGE_HDR + leaf.entries.iter().map(LeafEntry::cell_size).sum::<usize>()
            }
            Node::Internal(node) => {
                PAGE_HDR + node.entries.iter().map(|(key, _)| internal_cell_size(key.len())).sum::<usize>()
            }
        }
    }

    pub fn fits(&self, page_size: usize) -> bool {
        self.used_bytes() <= page_size
    }

    pub fn encode(&self, page_size: usize) -> Result<Vec<u8>> {
        if !self.fits(page_size) {
            return Err(TetherError::Corrupt("node exceeds page size".into()));
        }

        let mut buf = vec![0u8; page_size];
        let mut cursor = PAGE_HDR;

        match self {
            Node::Leaf(leaf) => {
                buf[4] = PAGE_LEAF;
                LittleEndian::write_u16(&mut buf[6..8], leaf.entries.len() as u16);
                LittleEndian::write_u32(&mut buf[8..12], leaf.next_leaf);

                for entry in &leaf.entries {
                    LittleEndian::write_u16(&mut buf[cursor..cursor + 2], entry.key.len() as u16);
                    cursor += 2;
                    match &entry.value {
                        ValueRef::Inline(val) => {
                            buf[cursor] = LEAF_VALUE_INLINE;
                            cursor += 1;
                            LittleEndian::write_u16(&mut buf[cursor..cursor + 2], val.len() as u16);
                            cursor += 2;
                            buf[cursor..cursor + entry.key.len()].copy_from_slice(&entry.key);
                            cursor += entry.key.len();
                            buf[cursor..cursor + val.len()].copy_from_slice(val);
                            cursor += val.len();
                        }
                        ValueRef::Overflow { total_len, head } => {
                            buf[cursor] = LEAF_VALUE_OVERFLOW;
                            cursor += 1;
                            LittleEndian::write_u32(&mut buf[cursor..cursor + 4], *total_len);
                            cursor += 4;
                            LittleEndian::write_u32(&mut buf[cursor..cursor + 4], *head);
                            cursor += 4;
                            buf[cursor..cursor + entry.key.len()].copy_from_slice(&entry.key);
                            cursor += entry.key.len();
                        }
                    }
                }
            }
            Node::Internal(node) => {
                buf[4] = PAGE_INTERNAL;
                LittleEndian::write_u16(&mut buf[6..8], node.entries.len() as u16);
                LittleEndian::write_u32(&mut buf[8..12], node.leftmost);

                for (key, child) in &node.entries {
                    LittleEndian::write_u16(&mut buf[cursor..cursor + 2], key.len() as u16);
                    cursor += 2;
                    buf[cursor..cursor + key.len()].copy_from_slice(key);
                    cursor += key.len();
                    LittleEndian::write_u32(&mut buf[cursor..cursor + 4], *child);
                    cursor += 4;
                }
            }
        }

        write_checksum(&mut buf);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        verify_checksum(buf)?;

        let page_type = buf[4];
        let count = LittleEndian::read_u16(&buf[6..8]) as usize;
        let extra = LittleEndian::read_u32(&buf[8..12]);
        let mut cursor = PAGE_HDR;

        match page_type {
            PAGE_LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = read_u16_at(buf, &mut cursor)? as usize;
                    let flag = *buf
                        .get(cursor)
                        .ok_or_else(|| TetherError::Corrupt("leaf cell truncated".into()))?;
                    cursor += 1;

                    let value = match flag {
                        LEAF_VALUE_INLINE => {
                            let val_len = read_u16_at(buf, &mut cursor)? as usize;
                            let key = read_bytes_at(buf, &mut cursor, key_len)?;
                            let val = read_bytes_at(buf, &mut cursor, val_len)?;
                            entries.push(LeafEntry { key, value: ValueRef::Inline(val) });
                            continue;
                        }
                        LEAF_VALUE_OVERFLOW => {
                            let total_len = read_u32_at(buf, &mut cursor)?;
                            let head = read_u32_at(buf, &mut cursor)?;
                            ValueRef::Overflow { total_len, head }
                        }
                        other => {
                            return Err(TetherError::Corrupt(
                                format!("unknown leaf value flag {other}").into(),
                            ));
                        }
                    };
                    let key = read_bytes_at(buf, &mut cursor, key_len)?;
                    entries.push(LeafEntry { key, value });
                }
                Ok(Node::Leaf(LeafNode { entries, next_leaf: extra }))
            }
            PAGE_INTERNAL => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = read_u16_at(buf, &mut cursor)? as usize;
                    let key = read_bytes_at(buf, &mut cursor, key_len)?;
                    let child = read_u32_at(buf, &mut cursor)?;
                    entries.push((key, child));
                }
                Ok(Node::Internal(InternalNode { leftmost: extra, entries }))
            }
            other => Err(TetherError::Corrupt(format!("unexpected page type {other}").into())),
        }
    }
}

/// Payload bytes an overflow page can carry
pub fn overflow_capacity(page_size: usize) -> usize {
    page_size - PAGE_HDR
}

pub fn encode_overflow(chunk: &[u8], next: u32, page_size: usize) -> Result<Vec<u8>> {
    if chunk.len() > overflow_capacity(page_size) {
        return Err(TetherError::Corrupt("overflow chunk exceeds page size".into()));
    }

    let mut buf = vec![0u8; page_size];
    buf[4] = PAGE_OVERFLOW;
    LittleEndian::write_u16(&mut buf[6..8], chunk.len() as u16);
    LittleEndian::write_u32(&mut buf[8..12], next);
    buf[PAGE_HDR..PAGE_HDR + chunk.len()].copy_from_slice(chunk);

    write_checksum(&mut buf);
    Ok(buf)
}

/// Returns the chunk bytes and the next page in the chain
pub fn decode_overflow(buf: &[u8]) -> Result<(Vec<u8>, u32)> {
    verify_checksum(buf)?;

    if buf[4] != PAGE_OVERFLOW {
        return Err(TetherError::Corrupt(format!("expected overflow page, got type {}", buf[4]).into()));
    }

    let chunk_len = LittleEndian::read_u16(&buf[6..8]) as usize;
    let next = LittleEndian::read_u32(&buf[8..12]);
    if PAGE_HDR + chunk_len > buf.len() {
        return Err(TetherError::Corrupt("overflow chunk truncated".into()));
    }

    Ok((buf[PAGE_HDR..PAGE_HDR + chunk_len].to_vec(), next))
}

/// Free-list node: type byte plus a link to the next free page
pub fn encode_free(next: u32, page_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; page_size];
    buf[4] = PAGE_FREE;
    LittleEndian::write_u32(&mut buf[8..12], next);
    write_checksum(&mut buf);
    buf
}

pub fn decode_free(buf: &[u8]) -> Result<u32> {
    verify_checksum(buf)?;
    if buf[4] != PAGE_FREE {
        return Err(TetherError::Corrupt(format!("expected free page, got type {}", buf[4]).into()));
    }
    Ok(LittleEndian::read_u32(&buf[8..12]))
}

fn write_checksum(buf: &mut [u8]) {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[4..]);
    let crc = hasher.finalize();
    LittleEndian::write_u32(&mut buf[0..4], crc);
}

fn verify_checksum(buf: &[u8]) -> Result<()> {
    if buf.len() < PAGE_HDR {
        return Err(TetherError::Corrupt("page truncated".into()));
    }

    let stored_crc = LittleEndian::read_u32(&buf[0..4]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[4..]);
    let computed_crc = hasher.finalize();

    if stored_crc != computed_crc {
        return Err(TetherError::Corrupt(
            format!("page CRC mismatch: expected {stored_crc}, got {computed_crc}").into(),
        ));
    }
    Ok(())
}

fn read_u16_at(buf: &[u8], cursor: &mut usize) -> Result<u16> {
    let end = *cursor + 2;
    if end > buf.len() {
        return Err(TetherError::Corrupt("cell truncated".into()));
    }
    let val = LittleEndian::read_u16(&buf[*cursor..end]);
    *cursor = end;
    Ok(val)
}

fn read_u32_at(buf: &[u8], cursor: &mut usize) -> Result<u32> {
    let end = *cursor + 4;
    if end > buf.len() {
        return Err(TetherError::Corrupt("cell truncated".into()));
    }
    let val = LittleEndian::read_u32(&buf[*cursor..end]);
    *cursor = end;
    Ok(val)
}

fn read_bytes_at(buf: &[u8], cursor: &mut usize, len: usize) -> Result<Vec<u8>> {
    let end = *cursor + len;
    if end > buf.len() {
        return Err(TetherError::Corrupt("cell truncated".into()));
    }
    let bytes = buf[*cursor..end].to_vec();
    *cursor = end;
    Ok(bytes)
}
