use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::errors::Result;
use crate::helpers::{KIBI, MEBI};

/// Arena floor: a tree needs at least a meta page and one leaf
const MIN_ARENA: usize = KIBI;

/// Arena ceiling on hosted platforms
const MAX_ARENA: usize = 64 * MEBI;

/// Byte-addressable storage below the tree.
///
/// Both variants expose the same random-access contract; `sync` is a real
/// durability barrier for files and a no-op for the volatile arena.
pub enum Backing {
    Memory(MemoryBacking),
    File(FileBacking),
}

/// Growable volatile byte arena. Lost on process exit.
pub struct MemoryBacking {
    buf: Vec<u8>,
}

/// File opened for random read/write. Created empty when absent.
pub struct FileBacking {
    file: File,
    len: u64,
}

impl Backing {
    /// Volatile arena sized from a percentage of available memory
    pub fn memory(ram_percentage: u8) -> Self {
        let initial = initial_arena_size(ram_percentage, available_memory());
        tracing::debug!("memory backing: initial arena {initial} bytes ({ram_percentage}%)");
        Backing::Memory(MemoryBacking { buf: Vec::with_capacity(initial) })
    }

    /// Open or create the backing file
    pub async fn open_file(path: &Path) -> Result<Self> {
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Backing::File(FileBacking { file, len }))
    }

    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Backing::Memory(mem) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > mem.buf.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("read past end of arena: {end} > {}", mem.buf.len()),
                    )
                    .into());
                }
                buf.copy_from_slice(&mem.buf[start..end]);
                Ok(())
            }
            Backing::File(file) => {
                file.file.seek(SeekFrom::Start(offset)).await?;
                file.file.read_exact(buf).await?;
                Ok(())
            }
        }
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            Backing::Memory(mem) => {
                let start = offset as usize;
                let end = start + data.len();
                if end > mem.buf.len() {
                    mem.buf.resize(end, 0);
                }
                mem.buf[start..end].copy_from_slice(data);
                Ok(())
            }
            Backing::File(file) => {
                file.file.seek(SeekFrom::Start(offset)).await?;
                file.file.write_all(data).await?;
                file.len = file.len.max(offset + data.len() as u64);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Backing::Memory(mem) => mem.buf.len() as u64,
            Backing::File(file) => file.len,
        }
    }

    pub async fn set_len(&mut self, len: u64) -> Result<()> {
        match self {
            Backing::Memory(mem) => {
                mem.buf.resize(len as usize, 0);
                Ok(())
            }
            Backing::File(file) => {
                file.file.set_len(len).await?;
                file.len = len;
                Ok(())
            }
        }
    }

    /// Durability barrier
    pub async fn sync(&mut self) -> Result<()> {
        match self {
            Backing::Memory(_) => Ok(()),
            Backing::File(file) => {
                file.file.sync_data().await?;
                Ok(())
            }
        }
    }
}

/// Clamp the requested share of available memory into the supported range.
fn initial_arena_size(ram_percentage: u8, available: Option<u64>) -> usize {
    let available = available.unwrap_or(MAX_ARENA as u64);
    let target = u128::from(available) * u128::from(ram_percentage) / 100;
    usize::try_from(target).unwrap_or(MAX_ARENA).clamp(MIN_ARENA, MAX_ARENA)
}

/// Available memory in bytes, when the platform reports it
fn available_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}
