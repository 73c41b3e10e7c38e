//! Append-only block archives
//!
//! The ledger owns one [`BlockStorage`] implementation, injected at
//! construction: in-memory for tests and tools, file-backed for nodes. The
//! file format is a flat sequence of length-prefixed canonical blocks.

use crate::block::Block;
use crate::Result;
use agora_core::wire::{read_var_len, take, write_var_len};
use agora_core::{from_slice, to_vec};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// An append-only sequence of blocks indexed by height.
pub trait BlockStorage: Send + Sync {
    /// Append a block. Heights are implicit: the nth pushed block is height
    /// n-1.
    fn push(&mut self, block: &Block) -> Result<()>;

    fn get(&self, height: u64) -> Option<Block>;

    fn latest(&self) -> Option<Block>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Vec-backed storage for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryBlockStorage {
    blocks: Vec<Block>,
}

impl MemoryBlockStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStorage for MemoryBlockStorage {
    fn push(&mut self, block: &Block) -> Result<()> {
        self.blocks.push(block.clone());
        Ok(())
    }

    fn get(&self, height: u64) -> Option<Block> {
        self.blocks.get(height as usize).cloned()
    }

    fn latest(&self) -> Option<Block> {
        self.blocks.last().cloned()
    }

    fn len(&self) -> u64 {
        self.blocks.len() as u64
    }
}

/// File-backed storage: one append-only file of LEB128-length-prefixed
/// canonical blocks, fully scanned on open.
#[derive(Debug)]
pub struct FileBlockStorage {
    path: PathBuf,
    file: File,
    blocks: Vec<Block>,
}

impl FileBlockStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let mut blocks = Vec::new();
        if path.exists() {
            let bytes = std::fs::read(path)?;
            let mut input = bytes.as_slice();
            while !input.is_empty() {
                let len = read_var_len(&mut input)?;
                let len = usize::try_from(len)
                    .map_err(|_| agora_core::WireError::LengthOverflow)?;
                let frame = take(&mut input, len)?;
                blocks.push(from_slice::<Block>(frame)?);
            }
            info!(path = %path.display(), count = blocks.len(), "block archive loaded");
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            blocks,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStorage for FileBlockStorage {
    fn push(&mut self, block: &Block) -> Result<()> {
        let body = to_vec(block);
        let mut frame = Vec::with_capacity(body.len() + 4);
        write_var_len(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
        self.file.write_all(&frame)?;
        self.file.flush()?;
        self.blocks.push(block.clone());
        Ok(())
    }

    fn get(&self, height: u64) -> Option<Block> {
        self.blocks.get(height as usize).cloned()
    }

    fn latest(&self) -> Option<Block> {
        self.blocks.last().cloned()
    }

    fn len(&self) -> u64 {
        self.blocks.len() as u64
    }
}
