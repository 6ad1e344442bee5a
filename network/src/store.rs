//! Local block storage consumed by the exchange.

use anyhow::Result;
use bytes::Bytes;
use cairn_util::FastDashMap;

use crate::types::{Block, Cid};

pub trait BlockStore: Send + Sync + 'static {
    fn has_block(&self, cid: &Cid) -> Result<bool>;

    fn get_block(&self, cid: &Cid) -> Result<Option<Block>>;

    fn put_block(&self, block: Block) -> Result<()>;

    /// Returns the size of the stored block data.
    fn size_of(&self, cid: &Cid) -> Result<Option<usize>>;

    fn delete_blocks(&self, cids: &[Cid]) -> Result<()>;

    fn sizes_of(&self, cids: &[Cid]) -> Result<Vec<Option<usize>>> {
        cids.iter().map(|cid| self.size_of(cid)).collect()
    }

    fn get_blocks(&self, cids: &[Cid]) -> Result<Vec<Option<Block>>> {
        cids.iter().map(|cid| self.get_block(cid)).collect()
    }
}

/// Keeps all blocks in memory.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: FastDashMap<Cid, Bytes>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockStore for MemoryBlockStore {
    fn has_block(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.contains_key(cid))
    }

    fn get_block(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(self
            .blocks
            .get(cid)
            .map(|data| Block::new_unchecked(*cid, data.clone())))
    }

    fn put_block(&self, block: Block) -> Result<()> {
        let cid = *block.cid();
        self.blocks.insert(cid, block.into_data());
        Ok(())
    }

    fn size_of(&self, cid: &Cid) -> Result<Option<usize>> {
        Ok(self.blocks.get(cid).map(|data| data.len()))
    }

    fn delete_blocks(&self, cids: &[Cid]) -> Result<()> {
        for cid in cids {
            self.blocks.remove(cid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Codec;

    #[test]
    fn memory_store_works() -> Result<()> {
        let store = MemoryBlockStore::new();
        let block = Block::new(Codec::RAW, Bytes::from_static(b"hello"));
        let cid = *block.cid();

        assert!(!store.has_block(&cid)?);
        store.put_block(block.clone())?;
        assert!(store.has_block(&cid)?);
        assert_eq!(store.size_of(&cid)?, Some(5));
        assert_eq!(store.get_block(&cid)?, Some(block));

        let other = Cid::for_data(Codec::RAW, b"other");
        assert_eq!(store.sizes_of(&[cid, other])?, vec![Some(5), None]);

        store.delete_blocks(&[cid])?;
        assert!(store.is_empty());
        Ok(())
    }
}
