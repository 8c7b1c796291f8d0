//! Self-describing byte store: allocator metadata, a named-cell directory,
//! and arbitrary binary blobs packed into one flat address space.

use std::collections::BTreeMap;
use std::io::Cursor;

use tracing::{debug, instrument};

use crate::alloc::BuddyAllocator;
use crate::descriptor::Block;
use crate::error::Result;
use crate::serialize::{read_bytes_list, read_u64_list, write_bytes_list, write_u64_list};
use crate::stream::ByteStream;

/// `(alloc_desc, names_desc)`, two big-endian u64s.
const HEADER_SIZE: u64 = 16;

/// Builder-style options for [`Store::open_with_options`]. There is no
/// external config file at this layer -- this is a library, not a
/// service -- so `StoreOptions` is just the typed equivalent of the
/// constructor keyword arguments a caller would otherwise pass positionally.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    base_offset: u64,
}

impl StoreOptions {
    pub fn new() -> Self {
        StoreOptions::default()
    }

    /// Address of the store's 16-byte header within the stream.
    pub fn base_offset(mut self, base_offset: u64) -> Self {
        self.base_offset = base_offset;
        self
    }
}

/// Self-describing store over a [`ByteStream`].
///
/// `base_offset` is the address of the 16-byte header; all block offsets
/// recorded by the allocator are relative to `base_offset + HEADER_SIZE`.
pub struct Store<S: ByteStream> {
    stream: S,
    base_offset: u64,
    alloc_desc: u64,
    names_desc: u64,
    alloc: BuddyAllocator,
    names: BTreeMap<Vec<u8>, u64>,
    read_only: bool,
}

impl<S: ByteStream> Store<S> {
    /// Open (or initialize) a store at `base_offset` within `stream`. If the
    /// stream is shorter than `base_offset + 16` bytes, the store starts out
    /// empty -- this covers both a freshly created/truncated file and an
    /// empty in-memory buffer.
    pub fn open(mut stream: S, base_offset: u64) -> Result<Self> {
        let data_offset = base_offset + HEADER_SIZE;

        let len = stream.len()?;
        let (alloc_desc, names_desc) = if len >= data_offset {
            let mut buf = [0u8; 16];
            stream.read_at(base_offset, &mut buf)?;
            let alloc_desc = u64::from_be_bytes(buf[0..8].try_into().unwrap());
            let names_desc = u64::from_be_bytes(buf[8..16].try_into().unwrap());
            (alloc_desc, names_desc)
        } else {
            (0, 0)
        };

        let read_only = stream.is_read_only();
        let mut store = Store {
            stream,
            base_offset,
            alloc_desc: 0,
            names_desc: 0,
            alloc: BuddyAllocator::new(),
            names: BTreeMap::new(),
            read_only,
        };

        if alloc_desc != 0 {
            let raw = store.load_raw(alloc_desc)?;
            store.alloc = BuddyAllocator::from_stream(&mut Cursor::new(raw))?;
        }
        store.alloc_desc = alloc_desc;

        if names_desc != 0 {
            let raw = store.load_raw(names_desc)?;
            let mut cur = Cursor::new(raw);
            let keys = read_bytes_list(&mut cur)?;
            let values = read_u64_list(&mut cur)?;
            store.names = keys.into_iter().zip(values).collect();
        }
        store.names_desc = names_desc;

        Ok(store)
    }

    /// Open (or initialize) a store using a [`StoreOptions`] builder rather
    /// than positional arguments.
    pub fn open_with_options(stream: S, options: StoreOptions) -> Result<Self> {
        Self::open(stream, options.base_offset)
    }

    fn load_raw(&mut self, desc: u64) -> Result<Vec<u8>> {
        if desc == 0 {
            return Ok(Vec::new());
        }
        let block = Block::from_desc(desc)?;
        let mut buf = vec![0u8; block.used as usize];
        let offset = self.base_offset + HEADER_SIZE + block.offset;
        self.stream.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Load a blob by its descriptor. Descriptor `0` returns empty data.
    pub fn load(&mut self, desc: u64) -> Result<Vec<u8>> {
        self.load_raw(desc)
    }

    /// Load the blob stored under `name`, or empty data if no such name.
    pub fn load_by_name(&mut self, name: &[u8]) -> Result<Vec<u8>> {
        let desc = self.names.get(name).copied().unwrap_or(0);
        self.load(desc)
    }

    /// Reserve space for `size` bytes without writing anything, reusing
    /// `desc`'s block if it's already big enough.
    #[instrument(level = "trace", skip(self))]
    pub fn reserve(&mut self, size: u64, desc: Option<u64>) -> Result<u64> {
        Ok(self.reserve_block(size, desc)?.to_desc())
    }

    fn reserve_block(&mut self, size: u64, desc: Option<u64>) -> Result<Block> {
        if let Some(desc) = desc.filter(|&d| d != 0) {
            let mut block = Block::from_desc(desc)?;
            if block.size() >= size {
                block.used = size;
                return Ok(block);
            }
            self.alloc.free(block);
        }
        let mut block = self.alloc.alloc(size)?;
        block.used = size;
        Ok(block)
    }

    /// Save `data`, reusing `desc`'s block when possible; returns the new
    /// descriptor. Empty data frees the old block (if any) and returns `0`.
    pub fn save(&mut self, data: &[u8], desc: Option<u64>) -> Result<u64> {
        if data.is_empty() {
            if let Some(desc) = desc.filter(|&d| d != 0) {
                self.delete(desc);
            }
            return Ok(0);
        }

        let block = self.reserve_block(data.len() as u64, desc)?;
        let offset = self.base_offset + HEADER_SIZE + block.offset;
        self.stream.write_at(offset, data)?;
        Ok(block.to_desc())
    }

    /// Save `data` under `name`; writing empty data removes the name.
    pub fn save_by_name(&mut self, name: &[u8], data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.delete_by_name(name);
            return Ok(());
        }
        let old = self.names.get(name).copied();
        let desc = self.save(data, old)?;
        self.names.insert(name.to_vec(), desc);
        Ok(())
    }

    /// Free the block referenced by `desc`. `0` is a no-op.
    pub fn delete(&mut self, desc: u64) {
        if desc == 0 {
            return;
        }
        // A malformed descriptor here indicates an internal bug (we only
        // ever delete descriptors we ourselves handed out), so unwrap is a
        // deliberate invariant check rather than user-facing fallibility.
        let block = Block::from_desc(desc).expect("delete() given a descriptor we did not mint");
        self.alloc.free(block);
    }

    /// Remove `name` and free its backing block, if any.
    pub fn delete_by_name(&mut self, name: &[u8]) {
        if let Some(desc) = self.names.remove(name) {
            self.delete(desc);
        }
    }

    /// Total space used, excluding the allocator's own bookkeeping blocks.
    pub fn size(&self) -> u64 {
        let mut internal = 0u64;
        if self.alloc_desc != 0 {
            internal += Block::from_desc(self.alloc_desc).unwrap().size();
        }
        if self.names_desc != 0 {
            internal += Block::from_desc(self.names_desc).unwrap().size();
        }
        for &desc in self.names.values() {
            internal += Block::from_desc(desc).unwrap().size();
        }
        self.alloc.size() - internal
    }

    /// Rewrite the names directory, the allocator's own free list, and the
    /// header. This is the only durability barrier.
    #[instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }

        // Names directory.
        if self.names.is_empty() {
            self.delete(self.names_desc);
            self.names_desc = 0;
        } else {
            let mut buf = Vec::new();
            let keys: Vec<&Vec<u8>> = self.names.keys().collect();
            let values: Vec<u64> = self.names.values().copied().collect();
            write_bytes_list(&mut buf, keys)?;
            write_u64_list(&mut buf, &values)?;
            self.names_desc = self.save(&buf, Some(self.names_desc).filter(|&d| d != 0))?;
        }

        // Allocator free list. Writing it can itself perturb the free list
        // (the write may need to allocate), so retry until the returned
        // descriptor stops moving.
        let own_block_size = if self.alloc_desc != 0 {
            Block::from_desc(self.alloc_desc)?.size()
        } else {
            0
        };
        if self.alloc.size().saturating_sub(own_block_size) > 0 {
            loop {
                let mut buf = Vec::new();
                self.alloc.to_stream(&mut buf)?;
                let prior = self.alloc_desc;
                let next = self.save(&buf, Some(prior).filter(|&d| d != 0))?;
                self.alloc_desc = next;
                if next == prior {
                    break;
                }
            }
        } else {
            let old = self.alloc_desc;
            self.alloc_desc = 0;
            self.delete(old);
            debug_assert_eq!(self.alloc.size(), 0, "allocator should be empty here");
        }

        let mut header = [0u8; 16];
        header[0..8].copy_from_slice(&self.alloc_desc.to_be_bytes());
        header[8..16].copy_from_slice(&self.names_desc.to_be_bytes());
        self.stream.write_at(self.base_offset, &header)?;
        self.stream.flush()?;

        debug!(alloc_desc = self.alloc_desc, names_desc = self.names_desc, "store flushed");
        Ok(())
    }

    /// Borrow the backing stream, e.g. to reopen a second `Store` over the
    /// same storage.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: ByteStream> Drop for Store<S> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::error!(error = %err, "store flush on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::InMemoryStream;

    #[test]
    fn simple_save_load() {
        let mut store = Store::open(InMemoryStream::new(), 1).unwrap();

        assert_eq!(store.save(b"", None).unwrap(), 0);
        assert_eq!(store.load(0).unwrap(), b"");

        let d1 = store.save(b"some test data", None).unwrap();
        assert_eq!(store.load(d1).unwrap(), b"some test data");

        store.save_by_name(b"name", b"some test value").unwrap();
        assert_eq!(store.load_by_name(b"name").unwrap(), b"some test value");

        store.flush().unwrap();
        let bytes = store.stream_mut().clone().into_vec();
        drop(store);

        let mut reloaded = Store::open(InMemoryStream::from_vec(bytes), 1).unwrap();
        assert_eq!(reloaded.load(d1).unwrap(), b"some test data");
        assert_eq!(reloaded.load_by_name(b"name").unwrap(), b"some test value");
    }

    /// A read-only `Store` must not touch its backing file at all: the
    /// names directory rewrite, the allocator's own save, and the header
    /// write are all write side effects that have to be skipped, not just
    /// the final `sync_all`.
    #[test]
    fn read_only_store_flush_does_not_mutate_file() {
        use crate::stream::{FileStream, OpenMode};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        {
            let mut store = Store::open(FileStream::open(&path, OpenMode::Truncate).unwrap(), 0).unwrap();
            store.save_by_name(b"k", b"some test value").unwrap();
            store.flush().unwrap();
        }
        let bytes_before = std::fs::read(&path).unwrap();

        {
            let mut store =
                Store::open(FileStream::open(&path, OpenMode::ReadOnly).unwrap(), 0).unwrap();
            assert_eq!(store.load_by_name(b"k").unwrap(), b"some test value");
            store.flush().unwrap();
        }

        let bytes_after = std::fs::read(&path).unwrap();
        assert_eq!(bytes_before, bytes_after, "read-only flush must not touch the file");
    }

    #[test]
    fn open_with_options_matches_positional_open() {
        let store = Store::open_with_options(
            InMemoryStream::new(),
            StoreOptions::new().base_offset(1),
        )
        .unwrap();
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn delete_frees_space() {
        let mut store = Store::open(InMemoryStream::new(), 0).unwrap();
        let d = store.save(b"some data here", None).unwrap();
        assert!(store.size() > 0);
        store.delete(d);
        store.flush().unwrap();
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn saving_empty_deletes_name() {
        let mut store = Store::open(InMemoryStream::new(), 0).unwrap();
        store.save_by_name(b"k", b"v").unwrap();
        assert_eq!(store.load_by_name(b"k").unwrap(), b"v");
        store.save_by_name(b"k", b"").unwrap();
        assert_eq!(store.load_by_name(b"k").unwrap(), b"");
        store.flush().unwrap();
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn stress_save_delete_reload() {
        crate::init_test_tracing();
        let mut rng_state = 0xdead_beef_cafe_f00du64;
        let mut next = || {
            rng_state ^= rng_state << 13;
            rng_state ^= rng_state >> 7;
            rng_state ^= rng_state << 17;
            rng_state
        };

        let count = 1 << 10;
        let datas: Vec<Vec<u8>> = (0..count)
            .map(|_| {
                let n = (next() % count as u64).to_string().into_bytes();
                let reps = (next() % 16 + 1) as usize;
                n.repeat(reps)
            })
            .collect();

        let mut store = Store::open(InMemoryStream::new(), 0).unwrap();
        let mut descs = Vec::new();
        for data in &datas {
            descs.push(store.save(data, None).unwrap());
        }
        store.flush().unwrap();

        for (data, &desc) in datas.iter().zip(&descs) {
            assert_eq!(&store.load(desc).unwrap(), data);
        }

        let half = datas.len() / 2;
        for &desc in &descs[half..] {
            store.delete(desc);
        }
        store.flush().unwrap();

        for (data, &desc) in datas[..half].iter().zip(&descs[..half]) {
            assert_eq!(&store.load(desc).unwrap(), data);
        }
    }
}
