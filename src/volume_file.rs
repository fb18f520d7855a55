use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::errors::{Result, StoreError};

//-------------------------------------------------------------------------

/// Handle to one record slot: the high 8 bits hold the size-class index,
/// the low 56 bits the byte offset of the slot in the file.
pub type RecordId = u64;

/// Stable node identity, allocated from the header counter and never reused.
pub type NodeId = u64;

pub const NO_RECORD: RecordId = u64::MAX;

pub const SIZES_COUNT: usize = 38;

// From 32 bytes to 4 TB
pub const RECORD_SIZES: [u64; SIZES_COUNT] = record_sizes();

const fn record_sizes() -> [u64; SIZES_COUNT] {
    let mut sizes = [0u64; SIZES_COUNT];
    sizes[0] = 32;
    let mut i = 1;
    while i < SIZES_COUNT {
        sizes[i] = sizes[i - 1] * 2;
        i += 1;
    }
    sizes
}

const CONTROL_BLOCK_SIZE: usize = 4096;
const FREE_RECORDS_PER_BLOCK: usize = CONTROL_BLOCK_SIZE / 8 - 1;

const SIGNATURE: [u8; 4] = *b"HKEY";
const VERSION: i32 = 1;

const EMPTY_OFFSET: u64 = u64::MAX;

// The class index must fit the top byte of a record id.
const RECORD_ID_CLASS_SHIFT: u32 = 56;

fn to_record_id(class: usize, offset: u64) -> RecordId {
    ((class as u64) << RECORD_ID_CLASS_SHIFT) | offset
}

fn from_record_id(id: RecordId) -> (usize, u64) {
    let class = (id >> RECORD_ID_CLASS_SHIFT) as usize;
    let offset = id & ((1u64 << RECORD_ID_CLASS_SHIFT) - 1);
    (class, offset)
}

//-------------------------------------------------------------------------

struct HeaderBlock {
    free_heads: [u64; SIZES_COUNT],
    available_head: u64,
    root_record_id: RecordId,
    ttl_tree_record_id: RecordId,
    next_node_id: NodeId,
}

impl HeaderBlock {
    fn new() -> Self {
        Self {
            free_heads: [EMPTY_OFFSET; SIZES_COUNT],
            available_head: EMPTY_OFFSET,
            root_record_id: NO_RECORD,
            ttl_tree_record_id: NO_RECORD,
            next_node_id: 0,
        }
    }

    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(CONTROL_BLOCK_SIZE);
        buf.write_all(&SIGNATURE)?;
        buf.write_i32::<LittleEndian>(VERSION)?;
        for head in &self.free_heads {
            buf.write_u64::<LittleEndian>(*head)?;
        }
        buf.write_u64::<LittleEndian>(self.available_head)?;
        buf.write_u64::<LittleEndian>(self.root_record_id)?;
        buf.write_u64::<LittleEndian>(self.ttl_tree_record_id)?;
        buf.write_u64::<LittleEndian>(self.next_node_id)?;
        buf.resize(CONTROL_BLOCK_SIZE, 0);
        Ok(buf)
    }

    fn decode(data: &[u8]) -> io::Result<Self> {
        let mut r = Cursor::new(data);
        let mut signature = [0u8; 4];
        r.read_exact(&mut signature)?;
        if signature != SIGNATURE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "file is not a volume",
            ));
        }
        let version = r.read_i32::<LittleEndian>()?;
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported volume version {}", version),
            ));
        }
        let mut free_heads = [EMPTY_OFFSET; SIZES_COUNT];
        for head in free_heads.iter_mut() {
            *head = r.read_u64::<LittleEndian>()?;
        }
        let available_head = r.read_u64::<LittleEndian>()?;
        let root_record_id = r.read_u64::<LittleEndian>()?;
        let ttl_tree_record_id = r.read_u64::<LittleEndian>()?;
        let next_node_id = r.read_u64::<LittleEndian>()?;
        Ok(Self {
            free_heads,
            available_head,
            root_record_id,
            ttl_tree_record_id,
            next_node_id,
        })
    }
}

//-------------------------------------------------------------------------

struct FreeRecordsBlock {
    offsets: [u64; FREE_RECORDS_PER_BLOCK],
    next: u64,
}

impl FreeRecordsBlock {
    fn empty() -> Self {
        Self {
            offsets: [EMPTY_OFFSET; FREE_RECORDS_PER_BLOCK],
            next: EMPTY_OFFSET,
        }
    }

    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(CONTROL_BLOCK_SIZE);
        for offset in &self.offsets {
            buf.write_u64::<LittleEndian>(*offset)?;
        }
        buf.write_u64::<LittleEndian>(self.next)?;
        Ok(buf)
    }

    fn decode(data: &[u8]) -> io::Result<Self> {
        let mut r = Cursor::new(data);
        let mut offsets = [EMPTY_OFFSET; FREE_RECORDS_PER_BLOCK];
        for offset in offsets.iter_mut() {
            *offset = r.read_u64::<LittleEndian>()?;
        }
        let next = r.read_u64::<LittleEndian>()?;
        Ok(Self { offsets, next })
    }
}

//-------------------------------------------------------------------------

struct VolumeFileInner {
    file: File,
    file_size: u64,
    header: HeaderBlock,

    // In-memory copy of the head free-records block of each size class.
    free_blocks: Vec<FreeRecordsBlock>,
}

impl VolumeFileInner {
    fn find_best_fit(&self, size: u64) -> Result<usize> {
        for (i, slot) in RECORD_SIZES.iter().enumerate() {
            if *slot >= size {
                return Ok(i);
            }
        }
        Err(StoreError::TooLargeRecord(size))
    }

    fn save_header(&mut self) -> io::Result<()> {
        let buf = self.header.encode()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)
    }

    fn load_free_block(&mut self, class: usize) -> io::Result<()> {
        let offset = self.header.free_heads[class];
        if offset != EMPTY_OFFSET {
            let mut buf = vec![0u8; CONTROL_BLOCK_SIZE];
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut buf)?;
            self.free_blocks[class] = FreeRecordsBlock::decode(&buf)?;
        }
        Ok(())
    }

    fn save_free_block(&mut self, class: usize) -> io::Result<()> {
        let buf = self.free_blocks[class].encode()?;
        self.file
            .seek(SeekFrom::Start(self.header.free_heads[class]))?;
        self.file.write_all(&buf)
    }

    /// The head block of `class` is now empty; park it on the available-empty
    /// chain and pull in the next chained block, if any.
    fn next_free_block(&mut self, class: usize) -> io::Result<()> {
        let next = self.free_blocks[class].next;

        self.free_blocks[class].next = self.header.available_head;
        self.save_free_block(class)?;

        self.header.available_head = self.header.free_heads[class];
        self.header.free_heads[class] = next;
        self.save_header()?;

        self.load_free_block(class)
    }

    /// Makes a fresh (all-empty) free-records block the head for `class`,
    /// reusing a parked empty block when one is available.
    fn acquire_free_block(&mut self, class: usize) -> io::Result<()> {
        if self.header.available_head != EMPTY_OFFSET {
            let chained = self.header.free_heads[class];

            self.header.free_heads[class] = self.header.available_head;
            self.load_free_block(class)?;
            self.header.available_head = self.free_blocks[class].next;
            self.free_blocks[class].next = chained;
            self.save_header()
        } else {
            let offset = self.file_size;
            self.file_size += CONTROL_BLOCK_SIZE as u64;

            let mut block = FreeRecordsBlock::empty();
            block.next = self.header.free_heads[class];
            self.free_blocks[class] = block;
            self.header.free_heads[class] = offset;
            self.save_header()
        }
    }

    fn write_padding(&mut self, mut size: u64) -> io::Result<()> {
        const BUF_SIZE: u64 = 65536;
        let zeroes = [0u8; BUF_SIZE as usize];

        while size > 0 {
            let to_write = size.min(BUF_SIZE);
            self.file.write_all(&zeroes[..to_write as usize])?;
            size -= to_write;
        }
        Ok(())
    }

    fn allocate(&mut self, data: &[u8]) -> Result<RecordId> {
        let size = data.len() as u64;
        let class = self.find_best_fit(size)?;

        if self.header.free_heads[class] != EMPTY_OFFSET {
            // Reuse a freed slot: pop the highest occupied entry.
            let mut offset = EMPTY_OFFSET;
            for i in (0..FREE_RECORDS_PER_BLOCK).rev() {
                if self.free_blocks[class].offsets[i] != EMPTY_OFFSET {
                    offset = self.free_blocks[class].offsets[i];
                    self.free_blocks[class].offsets[i] = EMPTY_OFFSET;
                    break;
                }
            }
            assert!(offset != EMPTY_OFFSET);

            if self.free_blocks[class].offsets[0] == EMPTY_OFFSET {
                self.next_free_block(class)?;
            } else {
                self.save_free_block(class)?;
            }

            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(data)?;
            Ok(to_record_id(class, offset))
        } else {
            // No free slot of this class; extend the file.
            let offset = self.file_size;
            self.file_size += RECORD_SIZES[class];

            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(data)?;
            self.write_padding(RECORD_SIZES[class] - size)?;
            Ok(to_record_id(class, offset))
        }
    }

    fn free(&mut self, id: RecordId) -> Result<()> {
        let (class, offset) = from_record_id(id);

        if self.header.free_heads[class] == EMPTY_OFFSET {
            self.acquire_free_block(class)?;
        }

        for i in 0..FREE_RECORDS_PER_BLOCK {
            if self.free_blocks[class].offsets[i] == EMPTY_OFFSET {
                self.free_blocks[class].offsets[i] = offset;
                self.save_free_block(class)?;
                return Ok(());
            }
        }

        // Head block is full; start a new one.
        self.acquire_free_block(class)?;
        self.free_blocks[class].offsets[0] = offset;
        self.save_free_block(class)?;
        Ok(())
    }

    fn write(&mut self, id: RecordId, data: &[u8]) -> Result<()> {
        let (class, offset) = from_record_id(id);
        debug_assert!(data.len() as u64 <= RECORD_SIZES[class]);

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn resize(&mut self, id: RecordId, data: &[u8]) -> Result<RecordId> {
        let (current_class, offset) = from_record_id(id);
        let new_class = self.find_best_fit(data.len() as u64)?;

        if new_class == current_class {
            // Leave the record where it is.
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(data)?;
            return Ok(id);
        }

        self.free(id)?;
        self.allocate(data)
    }
}

//-------------------------------------------------------------------------

/// Stream handed to record readers, bounded by the slot size.
pub type RecordReader<'a> = io::Take<&'a File>;

/// Record storage inside one volume file: a set of size-classed slot lists
/// with per-class free chains, plus the header that anchors the node tree
/// and the TTL index.
pub struct VolumeFile {
    inner: Mutex<VolumeFileInner>,
}

impl VolumeFile {
    pub fn exists(path: &Path) -> bool {
        fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
    }

    pub fn create(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let header = HeaderBlock::new();
        file.write_all(&header.encode()?)?;
        Ok(())
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.seek(SeekFrom::End(0))?;

        let mut buf = vec![0u8; CONTROL_BLOCK_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let header = HeaderBlock::decode(&buf)?;

        let mut free_blocks = Vec::with_capacity(SIZES_COUNT);
        for _ in 0..SIZES_COUNT {
            free_blocks.push(FreeRecordsBlock::empty());
        }

        let mut inner = VolumeFileInner {
            file,
            file_size,
            header,
            free_blocks,
        };

        for class in 0..SIZES_COUNT {
            inner.load_free_block(class)?;
        }

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Positions a reader at the start of the record and hands it to `f`.
    /// The stream is bounded by the slot size; the payload delimits itself.
    pub fn read_record<T, F>(&self, id: RecordId, f: F) -> Result<T>
    where
        F: FnOnce(&mut RecordReader<'_>) -> io::Result<T>,
    {
        let mut inner = self.inner.lock().unwrap();
        let (class, offset) = from_record_id(id);

        inner.file.seek(SeekFrom::Start(offset))?;
        let mut bounded = (&inner.file).take(RECORD_SIZES[class]);
        Ok(f(&mut bounded)?)
    }

    /// Overwrites a record in place.  The caller guarantees the payload still
    /// fits the record's slot class.
    pub fn write_record(&self, id: RecordId, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.write(id, data)
    }

    pub fn allocate_record(&self, data: &[u8]) -> Result<RecordId> {
        let mut inner = self.inner.lock().unwrap();
        inner.allocate(data)
    }

    pub fn free_record(&self, id: RecordId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.free(id)
    }

    /// Rewrites a record, moving it to a different slot when the payload no
    /// longer fits its class.  Returns the (possibly new) record id.
    pub fn resize_record(&self, id: RecordId, data: &[u8]) -> Result<RecordId> {
        let mut inner = self.inner.lock().unwrap();
        inner.resize(id, data)
    }

    pub fn allocate_next_node_id(&self) -> Result<NodeId> {
        let mut inner = self.inner.lock().unwrap();
        let node_id = inner.header.next_node_id;
        inner.header.next_node_id += 1;
        inner.save_header()?;
        Ok(node_id)
    }

    pub fn root_record_id(&self) -> RecordId {
        self.inner.lock().unwrap().header.root_record_id
    }

    pub fn set_root_record_id(&self, id: RecordId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.header.root_record_id = id;
        inner.save_header()?;
        Ok(())
    }

    pub fn ttl_tree_record_id(&self) -> RecordId {
        self.inner.lock().unwrap().header.ttl_tree_record_id
    }

    pub fn set_ttl_tree_record_id(&self, id: RecordId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.header.ttl_tree_record_id = id;
        inner.save_header()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn file_size(&self) -> u64 {
        self.inner.lock().unwrap().file_size
    }
}

//-------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{ensure, Result};
    use tempfile::TempDir;

    struct Fixture {
        vf: VolumeFile,
        path: std::path::PathBuf,
        _temp_dir: TempDir,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let temp_dir = TempDir::new()?;
            let path = temp_dir.path().join("volume");
            VolumeFile::create(&path)?;
            let vf = VolumeFile::open(&path)?;
            Ok(Fixture {
                vf,
                path,
                _temp_dir: temp_dir,
            })
        }

        fn reopen(&mut self) -> Result<()> {
            self.vf = VolumeFile::open(&self.path)?;
            Ok(())
        }
    }

    fn read_all(vf: &VolumeFile, id: RecordId, len: usize) -> Result<Vec<u8>> {
        let data = vf.read_record(id, |r| {
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            Ok(buf)
        })?;
        Ok(data)
    }

    #[test]
    fn test_create_and_open() -> Result<()> {
        let fix = Fixture::new()?;
        ensure!(fix.vf.root_record_id() == NO_RECORD);
        ensure!(fix.vf.ttl_tree_record_id() == NO_RECORD);
        Ok(())
    }

    #[test]
    fn test_open_rejects_bad_magic() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("not-a-volume");
        fs::write(&path, vec![0u8; CONTROL_BLOCK_SIZE])?;
        ensure!(VolumeFile::open(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_allocate_and_read() -> Result<()> {
        let fix = Fixture::new()?;
        let id = fix.vf.allocate_record(b"hello")?;
        ensure!(read_all(&fix.vf, id, 5)? == b"hello");
        Ok(())
    }

    #[test]
    fn test_size_class_in_record_id() -> Result<()> {
        let fix = Fixture::new()?;
        let small = fix.vf.allocate_record(&[0u8; 10])?;
        let large = fix.vf.allocate_record(&[0u8; 100])?;
        ensure!(small >> 56 == 0);
        ensure!(large >> 56 == 2); // 128-byte class
        Ok(())
    }

    #[test]
    fn test_too_large_record() -> Result<()> {
        let fix = Fixture::new()?;
        // Probing for a slot never touches the file, so an oversized request
        // can be rejected without allocating the payload.
        let huge = RECORD_SIZES[SIZES_COUNT - 1] + 1;
        let inner = fix.vf.inner.lock().unwrap();
        ensure!(matches!(
            inner.find_best_fit(huge),
            Err(StoreError::TooLargeRecord(_))
        ));
        Ok(())
    }

    #[test]
    fn test_freed_slot_is_reused() -> Result<()> {
        let fix = Fixture::new()?;
        let id = fix.vf.allocate_record(&[7u8; 20])?;
        fix.vf.free_record(id)?;
        let size_before = fix.vf.file_size();
        let id2 = fix.vf.allocate_record(&[9u8; 20])?;
        ensure!(id == id2);
        ensure!(fix.vf.file_size() == size_before);
        Ok(())
    }

    #[test]
    fn test_resize_in_place() -> Result<()> {
        let fix = Fixture::new()?;
        let id = fix.vf.allocate_record(&[1u8; 20])?;
        let id2 = fix.vf.resize_record(id, &[2u8; 30])?;
        ensure!(id == id2);
        ensure!(read_all(&fix.vf, id2, 30)? == vec![2u8; 30]);
        Ok(())
    }

    #[test]
    fn test_resize_moves_between_classes() -> Result<()> {
        let fix = Fixture::new()?;
        let id = fix.vf.allocate_record(&[1u8; 20])?;
        let id2 = fix.vf.resize_record(id, &[2u8; 100])?;
        ensure!(id != id2);
        ensure!(read_all(&fix.vf, id2, 100)? == vec![2u8; 100]);

        // The vacated 32-byte slot is recycled before the file grows.
        let size_before = fix.vf.file_size();
        let id3 = fix.vf.allocate_record(&[3u8; 20])?;
        ensure!(id3 == id);
        ensure!(fix.vf.file_size() == size_before);
        Ok(())
    }

    #[test]
    fn test_live_records_survive_churn() -> Result<()> {
        let fix = Fixture::new()?;

        let mut live = Vec::new();
        for i in 0..100u8 {
            live.push((fix.vf.allocate_record(&[i; 24])?, i));
        }
        for (id, _) in live.drain(0..50) {
            fix.vf.free_record(id)?;
        }
        for i in 100..150u8 {
            live.push((fix.vf.allocate_record(&[i; 24])?, i));
        }
        for (id, stamp) in &live {
            ensure!(read_all(&fix.vf, *id, 24)? == vec![*stamp; 24]);
        }
        Ok(())
    }

    #[test]
    fn test_free_chain_spills_to_second_block() -> Result<()> {
        let fix = Fixture::new()?;

        // More frees than one control block holds, forcing a chained block,
        // then drain the whole chain again.
        let count = FREE_RECORDS_PER_BLOCK + 10;
        let mut ids = Vec::new();
        for _ in 0..count {
            ids.push(fix.vf.allocate_record(&[0u8; 16])?);
        }
        for id in &ids {
            fix.vf.free_record(*id)?;
        }

        let size_before = fix.vf.file_size();
        for _ in 0..count {
            fix.vf.allocate_record(&[1u8; 16])?;
        }
        ensure!(fix.vf.file_size() == size_before);
        Ok(())
    }

    #[test]
    fn test_header_persists() -> Result<()> {
        let mut fix = Fixture::new()?;
        let id = fix.vf.allocate_record(b"root")?;
        fix.vf.set_root_record_id(id)?;
        fix.vf.set_ttl_tree_record_id(id)?;
        ensure!(fix.vf.allocate_next_node_id()? == 0);
        ensure!(fix.vf.allocate_next_node_id()? == 1);

        fix.reopen()?;
        ensure!(fix.vf.root_record_id() == id);
        ensure!(fix.vf.ttl_tree_record_id() == id);
        ensure!(fix.vf.allocate_next_node_id()? == 2);
        Ok(())
    }

    #[test]
    fn test_free_list_persists() -> Result<()> {
        let mut fix = Fixture::new()?;
        let id = fix.vf.allocate_record(&[5u8; 16])?;
        fix.vf.free_record(id)?;

        fix.reopen()?;
        let size_before = fix.vf.file_size();
        let id2 = fix.vf.allocate_record(&[6u8; 16])?;
        ensure!(id2 == id);
        ensure!(fix.vf.file_size() == size_before);
        Ok(())
    }
}

//-------------------------------------------------------------------------
