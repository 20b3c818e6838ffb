//! Physical files backing one segment
//!
//! Chunks are appended to `data_NNNNN.bin` files and read back through
//! memory maps. When appending a chunk would push the current file past the
//! maximum mapped size, a new file is started; chunk offsets are relative to
//! their own file and `preceding_memory_offset` tracks the bytes before it.

use crate::chunk::ChunkMeta;
use crate::{Result, StrataError};
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Where an appended chunk landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlacement {
    pub file_index: u32,
    pub file_offset: u64,
    pub preceding_memory_offset: u64,
}

/// Read access to the mapped files of one segment
pub struct SegmentFiles {
    dir: PathBuf,
    maps: Mutex<HashMap<u32, Arc<Mmap>>>,
}

impl SegmentFiles {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            maps: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, file_index: u32) -> PathBuf {
        data_file_path(&self.dir, file_index)
    }

    /// Borrow the bytes of a chunk from its mapped file
    pub fn read(&self, meta: &ChunkMeta) -> Result<ChunkBytes> {
        let end = meta.end_offset();
        let mut maps = self.maps.lock();

        if let Some(map) = maps.get(&meta.file_index) {
            if map.len() as u64 >= end {
                return Ok(ChunkBytes::new(map.clone(), meta));
            }
        }

        let path = self.file_path(meta.file_index);
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                StrataError::Corruption(format!("Missing segment file {:?}", path))
            }
            _ => StrataError::Io(e),
        })?;
        let len = file.metadata()?.len();
        if len < end {
            return Err(StrataError::Corruption(format!(
                "Chunk [{}, {}) lies beyond end of {:?} ({} bytes)",
                meta.file_offset, end, path, len
            )));
        }

        // Safety: files are only appended to or truncated while the owning
        // key is write-locked, and truncation drops the cached maps first.
        let map = Arc::new(unsafe { MmapOptions::new().map(&file)? });
        debug!("Mapped {:?} ({} bytes)", path, map.len());
        maps.insert(meta.file_index, map.clone());
        Ok(ChunkBytes::new(map, meta))
    }

    /// Open an appender positioned after `tail`, or at the start of an
    /// empty segment when `tail` is `None`.
    pub fn writer(&self, tail: Option<&ChunkMeta>, max_file_size: u64) -> Result<SegmentFileWriter> {
        fs::create_dir_all(&self.dir)?;
        SegmentFileWriter::open(self.dir.clone(), tail, max_file_size)
    }

    /// Cut the segment back so `meta` and everything after it are gone
    pub fn truncate_to(&self, meta: &ChunkMeta) -> Result<()> {
        self.invalidate();

        let path = self.file_path(meta.file_index);
        if meta.file_offset == 0 && meta.file_index > 0 {
            fs::remove_file(&path)?;
        } else {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(meta.file_offset)?;
            file.sync_all()?;
        }

        let mut next = meta.file_index + 1;
        loop {
            let path = self.file_path(next);
            if !path.exists() {
                break;
            }
            fs::remove_file(&path)?;
            next += 1;
        }
        Ok(())
    }

    /// Drop all cached maps
    pub fn invalidate(&self) {
        self.maps.lock().clear();
    }

    /// Remove every file of the segment
    pub fn delete_all(&self) -> Result<()> {
        self.invalidate();
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// Mapped segments kept open, evicting the least recently used one past
/// `capacity`. Evicted maps stay alive while a reader still holds them.
pub(crate) struct SegmentFilesCache<T> {
    capacity: usize,
    tick: u64,
    entries: HashMap<T, (Arc<SegmentFiles>, u64)>,
}

impl<T: Eq + std::hash::Hash + Clone> SegmentFilesCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
        }
    }

    pub fn get_or_open(&mut self, key: T, open: impl FnOnce() -> SegmentFiles) -> Arc<SegmentFiles> {
        self.tick += 1;
        let tick = self.tick;
        if let Some((files, used)) = self.entries.get_mut(&key) {
            *used = tick;
            return files.clone();
        }

        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                if let Some((files, _)) = self.entries.remove(&oldest) {
                    debug!("Unmapping segment files in {:?}", files.dir());
                }
            }
        }

        let files = Arc::new(open());
        self.entries.insert(key, (files.clone(), tick));
        files
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.entries.retain(|key, _| keep(key));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn data_file_path(dir: &Path, file_index: u32) -> PathBuf {
    dir.join(format!("data_{:05}.bin", file_index))
}

/// Chunk bytes borrowed from a shared memory map
#[derive(Debug)]
pub struct ChunkBytes {
    map: Arc<Mmap>,
    start: usize,
    end: usize,
}

impl ChunkBytes {
    fn new(map: Arc<Mmap>, meta: &ChunkMeta) -> Self {
        Self {
            map,
            start: meta.file_offset as usize,
            end: meta.end_offset() as usize,
        }
    }
}

impl Deref for ChunkBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map[self.start..self.end]
    }
}

/// Appends chunks to the files of one segment
pub struct SegmentFileWriter {
    dir: PathBuf,
    max_file_size: u64,
    file_index: u32,
    file: BufWriter<File>,
    file_len: u64,
    preceding_memory_offset: u64,
}

impl SegmentFileWriter {
    fn open(dir: PathBuf, tail: Option<&ChunkMeta>, max_file_size: u64) -> Result<Self> {
        let (file_index, file_len, preceding_memory_offset) = match tail {
            Some(meta) => (meta.file_index, meta.end_offset(), meta.preceding_memory_offset),
            None => (0, 0, 0),
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(data_file_path(&dir, file_index))?;
        // Anything past the last indexed chunk was never committed
        file.set_len(file_len)?;
        let mut file = BufWriter::new(file);
        io::Seek::seek(&mut file, io::SeekFrom::Start(file_len))?;

        Ok(Self {
            dir,
            max_file_size: max_file_size.max(1),
            file_index,
            file,
            file_len,
            preceding_memory_offset,
        })
    }

    /// Append one encoded chunk
    pub fn append(&mut self, bytes: &[u8]) -> Result<ChunkPlacement> {
        let placement = self.reserve(bytes.len() as u64)?;
        self.file.write_all(bytes)?;
        self.file_len += bytes.len() as u64;
        Ok(placement)
    }

    /// Append `len` bytes copied from `reader` (a temporary chunk file)
    pub fn append_from<R: Read>(&mut self, reader: &mut R, len: u64) -> Result<ChunkPlacement> {
        let placement = self.reserve(len)?;
        let copied = io::copy(&mut reader.take(len), &mut self.file)?;
        if copied != len {
            return Err(StrataError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected {} chunk bytes, copied {}", len, copied),
            )));
        }
        self.file_len += len;
        Ok(placement)
    }

    fn reserve(&mut self, len: u64) -> Result<ChunkPlacement> {
        if self.file_len > 0 && self.file_len + len > self.max_file_size {
            self.roll()?;
        }
        Ok(ChunkPlacement {
            file_index: self.file_index,
            file_offset: self.file_len,
            preceding_memory_offset: self.preceding_memory_offset,
        })
    }

    fn roll(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        self.preceding_memory_offset += self.file_len;
        self.file_index += 1;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(data_file_path(&self.dir, self.file_index))?;
        self.file = BufWriter::new(file);
        self.file_len = 0;
        debug!("Rolled segment {:?} to file {}", self.dir, self.file_index);
        Ok(())
    }

    /// Flush buffered bytes so readers can map them
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flush and sync the current file
    pub fn finish(mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta_for(placement: ChunkPlacement, len: usize) -> ChunkMeta {
        ChunkMeta {
            min_time: 0,
            max_time: 0,
            value_count: 1,
            preceding_value_count: 0,
            file_index: placement.file_index,
            file_offset: placement.file_offset,
            length: len as u64,
            preceding_memory_offset: placement.preceding_memory_offset,
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let files = SegmentFiles::new(dir.path().join("seg"));

        let mut writer = files.writer(None, 1 << 20).unwrap();
        let a = writer.append(b"hello").unwrap();
        let b = writer.append(b"world!").unwrap();
        writer.finish().unwrap();

        assert_eq!(a.file_offset, 0);
        assert_eq!(b.file_offset, 5);
        assert_eq!(&*files.read(&meta_for(a, 5)).unwrap(), b"hello");
        assert_eq!(&*files.read(&meta_for(b, 6)).unwrap(), b"world!");
    }

    #[test]
    fn test_rollover_tracks_preceding_offset() {
        let dir = TempDir::new().unwrap();
        let files = SegmentFiles::new(dir.path().join("seg"));

        let mut writer = files.writer(None, 10).unwrap();
        let a = writer.append(b"12345678").unwrap();
        let b = writer.append(b"abcdef").unwrap();
        // Oversized chunk still gets written, alone in its file
        let c = writer.append(b"0123456789ABCDEF").unwrap();
        writer.finish().unwrap();

        assert_eq!((a.file_index, a.file_offset, a.preceding_memory_offset), (0, 0, 0));
        assert_eq!((b.file_index, b.file_offset, b.preceding_memory_offset), (1, 0, 8));
        assert_eq!((c.file_index, c.file_offset, c.preceding_memory_offset), (2, 0, 14));
        assert_eq!(&*files.read(&meta_for(c, 16)).unwrap(), b"0123456789ABCDEF");
    }

    #[test]
    fn test_reopen_appends_after_tail_and_remaps() {
        let dir = TempDir::new().unwrap();
        let files = SegmentFiles::new(dir.path().join("seg"));

        let mut writer = files.writer(None, 1 << 20).unwrap();
        let a = writer.append(b"first").unwrap();
        writer.finish().unwrap();
        let first = meta_for(a, 5);
        assert_eq!(&*files.read(&first).unwrap(), b"first");

        let mut writer = files.writer(Some(&first), 1 << 20).unwrap();
        let b = writer.append(b"second").unwrap();
        writer.finish().unwrap();
        assert_eq!(b.file_offset, 5);

        // Cached map is too short and gets replaced
        assert_eq!(&*files.read(&meta_for(b, 6)).unwrap(), b"second");
    }

    #[test]
    fn test_truncate_to_drops_tail_files() {
        let dir = TempDir::new().unwrap();
        let files = SegmentFiles::new(dir.path().join("seg"));

        let mut writer = files.writer(None, 8).unwrap();
        let a = writer.append(b"aaaaaa").unwrap();
        let b = writer.append(b"bbbbbb").unwrap();
        writer.finish().unwrap();
        assert_eq!(b.file_index, 1);

        files.truncate_to(&meta_for(b, 6)).unwrap();
        assert_eq!(fs::metadata(files.file_path(0)).unwrap().len(), 6);
        assert!(!files.file_path(1).exists());

        files.truncate_to(&meta_for(a, 6)).unwrap();
        assert_eq!(fs::metadata(files.file_path(0)).unwrap().len(), 0);
    }

    #[test]
    fn test_append_from_reader() {
        let dir = TempDir::new().unwrap();
        let files = SegmentFiles::new(dir.path().join("seg"));

        let mut writer = files.writer(None, 1 << 20).unwrap();
        let mut source = std::io::Cursor::new(b"temp-chunk".to_vec());
        let placement = writer.append_from(&mut source, 10).unwrap();
        writer.finish().unwrap();

        assert_eq!(&*files.read(&meta_for(placement, 10)).unwrap(), b"temp-chunk");
    }

    #[test]
    fn test_missing_file_is_corruption() {
        let dir = TempDir::new().unwrap();
        let files = SegmentFiles::new(dir.path().join("seg"));
        let meta = meta_for(
            ChunkPlacement {
                file_index: 3,
                file_offset: 0,
                preceding_memory_offset: 0,
            },
            4,
        );
        assert!(files.read(&meta).unwrap_err().is_corruption());
    }

    #[test]
    fn test_files_cache_evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let mut cache = SegmentFilesCache::new(2);
        let open = |name: &str| {
            let path = dir.path().join(name);
            move || SegmentFiles::new(path)
        };

        let a = cache.get_or_open("a", open("a"));
        cache.get_or_open("b", open("b"));
        // Touch "a" so "b" is the oldest
        assert!(Arc::ptr_eq(&a, &cache.get_or_open("a", open("a"))));
        cache.get_or_open("c", open("c"));
        assert_eq!(cache.len(), 2);

        assert!(Arc::ptr_eq(&a, &cache.get_or_open("a", open("a"))));
        let b = cache.get_or_open("b", open("b"));
        assert_eq!(b.dir(), dir.path().join("b").as_path());
        assert_eq!(cache.len(), 2);

        cache.retain(|name| *name != "a");
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
