use crate::keys::{FlowRec, FLOW_REC_SIZE};
use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const PAGE: usize = 4096;
const MAX_PAGES: usize = 16;

/// Stale `.tmp` files older than this are reclaimed by the next writer.
pub const TMP_STALE_TIMEOUT: Duration = Duration::from_secs(10);

/// An item storable in an ordered set.
pub trait SetItem: Copy {
    const SIZE: usize;
    fn encode(&self, out: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
    fn cmp_item(&self, other: &Self) -> Ordering;
    /// Called when a union finds two equal items; flow records merge their
    /// counters, offsets do nothing.
    fn merge_from(&mut self, _other: &Self) {}
}

impl SetItem for u64 {
    const SIZE: usize = 8;

    fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_u64(out, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }

    fn cmp_item(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl SetItem for FlowRec {
    const SIZE: usize = FLOW_REC_SIZE;

    fn encode(&self, out: &mut [u8]) {
        FlowRec::encode(self, out);
    }

    fn decode(buf: &[u8]) -> Self {
        FlowRec::decode(buf)
    }

    fn cmp_item(&self, other: &Self) -> Ordering {
        self.key.cmp_flow(&other.key)
    }

    fn merge_from(&mut self, other: &Self) {
        self.key.merge(&other.key);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    /// Buffered writes destined for `<path>.tmp`, renamed to `<path>` on
    /// finish.
    WriteFinal,
    /// Anonymous scratch set; buffer doubles up to 16 pages then spills to
    /// an unlinked temp file.
    TmpWrite,
    /// Buffered sequential reads.
    Read,
}

/// Outcome of opening a final-result writer: an existing result file is a
/// no-op success (idempotent searches).
pub enum OpenOutcome<T: SetItem> {
    Exists,
    Writer(OrderedSet<T>),
}

/// A lazily-buffered, strictly ascending container of offsets or flow
/// records, backed by memory or a file.
pub struct OrderedSet<T: SetItem> {
    mode: Mode,
    buffer: Vec<T>,
    /// Max buffered items before spilling (write modes).
    buffer_max: usize,
    cursor: usize,
    file: Option<File>,
    path: Option<PathBuf>,
    tmp_path: Option<PathBuf>,
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl<T: SetItem> OrderedSet<T> {
    /// Open a writer committing to `path` atomically. If `path` already
    /// exists the operation is complete before it starts. A fresh `.tmp`
    /// means another worker is producing the same result.
    pub fn create_final(path: &Path) -> Result<OpenOutcome<T>> {
        if path.exists() {
            return Ok(OpenOutcome::Exists);
        }
        let tmp_path = tmp_path_for(path);
        if tmp_path.exists() {
            let stale = mtime(&tmp_path)
                .and_then(|m| m.elapsed().ok())
                .map(|age| age > TMP_STALE_TIMEOUT)
                .unwrap_or(true);
            if stale {
                // A crashed writer left this behind; reclaim it.
                let _ = fs::remove_file(&tmp_path);
            }
        }
        let file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Someone else holds the commit token.
                return Ok(OpenOutcome::Exists);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("create {}", tmp_path.display()))
            }
        };
        Ok(OpenOutcome::Writer(Self {
            mode: Mode::WriteFinal,
            buffer: Vec::with_capacity(PAGE / T::SIZE),
            buffer_max: PAGE / T::SIZE,
            cursor: 0,
            file: Some(file),
            path: Some(path.to_path_buf()),
            tmp_path: Some(tmp_path),
        }))
    }

    /// An anonymous scratch set, spilling to an unlinked temp file when it
    /// outgrows sixteen pages of buffer.
    pub fn create_tmp() -> Self {
        Self {
            mode: Mode::TmpWrite,
            buffer: Vec::with_capacity(PAGE / T::SIZE),
            buffer_max: PAGE / T::SIZE,
            cursor: 0,
            file: None,
            path: None,
            tmp_path: None,
        }
    }

    /// Open an existing result file for reading. If only the `.tmp`
    /// exists, poll (1 s granularity) until the writer commits; abandon if
    /// the tmp file's mtime stops moving across two polls.
    pub fn open_read(path: &Path) -> Result<Self> {
        let tmp_path = tmp_path_for(path);
        let mut last_seen: Option<SystemTime> = None;
        let file = loop {
            match File::open(path) {
                Ok(f) => break f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let Some(m) = mtime(&tmp_path) else {
                        // No tmp either; retry the final path once in case
                        // the rename landed between our two checks.
                        match File::open(path) {
                            Ok(f) => break f,
                            Err(_) => bail!(
                                "input set {} does not exist and isn't expected to soon",
                                path.display()
                            ),
                        }
                    };
                    if last_seen == Some(m) {
                        bail!(
                            "input set {} not ready and {} is not being written",
                            path.display(),
                            tmp_path.display()
                        );
                    }
                    last_seen = Some(m);
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("open {}", path.display()))
                }
            }
        };

        let size = file.metadata()?.len() as usize;
        if size % T::SIZE != 0 {
            tracing::warn!(path = %path.display(), "set file size is not a record multiple");
        }
        let buf_bytes = size.clamp(PAGE, MAX_PAGES * PAGE);
        Ok(Self {
            mode: Mode::Read,
            buffer: Vec::with_capacity(buf_bytes / T::SIZE),
            buffer_max: buf_bytes / T::SIZE.max(1),
            cursor: 0,
            file: Some(file),
            path: Some(path.to_path_buf()),
            tmp_path: None,
        })
    }

    /// Append an item. Items must arrive in ascending order.
    pub fn push(&mut self, item: T) -> Result<()> {
        debug_assert!(self.mode != Mode::Read);
        if self.buffer.len() >= self.buffer_max {
            if self.mode == Mode::TmpWrite && self.buffer_max < MAX_PAGES * PAGE / T::SIZE {
                // Scratch sets grow their buffer before touching disk.
                self.buffer_max *= 2;
                self.buffer.reserve(self.buffer_max - self.buffer.len());
            } else {
                self.dump_buffer()?;
            }
        }
        self.buffer.push(item);
        Ok(())
    }

    fn dump_buffer(&mut self) -> Result<()> {
        if self.file.is_none() {
            debug_assert_eq!(self.mode, Mode::TmpWrite);
            self.file = Some(tempfile::tempfile().context("open set spill file")?);
        }
        if !self.buffer.is_empty() {
            let mut bytes = vec![0u8; self.buffer.len() * T::SIZE];
            for (i, item) in self.buffer.iter().enumerate() {
                item.encode(&mut bytes[i * T::SIZE..]);
            }
            self.file.as_mut().unwrap().write_all(&bytes).context("write set buffer")?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Flip a scratch set from writing to reading.
    pub fn into_read_mode(&mut self) -> Result<()> {
        debug_assert_eq!(self.mode, Mode::TmpWrite);
        self.mode = Mode::Read;
        if self.file.is_some() {
            // Spill the tail, rewind, refill from the start.
            self.dump_buffer()?;
            self.file.as_mut().unwrap().seek(SeekFrom::Start(0))?;
            self.cursor = 0;
            self.buffer.clear();
            self.fill_buffer()?;
        } else {
            self.cursor = 0;
        }
        Ok(())
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let mut bytes = vec![0u8; self.buffer_max.max(1) * T::SIZE];
        let mut filled = 0;
        while filled < bytes.len() {
            let n = file.read(&mut bytes[filled..]).context("read set file")?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.buffer.clear();
        self.cursor = 0;
        let whole = filled / T::SIZE;
        if filled % T::SIZE != 0 {
            tracing::warn!("extra bytes at the end of a search set file");
        }
        for i in 0..whole {
            self.buffer.push(T::decode(&bytes[i * T::SIZE..]));
        }
        Ok(())
    }

    pub fn peek(&mut self) -> Result<Option<T>> {
        if self.cursor >= self.buffer.len() {
            if self.file.is_none() {
                return Ok(None);
            }
            self.fill_buffer()?;
            if self.buffer.is_empty() {
                return Ok(None);
            }
        }
        Ok(Some(self.buffer[self.cursor]))
    }

    pub fn pop(&mut self) -> Result<Option<T>> {
        let item = self.peek()?;
        if item.is_some() {
            self.cursor += 1;
        }
        Ok(item)
    }

    /// Seek to the nth record. Read mode only; resets the buffer.
    pub fn seek_record(&mut self, n: u64) -> Result<()> {
        debug_assert_eq!(self.mode, Mode::Read);
        self.buffer.clear();
        self.cursor = 0;
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(n * T::SIZE as u64))?;
        }
        Ok(())
    }

    /// Flush and, for final writers, atomically promote `.tmp` to the
    /// result path.
    pub fn finish(mut self) -> Result<()> {
        if self.mode == Mode::WriteFinal {
            self.dump_buffer()?;
            self.file.take(); // close before rename
            let tmp = self.tmp_path.take().expect("final writer has tmp path");
            let path = self.path.take().expect("final writer has path");
            fs::rename(&tmp, &path)
                .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        }
        Ok(())
    }
}

pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".tmp");
    PathBuf::from(s)
}
