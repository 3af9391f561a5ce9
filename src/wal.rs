use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Bytes of framing around each payload: length prefix and checksum.
const RECORD_OVERHEAD: u64 = 8;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little-endian.
/// Returns the number of bytes written.
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(u64::from(len) + RECORD_OVERHEAD)
}

/// Fill `buf` completely, or report a clean `false` if the file ends first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact payload, `None` at end of file or at the first torn or
/// corrupt record.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        tracing::warn!("WAL ends in a truncated record; discarding it");
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        tracing::warn!("WAL record failed its checksum; discarding the tail");
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Append-only journal of schedule and appointment changes.
///
/// A crash mid-write leaves at most one torn record at the end, which the
/// length prefix and checksum let `replay` drop and `recover` cut off.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful `flush_sync`.
    synced_len: u64,
    /// Bytes and records buffered or written since then.
    unsynced_len: u64,
    unsynced_appends: u64,
    appends_since_compact: u64,
    /// Set when a failed batch could not be cut back off the file.
    broken: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            unsynced_len: 0,
            unsynced_appends: 0,
            appends_since_compact: 0,
            broken: false,
        })
    }

    /// Replay `path`, cut any torn or corrupt tail off the file, and open it
    /// for appends. New records always follow the last intact one.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, intact_len) = scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > intact_len
        {
            tracing::warn!(
                "truncating {} from {} to {intact_len} bytes",
                path.display(),
                meta.len()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, events))
    }

    /// Append and fsync one event. Production code batches instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::other("WAL has an unrecoverable partial write"));
        }
        // Counted up front: a failed write may still have reached the buffer.
        self.unsynced_appends += 1;
        self.unsynced_len += write_record(&mut self.writer, event)?;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.synced_len += self.unsynced_len;
        self.appends_since_compact += self.unsynced_appends;
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`, both
    /// from the buffer and from the file. If the file cannot be cut back the
    /// WAL refuses further appends.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        let result = self.truncate_to_synced();
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // The old writer's buffer must not reach the file after the cut.
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (old_file, _unwritten) = old.into_parts();
        drop(old_file);
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the journal with `events`: write a synced sibling file, then
    /// rename it over the live one and reopen for appends.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut written = 0;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                written += write_record(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        self.writer.flush()?;
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.synced_len = written;
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        self.appends_since_compact = 0;
        self.broken = false;
        Ok(())
    }

    /// Every intact event on disk, in append order. A missing file is empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }
}

/// Intact events plus the byte length they occupy from the start of the file.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact_len = 0;
    while let Some(payload) = read_record(&mut reader)? {
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => {
                events.push(event);
                intact_len += payload.len() as u64 + RECORD_OVERHEAD;
            }
            Err(e) => {
                tracing::warn!("WAL record did not decode ({e}); discarding the tail");
                break;
            }
        }
    }
    Ok((events, intact_len))
}
