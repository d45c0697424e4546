use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL frame"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of reading a log back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte offset of the first frame that could not be read, if replay
    /// stopped before the end of the file.
    pub damaged_at: Option<u64>,
}

/// Append-only event log for one tenant.
///
/// Each frame is `[u32 len][bincode Event][u32 crc32]`, little endian. A torn
/// or corrupt tail is dropped on replay; everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to `<wal>.tmp` and fsync it. Slow; run before `swap_compact_file`.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the snapshot over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact frame. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        let mut offset = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match read_frame_part(&mut reader, &mut len_buf) {
                FramePart::Complete => {}
                FramePart::CleanEof => break,
                FramePart::Torn => {
                    replay.damaged_at = Some(offset);
                    break;
                }
                FramePart::Failed(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            let body = match read_frame_part(&mut reader, &mut payload) {
                FramePart::Complete => read_frame_part(&mut reader, &mut crc_buf),
                other => other,
            };
            match body {
                FramePart::Complete => {}
                FramePart::CleanEof | FramePart::Torn => {
                    replay.damaged_at = Some(offset);
                    break;
                }
                FramePart::Failed(e) => return Err(e),
            }

            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                replay.damaged_at = Some(offset);
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => replay.events.push(event),
                Err(_) => {
                    replay.damaged_at = Some(offset);
                    break;
                }
            }
            offset += len as u64 + FRAME_OVERHEAD;
        }

        Ok(replay)
    }
}

enum FramePart {
    Complete,
    CleanEof,
    Torn,
    Failed(io::Error),
}

fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> FramePart {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return FramePart::CleanEof,
            Ok(0) => return FramePart::Torn,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return FramePart::Failed(e),
        }
    }
    FramePart::Complete
}
