use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_WAL_RECORD_BYTES;
use crate::model::Commit;

/// One record read back from the log.
enum Frame {
    /// A decoded commit and its on-disk size in bytes.
    Commit(Commit, u64),
    /// Clean end of file.
    End,
    /// Short read, bad checksum or undecodable payload. Nothing after it is trusted.
    Torn(&'static str),
}

fn write_frame(out: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "commit too large"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf`, or report whether the file ended before it started or midway.
fn read_full(input: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => return Ok(Some(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

fn read_frame(input: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    match read_full(input, &mut word)? {
        Some(0) => return Ok(Frame::End),
        Some(_) => return Ok(Frame::Torn("short length prefix")),
        None => {}
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_WAL_RECORD_BYTES {
        return Ok(Frame::Torn("length prefix out of range"));
    }

    let mut payload = vec![0u8; len];
    if read_full(input, &mut payload)?.is_some() {
        return Ok(Frame::Torn("short payload"));
    }
    if read_full(input, &mut word)?.is_some() {
        return Ok(Frame::Torn("short checksum"));
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    let size = (len + 8) as u64;
    Ok(match bincode::deserialize(&payload) {
        Ok(commit) => Frame::Commit(commit, size),
        Err(_) => Frame::Torn("undecodable commit"),
    })
}

/// Append-only log of [`Commit`]s, one record per commit:
/// `[u32 len][bincode payload][u32 crc32]`, little-endian.
///
/// A commit is replayed whole or not at all; a crash mid-write leaves a torn
/// tail that [`Wal::recover`] cuts off.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            out: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Append and fsync in one step.
    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Buffer a commit. Not durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        write_frame(&mut self.out, commit)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `snapshot`. The snapshot is written and synced to a
    /// sibling file first, then renamed over the log, so a crash leaves either
    /// the old log or the new one.
    pub fn rewrite(&mut self, snapshot: &[Commit]) -> io::Result<()> {
        self.flush_sync()?;
        let staging = self.path.with_extension("wal.snapshot");
        {
            let mut out = BufWriter::new(File::create(&staging)?);
            for commit in snapshot {
                write_frame(&mut out, commit)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        self.out = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay the log at `path`, cut off any torn tail, and open it for append.
    ///
    /// The file is truncated to the end of the last intact record before the
    /// first new append, so commits made after a crash are never stranded
    /// behind garbage that the next replay would stop at.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Commit>)> {
        let scan = Self::scan(path)?;
        if let Some(reason) = scan.torn {
            tracing::warn!(
                path = %path.display(),
                replayed = scan.commits.len(),
                intact_bytes = scan.intact_len,
                reason,
                "truncating torn WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scan.intact_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, scan.commits))
    }

    /// Every intact commit in the log at `path`, without touching the file.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        Ok(Self::scan(path)?.commits)
    }

    fn scan(path: &Path) -> io::Result<Scan> {
        let mut scan = Scan::default();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(scan),
            Err(e) => return Err(e),
        };
        let mut input = BufReader::new(file);
        loop {
            match read_frame(&mut input)? {
                Frame::Commit(commit, len) => {
                    scan.commits.push(commit);
                    scan.intact_len += len;
                }
                Frame::End => break,
                Frame::Torn(reason) => {
                    scan.torn = Some(reason);
                    break;
                }
            }
        }
        Ok(scan)
    }
}

/// What replay found: the intact prefix and why it stopped early, if it did.
#[derive(Default)]
struct Scan {
    commits: Vec<Commit>,
    /// Byte length of the intact prefix.
    intact_len: u64,
    torn: Option<&'static str>,
}
