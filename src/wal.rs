use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;

/// Bytes of framing around each payload: length prefix + crc32 trailer.
const FRAME_OVERHEAD: u64 = 8;

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL frame"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame. `Ok(None)` means a clean end, a torn tail, or a corrupt frame: replay
/// stops there either way.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, len as u64 + FRAME_OVERHEAD))),
        Err(_) => Ok(None),
    }
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of reading a WAL file from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Length of the valid prefix. Anything after it is a torn or corrupt tail.
    pub valid_len: u64,
}

/// Append-only write-ahead log.
///
/// Frame: `[u32 le: payload len][bincode Event][u32 le: crc32(payload)]`.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open for appending, first cutting the file back to `valid_len` so new frames never
    /// land behind a torn tail that replay would stop at.
    pub fn open(path: &Path, valid_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(path = %path.display(), valid_len, "truncating torn WAL tail");
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Buffer one event. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
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

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn snapshot_path(path: &Path) -> PathBuf {
        path.with_extension("wal.snapshot")
    }

    /// Write a snapshot next to the WAL and fsync it. Does not touch the live file.
    pub fn write_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::snapshot_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live WAL and reopen it for appending.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::snapshot_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every valid event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        while let Some((event, frame_len)) = read_frame(&mut reader)? {
            replay.events.push(event);
            replay.valid_len += frame_len;
        }
        Ok(replay)
    }
}

// ── Group-commit writer ──────────────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Handle to the background task that owns a [`Wal`].
///
/// Appends that arrive while a flush is pending are batched behind a single fsync.
#[derive(Clone)]
pub struct WalWriter {
    tx: mpsc::Sender<WalCommand>,
}

impl WalWriter {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    /// Durably append one event. Returns once the batch containing it is fsynced.
    pub async fn append(&self, event: &Event) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(WalCommand::Append {
            event: event.clone(),
            response,
        })
        .await?;
        rx.await.map_err(|_| writer_gone())?
    }

    /// Replace the log with `events`, which must recreate the current state on their own.
    pub async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(WalCommand::Compact { events, response }).await?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self.send(WalCommand::AppendsSinceCompact { response }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn send(&self, cmd: WalCommand) -> io::Result<()> {
        self.tx.send(cmd).await.map_err(|_| writer_gone())
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer shut down")
}

type Pending = Vec<oneshot::Sender<io::Result<()>>>;

async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut deferred: Option<WalCommand> = None;
    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };

        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        // Batch window: everything already queued rides on this fsync.
        let mut pending: Pending = vec![response];
        let mut result = wal.append_buffered(&event);
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => {
                    if result.is_ok() {
                        result = wal.append_buffered(&event);
                    }
                    pending.push(response);
                }
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(pending.len() as f64);
        let started = std::time::Instant::now();
        // Flush even after a failed append so half-written bytes do not leak into the
        // next batch; every caller in this batch is told it failed.
        let flushed = wal.flush_sync();
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        let result = result.and(flushed);
        if let Err(e) = &result {
            tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
        }
        for tx in pending {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by writer_loop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Course, CourseSpec, Student};
    use std::sync::Arc;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("enrolld_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn seat(course: &str, student: &str) -> Event {
        Event::SeatReserved {
            course_id: course.into(),
            student_id: student.into(),
        }
    }

    fn append_sync(wal: &mut Wal, event: &Event) {
        wal.append_buffered(event).unwrap();
        wal.flush_sync().unwrap();
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            Event::CourseCreated {
                course: Course::empty(CourseSpec::new("C1", "Rust", 2)),
            },
            seat("C1", "S1"),
            Event::WaiterAppended {
                course_id: "C1".into(),
                student_id: "S2".into(),
            },
        ];
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for e in &events {
                append_sync(&mut wal, e);
            }
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn torn_tail_is_dropped_and_truncated_on_open() {
        let path = tmp_path("torn_tail.wal");
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            append_sync(&mut wal, &seat("C1", "S1"));
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events.len(), 1);

        // Appends after reopening must not sit behind the garbage.
        {
            let mut wal = Wal::open(&path, replay.valid_len).unwrap();
            append_sync(&mut wal, &seat("C1", "S2"));
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![seat("C1", "S1"), seat("C1", "S2")]);
    }

    #[test]
    fn corrupt_crc_stops_replay() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let payload = bincode::serialize(&seat("C1", "S1")).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn snapshot_replaces_log_and_accepts_appends() {
        let path = tmp_path("snapshot.wal");
        let mut wal = Wal::open(&path, 0).unwrap();
        for i in 0..20 {
            append_sync(&mut wal, &seat("C1", &format!("S{i}")));
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![Event::StudentSaved {
            student: Student::new("S1", "Alice", "alice@example.com", "hash"),
        }];
        Wal::write_snapshot(&path, &snapshot).unwrap();
        wal.install_snapshot().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        append_sync(&mut wal, &seat("C2", "S1"));

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "snapshot should shrink the log: {after} < {before}");
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events.len(), 2);
        assert_eq!(replay.events[0], snapshot[0]);
        assert_eq!(replay.events[1], seat("C2", "S1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writer_commits_concurrent_appends() {
        let path = tmp_path("writer_concurrent.wal");
        let writer = Arc::new(WalWriter::spawn(Wal::open(&path, 0).unwrap()));

        let mut handles = Vec::new();
        for i in 0..32 {
            let w = writer.clone();
            handles.push(tokio::spawn(async move { w.append(&seat("C1", &format!("S{i}"))).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(writer.appends_since_compact().await, 32);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events.len(), 32);
    }

    #[tokio::test]
    async fn writer_compaction_resets_counter() {
        let path = tmp_path("writer_compact.wal");
        let writer = WalWriter::spawn(Wal::open(&path, 0).unwrap());
        writer.append(&seat("C1", "S1")).await.unwrap();
        writer.append(&seat("C1", "S2")).await.unwrap();
        assert_eq!(writer.appends_since_compact().await, 2);

        writer.compact(vec![seat("C1", "S2")]).await.unwrap();
        assert_eq!(writer.appends_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap().events, vec![seat("C1", "S2")]);
    }
}
