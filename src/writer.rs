use crate::limits::{MATCH_MAX, NUM_SLOTS};
use crate::prod::check_header;
use crate::{NewProduct, SchedError, SchedResult};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task;
use tracing::{debug, warn};

pub const MERGED_FILE: &str = "prods.tsv";

/// Per-worker product report files, one line per product in the format
/// [`crate::prod::parse_record`] reads back.
#[derive(Clone)]
pub struct ProductWriter {
    dir: PathBuf,
    held: Arc<[AtomicBool; NUM_SLOTS]>,
}

impl ProductWriter {
    pub fn new(dir: impl Into<PathBuf>) -> SchedResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(ProductWriter {
            dir,
            held: Arc::new(std::array::from_fn(|_| AtomicBool::new(false))),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn slot_path(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("prods_{:02}.tsv", slot))
    }

    /// Takes exclusive ownership of `slot` until the returned writer is
    /// dropped.
    pub async fn acquire(&self, slot: usize) -> SchedResult<SlotWriter> {
        if slot >= NUM_SLOTS {
            return Err(SchedError::LimitExceeded(format!(
                "slot {} out of range, there are {} slots",
                slot, NUM_SLOTS
            )));
        }
        if self.held[slot].swap(true, Ordering::AcqRel) {
            return Err(SchedError::state(format!("slot {} is already in use", slot)));
        }

        let path = self.slot_path(slot);
        let opened = task::spawn_blocking(move || -> io::Result<File> {
            let mut file = OpenOptions::new().create(true).write(true).open(path)?;
            file.seek(SeekFrom::End(0))?;
            Ok(file)
        })
        .await
        .map_err(io::Error::other)
        .and_then(|file| file);
        let file = match opened {
            Ok(file) => file,
            Err(err) => {
                self.held[slot].store(false, Ordering::Release);
                return Err(err.into());
            }
        };

        debug!(slot, "Slot acquired");
        Ok(SlotWriter {
            slot,
            out: BufWriter::new(file),
            record: None,
            held: self.held.clone(),
        })
    }

    /// Concatenates every slot file into one report and returns its path.
    /// All slots must have been released.
    pub async fn merge(&self) -> SchedResult<PathBuf> {
        if let Some(slot) = self.held.iter().position(|h| h.load(Ordering::Acquire)) {
            return Err(SchedError::state(format!("slot {} is still in use", slot)));
        }

        let merged = self.dir.join(MERGED_FILE);
        let mut out = tokio::io::BufWriter::new(tokio::fs::File::create(&merged).await?);
        for slot in 0..NUM_SLOTS {
            match tokio::fs::File::open(self.slot_path(slot)).await {
                Ok(mut input) => {
                    tokio::io::copy(&mut input, &mut out).await?;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        out.flush().await?;
        Ok(merged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Begun,
    Matched,
    Separated,
}

#[derive(Debug, Clone, Copy)]
struct OpenRecord {
    start: u64,
    match_len: usize,
    stage: Stage,
}

/// Exclusive writer for one slot. A record is `write_begin`, then match
/// pieces with `write_match_sep` between whole matches, then `write_end`.
/// Calls out of that order fail with `InvalidState` and leave the record as
/// it was. The file I/O is blocking; async callers go through
/// `spawn_blocking`.
pub struct SlotWriter {
    slot: usize,
    out: BufWriter<File>,
    record: Option<OpenRecord>,
    held: Arc<[AtomicBool; NUM_SLOTS]>,
}

impl SlotWriter {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn write_begin(&mut self, prod: &NewProduct) -> SchedResult<()> {
        if self.record.is_some() {
            return Err(self.out_of_order("write_begin", "a record is already open"));
        }
        check_header(prod)?;

        let start = self.out.stream_position()?;
        self.record = Some(OpenRecord {
            start,
            match_len: 0,
            stage: Stage::Begun,
        });
        let written = write!(
            self.out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t",
            prod.job_id,
            prod.seq_id,
            prod.profile_name,
            prod.abc_name,
            prod.alt_loglik,
            prod.null_loglik,
            prod.profile_typeid,
            prod.version
        );
        if let Err(err) = written {
            self.abort()?;
            return Err(err.into());
        }
        Ok(())
    }

    /// Runs `formatter` against the slot stream. May be called repeatedly
    /// to stream one match in pieces. Line breaks and anything past the
    /// match limit abort the whole record.
    pub fn write_match<M, F>(&mut self, formatter: F, value: &M) -> SchedResult<()>
    where
        M: ?Sized,
        F: FnOnce(&mut dyn Write, &M) -> io::Result<()>,
    {
        let Some(record) = self.record else {
            return Err(self.out_of_order("write_match", "no record is open"));
        };

        let mut guarded = GuardedWrite {
            inner: &mut self.out,
            count: 0,
            room: MATCH_MAX - record.match_len,
            fault: None,
        };
        let result = formatter(&mut guarded, value);
        let written = guarded.count;
        let fault = guarded.fault;

        let err = match (fault, result) {
            (Some(Fault::TooLong), _) => SchedError::LimitExceeded(format!(
                "match exceeds {} bytes",
                MATCH_MAX
            )),
            (Some(Fault::LineBreak), _) => SchedError::invalid("match contains a line break"),
            (None, Err(err)) => SchedError::Io(err),
            (None, Ok(())) => {
                self.record = Some(OpenRecord {
                    match_len: record.match_len + written,
                    stage: Stage::Matched,
                    ..record
                });
                return Ok(());
            }
        };
        self.abort()?;
        Err(err)
    }

    pub fn write_match_sep(&mut self) -> SchedResult<()> {
        let record = match self.record {
            Some(record) if record.stage == Stage::Matched => record,
            Some(_) => return Err(self.out_of_order("write_match_sep", "no match to separate")),
            None => return Err(self.out_of_order("write_match_sep", "no record is open")),
        };
        self.out.write_all(b";")?;
        self.record = Some(OpenRecord {
            stage: Stage::Separated,
            ..record
        });
        Ok(())
    }

    /// Closes the record and flushes it to the slot file.
    pub fn write_end(&mut self) -> SchedResult<()> {
        match self.record {
            Some(record) if record.stage != Stage::Separated => {}
            Some(_) => return Err(self.out_of_order("write_end", "a separator awaits its match")),
            None => return Err(self.out_of_order("write_end", "no record is open")),
        }
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.record = None;
        Ok(())
    }

    /// Drops the open record, if any, truncating the slot file back to where
    /// the record began.
    pub fn abort(&mut self) -> SchedResult<()> {
        if let Some(record) = self.record.take() {
            self.out.flush()?;
            self.out.get_ref().set_len(record.start)?;
            self.out.seek(SeekFrom::Start(record.start))?;
            debug!(slot = self.slot, "Record aborted");
        }
        Ok(())
    }

    fn out_of_order(&self, call: &str, why: &str) -> SchedError {
        SchedError::state(format!("{} on slot {}: {}", call, self.slot, why))
    }
}

impl Drop for SlotWriter {
    fn drop(&mut self) {
        if let Err(err) = self.abort().and_then(|_| self.out.flush().map_err(SchedError::from)) {
            warn!(slot = self.slot, error = %err, "Failed to release slot cleanly");
        }
        self.held[self.slot].store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    TooLong,
    LineBreak,
}

/// Counts what a match formatter writes and refuses bytes that would break
/// the line format or the match limit.
struct GuardedWrite<'a, W: Write> {
    inner: &'a mut W,
    count: usize,
    room: usize,
    fault: Option<Fault>,
}

impl<W: Write> GuardedWrite<'_, W> {
    fn refuse(&mut self, fault: Fault) -> io::Error {
        self.fault = Some(fault);
        io::Error::new(io::ErrorKind::InvalidData, "match rejected")
    }
}

impl<W: Write> Write for GuardedWrite<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.iter().any(|b| *b == b'\n' || *b == b'\r') {
            return Err(self.refuse(Fault::LineBreak));
        }
        if buf.len() > self.room - self.count {
            return Err(self.refuse(Fault::TooLong));
        }
        let n = self.inner.write(buf)?;
        self.count += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
