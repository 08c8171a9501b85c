use std::{
    ffi::OsStr,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
    vec,
};

use crossbeam::channel::{Receiver, Sender};
use log::debug;
use xz2::read::XzDecoder;

use crate::{
    cache::Request,
    error::{Error, Result},
    hex,
};

pub const RECORDS_PER_BATCH: usize = 1024;
pub const BATCHES_PER_QUEUE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Load { addr: u64, size: usize },
    Store { addr: u64, value: Vec<u8> },
}

impl Record {
    /// Parses one trace line. Blank lines yield `None`.
    pub fn parse(text: &str, line: usize) -> Result<Option<Record>> {
        let mut tokens = text.split_whitespace();
        let Some(op) = tokens.next() else {
            return Ok(None);
        };
        if op != "load" && op != "store" {
            return Err(Error::parse(line, format!("unknown operation `{op}`")));
        }

        let addr = tokens
            .next()
            .ok_or_else(|| Error::parse(line, "missing address"))?;
        let addr_digits = addr
            .strip_prefix("0x")
            .or_else(|| addr.strip_prefix("0X"))
            .unwrap_or(addr);
        let addr = u64::from_str_radix(addr_digits, 16)
            .map_err(|_| Error::parse(line, format!("bad hex address `{addr}`")))?;

        let size = tokens
            .next()
            .ok_or_else(|| Error::parse(line, "missing access size"))?;
        let size: usize = size
            .parse()
            .map_err(|_| Error::parse(line, format!("bad access size `{size}`")))?;

        let record = if op == "load" {
            Record::Load { addr, size }
        } else {
            let payload = tokens
                .next()
                .ok_or_else(|| Error::parse(line, "missing store payload"))?;
            if payload.len() % 2 != 0 || payload.len() / 2 != size {
                return Err(Error::parse(
                    line,
                    format!(
                        "payload has {} hex digits, expected {} for a {size} byte store",
                        payload.len(),
                        size.saturating_mul(2)
                    ),
                ));
            }
            let value = hex::decode(payload)
                .ok_or_else(|| Error::parse(line, format!("bad hex payload `{payload}`")))?;
            Record::Store { addr, value }
        };

        if let Some(extra) = tokens.next() {
            return Err(Error::parse(line, format!("unexpected `{extra}`")));
        }
        Ok(Some(record))
    }

    pub fn addr(&self) -> u64 {
        match *self {
            Record::Load { addr, .. } | Record::Store { addr, .. } => addr,
        }
    }

    pub fn request(&self) -> Request<'_> {
        match *self {
            Record::Load { addr, size } => Request::Load { addr, size },
            Record::Store { addr, ref value } => Request::Store { addr, value },
        }
    }
}

/// Parsed trace records, read ahead on a background thread and yielded in file order.
///
/// Iteration ends after the first error.
pub struct Trace {
    rec: Receiver<Result<Vec<Record>>>,
    batch: vec::IntoIter<Record>,
    _thread: JoinHandle<()>,
}

impl Trace {
    /// Opens a trace file; `.xz` files are decompressed on the fly.
    pub fn read(path: PathBuf, records_per_batch: usize, batches_per_queue: usize) -> Result<Trace> {
        let stream = fs::File::open(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        let reader: Box<dyn BufRead + Send> = if path.extension() == Some(OsStr::new("xz")) {
            debug!("reading xz compressed trace {}", path.display());
            Box::new(BufReader::new(XzDecoder::new(stream)))
        } else {
            Box::new(BufReader::new(stream))
        };
        Ok(Trace::spawn(reader, path, records_per_batch, batches_per_queue))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Trace> {
        Trace::read(path.as_ref().into(), RECORDS_PER_BATCH, BATCHES_PER_QUEUE)
    }

    /// Reads records from an already open stream, e.g. stdin or an in-memory buffer.
    pub fn from_reader<R: BufRead + Send + 'static>(reader: R) -> Trace {
        Trace::spawn(reader, PathBuf::from("<input>"), RECORDS_PER_BATCH, BATCHES_PER_QUEUE)
    }

    fn spawn<R: BufRead + Send + 'static>(
        reader: R,
        path: PathBuf,
        records_per_batch: usize,
        batches_per_queue: usize,
    ) -> Trace {
        let records_per_batch = records_per_batch.max(1);
        let (sender, receiver) = crossbeam::channel::bounded(batches_per_queue);
        let t = thread::spawn(move || Trace::run_thread(reader, path, records_per_batch, sender));
        Trace {
            rec: receiver,
            batch: Vec::new().into_iter(),
            _thread: t,
        }
    }

    fn run_thread<R: BufRead>(
        reader: R,
        path: PathBuf,
        records_per_batch: usize,
        queue: Sender<Result<Vec<Record>>>,
    ) {
        let mut buffer = Vec::with_capacity(records_per_batch);
        for (idx, text) in reader.lines().enumerate() {
            let parsed = text
                .map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })
                .and_then(|text| Record::parse(&text, idx + 1));
            match parsed {
                Ok(Some(record)) => buffer.push(record),
                Ok(None) => continue,
                Err(err) => {
                    // Records before the bad line still get simulated.
                    if !buffer.is_empty() && queue.send(Ok(buffer)).is_err() {
                        return;
                    }
                    let _ = queue.send(Err(err));
                    return;
                }
            }
            if buffer.len() == records_per_batch {
                let full = std::mem::replace(&mut buffer, Vec::with_capacity(records_per_batch));
                if queue.send(Ok(full)).is_err() {
                    return;
                }
            }
        }
        if !buffer.is_empty() {
            let _ = queue.send(Ok(buffer));
        }
    }
}

impl Iterator for Trace {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.batch.next() {
                return Some(Ok(record));
            }
            match self.rec.recv() {
                Ok(Ok(batch)) => self.batch = batch.into_iter(),
                Ok(Err(err)) => return Some(Err(err)),
                Err(_) => return None,
            }
        }
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("buffered", &self.batch.len())
            .finish_non_exhaustive()
    }
}
