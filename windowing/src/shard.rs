//! Tar shard output
//!
//! Every window record becomes a group of consecutive tar entries named
//! `<key>.<entry>` (`clip_90.meta.json`, `clip_90.frames.u8`, ...). Shards are
//! named `<prefix>-w<seq_len>-s<stride>-<index:05>.tar` with a monotonically
//! increasing index. The writer opens its first shard lazily, so a run that
//! produces no windows leaves no shard files behind.

use crate::config::WindowConfig;
use crate::error::{Result, WindowingError};
use crate::window::{Payload, WindowRecord};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const TAR_BLOCK: u64 = 512;

type Sink = Box<dyn Write + Send>;
type SinkOpener = Box<dyn Fn(&Path) -> io::Result<Sink> + Send>;

fn open_file_sink(path: &Path) -> io::Result<Sink> {
    Ok(Box::new(BufWriter::new(File::create(path)?)))
}

/// Tracks the archive length as bytes are handed to the shard file
struct CountingSink {
    inner: Sink,
    written: u64,
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct OpenShard {
    builder: tar::Builder<CountingSink>,
    path: PathBuf,
    records: usize,
}

impl OpenShard {
    fn bytes(&self) -> u64 {
        self.builder.get_ref().written
    }

    /// Write every entry of one record and flush it to the file
    fn append_record(&mut self, key: &str, payload: &Payload) -> Result<()> {
        for (name, bytes) in payload {
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_cksum();
            self.builder
                .append_data(&mut header, format!("{}.{}", key, name), bytes.as_slice())
                .map_err(|e| {
                    WindowingError::shard(format!(
                        "{}: writing {}.{}: {}",
                        self.path.display(),
                        key,
                        name,
                        e
                    ))
                })?;
        }
        self.builder.get_mut().flush().map_err(|e| {
            WindowingError::shard(format!("{}: flushing {}: {}", self.path.display(), key, e))
        })?;
        self.records += 1;
        Ok(())
    }

    fn close(self) -> Result<(PathBuf, usize)> {
        let mut inner = self
            .builder
            .into_inner()
            .map_err(|e| WindowingError::shard(format!("{}: {}", self.path.display(), e)))?;
        inner.flush()?;
        Ok((self.path, self.records))
    }
}

/// Appends window records to size-bounded tar shards
pub struct ShardWriter {
    dir: PathBuf,
    config: WindowConfig,
    next_index: usize,
    current: Option<OpenShard>,
    finished: Vec<PathBuf>,
    records_written: usize,
    open_sink: SinkOpener,
}

impl ShardWriter {
    /// Create a writer for `dir`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P, config: &WindowConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            WindowingError::resource(format!("cannot create {}: {}", dir.display(), e))
        })?;
        log::info!(
            "Shard writer: {} ({}, rotate above {} bytes)",
            dir.display(),
            config.shard_pattern(),
            config.max_shard_size
        );
        Ok(Self {
            dir,
            config: config.clone(),
            next_index: 0,
            current: None,
            finished: Vec::new(),
            records_written: 0,
            open_sink: Box::new(open_file_sink),
        })
    }

    /// Append one record; rotates first when the open shard is already over the limit
    ///
    /// A record that fails halfway is cut off again and its shard is closed,
    /// so the next record starts a fresh shard. Only a shard that cannot be
    /// repaired makes the failure a [`WindowingError::ResourceExhausted`].
    pub fn append(&mut self, key: &str, payload: &Payload) -> Result<()> {
        self.rotate_if_over(self.config.max_shard_size)?;
        if self.current.is_none() {
            self.open_next()?;
        }
        let shard = self
            .current
            .as_mut()
            .ok_or_else(|| WindowingError::shard("no open shard"))?;

        let record_start = shard.bytes();
        if let Err(e) = shard.append_record(key, payload) {
            log::warn!("Discarding partial record {}: {}", key, e);
            self.discard_partial(record_start)?;
            return Err(e);
        }
        self.records_written += 1;
        Ok(())
    }

    /// Drop the open shard after a failed append, keeping only complete records
    fn discard_partial(&mut self, record_start: u64) -> Result<()> {
        let Some(shard) = self.current.take() else {
            return Ok(());
        };
        let OpenShard {
            builder,
            path,
            records,
        } = shard;
        // the sink is broken; whatever the builder still writes gets cut below
        let _ = builder.into_inner();

        let repaired = if records == 0 {
            std::fs::remove_file(&path).map(|_| {
                self.next_index -= 1;
            })
        } else {
            truncate_archive(&path, record_start).map(|_| {
                log::warn!("Closed shard {} early ({} records)", path.display(), records);
                self.finished.push(path.clone());
            })
        };
        repaired.map_err(|e| {
            WindowingError::resource(format!(
                "cannot recover shard {} after a failed write: {}",
                path.display(),
                e
            ))
        })
    }

    /// Close the open shard if it holds more than `max_size` bytes
    ///
    /// Failing to close or open a shard is a storage problem and reported as
    /// [`WindowingError::ResourceExhausted`].
    pub fn rotate_if_over(&mut self, max_size: u64) -> Result<bool> {
        let over = self
            .current
            .as_ref()
            .map(|shard| shard.bytes() > max_size)
            .unwrap_or(false);
        if !over {
            return Ok(false);
        }
        self.close_current()
            .map_err(|e| WindowingError::resource(format!("shard rotation failed: {}", e)))?;
        self.open_next()?;
        Ok(true)
    }

    fn open_next(&mut self) -> Result<()> {
        let path = self.dir.join(self.config.shard_file_name(self.next_index));
        let sink = (self.open_sink)(&path).map_err(|e| {
            WindowingError::resource(format!("cannot create shard {}: {}", path.display(), e))
        })?;
        log::info!("Opening shard {}", path.display());
        self.current = Some(OpenShard {
            builder: tar::Builder::new(CountingSink {
                inner: sink,
                written: 0,
            }),
            path,
            records: 0,
        });
        self.next_index += 1;
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(shard) = self.current.take() {
            let (path, records) = shard.close()?;
            log::info!("Closed shard {} ({} records)", path.display(), records);
            self.finished.push(path);
        }
        Ok(())
    }

    /// Close the open shard and return every shard written, in index order
    pub fn finish(&mut self) -> Result<Vec<PathBuf>> {
        self.close_current()?;
        Ok(self.finished.clone())
    }

    pub fn records_written(&self) -> usize {
        self.records_written
    }

    /// Shards opened so far, including the one still open
    pub fn shard_count(&self) -> usize {
        self.next_index
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close_current() {
            log::warn!("Failed to close shard on drop: {}", e);
        }
    }
}

/// Cut `path` back to `len` bytes and end the archive there
fn truncate_archive(path: &Path, len: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.seek(SeekFrom::Start(len))?;
    file.write_all(&[0u8; 2 * TAR_BLOCK as usize])?;
    file.sync_all()
}

/// Reads the records back out of one shard
pub struct ShardReader {
    path: PathBuf,
}

impl ShardReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(WindowingError::shard(format!("{} is not a file", path.display())));
        }
        Ok(Self { path })
    }

    /// Records as `(key, payload)` pairs in archive order
    pub fn payloads(&self) -> Result<Vec<(String, Payload)>> {
        let mut archive = tar::Archive::new(File::open(&self.path)?);
        let mut records: Vec<(String, Payload)> = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let (key, suffix) = name.split_once('.').ok_or_else(|| {
                WindowingError::shard(format!("{}: unkeyed entry {}", self.path.display(), name))
            })?;
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;

            let entry = (suffix.to_string(), bytes);
            match records.last_mut() {
                Some((last_key, payload)) if last_key.as_str() == key => payload.push(entry),
                _ => records.push((key.to_string(), vec![entry])),
            }
        }
        Ok(records)
    }

    pub fn records(&self) -> Result<Vec<WindowRecord>> {
        self.payloads()?
            .iter()
            .map(|(_, payload)| WindowRecord::from_payload(payload))
            .collect()
    }
}

/// Shard index encoded in `file_name`, if it follows the naming scheme of `config`
pub fn shard_index(file_name: &str, config: &WindowConfig) -> Option<usize> {
    let prefix = format!("{}-w{}-s{}-", config.shard_prefix, config.seq_len, config.stride);
    let digits = file_name.strip_prefix(&prefix)?.strip_suffix(".tar")?;
    if digits.len() < 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Shard files in `dir` written with `config`, ordered by shard index
pub fn list_shards<P: AsRef<Path>>(dir: P, config: &WindowConfig) -> Result<Vec<PathBuf>> {
    let mut shards: Vec<(usize, PathBuf)> = std::fs::read_dir(dir.as_ref())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter_map(|path| {
            let index = shard_index(path.file_name()?.to_str()?, config)?;
            Some((index, path))
        })
        .collect();
    shards.sort();
    Ok(shards.into_iter().map(|(_, path)| path).collect())
}
