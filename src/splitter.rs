//! Line-aligned file splitting for the sharded ingest path.
//!
//! Every shard starts with the source's two header lines, so each one is a
//! valid export on its own and can be fed straight to
//! [`ChunkReader`](crate::reader::ChunkReader). Data is copied in whole
//! lines only; no row is ever cut in half or duplicated.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::reader::HEADER_LINES;

const COPY_BUF_BYTES: usize = 64 * 1024;

/// One shard written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFile {
    pub id: usize,
    pub path: PathBuf,
    /// Data lines in the shard, header excluded.
    pub lines: u64,
}

fn shard_path(dir: &Path, id: usize) -> PathBuf {
    dir.join(format!("shard_{:04}.csv", id))
}

/// Read the header lines, returning their bytes (newline-terminated) and
/// the offset where data begins.
fn read_header(src: &mut BufReader<File>) -> Result<(Vec<u8>, u64)> {
    let mut header = Vec::new();
    let mut offset = 0u64;
    for _ in 0..HEADER_LINES {
        let n = src.read_until(b'\n', &mut header)?;
        offset += n as u64;
    }
    if header.last().is_some_and(|b| *b != b'\n') {
        header.push(b'\n');
    }
    Ok((header, offset))
}

/// Smallest line start at or after `pos`.
fn align_to_line_start(src: &mut BufReader<File>, pos: u64, data_start: u64, size: u64) -> Result<u64> {
    if pos <= data_start {
        return Ok(data_start);
    }
    if pos >= size {
        return Ok(size);
    }
    src.seek(SeekFrom::Start(pos - 1))?;
    let mut skipped = Vec::new();
    let n = src.read_until(b'\n', &mut skipped)?;
    Ok((pos - 1 + n as u64).min(size))
}

/// Copy `len` bytes to `out`, returning the number of lines copied.
fn copy_counting(src: &mut impl Read, out: &mut impl Write, len: u64) -> Result<u64> {
    let mut limited = src.take(len);
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    let mut lines = 0u64;
    let mut last = b'\n';

    loop {
        let n = limited.read(&mut buf)?;
        if n == 0 {
            break;
        }
        lines += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
        last = buf[n - 1];
        out.write_all(&buf[..n])?;
    }

    if last != b'\n' {
        lines += 1;
    }
    Ok(lines)
}

fn remove_files(shards: &[ShardFile]) {
    for shard in shards {
        if let Err(e) = std::fs::remove_file(&shard.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %shard.path.display(), error = %e, "Failed to remove shard");
            }
        }
    }
}

/// Split `src` into at most `shards` byte-balanced pieces. Boundaries move
/// forward to the next line start; the last shard takes the remainder.
pub fn split_by_count(src: &Path, shards: usize, dir: &Path) -> Result<Vec<ShardFile>> {
    let mut created = Vec::new();
    match split_by_count_inner(src, shards.max(1), dir, &mut created) {
        Ok(()) => Ok(created),
        Err(e) => {
            remove_files(&created);
            Err(e)
        }
    }
}

fn split_by_count_inner(
    src: &Path,
    shards: usize,
    dir: &Path,
    created: &mut Vec<ShardFile>,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create shard directory {}", dir.display()))?;

    let file = File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    let size = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let (header, data_start) = read_header(&mut reader)?;
    let data_len = size.saturating_sub(data_start);

    let mut bounds = Vec::with_capacity(shards + 1);
    bounds.push(data_start);
    for i in 1..shards {
        let target = data_start + data_len * i as u64 / shards as u64;
        let aligned = align_to_line_start(&mut reader, target, data_start, size)?;
        let prev = bounds.last().copied().unwrap_or(data_start);
        bounds.push(aligned.max(prev));
    }
    bounds.push(size);

    for window in bounds.windows(2) {
        let (start, end) = (window[0], window[1]);
        if end <= start {
            continue;
        }

        let id = created.len();
        let path = shard_path(dir, id);
        let mut out = BufWriter::new(
            File::create(&path)
                .with_context(|| format!("Failed to create shard {}", path.display()))?,
        );
        created.push(ShardFile {
            id,
            path: path.clone(),
            lines: 0,
        });

        out.write_all(&header)?;
        reader.seek(SeekFrom::Start(start))?;
        let lines = copy_counting(&mut reader, &mut out, end - start)?;
        out.flush()?;

        if let Some(shard) = created.last_mut() {
            shard.lines = lines;
        }
        debug!(shard = id, bytes = end - start, lines, "Wrote shard");
    }

    Ok(())
}

/// Split `src` into shards of up to `lines_per_shard` data lines each.
pub fn split_by_lines(src: &Path, lines_per_shard: usize, dir: &Path) -> Result<Vec<ShardFile>> {
    let mut created = Vec::new();
    match split_by_lines_inner(src, lines_per_shard.max(1) as u64, dir, &mut created) {
        Ok(()) => Ok(created),
        Err(e) => {
            remove_files(&created);
            Err(e)
        }
    }
}

fn split_by_lines_inner(
    src: &Path,
    lines_per_shard: u64,
    dir: &Path,
    created: &mut Vec<ShardFile>,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create shard directory {}", dir.display()))?;

    let file = File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    let mut reader = BufReader::new(file);
    let (header, _) = read_header(&mut reader)?;

    let mut current: Option<BufWriter<File>> = None;
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }

        if current.is_none() {
            let id = created.len();
            let path = shard_path(dir, id);
            let mut out = BufWriter::new(
                File::create(&path)
                    .with_context(|| format!("Failed to create shard {}", path.display()))?,
            );
            out.write_all(&header)?;
            created.push(ShardFile { id, path, lines: 0 });
            current = Some(out);
        }

        let mut full = false;
        if let (Some(out), Some(shard)) = (current.as_mut(), created.last_mut()) {
            out.write_all(&line)?;
            shard.lines += 1;
            if shard.lines >= lines_per_shard {
                out.flush()?;
                full = true;
            }
        }
        if full {
            current = None;
        }
    }

    if let Some(mut out) = current {
        out.flush()?;
    }

    Ok(())
}

/// Remove a shard directory and anything left in it. A missing directory
/// is not an error.
pub fn remove_shard_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove shard directory");
        }
    }
}
