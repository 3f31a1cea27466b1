// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One reader per active file.
//!
//! The reader owns the open handle, the read offset and the tail buffer of
//! the current incomplete line. Each tick stats the path to detect rotation
//! and truncation, reads forward under a byte budget, and pushes complete
//! lines through the assembler and parser. Offsets always count raw file
//! bytes, including the bytes carried in the tail buffer; the checkpointed
//! offset backs off by the tail length so a restart re-reads only the
//! incomplete line.

use crate::multiline::{Assembler, CompiledMultiline};
use crate::parse::{CompiledParser, ParseOutcome, ParserStats};
use crate::split::LineSplitter;
use crate::Record;
use chrono::Utc;
use ddtail_checkpoint::PrimaryCheckpoint;
use ddtail_config::{MultilineConfig, ParserConfig, SourceConfig};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
    pub signature: Vec<u8>,
    pub signature_size: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Transient; the reader is parked and retried on the next wake.
    #[error("open {path}: {err}")]
    OpenFailed { path: PathBuf, err: std::io::Error },
    /// Permanent; reported once, the reader is abandoned.
    #[error("permission denied opening {0}")]
    PermissionDenied(PathBuf),
    /// The checkpointed signature no longer matches: treat as a new file.
    #[error("signature mismatch at {0}")]
    SignatureMismatch(PathBuf),
    #[error("stat {path}: {err}")]
    StatFailed { path: PathBuf, err: std::io::Error },
    #[error("read {path}: {err}")]
    ReadFailed { path: PathBuf, err: std::io::Error },
    #[error("source {source_name} has an uncompilable pattern: {err}")]
    InvalidConfig {
        source_name: String,
        err: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Caught up with the file.
    Eof,
    /// Stopped on the per-tick byte budget; more data remains.
    BudgetExhausted,
    /// The path now names a different inode and the old handle is drained.
    /// The caller closes this reader and discovers the new file.
    Rotated,
    /// The path is gone and the old handle is drained.
    Deleted,
}

#[derive(Debug)]
pub struct TickOutput {
    pub records: Vec<Record>,
    /// Raw bytes consumed this tick (tail bytes included).
    pub consumed: u64,
    pub status: ReadStatus,
    pub truncated: bool,
}

pub struct FileReader {
    source: Arc<SourceConfig>,
    path: PathBuf,
    /// `path` rendered once, shared into every emitted record's `path` slot.
    path_tag: Arc<str>,
    real_path: PathBuf,
    file: File,
    identity: FileIdentity,
    /// Raw file position; invariant per tick:
    /// `consumed + |tail|` bytes past the previous complete position.
    offset: u64,
    tail: Vec<u8>,
    splitter: LineSplitter,
    assembler: Assembler,
    parser: CompiledParser,
    decoder: Option<encoding_rs::Decoder>,
    encoding_errors: u64,
    last_read: Instant,
    deleted_at: Option<Instant>,
    created_at: u64,
    read_chunk: usize,
    /// End of the last emitted record's byte range.
    last_emit_end: u64,
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .finish()
    }
}

impl FileReader {
    /// Open a file, verify it against `checkpoint` if one exists, and decide
    /// the starting offset: the checkpointed offset on a signature match,
    /// otherwise 0 for recently modified files and EOF for cold ones.
    pub fn open(
        source: Arc<SourceConfig>,
        path: &Path,
        checkpoint: Option<&PrimaryCheckpoint>,
        read_chunk: usize,
    ) -> Result<FileReader, ReaderError> {
        let mut file = open_file(path)?;
        let meta = file.metadata().map_err(|err| ReaderError::StatFailed {
            path: path.to_owned(),
            err,
        })?;
        let (device, inode, size) = (meta.dev(), meta.ino(), meta.len());

        let mut offset = None;
        if let Some(cpt) = checkpoint {
            if cpt.device == device && cpt.inode == inode && cpt.signature_size > 0 {
                if size >= u64::from(cpt.signature_size) {
                    let hash = hash_prefix(&mut file, u64::from(cpt.signature_size))
                        .map_err(|err| ReaderError::ReadFailed {
                            path: path.to_owned(),
                            err,
                        })?;
                    if hash == cpt.signature {
                        offset = Some(cpt.read_offset.min(size));
                    } else {
                        return Err(ReaderError::SignatureMismatch(path.to_owned()));
                    }
                } else {
                    // The file shrank below the bytes the signature covered:
                    // old content is gone, start over.
                    offset = Some(0);
                }
            }
        }
        let offset = match offset {
            Some(offset) => offset,
            None => {
                let fresh = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .map_or(true, |age| age.as_secs() <= source.tail_since_secs);
                if fresh {
                    0
                } else {
                    size
                }
            }
        };

        let sig_width = u64::from(source.signature_bytes).min(size);
        let signature = hash_prefix(&mut file, sig_width).map_err(|err| {
            ReaderError::ReadFailed {
                path: path.to_owned(),
                err,
            }
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| ReaderError::ReadFailed {
                path: path.to_owned(),
                err,
            })?;

        let invalid = |err| ReaderError::InvalidConfig {
            source_name: source.name.clone(),
            err,
        };
        let assembler = Assembler::new(
            CompiledMultiline::compile(&source.multiline).map_err(invalid)?,
            source.unmatched,
            Duration::from_millis(source.multiline_timeout_ms),
        );
        let parser = CompiledParser::compile(&source).map_err(|err| ReaderError::InvalidConfig {
            source_name: source.name.clone(),
            err,
        })?;
        let splitter = match &source.parser {
            ParserConfig::Json { .. } => LineSplitter::whole_buffer(),
            _ => LineSplitter::new(source.line_terminator as u8),
        };
        let decoder = encoding_rs::Encoding::for_label(source.encoding.as_bytes())
            .filter(|&e| e != encoding_rs::UTF_8)
            .map(|e| e.new_decoder());

        let real_path = fs::canonicalize(path).unwrap_or_else(|_| path.to_owned());
        debug!(path = %path.display(), offset, size, "reader opened");
        Ok(FileReader {
            path: path.to_owned(),
            path_tag: Arc::from(path.to_string_lossy().as_ref()),
            real_path,
            file,
            identity: FileIdentity {
                device,
                inode,
                signature,
                signature_size: sig_width as u32,
            },
            offset,
            tail: Vec::new(),
            splitter,
            assembler,
            parser,
            decoder,
            encoding_errors: 0,
            last_read: Instant::now(),
            deleted_at: None,
            created_at: checkpoint.map_or_else(unix_now, |c| c.created_at),
            read_chunk,
            last_emit_end: offset,
            source,
        })
    }

    pub fn source(&self) -> &Arc<SourceConfig> {
        &self.source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn parser_stats(&self) -> ParserStats {
        self.parser.stats()
    }

    pub fn encoding_errors(&self) -> u64 {
        self.encoding_errors
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }

    /// A deleted file's reader is destroyed once idle past the expiry.
    pub fn is_expired(&self, expire: Duration) -> bool {
        self.deleted_at
            .map_or(false, |deleted| deleted.elapsed() >= expire)
    }

    pub fn primary_key(&self) -> Vec<u8> {
        ddtail_checkpoint::primary_key(&self.source.name, &self.path)
    }

    /// Durable state for this reader. The checkpointed offset excludes the
    /// tail buffer so a restart re-reads the incomplete line instead of
    /// losing it.
    pub fn checkpoint(&self) -> PrimaryCheckpoint {
        PrimaryCheckpoint {
            source: self.source.name.clone(),
            logical_path: self.path.clone(),
            real_path: self.real_path.clone(),
            device: self.identity.device,
            inode: self.identity.inode,
            signature: self.identity.signature.clone(),
            signature_size: self.identity.signature_size,
            read_offset: self.offset - self.tail.len() as u64,
            created_at: self.created_at,
            last_read_at: unix_now(),
            range_concurrency: self.source.exactly_once_concurrency,
        }
    }

    /// One bounded read pass. See the module docs for the algorithm.
    pub fn tick(&mut self, budget: usize) -> Result<TickOutput, ReaderError> {
        let mut records = Vec::new();
        let mut truncated = false;

        let status = match fs::metadata(&self.path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if self.deleted_at.is_none() {
                    self.deleted_at = Some(Instant::now());
                }
                Some(ReadStatus::Deleted)
            }
            Err(err) => {
                return Err(ReaderError::StatFailed {
                    path: self.path.clone(),
                    err,
                })
            }
            Ok(meta) => {
                self.deleted_at = None;
                if (meta.dev(), meta.ino()) != (self.identity.device, self.identity.inode) {
                    // Rotation: the path names a new inode. Drain the handle
                    // we still hold (the renamed-aside file) to EOF first.
                    Some(ReadStatus::Rotated)
                } else {
                    if meta.len() < self.offset {
                        // Truncation: whatever was beyond the new size never
                        // made it out; flush the tail as a terminal record.
                        records.extend(self.flush_pending());
                        self.file
                            .seek(SeekFrom::Start(0))
                            .map_err(|err| ReaderError::ReadFailed {
                                path: self.path.clone(),
                                err,
                            })?;
                        self.offset = 0;
                        self.last_emit_end = 0;
                        truncated = true;
                    }
                    None
                }
            }
        };

        let mut consumed: u64 = 0;
        let mut chunk = vec![0u8; self.read_chunk];
        let drained = loop {
            if consumed >= budget as u64 {
                break false;
            }
            let want = chunk
                .len()
                .min((budget as u64 - consumed) as usize);
            let n = self
                .file
                .read(&mut chunk[..want])
                .map_err(|err| ReaderError::ReadFailed {
                    path: self.path.clone(),
                    err,
                })?;
            if n == 0 {
                break true;
            }
            consumed += n as u64;
            self.offset += n as u64;
            self.last_read = Instant::now();
            self.ingest(&chunk[..n], &mut records);
        };

        let status = match status {
            Some(final_status) if drained => {
                // Old inode fully drained; emit whatever is still buffered.
                records.extend(self.flush_pending());
                final_status
            }
            _ if drained => ReadStatus::Eof,
            _ => ReadStatus::BudgetExhausted,
        };

        Ok(TickOutput {
            records,
            consumed,
            status,
            truncated,
        })
    }

    /// Idle poll: force out a multiline record that has waited past the
    /// multiline timeout.
    pub fn poll_idle(&mut self, now: Instant) -> Vec<Record> {
        let mut records = Vec::new();
        if let Some(merged) = self.assembler.poll_timeout(now) {
            self.parse_into(merged, &mut records);
        }
        records
    }

    /// Flush everything buffered: the incomplete tail line and any open
    /// multiline record. Used at truncation, rotation, and teardown.
    pub fn flush_pending(&mut self) -> Vec<Record> {
        let mut records = Vec::new();
        let tail = std::mem::take(&mut self.tail);
        if !tail.is_empty() {
            for merged in self.assembler.push_line(tail) {
                self.parse_into(merged, &mut records);
            }
        }
        if let Some(merged) = self.assembler.flush() {
            self.parse_into(merged, &mut records);
        }
        self.last_emit_end = self.offset;
        records
    }

    fn ingest(&mut self, raw: &[u8], records: &mut Vec<Record>) {
        let decoded;
        let bytes: &[u8] = match &mut self.decoder {
            None => raw,
            Some(decoder) => {
                let mut out = String::with_capacity(raw.len() * 2);
                let (_, _, had_errors) = decoder.decode_to_string(raw, &mut out, false);
                if had_errors {
                    self.encoding_errors += 1;
                }
                decoded = out.into_bytes();
                &decoded
            }
        };
        let out = self.splitter.split(std::mem::take(&mut self.tail), bytes);
        self.tail = out.tail;
        let flag_mode = matches!(self.source.multiline, MultilineConfig::Flag);
        for line in out.lines {
            let merged = if flag_mode {
                let (content, partial) = strip_partial_flag(line);
                self.assembler.push_flagged(content, partial)
            } else {
                self.assembler.push_line(line)
            };
            for record in merged {
                self.parse_into(record, records);
            }
        }
    }

    fn parse_into(&mut self, merged: Vec<u8>, records: &mut Vec<Record>) {
        let end = self.offset - self.tail.len() as u64;
        match self.parser.parse(&merged, Utc::now()) {
            ParseOutcome::Record(mut record) => {
                record.path = Some(Arc::clone(&self.path_tag));
                record.file_range = Some((self.last_emit_end, end));
                self.last_emit_end = end;
                records.push(record);
            }
            ParseOutcome::Outdated | ParseOutcome::Dropped => {
                self.last_emit_end = end;
            }
        }
    }
}

/// Container-runtime log protocol: `<ts> <stream> <P|F> <content>`. A `P`
/// marks a partial line the runtime split; anything malformed is a full line.
fn strip_partial_flag(line: Vec<u8>) -> (Vec<u8>, bool) {
    let text = String::from_utf8_lossy(&line);
    let mut parts = text.splitn(4, ' ');
    let (Some(_ts), Some(stream), Some(flag), Some(content)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return (line, false);
    };
    if (stream == "stdout" || stream == "stderr") && (flag == "P" || flag == "F") {
        (content.as_bytes().to_vec(), flag == "P")
    } else {
        (line, false)
    }
}

fn open_file(path: &Path) -> Result<File, ReaderError> {
    File::open(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::PermissionDenied => ReaderError::PermissionDenied(path.to_owned()),
        _ => ReaderError::OpenFailed {
            path: path.to_owned(),
            err,
        },
    })
}

fn hash_prefix(file: &mut File, width: u64) -> std::io::Result<Vec<u8>> {
    let previous = file.stream_position()?;
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut remaining = width;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    file.seek(SeekFrom::Start(previous))?;
    Ok(hasher.finalize().to_vec())
}

/// Does the file currently at `path` still match the checkpoint's identity?
/// Used by the startup checkpoint scan.
pub fn signature_matches(path: &Path, cpt: &PrimaryCheckpoint) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let Ok(meta) = file.metadata() else {
        return false;
    };
    if meta.len() < u64::from(cpt.signature_size) {
        return false;
    }
    match hash_prefix(&mut file, u64::from(cpt.signature_size)) {
        Ok(hash) => hash == cpt.signature,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "signature check failed");
            false
        }
    }
}

/// Look for an inode in `dir` (non-recursive): the renamed-aside half of a
/// rotation keeps its inode and usually lands in the same directory.
pub fn find_inode_in_dir(dir: &Path, device: u64, inode: u64) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        if let Ok(meta) = entry.metadata() {
            if meta.dev() == device && meta.ino() == inode {
                return Some(entry.path());
            }
        }
    }
    None
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source() -> Arc<SourceConfig> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "name": "test",
                "path_glob": "/tmp/*.log",
                "destination": "main",
            }))
            .unwrap(),
        )
    }

    fn write_file(path: &Path, contents: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    #[test]
    fn test_simple_tail() {
        // Two complete lines produce two records and the offset lands at EOF.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"alpha\nbeta\n");

        let mut reader = FileReader::open(source(), &path, None, 4096).unwrap();
        let out = reader.tick(1 << 20).unwrap();
        assert_eq!(out.status, ReadStatus::Eof);
        assert_eq!(out.consumed, 11);
        assert_eq!(reader.offset(), 11);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].field("content"), Some("alpha"));
        assert_eq!(out.records[1].field("content"), Some("beta"));
        assert_eq!(
            out.records[0].path.as_deref(),
            Some(path.to_string_lossy().as_ref())
        );
    }

    #[test]
    fn test_offset_invariant_with_partial_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"complete\npartial");

        let mut reader = FileReader::open(source(), &path, None, 4096).unwrap();
        let start = reader.offset();
        let out = reader.tick(1 << 20).unwrap();
        // bytes_consumed == offset_end - offset_start, tail included.
        assert_eq!(out.consumed, reader.offset() - start);
        assert_eq!(out.records.len(), 1);
        // The checkpoint backs off by the tail length.
        assert_eq!(reader.checkpoint().read_offset, 9);
    }

    #[test]
    fn test_terminator_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"hel");

        let mut reader = FileReader::open(source(), &path, None, 4096).unwrap();
        let first = reader.tick(1 << 20).unwrap();
        assert!(first.records.is_empty());

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"lo\n").unwrap();
        let second = reader.tick(1 << 20).unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].field("content"), Some("hello"));
    }

    #[test]
    fn test_budget_bounds_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        let mut contents = Vec::new();
        for i in 0..1000 {
            contents.extend_from_slice(format!("line number {i}\n").as_bytes());
        }
        write_file(&path, &contents);

        let mut reader = FileReader::open(source(), &path, None, 64).unwrap();
        let out = reader.tick(128).unwrap();
        assert_eq!(out.status, ReadStatus::BudgetExhausted);
        assert!(out.consumed <= 128);

        // Subsequent ticks make progress and eventually reach EOF.
        let mut total = out.consumed;
        let mut all_records = out.records;
        loop {
            let next = reader.tick(1 << 20).unwrap();
            total += next.consumed;
            all_records.extend(next.records);
            if next.status == ReadStatus::Eof {
                break;
            }
        }
        assert_eq!(total, contents.len() as u64);
        assert_eq!(all_records.len(), 1000);
    }

    #[test]
    fn test_truncation_resets_offset_and_flushes_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"first\npartial-tail");

        let mut reader = FileReader::open(source(), &path, None, 4096).unwrap();
        reader.tick(1 << 20).unwrap();
        assert_eq!(reader.offset(), 18);

        // Truncate below the current offset.
        write_file(&path, b"new\n");
        let out = reader.tick(1 << 20).unwrap();
        assert!(out.truncated);
        // The dangling tail came out as a terminal record, then the new
        // content was read from offset 0.
        assert_eq!(out.records[0].field("content"), Some("partial-tail"));
        assert_eq!(out.records[1].field("content"), Some("new"));
        assert_eq!(reader.offset(), 4);
    }

    #[test]
    fn test_rotation_drains_old_inode_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"old-1\nold-2\n");

        let mut reader = FileReader::open(source(), &path, None, 4096).unwrap();
        // Read halfway, then rotate.
        let first = reader.tick(6).unwrap();
        assert_eq!(first.records.len(), 1);

        fs::rename(&path, dir.path().join("a.log.1")).unwrap();
        write_file(&path, b"new\n");

        let out = reader.tick(1 << 20).unwrap();
        assert_eq!(out.status, ReadStatus::Rotated);
        // The remainder of the old inode drained before anything else.
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].field("content"), Some("old-2"));

        // The caller now opens a fresh reader on the new inode.
        let mut fresh = FileReader::open(source(), &path, None, 4096).unwrap();
        let fresh_out = fresh.tick(1 << 20).unwrap();
        assert_eq!(fresh_out.records.len(), 1);
        assert_eq!(fresh_out.records[0].field("content"), Some("new"));
    }

    #[test]
    fn test_deleted_file_drained_then_expires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"leftover\n");

        let mut reader = FileReader::open(source(), &path, None, 4096).unwrap();
        fs::remove_file(&path).unwrap();
        let out = reader.tick(1 << 20).unwrap();
        assert_eq!(out.status, ReadStatus::Deleted);
        assert_eq!(out.records.len(), 1);
        assert!(!reader.is_expired(Duration::from_secs(60)));
        assert!(reader.is_expired(Duration::ZERO));
    }

    #[test]
    fn test_checkpoint_resume_skips_read_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"first\nsecond\n");

        let cpt = {
            let mut reader = FileReader::open(source(), &path, None, 4096).unwrap();
            reader.tick(1 << 20).unwrap();
            reader.checkpoint()
        };
        assert_eq!(cpt.read_offset, 13);

        // Append and resume from the checkpoint: only new bytes are read.
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"third\n").unwrap();
        let mut resumed = FileReader::open(source(), &path, Some(&cpt), 4096).unwrap();
        let out = resumed.tick(1 << 20).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].field("content"), Some("third"));
    }

    #[test]
    fn test_checkpoint_signature_mismatch_is_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"original content here\n");

        let cpt = {
            let mut reader = FileReader::open(source(), &path, None, 4096).unwrap();
            reader.tick(1 << 20).unwrap();
            reader.checkpoint()
        };

        // Same length, different bytes: the inode was reused.
        write_file(&path, b"REPLACED content here\n");
        match FileReader::open(source(), &path, Some(&cpt), 4096) {
            Err(ReaderError::SignatureMismatch(p)) => assert_eq!(p, path),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_short_file_signature_resume() {
        // The signature is recorded over fewer bytes than configured while
        // the file is shorter than the configured width, and still verifies.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"tiny\n");

        let cpt = {
            let mut reader = FileReader::open(source(), &path, None, 4096).unwrap();
            reader.tick(1 << 20).unwrap();
            let cpt = reader.checkpoint();
            assert_eq!(cpt.signature_size, 5);
            cpt
        };

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"more\n").unwrap();
        let mut resumed = FileReader::open(source(), &path, Some(&cpt), 4096).unwrap();
        let out = resumed.tick(1 << 20).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].field("content"), Some("more"));
    }

    #[test]
    fn test_cold_file_tails_from_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"ancient history\n");
        // Make the mtime far older than tail_since_secs.
        let old = SystemTime::now() - Duration::from_secs(3600);
        let f = fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_modified(old).unwrap();

        let reader = FileReader::open(source(), &path, None, 4096).unwrap();
        assert_eq!(reader.offset(), 16);
    }

    #[test]
    fn test_find_inode_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(&path, b"x");
        let meta = fs::metadata(&path).unwrap();
        let renamed = dir.path().join("a.log.1");
        fs::rename(&path, &renamed).unwrap();
        assert_eq!(
            find_inode_in_dir(dir.path(), meta.dev(), meta.ino()),
            Some(renamed)
        );
        assert_eq!(find_inode_in_dir(dir.path(), meta.dev(), meta.ino() + 1), None);
    }

    #[test]
    fn test_flag_mode_reassembles_container_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_file(
            &path,
            b"2025-06-01T12:00:00Z stdout P hello \n2025-06-01T12:00:00Z stdout F world\n",
        );
        let src: Arc<SourceConfig> = Arc::new(
            serde_json::from_value(serde_json::json!({
                "name": "cri",
                "path_glob": "/tmp/*.log",
                "destination": "main",
                "multiline": { "mode": "flag" },
            }))
            .unwrap(),
        );
        let mut reader = FileReader::open(src, &path, None, 4096).unwrap();
        let out = reader.tick(1 << 20).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].field("content"), Some("hello world"));
    }
}
