//! Incremental tar container parser.
//!
//! [`ContainerParser`] is a byte stage that turns an archive arriving in arbitrary
//! chunks into a flat sequence of [`EntryEvent`]s.  Nothing is buffered beyond one
//! header block: body bytes are forwarded as soon as they arrive, split off from the
//! zero padding that rounds every body up to the next 512-byte boundary.
//!
//! The parser walks these states:
//!
//! ```text
//! Header ──(all-zero block)──────────────────────────▶ End
//!   │ ──(L / x header)──▶ Extension ──▶ Skip ──▶ Header
//!   │ ──(file header)───▶ Body ──▶ Skip ──────▶ Header
//!   └ ──(other kind)────▶ Skip ──────────────────▶ Header
//! ```
//!
//! Header fields are decoded with the `tar` crate's accessors; the checksum is
//! verified before any event for that header is emitted.

use std::fmt;

use bytes::{Buf, Bytes};
use tar::{EntryType, PaxExtensions};

use crate::{
    error::{PipelineError, Result},
    stage::{guard, BackpressureCallback, Flow, Lifecycle, Stage},
};

/// Size of a tar header block, and the alignment of every body.
pub const BLOCK_SIZE: usize = 512;

/// Upper bound on GNU long-name and PAX extension bodies.
const MAX_EXTENSION_SIZE: u64 = 1024 * 1024;

/// The kind of an archive member, reduced to what the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Any other member type, carrying its raw typeflag byte.
    Other(u8),
}

impl From<EntryType> for EntryKind {
    fn from(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Regular | EntryType::Continuous => EntryKind::File,
            EntryType::Directory => EntryKind::Directory,
            other => EntryKind::Other(other.as_byte()),
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::File => write!(f, "File"),
            EntryKind::Directory => write!(f, "Directory"),
            EntryKind::Other(flag) => write!(f, "Other({:?})", *flag as char),
        }
    }
}

/// The decoded fields of one header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub path: String,
    pub kind: EntryKind,
    pub entry_type: u8,
    /// Declared body size in bytes, excluding padding.
    pub size: u64,
}

impl EntryHeader {
    /// Body size rounded up to the block boundary.
    pub fn stored_size(&self) -> u64 {
        self.size.next_multiple_of(BLOCK_SIZE as u64)
    }
}

/// Computes the header checksum: the unsigned sum of all header bytes, with the
/// checksum field itself counted as spaces.
pub fn compute_checksum(block: &[u8]) -> u64 {
    block
        .iter()
        .enumerate()
        .map(|(i, &byte)| match i {
            148..156 => u64::from(b' '),
            _ => u64::from(byte),
        })
        .sum()
}

/// Decodes one 512-byte header block.
///
/// Returns `Ok(None)` for the all-zero block that marks the end of an archive.
pub fn decode_header(block: &[u8]) -> Result<Option<EntryHeader>> {
    if block.len() != BLOCK_SIZE {
        return Err(PipelineError::TruncatedInput(format!(
            "header block of {} bytes",
            block.len()
        )));
    }
    if block.iter().all(|&b| b == 0) {
        return Ok(None);
    }

    let header = tar::Header::from_byte_slice(block);
    let computed = compute_checksum(block);
    // an unreadable checksum field can never match
    if header.cksum().ok().map(u64::from) != Some(computed) {
        let stored = String::from_utf8_lossy(&header.as_old().cksum);
        return Err(PipelineError::ChecksumMismatch {
            expected: stored.trim_matches(['\0', ' ']).to_string(),
            computed,
        });
    }

    let size = header
        .entry_size()
        .map_err(|e| PipelineError::MalformedRecord(format!("size field: {e}")))?;
    let entry_type = header.entry_type();

    Ok(Some(EntryHeader {
        path: String::from_utf8_lossy(&header.path_bytes()).into_owned(),
        kind: entry_type.into(),
        entry_type: entry_type.as_byte(),
        size,
    }))
}

/// One archive member as seen by downstream stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub kind: EntryKind,
    /// Declared payload size.
    pub size: u64,
    /// Payload bytes forwarded so far; never exceeds `size`.
    pub bytes_consumed: u64,
}

impl Entry {
    pub fn is_complete(&self) -> bool {
        self.bytes_consumed == self.size
    }

    fn remaining(&self) -> u64 {
        self.size - self.bytes_consumed
    }
}

/// Output of [`ContainerParser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryEvent {
    /// A header was parsed and a new entry opened.
    Start(Entry),
    /// A slice of the open entry's payload.
    Data(Bytes),
    /// The open entry received all of its declared bytes.
    End(Entry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extension {
    GnuLongName,
    Pax,
}

#[derive(Debug)]
enum State {
    Header,
    Extension {
        kind: Extension,
        remaining: u64,
        padding: u64,
        buf: Vec<u8>,
    },
    Body {
        entry: Entry,
        padding: u64,
    },
    Skip {
        remaining: u64,
    },
    End,
}

/// Byte stage that parses a tar stream into [`EntryEvent`]s.
#[derive(Debug)]
pub struct ContainerParser<S> {
    downstream: S,
    state: State,
    header: Vec<u8>,
    pending_path: Option<String>,
    entries: u64,
    lifecycle: Lifecycle,
}

impl<S: Stage<EntryEvent>> ContainerParser<S> {
    pub fn new(downstream: S) -> Self {
        ContainerParser {
            downstream,
            state: State::Header,
            header: Vec::with_capacity(BLOCK_SIZE),
            pending_path: None,
            entries: 0,
            lifecycle: Lifecycle::default(),
        }
    }

    /// Number of entries opened so far (extension headers not counted).
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// True once the end-of-archive block has been seen.
    pub fn at_end(&self) -> bool {
        matches!(self.state, State::End)
    }

    fn process(&mut self, mut input: Bytes) -> Result<Flow> {
        let mut flow = Flow::Ready;

        while !input.is_empty() {
            match &mut self.state {
                State::End => {
                    log::trace!("ignoring {} bytes after end of archive", input.len());
                    break;
                }
                State::Header => {
                    let take = (BLOCK_SIZE - self.header.len()).min(input.len());
                    self.header.extend_from_slice(&input.split_to(take));
                    if self.header.len() == BLOCK_SIZE {
                        let block =
                            std::mem::replace(&mut self.header, Vec::with_capacity(BLOCK_SIZE));
                        flow = flow.and(self.on_header(&block)?);
                    }
                }
                State::Extension { remaining, buf, .. } => {
                    let take = (*remaining).min(input.len() as u64) as usize;
                    buf.extend_from_slice(&input.split_to(take));
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.on_extension()?;
                    }
                }
                State::Body { entry, .. } => {
                    let take = entry.remaining().min(input.len() as u64) as usize;
                    let data = input.split_to(take);
                    entry.bytes_consumed += take as u64;
                    let done = entry.is_complete();
                    flow = flow.and(self.downstream.push(EntryEvent::Data(data))?);
                    if done {
                        flow = flow.and(self.end_entry()?);
                    }
                }
                State::Skip { remaining } => {
                    let take = (*remaining).min(input.len() as u64) as usize;
                    input.advance(take);
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = State::Header;
                    }
                }
            }
        }

        Ok(flow)
    }

    fn on_header(&mut self, block: &[u8]) -> Result<Flow> {
        let Some(header) = decode_header(block)? else {
            log::debug!("end of archive after {} entries", self.entries);
            self.state = State::End;
            self.downstream.finish()?;
            return Ok(Flow::Ready);
        };

        let padding = header.stored_size() - header.size;
        match EntryType::new(header.entry_type) {
            EntryType::GNULongName | EntryType::XHeader => {
                if header.size > MAX_EXTENSION_SIZE {
                    return Err(PipelineError::MalformedRecord(format!(
                        "extension header of {} bytes",
                        header.size
                    )));
                }
                let kind = if header.entry_type == b'L' {
                    Extension::GnuLongName
                } else {
                    Extension::Pax
                };
                self.state = State::Extension {
                    kind,
                    remaining: header.size,
                    padding,
                    buf: Vec::with_capacity(header.size as usize),
                };
                if header.size == 0 {
                    self.on_extension()?;
                }
                return Ok(Flow::Ready);
            }
            EntryType::GNULongLink | EntryType::XGlobalHeader => {
                // link targets and global attributes don't affect what we report
                self.skip(header.stored_size());
                return Ok(Flow::Ready);
            }
            _ => {}
        }

        let stored_size = header.stored_size();
        let path = self.pending_path.take().unwrap_or(header.path);
        self.entries += 1;

        if header.kind != EntryKind::File {
            log::trace!("skipping {} entry {path}", header.kind);
            let entry = Entry {
                path,
                kind: header.kind,
                size: 0,
                bytes_consumed: 0,
            };
            let flow = self
                .downstream
                .push(EntryEvent::Start(entry.clone()))?
                .and(self.downstream.push(EntryEvent::End(entry))?);
            self.skip(stored_size);
            return Ok(flow);
        }

        log::debug!("entry {path}: {} bytes", header.size);
        let entry = Entry {
            path,
            kind: EntryKind::File,
            size: header.size,
            bytes_consumed: 0,
        };
        let flow = self.downstream.push(EntryEvent::Start(entry.clone()))?;
        self.state = State::Body { entry, padding };
        if header.size == 0 {
            return Ok(flow.and(self.end_entry()?));
        }
        Ok(flow)
    }

    fn on_extension(&mut self) -> Result<()> {
        let State::Extension {
            kind, padding, buf, ..
        } = std::mem::replace(&mut self.state, State::Header)
        else {
            return Ok(());
        };

        match kind {
            Extension::GnuLongName => {
                let name = buf.split(|&b| b == 0).next().unwrap_or_default();
                self.pending_path = Some(String::from_utf8_lossy(name).into_owned());
            }
            Extension::Pax => {
                for item in PaxExtensions::new(&buf) {
                    let extension = item.map_err(|e| {
                        PipelineError::MalformedRecord(format!("pax extension: {e}"))
                    })?;
                    let key = extension.key().map_err(|e| {
                        PipelineError::MalformedRecord(format!("pax key: {e}"))
                    })?;
                    if key == "path" {
                        self.pending_path =
                            Some(String::from_utf8_lossy(extension.value_bytes()).into_owned());
                    }
                }
            }
        }

        self.skip(padding);
        Ok(())
    }

    fn end_entry(&mut self) -> Result<Flow> {
        let State::Body { entry, padding } = std::mem::replace(&mut self.state, State::Header)
        else {
            return Err(PipelineError::OutOfOrderData("end of entry without a header".into()));
        };
        debug_assert!(entry.is_complete());
        log::trace!("entry {} complete", entry.path);
        let flow = self.downstream.push(EntryEvent::End(entry))?;
        self.skip(padding);
        Ok(flow)
    }

    fn skip(&mut self, bytes: u64) {
        self.state = match bytes {
            0 => State::Header,
            remaining => State::Skip { remaining },
        };
    }

    fn check_complete(&self) -> Result<()> {
        match &self.state {
            State::Header if self.header.is_empty() => Ok(()),
            State::End => Ok(()),
            State::Header => Err(PipelineError::TruncatedInput(format!(
                "archive ends inside a header block ({} of {BLOCK_SIZE} bytes)",
                self.header.len()
            ))),
            State::Body { entry, .. } => Err(PipelineError::TruncatedInput(format!(
                "{} declares {} bytes but only {} arrived",
                entry.path, entry.size, entry.bytes_consumed
            ))),
            State::Extension { remaining, .. } => Err(PipelineError::TruncatedInput(format!(
                "archive ends {remaining} bytes short inside an extension header"
            ))),
            State::Skip { remaining } => Err(PipelineError::TruncatedInput(format!(
                "archive ends {remaining} bytes short of a block boundary"
            ))),
        }
    }
}

impl<S: Stage<EntryEvent>> Stage<Bytes> for ContainerParser<S> {
    fn push(&mut self, chunk: Bytes) -> Result<Flow> {
        self.lifecycle.check_open()?;
        let result = self.process(chunk);
        guard(&mut self.lifecycle, &mut self.downstream, result)
    }

    fn finish(&mut self) -> Result<()> {
        if !self.lifecycle.should_finish()? {
            return Ok(());
        }
        let result = self.check_complete();
        guard(&mut self.lifecycle, &mut self.downstream, result)?;
        self.lifecycle.close();

        match self.state {
            // downstream was finished when the terminator arrived
            State::End => Ok(()),
            _ => {
                log::debug!("archive ended without terminator after {} entries", self.entries);
                self.state = State::End;
                self.downstream.finish()
            }
        }
    }

    fn abort(&mut self, error: &PipelineError) {
        if self.lifecycle.begin_abort() {
            log::debug!("container parser aborted: {error}");
            self.downstream.abort(error);
        }
    }

    fn poll_ready(&mut self) -> Result<Flow> {
        self.downstream.poll_ready()
    }

    fn on_backpressure(&mut self, callback: BackpressureCallback) {
        self.downstream.on_backpressure(callback);
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        sink::Collect,
        test::{archive, feed},
    };

    fn parse(data: &[u8], chunk_size: usize) -> (Result<()>, Vec<EntryEvent>) {
        let sink = Collect::new();
        let mut parser = ContainerParser::new(sink.clone());
        let result = feed(&mut parser, data, chunk_size);
        (result, sink.items())
    }

    /// Collapses the event stream into (path, kind, payload) triples.
    fn summarize(events: &[EntryEvent]) -> Vec<(String, EntryKind, Vec<u8>)> {
        let mut out = vec![];
        let mut current: Option<(String, EntryKind, Vec<u8>)> = None;
        for event in events {
            match event {
                EntryEvent::Start(entry) => {
                    assert!(current.is_none(), "two entries open at once");
                    current = Some((entry.path.clone(), entry.kind, vec![]));
                }
                EntryEvent::Data(data) => current.as_mut().unwrap().2.extend_from_slice(data),
                EntryEvent::End(entry) => {
                    assert!(entry.is_complete());
                    out.push(current.take().unwrap());
                }
            }
        }
        assert!(current.is_none(), "entry left open");
        out
    }

    #[test]
    fn test_single_file() {
        let data = archive(&[("a.txt", &b"hello"[..])]);
        // one header, one padded body block, two terminator blocks
        assert_eq!(data.len(), 4 * BLOCK_SIZE);

        let (result, events) = parse(&data, 4096);
        result.unwrap();
        assert_eq!(
            events,
            vec![
                EntryEvent::Start(Entry {
                    path: "a.txt".into(),
                    kind: EntryKind::File,
                    size: 5,
                    bytes_consumed: 0,
                }),
                EntryEvent::Data(Bytes::from_static(b"hello")),
                EntryEvent::End(Entry {
                    path: "a.txt".into(),
                    kind: EntryKind::File,
                    size: 5,
                    bytes_consumed: 5,
                }),
            ]
        );
    }

    #[test]
    fn test_every_chunk_size_gives_same_entries() {
        let big = vec![7u8; 1500];
        let exact = [1u8; 512];
        let data = archive(&[
            ("empty", &b""[..]),
            ("one", &b"x"[..]),
            ("big", &big[..]),
            ("exact", &exact[..]),
        ]);
        let (result, events) = parse(&data, data.len());
        result.unwrap();
        let expected = summarize(&events);
        assert_eq!(expected.len(), 4);

        for chunk_size in [1, 3, 100, 511, 512, 513, 1024] {
            let (result, events) = parse(&data, chunk_size);
            result.unwrap();
            assert_eq!(summarize(&events), expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_directory_entries_have_no_payload() {
        let mut builder = tar::Builder::new(vec![]);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder.append_data(&mut header, "dir", std::io::empty()).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(2);
        builder.append_data(&mut header, "dir/f", &b"hi"[..]).unwrap();
        let data = builder.into_inner().unwrap();

        let (result, events) = parse(&data, 64);
        result.unwrap();
        assert_eq!(
            summarize(&events),
            vec![
                ("dir".to_string(), EntryKind::Directory, vec![]),
                ("dir/f".to_string(), EntryKind::File, b"hi".to_vec()),
            ]
        );
    }

    #[test]
    fn test_gnu_long_name() {
        let long = format!("{}/file.txt", "d".repeat(150));
        let data = archive(&[(long.as_str(), &b"content"[..])]);
        let (result, events) = parse(&data, 100);
        result.unwrap();
        assert_eq!(
            summarize(&events),
            vec![(long, EntryKind::File, b"content".to_vec())]
        );
    }

    #[test]
    fn test_pax_path() {
        let mut builder = tar::Builder::new(vec![]);
        builder
            .append_pax_extensions([("path", &b"pax/override.txt"[..])])
            .unwrap();
        let mut header = tar::Header::new_ustar();
        header.set_mode(0o644);
        header.set_size(3);
        builder.append_data(&mut header, "short", &b"abc"[..]).unwrap();
        let data = builder.into_inner().unwrap();

        let (result, events) = parse(&data, 7);
        result.unwrap();
        assert_eq!(
            summarize(&events),
            vec![("pax/override.txt".to_string(), EntryKind::File, b"abc".to_vec())]
        );
    }

    #[test]
    fn test_checksum_corruption_is_detected_before_payload() {
        let mut data = archive(&[("a.txt", &b"hello"[..])]);
        data[10] ^= 0x01; // inside the name field

        let (result, events) = parse(&data, 4096);
        assert!(matches!(
            result,
            Err(PipelineError::ChecksumMismatch { .. })
        ));
        assert_eq!(events, vec![]);
    }

    #[test]
    fn test_unreadable_checksum_field_is_a_mismatch() {
        let mut data = archive(&[("a.txt", &b"hello"[..])]);
        data[150] = b'x';

        let (result, events) = parse(&data, 4096);
        match result {
            Err(PipelineError::ChecksumMismatch { expected, computed }) => {
                assert!(expected.contains('x'), "{expected}");
                assert_eq!(computed, compute_checksum(&data[..BLOCK_SIZE]));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events, vec![]);
    }

    #[test]
    fn test_truncated_body() {
        let data = archive(&[("a.txt", &b"hello world"[..])]);
        // header plus 4 body bytes
        let (result, events) = parse(&data[..BLOCK_SIZE + 4], 4096);
        assert!(matches!(result, Err(PipelineError::TruncatedInput(_))));
        // the entry was opened and partially streamed, but never ended
        assert!(!events.iter().any(|e| matches!(e, EntryEvent::End(_))));
    }

    #[test]
    fn test_truncated_header() {
        let data = archive(&[("a.txt", &b"hello"[..])]);
        let (result, _) = parse(&data[..100], 4096);
        assert!(matches!(result, Err(PipelineError::TruncatedInput(_))));
    }

    #[test]
    fn test_bytes_after_terminator_are_ignored() {
        let mut data = archive(&[("a.txt", &b"hello"[..])]);
        data.extend_from_slice(b"trailing garbage that is not a header");

        let sink = Collect::new();
        let mut parser = ContainerParser::new(sink.clone());
        feed(&mut parser, &data, 33).unwrap();
        assert!(parser.at_end());
        assert_eq!(parser.entries(), 1);
        assert_eq!(sink.finish_calls(), 1);
    }

    #[test]
    fn test_missing_terminator_is_accepted_at_block_boundary() {
        let data = archive(&[("a.txt", &b"hello"[..])]);
        let (result, events) = parse(&data[..2 * BLOCK_SIZE], 4096);
        result.unwrap();
        assert_eq!(summarize(&events).len(), 1);
    }

    #[test]
    fn test_decode_header_rejects_bad_size() {
        let mut data = archive(&[("a.txt", &b"hello"[..])]);
        data[124..136].copy_from_slice(b"zzzzzzzzzzz\0");
        let checksum = compute_checksum(&data[..BLOCK_SIZE]);
        data[148..156].copy_from_slice(format!("{checksum:06o}\0 ").as_bytes());
        assert!(matches!(
            decode_header(&data[..BLOCK_SIZE]),
            Err(PipelineError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_abort_propagates_once() {
        let sink: Collect<EntryEvent> = Collect::new();
        let mut parser = ContainerParser::new(sink.clone());
        parser.abort(&PipelineError::Closed);
        parser.abort(&PipelineError::Closed);
        assert_eq!(sink.abort_calls(), 1);
        assert!(matches!(
            parser.push(Bytes::from_static(b"x")),
            Err(PipelineError::Closed)
        ));
    }
}
