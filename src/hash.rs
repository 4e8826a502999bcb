//! Per-entry content digests and the `<hex> <path>` report.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::{
    container::{Entry, EntryEvent, EntryKind},
    error::{PipelineError, Result},
    stage::{guard, BackpressureCallback, Flow, Lifecycle, Stage},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            _ => Err(PipelineError::MalformedRecord(format!("unknown hash algorithm {s:?}"))),
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// The digest of one completed file entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDigest {
    pub path: String,
    pub digest: Vec<u8>,
}

impl EntryDigest {
    pub fn hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

impl fmt::Display for EntryDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.hex(), self.path)
    }
}

/// Hashes the payload of each file entry and emits an [`EntryDigest`] when the
/// entry ends.  Directories and other non-file entries produce nothing.
pub struct HashStage<S> {
    downstream: S,
    algorithm: HashAlgorithm,
    /// The open entry; the hasher is `None` for entries that are not hashed.
    open: Option<(String, Option<Hasher>)>,
    lifecycle: Lifecycle,
}

impl<S> fmt::Debug for HashStage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashStage")
            .field("algorithm", &self.algorithm)
            .field("open", &self.open.as_ref().map(|(path, _)| path))
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl<S: Stage<EntryDigest>> HashStage<S> {
    pub fn new(algorithm: HashAlgorithm, downstream: S) -> Self {
        HashStage {
            downstream,
            algorithm,
            open: None,
            lifecycle: Lifecycle::default(),
        }
    }

    fn start(&mut self, entry: Entry) -> Result<Flow> {
        if let Some((path, _)) = &self.open {
            return Err(PipelineError::OutOfOrderData(format!(
                "{} started while {path} is still open",
                entry.path
            )));
        }
        let hasher = (entry.kind == EntryKind::File).then(|| self.algorithm.hasher());
        self.open = Some((entry.path, hasher));
        self.downstream.poll_ready()
    }

    fn data(&mut self, data: &[u8]) -> Result<Flow> {
        match &mut self.open {
            Some((_, Some(hasher))) => hasher.update(data),
            Some((path, None)) => {
                return Err(PipelineError::MalformedRecord(format!(
                    "payload for non-file entry {path}"
                )))
            }
            None => return Err(PipelineError::OutOfOrderData("payload outside of an entry".into())),
        }
        self.downstream.poll_ready()
    }

    fn end(&mut self, entry: Entry) -> Result<Flow> {
        let Some((path, hasher)) = self.open.take() else {
            return Err(PipelineError::OutOfOrderData(format!(
                "end of {} without a start",
                entry.path
            )));
        };
        if !entry.is_complete() {
            return Err(PipelineError::TruncatedInput(format!(
                "{path}: {} of {} bytes",
                entry.bytes_consumed, entry.size
            )));
        }
        match hasher {
            Some(hasher) => {
                let digest = EntryDigest {
                    path,
                    digest: hasher.finalize(),
                };
                log::trace!("{digest}");
                self.downstream.push(digest)
            }
            None => self.downstream.poll_ready(),
        }
    }
}

impl<S: Stage<EntryDigest>> Stage<EntryEvent> for HashStage<S> {
    fn push(&mut self, event: EntryEvent) -> Result<Flow> {
        self.lifecycle.check_open()?;
        let result = match event {
            EntryEvent::Start(entry) => self.start(entry),
            EntryEvent::Data(data) => self.data(&data),
            EntryEvent::End(entry) => self.end(entry),
        };
        guard(&mut self.lifecycle, &mut self.downstream, result)
    }

    fn finish(&mut self) -> Result<()> {
        if !self.lifecycle.should_finish()? {
            return Ok(());
        }
        let result = match self.open.take() {
            Some((path, _)) => Err(PipelineError::TruncatedInput(format!(
                "stream ended inside {path}"
            ))),
            None => Ok(()),
        };
        guard(&mut self.lifecycle, &mut self.downstream, result)?;
        self.lifecycle.close();
        self.downstream.finish()
    }

    fn abort(&mut self, error: &PipelineError) {
        if self.lifecycle.begin_abort() {
            self.open = None;
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

/// Formats each digest as a `<hex> <path>\n` line.
#[derive(Debug)]
pub struct Report<S> {
    downstream: S,
}

impl<S: Stage<Bytes>> Report<S> {
    pub fn new(downstream: S) -> Self {
        Report { downstream }
    }
}

impl<S: Stage<Bytes>> Stage<EntryDigest> for Report<S> {
    fn push(&mut self, digest: EntryDigest) -> Result<Flow> {
        self.downstream.push(Bytes::from(format!("{digest}\n")))
    }

    fn finish(&mut self) -> Result<()> {
        self.downstream.finish()
    }

    fn abort(&mut self, error: &PipelineError) {
        self.downstream.abort(error);
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
    use crate::sink::Collect;

    fn entry(path: &str, kind: EntryKind, size: u64, bytes_consumed: u64) -> Entry {
        Entry {
            path: path.into(),
            kind,
            size,
            bytes_consumed,
        }
    }

    fn hash_file(algorithm: HashAlgorithm, chunks: &[&[u8]]) -> EntryDigest {
        let sink = Collect::new();
        let mut stage = HashStage::new(algorithm, sink.clone());
        let size = chunks.iter().map(|c| c.len() as u64).sum();
        stage
            .push(EntryEvent::Start(entry("a.txt", EntryKind::File, size, 0)))
            .unwrap();
        for chunk in chunks {
            stage.push(EntryEvent::Data(Bytes::copy_from_slice(chunk))).unwrap();
        }
        stage
            .push(EntryEvent::End(entry("a.txt", EntryKind::File, size, size)))
            .unwrap();
        stage.finish().unwrap();
        let mut digests = sink.take();
        assert_eq!(digests.len(), 1);
        digests.remove(0)
    }

    #[test]
    fn test_md5() {
        let digest = hash_file(HashAlgorithm::Md5, &[&b"he"[..], &b"llo"[..]]);
        assert_eq!(digest.to_string(), "5d41402abc4b2a76b9719d911017c592 a.txt");
        let empty = hash_file(HashAlgorithm::Md5, &[]);
        assert_eq!(empty.hex(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_sha256() {
        let digest = hash_file(HashAlgorithm::Sha256, &[&b"hello"[..]]);
        assert_eq!(
            digest.hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_directories_produce_nothing() {
        let sink = Collect::new();
        let mut stage = HashStage::new(HashAlgorithm::Md5, sink.clone());
        stage
            .push(EntryEvent::Start(entry("dir", EntryKind::Directory, 0, 0)))
            .unwrap();
        stage
            .push(EntryEvent::End(entry("dir", EntryKind::Directory, 0, 0)))
            .unwrap();
        stage.finish().unwrap();
        assert!(sink.is_empty());
        assert!(sink.is_finished());
    }

    #[test]
    fn test_incomplete_entry() {
        let sink = Collect::new();
        let mut stage = HashStage::new(HashAlgorithm::Md5, sink.clone());
        stage
            .push(EntryEvent::Start(entry("a.txt", EntryKind::File, 10, 0)))
            .unwrap();
        let err = stage
            .push(EntryEvent::End(entry("a.txt", EntryKind::File, 10, 4)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::TruncatedInput(_)));
        assert!(sink.is_empty());
        assert_eq!(sink.abort_calls(), 1);
    }

    #[test]
    fn test_finish_inside_entry() {
        let sink: Collect<EntryDigest> = Collect::new();
        let mut stage = HashStage::new(HashAlgorithm::Md5, sink.clone());
        stage
            .push(EntryEvent::Start(entry("a.txt", EntryKind::File, 10, 0)))
            .unwrap();
        assert!(matches!(stage.finish(), Err(PipelineError::TruncatedInput(_))));
        assert_eq!(sink.finish_calls(), 0);
        assert_eq!(sink.abort_calls(), 1);
    }

    #[test]
    fn test_report_lines() {
        let sink = Collect::new();
        let mut report = Report::new(sink.clone());
        report
            .push(EntryDigest {
                path: "dir/b.txt".into(),
                digest: vec![0xab, 0xcd],
            })
            .unwrap();
        report.finish().unwrap();
        assert_eq!(sink.bytes(), b"abcd dir/b.txt\n");
    }
}
