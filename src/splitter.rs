//! Reassembly of delimited records from a byte stream.
//!
//! A [`RecordSplitter`] keeps the bytes it has not yet been able to turn into a
//! record and emits a [`Record`] only once the record's terminator has been fully
//! observed, no matter how the input was chunked.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::{
    container::{decode_header, EntryHeader, BLOCK_SIZE},
    error::{PipelineError, Result},
    stage::{guard, BackpressureCallback, Flow, Lifecycle, Stage},
};

/// A logical unit produced by splitting.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Line(String),
    JsonDoc(Value),
    TarHeader(EntryHeader),
    /// A complete entry body with its block padding removed.
    TarBody(Bytes),
}

/// How record boundaries are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// `\n`-terminated UTF-8 lines; a trailing `\r` is stripped.
    Lines,
    /// Concatenated JSON documents, usually one per line.
    Json,
    /// Tar header blocks and whole entry bodies.
    TarBlocks,
}

/// Tracks where top-level JSON values end without parsing them, so each byte is
/// looked at once however the input is chunked.
#[derive(Debug, Default)]
struct JsonScan {
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Inside a top-level number or literal.
    in_scalar: bool,
    /// Bytes of the buffer already looked at.
    scanned: usize,
    /// End of the last complete top-level value.
    boundary: usize,
    /// Tail length at which an incomplete document is parsed again.
    retry_at: usize,
}

impl JsonScan {
    /// Scans the bytes not seen yet and returns the end of the last complete value.
    fn scan(&mut self, buf: &[u8]) -> usize {
        for (i, &b) in buf.iter().enumerate().skip(self.scanned) {
            if self.in_string {
                match b {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => {
                        self.in_string = false;
                        if self.depth == 0 {
                            self.boundary = i + 1;
                        }
                    }
                    _ => {}
                }
                continue;
            }
            if self.in_scalar {
                if !(b.is_ascii_whitespace() || matches!(b, b'{' | b'[' | b'}' | b']' | b'"')) {
                    continue;
                }
                self.in_scalar = false;
                self.boundary = i;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    // an unbalanced bracket goes to the parser, which rejects it
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        self.boundary = i + 1;
                    }
                }
                _ if b.is_ascii_whitespace() => {}
                _ if self.depth == 0 => self.in_scalar = true,
                _ => {}
            }
        }
        self.scanned = buf.len();
        self.boundary
    }

    /// The first `n` bytes of the buffer were removed.
    fn consumed(&mut self, n: usize) {
        self.scanned -= n;
        self.boundary -= n;
        self.retry_at = 0;
    }
}

#[derive(Debug)]
enum TarState {
    Header,
    Body { size: usize, stored: usize },
    End,
}

/// Byte stage that emits [`Record`]s.
#[derive(Debug)]
pub struct RecordSplitter<S> {
    downstream: S,
    mode: SplitMode,
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known not to contain a newline.
    scanned: usize,
    json: JsonScan,
    tar: TarState,
    records: u64,
    lifecycle: Lifecycle,
}

impl<S: Stage<Record>> RecordSplitter<S> {
    pub fn new(mode: SplitMode, downstream: S) -> Self {
        RecordSplitter {
            downstream,
            mode,
            buffer: BytesMut::new(),
            scanned: 0,
            json: JsonScan::default(),
            tar: TarState::Header,
            records: 0,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn lines(downstream: S) -> Self {
        Self::new(SplitMode::Lines, downstream)
    }

    pub fn json(downstream: S) -> Self {
        Self::new(SplitMode::Json, downstream)
    }

    pub fn tar_blocks(downstream: S) -> Self {
        Self::new(SplitMode::TarBlocks, downstream)
    }

    /// Number of records emitted so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    fn emit(&mut self, record: Record) -> Result<Flow> {
        self.records += 1;
        self.downstream.push(record)
    }

    fn split_lines(&mut self) -> Result<Flow> {
        let mut flow = Flow::Ready;
        while let Some(pos) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(self.scanned + pos + 1);
            self.scanned = 0;
            line.truncate(line.len() - 1);
            flow = flow.and(self.emit_line(line)?);
        }
        self.scanned = self.buffer.len();
        Ok(flow)
    }

    fn emit_line(&mut self, mut line: BytesMut) -> Result<Flow> {
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        let text = String::from_utf8(line.to_vec())
            .map_err(|e| PipelineError::MalformedRecord(format!("line {}: {e}", self.records + 1)))?;
        self.emit(Record::Line(text))
    }

    fn split_json(&mut self) -> Result<Flow> {
        let boundary = self.json.scan(&self.buffer);
        let mut docs = vec![];
        let mut failure = None;

        // everything before the boundary is whole documents, so any error is final
        let stream =
            serde_json::Deserializer::from_slice(&self.buffer[..boundary]).into_iter::<Value>();
        for doc in stream {
            match doc {
                Ok(value) => docs.push(value),
                Err(e) => {
                    failure = Some(self.malformed_json(docs.len(), e));
                    break;
                }
            }
        }
        if failure.is_none() {
            failure = self.check_json_tail(boundary, docs.len());
        }

        if boundary > 0 {
            let _ = self.buffer.split_to(boundary);
            self.json.consumed(boundary);
        }
        let mut flow = Flow::Ready;
        for doc in docs {
            flow = flow.and(self.emit(Record::JsonDoc(doc))?);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(flow),
        }
    }

    /// Parses the incomplete document after `boundary` so that a syntax error
    /// surfaces before its closing bracket arrives.  Only retried once the tail has
    /// doubled in size.
    fn check_json_tail(&mut self, boundary: usize, docs: usize) -> Option<PipelineError> {
        let tail = &self.buffer[boundary..];
        if tail.is_empty() || tail.len() < self.json.retry_at {
            return None;
        }
        self.json.retry_at = tail.len() * 2;
        match serde_json::Deserializer::from_slice(tail).into_iter::<Value>().next() {
            Some(Err(e)) if !e.is_eof() => Some(self.malformed_json(docs, e)),
            _ => None,
        }
    }

    fn malformed_json(&self, docs: usize, e: serde_json::Error) -> PipelineError {
        PipelineError::MalformedRecord(format!(
            "JSON document {}: {e}",
            self.records + docs as u64 + 1
        ))
    }

    fn split_tar(&mut self) -> Result<Flow> {
        let mut flow = Flow::Ready;
        loop {
            match self.tar {
                TarState::End => {
                    self.buffer.clear();
                    return Ok(flow);
                }
                TarState::Header if self.buffer.len() >= BLOCK_SIZE => {
                    let block = self.buffer.split_to(BLOCK_SIZE);
                    match decode_header(&block)? {
                        None => {
                            log::debug!("end of archive after {} records", self.records);
                            self.tar = TarState::End;
                            self.downstream.finish()?;
                        }
                        Some(header) => {
                            let (size, stored) = (header.size as usize, header.stored_size() as usize);
                            if stored > 0 {
                                self.tar = TarState::Body { size, stored };
                            }
                            flow = flow.and(self.emit(Record::TarHeader(header))?);
                        }
                    }
                }
                TarState::Body { size, stored } if self.buffer.len() >= stored => {
                    let mut body = self.buffer.split_to(stored);
                    body.truncate(size);
                    self.tar = TarState::Header;
                    flow = flow.and(self.emit(Record::TarBody(body.freeze()))?);
                }
                _ => return Ok(flow),
            }
        }
    }

    fn process(&mut self, chunk: Bytes) -> Result<Flow> {
        if matches!(self.tar, TarState::End) {
            return Ok(Flow::Ready);
        }
        self.buffer.extend_from_slice(&chunk);
        match self.mode {
            SplitMode::Lines => self.split_lines(),
            SplitMode::Json => self.split_json(),
            SplitMode::TarBlocks => self.split_tar(),
        }
    }

    /// Handles whatever is left in the buffer at end of stream.
    fn flush(&mut self) -> Result<()> {
        match self.mode {
            SplitMode::Lines => {
                if !self.buffer.is_empty() {
                    let line = self.buffer.split();
                    self.emit_line(line)?;
                }
            }
            SplitMode::Json => {
                let rest = self.buffer.split();
                if rest.iter().all(u8::is_ascii_whitespace) {
                    return Ok(());
                }
                let value = serde_json::from_slice::<Value>(&rest).map_err(|e| {
                    if e.is_eof() {
                        PipelineError::TruncatedInput(format!("unterminated JSON document: {e}"))
                    } else {
                        PipelineError::MalformedRecord(format!("JSON document: {e}"))
                    }
                })?;
                self.emit(Record::JsonDoc(value))?;
            }
            SplitMode::TarBlocks => match self.tar {
                TarState::End => {}
                TarState::Header if self.buffer.is_empty() => {}
                TarState::Header => {
                    return Err(PipelineError::TruncatedInput(format!(
                        "archive ends inside a header block ({} of {BLOCK_SIZE} bytes)",
                        self.buffer.len()
                    )))
                }
                TarState::Body { stored, .. } => {
                    return Err(PipelineError::TruncatedInput(format!(
                        "archive ends {} bytes into a {stored} byte body",
                        self.buffer.len()
                    )))
                }
            },
        }
        Ok(())
    }
}

impl<S: Stage<Record>> Stage<Bytes> for RecordSplitter<S> {
    fn push(&mut self, chunk: Bytes) -> Result<Flow> {
        self.lifecycle.check_open()?;
        let result = self.process(chunk);
        guard(&mut self.lifecycle, &mut self.downstream, result)
    }

    fn finish(&mut self) -> Result<()> {
        if !self.lifecycle.should_finish()? {
            return Ok(());
        }
        let result = self.flush();
        guard(&mut self.lifecycle, &mut self.downstream, result)?;
        self.lifecycle.close();
        match self.tar {
            TarState::End => Ok(()),
            _ => self.downstream.finish(),
        }
    }

    fn abort(&mut self, error: &PipelineError) {
        if self.lifecycle.begin_abort() {
            self.buffer.clear();
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
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        container::EntryKind,
        sink::Collect,
        test::{archive, feed},
    };

    fn split(mode: SplitMode, data: &[u8], chunk_size: usize) -> (Result<()>, Vec<Record>) {
        let sink = Collect::new();
        let mut splitter = RecordSplitter::new(mode, sink.clone());
        let result = feed(&mut splitter, data, chunk_size);
        (result, sink.items())
    }

    fn lines(records: &[Record]) -> Vec<&str> {
        records
            .iter()
            .map(|r| match r {
                Record::Line(line) => line.as_str(),
                other => panic!("unexpected record {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_lines_across_chunks() {
        let input = b"first\r\nsecond\n\nfourth without newline";
        for chunk_size in 1..input.len() {
            let (result, records) = split(SplitMode::Lines, input, chunk_size);
            result.unwrap();
            assert_eq!(
                lines(&records),
                vec!["first", "second", "", "fourth without newline"],
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn test_lines_invalid_utf8() {
        let (result, records) = split(SplitMode::Lines, b"ok\n\xff\xfe\n", 64);
        assert!(matches!(result, Err(PipelineError::MalformedRecord(_))));
        assert_eq!(lines(&records), vec!["ok"]);
    }

    #[test]
    fn test_json_documents() {
        let input = br#"{"type":"genre","name":"Sci-Fi"}
{"name":"Dune"}

{"name": "Neuromancer", "tags": ["cyber", {"nested": true}]}
"#;
        let expected = vec![
            Record::JsonDoc(json!({"type": "genre", "name": "Sci-Fi"})),
            Record::JsonDoc(json!({"name": "Dune"})),
            Record::JsonDoc(json!({"name": "Neuromancer", "tags": ["cyber", {"nested": true}]})),
        ];
        for chunk_size in [1, 2, 5, 17, input.len()] {
            let (result, records) = split(SplitMode::Json, input, chunk_size);
            result.unwrap();
            assert_eq!(records, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_json_number_split_across_chunks() {
        let (result, records) = split(SplitMode::Json, b"12 345", 1);
        result.unwrap();
        assert_eq!(
            records,
            vec![Record::JsonDoc(json!(12)), Record::JsonDoc(json!(345))]
        );
    }

    #[test]
    fn test_json_malformed_fails_fast() {
        let sink = Collect::new();
        let mut splitter = RecordSplitter::json(sink.clone());
        let err = splitter
            .push(Bytes::from_static(b"{\"name\":\"a\"}\n{\"name\" 1}\n"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord(_)));
        assert_eq!(sink.items(), vec![Record::JsonDoc(json!({"name": "a"}))]);
        assert_eq!(sink.abort_calls(), 1);
        assert!(matches!(
            splitter.push(Bytes::from_static(b"{}")),
            Err(PipelineError::Closed)
        ));
    }

    #[test]
    fn test_json_large_document_in_small_chunks() {
        let names: Vec<String> = (0..2000).map(|i| format!("book \"{i}\" [{{]}}")).collect();
        let doc = json!({"type": "genre", "name": "big", "books": names});
        let mut input = serde_json::to_vec(&doc).unwrap();
        input.extend_from_slice(b"\n\"tail\" true\n");

        let sink = Collect::new();
        let mut splitter = RecordSplitter::json(sink.clone());
        for chunk in input.chunks(7) {
            splitter.push(Bytes::copy_from_slice(chunk)).unwrap();
            // bytes are scanned once, not re-parsed on every chunk
            assert!(splitter.json.scanned <= splitter.buffer.len());
            assert!(splitter.json.retry_at <= 2 * splitter.buffer.len());
        }
        splitter.finish().unwrap();
        assert_eq!(
            sink.items(),
            vec![
                Record::JsonDoc(doc),
                Record::JsonDoc(json!("tail")),
                Record::JsonDoc(json!(true)),
            ]
        );
    }

    #[test]
    fn test_json_unclosed_malformed_fails_fast() {
        let sink: Collect<Record> = Collect::new();
        let mut splitter = RecordSplitter::json(sink.clone());
        splitter.push(Bytes::from_static(b"{\"name\":")).unwrap();
        let err = splitter
            .push(Bytes::from_static(b" \"a\" \"b\", "))
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord(_)), "{err}");
        assert!(sink.is_empty());
        assert_eq!(sink.abort_calls(), 1);
    }

    #[test]
    fn test_json_truncated_document() {
        let (result, records) = split(SplitMode::Json, b"{\"name\":\"a\"}\n{\"name\":", 4);
        assert!(matches!(result, Err(PipelineError::TruncatedInput(_))));
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_tar_blocks() {
        let data = archive(&[("a.txt", &b"hello"[..]), ("b.txt", &b""[..])]);
        let (result, records) = split(SplitMode::TarBlocks, &data, 100);
        result.unwrap();

        assert_eq!(records.len(), 3);
        match &records[0] {
            Record::TarHeader(header) => {
                assert_eq!(header.path, "a.txt");
                assert_eq!(header.kind, EntryKind::File);
                assert_eq!(header.size, 5);
            }
            other => panic!("unexpected record {other:?}"),
        }
        assert_eq!(records[1], Record::TarBody(Bytes::from_static(b"hello")));
        match &records[2] {
            Record::TarHeader(header) => assert_eq!(header.path, "b.txt"),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_tar_blocks_stop_at_zero_block() {
        let mut data = archive(&[("a.txt", &b"hello"[..])]);
        data.extend_from_slice(&[0xffu8; 1000]);

        let sink = Collect::new();
        let mut splitter = RecordSplitter::tar_blocks(sink.clone());
        feed(&mut splitter, &data, 512).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.finish_calls(), 1);
    }

    #[test]
    fn test_tar_blocks_truncated_body() {
        let data = archive(&[("a.txt", &b"hello"[..])]);
        let (result, records) = split(SplitMode::TarBlocks, &data[..600], 100);
        assert!(matches!(result, Err(PipelineError::TruncatedInput(_))));
        // the header was complete, the body never was
        assert_eq!(records.len(), 1);
    }
}
