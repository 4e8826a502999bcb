//! Per-record transform stages.
//!
//! These sit between a [`RecordSplitter`](crate::splitter::RecordSplitter) and a
//! byte sink: grouping, re-serializing, case folding and counting.

use std::{collections::BTreeMap, fmt};

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::{
    error::{PipelineError, Result},
    splitter::Record,
    stage::{guard, BackpressureCallback, Flow, Lifecycle, Stage},
};

fn expect_json(record: Record) -> Result<Value> {
    match record {
        Record::JsonDoc(value) => Ok(value),
        other => Err(PipelineError::MalformedRecord(format!(
            "expected a JSON document, got {other:?}"
        ))),
    }
}

/// A genre and the names of the books that followed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Genre {
    pub name: String,
    pub books: Vec<String>,
}

/// Folds a flat sequence of `{"type":"genre"}` and book records into [`Genre`]s.
///
/// A genre is emitted when the next genre starts or at `finish`, so at most one
/// group is buffered.
#[derive(Debug)]
pub struct GroupStage<S> {
    downstream: S,
    current: Option<Genre>,
    records: u64,
    lifecycle: Lifecycle,
}

impl<S: Stage<Genre>> GroupStage<S> {
    pub fn new(downstream: S) -> Self {
        GroupStage {
            downstream,
            current: None,
            records: 0,
            lifecycle: Lifecycle::default(),
        }
    }

    fn process(&mut self, record: Record) -> Result<Flow> {
        self.records += 1;
        let value = expect_json(record)?;
        let name = match value.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                return Err(PipelineError::MalformedRecord(format!(
                    "record {} has no string \"name\"",
                    self.records
                )))
            }
        };

        if value.get("type").and_then(Value::as_str) == Some("genre") {
            let previous = self.current.replace(Genre { name, books: vec![] });
            return match previous {
                Some(genre) => self.downstream.push(genre),
                None => self.downstream.poll_ready(),
            };
        }

        match &mut self.current {
            Some(genre) => genre.books.push(name),
            None => {
                return Err(PipelineError::OutOfOrderData(format!(
                    "book {name:?} before any genre"
                )))
            }
        }
        self.downstream.poll_ready()
    }
}

impl<S: Stage<Genre>> Stage<Record> for GroupStage<S> {
    fn push(&mut self, record: Record) -> Result<Flow> {
        self.lifecycle.check_open()?;
        let result = self.process(record);
        guard(&mut self.lifecycle, &mut self.downstream, result)
    }

    fn finish(&mut self) -> Result<()> {
        if !self.lifecycle.should_finish()? {
            return Ok(());
        }
        if let Some(genre) = self.current.take() {
            let result = self.downstream.push(genre);
            guard(&mut self.lifecycle, &mut self.downstream, result)?;
        }
        self.lifecycle.close();
        self.downstream.finish()
    }

    fn abort(&mut self, error: &PipelineError) {
        if self.lifecycle.begin_abort() {
            self.current = None;
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

/// Serializes each item as one line of JSON.
#[derive(Debug)]
pub struct JsonLines<S> {
    downstream: S,
    lifecycle: Lifecycle,
}

impl<S: Stage<Bytes>> JsonLines<S> {
    pub fn new(downstream: S) -> Self {
        JsonLines {
            downstream,
            lifecycle: Lifecycle::default(),
        }
    }
}

impl<T: Serialize, S: Stage<Bytes>> Stage<T> for JsonLines<S> {
    fn push(&mut self, item: T) -> Result<Flow> {
        self.lifecycle.check_open()?;
        let result = serde_json::to_vec(&item)
            .map_err(|e| PipelineError::MalformedRecord(e.to_string()))
            .and_then(|mut line| {
                line.push(b'\n');
                self.downstream.push(Bytes::from(line))
            });
        guard(&mut self.lifecycle, &mut self.downstream, result)
    }

    fn finish(&mut self) -> Result<()> {
        if !self.lifecycle.should_finish()? {
            return Ok(());
        }
        self.lifecycle.close();
        self.downstream.finish()
    }

    fn abort(&mut self, error: &PipelineError) {
        if self.lifecycle.begin_abort() {
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

/// Lower-cases even-numbered lines and upper-cases odd-numbered ones (counting
/// from zero), re-terminating each with `\n`.
#[derive(Debug)]
pub struct CaseFold<S> {
    downstream: S,
    index: u64,
    lifecycle: Lifecycle,
}

impl<S: Stage<Bytes>> CaseFold<S> {
    pub fn new(downstream: S) -> Self {
        CaseFold {
            downstream,
            index: 0,
            lifecycle: Lifecycle::default(),
        }
    }

    fn process(&mut self, record: Record) -> Result<Flow> {
        let line = match record {
            Record::Line(line) => line,
            other => {
                return Err(PipelineError::MalformedRecord(format!(
                    "expected a line, got {other:?}"
                )))
            }
        };
        let mut folded = if self.index % 2 == 0 {
            line.to_lowercase()
        } else {
            line.to_uppercase()
        };
        folded.push('\n');
        self.index += 1;
        self.downstream.push(Bytes::from(folded))
    }
}

impl<S: Stage<Bytes>> Stage<Record> for CaseFold<S> {
    fn push(&mut self, record: Record) -> Result<Flow> {
        self.lifecycle.check_open()?;
        let result = self.process(record);
        guard(&mut self.lifecycle, &mut self.downstream, result)
    }

    fn finish(&mut self) -> Result<()> {
        if !self.lifecycle.should_finish()? {
            return Ok(());
        }
        self.lifecycle.close();
        self.downstream.finish()
    }

    fn abort(&mut self, error: &PipelineError) {
        if self.lifecycle.begin_abort() {
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

/// ASCII upper-casing, chunk by chunk.
#[derive(Debug)]
pub struct Uppercase<S> {
    downstream: S,
}

impl<S: Stage<Bytes>> Uppercase<S> {
    pub fn new(downstream: S) -> Self {
        Uppercase { downstream }
    }
}

impl<S: Stage<Bytes>> Stage<Bytes> for Uppercase<S> {
    fn push(&mut self, chunk: Bytes) -> Result<Flow> {
        self.downstream.push(Bytes::from(chunk.to_ascii_uppercase()))
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

pub type Counts = BTreeMap<String, u64>;

/// Counts JSON documents by the value of one field and hands the totals to a
/// callback at `finish`.
///
/// String values are used as-is, anything else by its JSON text.  A document
/// without the field is a [`PipelineError::MalformedRecord`].
pub struct Tally<F> {
    field: String,
    counts: Counts,
    on_counts: Option<F>,
    lifecycle: Lifecycle,
}

impl<F> fmt::Debug for Tally<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tally")
            .field("field", &self.field)
            .field("counts", &self.counts)
            .finish_non_exhaustive()
    }
}

impl<F: FnOnce(Counts)> Tally<F> {
    pub fn new(field: impl Into<String>, on_counts: F) -> Self {
        Tally {
            field: field.into(),
            counts: Counts::new(),
            on_counts: Some(on_counts),
            lifecycle: Lifecycle::default(),
        }
    }

    fn process(&mut self, record: Record) -> Result<()> {
        let value = expect_json(record)?;
        let key = match value.get(&self.field) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                return Err(PipelineError::MalformedRecord(format!(
                    "document has no {:?} field",
                    self.field
                )))
            }
        };
        *self.counts.entry(key).or_default() += 1;
        Ok(())
    }
}

impl<F: FnOnce(Counts)> Stage<Record> for Tally<F> {
    fn push(&mut self, record: Record) -> Result<Flow> {
        self.lifecycle.check_open()?;
        match self.process(record) {
            Ok(()) => Ok(Flow::Ready),
            Err(err) => {
                self.lifecycle.begin_abort();
                Err(err)
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        if !self.lifecycle.should_finish()? {
            return Ok(());
        }
        self.lifecycle.close();
        if let Some(on_counts) = self.on_counts.take() {
            log::debug!("{} distinct {:?} values", self.counts.len(), self.field);
            on_counts(std::mem::take(&mut self.counts));
        }
        Ok(())
    }

    fn abort(&mut self, _error: &PipelineError) {
        if self.lifecycle.begin_abort() {
            self.counts.clear();
            self.on_counts = None;
        }
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, rc::Rc};

    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::sink::Collect;

    fn docs(values: Vec<Value>) -> Vec<Record> {
        values.into_iter().map(Record::JsonDoc).collect()
    }

    fn group(records: Vec<Record>) -> (Result<()>, Vec<Genre>) {
        let sink = Collect::new();
        let mut stage = GroupStage::new(sink.clone());
        let result = records
            .into_iter()
            .try_for_each(|r| stage.push(r).map(drop))
            .and_then(|()| stage.finish());
        (result, sink.items())
    }

    #[test]
    fn test_group_genres() {
        let (result, genres) = group(docs(vec![
            json!({"type": "genre", "name": "cyberpunk"}),
            json!({"type": "book", "name": "Neuromancer"}),
            json!({"type": "book", "name": "Snow Crash"}),
            json!({"type": "genre", "name": "space opera"}),
            json!({"type": "book", "name": "A Deepness in the Sky"}),
        ]));
        result.unwrap();
        assert_eq!(
            genres,
            vec![
                Genre {
                    name: "cyberpunk".into(),
                    books: vec!["Neuromancer".into(), "Snow Crash".into()],
                },
                Genre {
                    name: "space opera".into(),
                    books: vec!["A Deepness in the Sky".into()],
                },
            ]
        );
    }

    #[test]
    fn test_consecutive_genres() {
        let (result, genres) = group(docs(vec![
            json!({"type": "genre", "name": "a"}),
            json!({"type": "genre", "name": "b"}),
        ]));
        result.unwrap();
        assert_eq!(genres.len(), 2);
        assert!(genres.iter().all(|g| g.books.is_empty()));
    }

    #[test]
    fn test_book_before_genre() {
        let (result, genres) = group(docs(vec![json!({"type": "book", "name": "Orphan"})]));
        assert!(matches!(result, Err(PipelineError::OutOfOrderData(_))));
        assert!(genres.is_empty());
    }

    #[test]
    fn test_record_without_name() {
        let (result, _) = group(docs(vec![json!({"type": "genre"})]));
        assert!(matches!(result, Err(PipelineError::MalformedRecord(_))));
    }

    #[test]
    fn test_json_lines() {
        let sink = Collect::new();
        let mut stage = JsonLines::new(sink.clone());
        stage
            .push(Genre {
                name: "x".into(),
                books: vec!["y".into()],
            })
            .unwrap();
        Stage::<Genre>::finish(&mut stage).unwrap();
        assert_eq!(
            String::from_utf8(sink.bytes()).unwrap(),
            "{\"name\":\"x\",\"books\":[\"y\"]}\n"
        );
    }

    #[test]
    fn test_case_fold() {
        let sink = Collect::new();
        let mut stage = CaseFold::new(sink.clone());
        for line in ["One", "Two", "Three", ""] {
            stage.push(Record::Line(line.into())).unwrap();
        }
        stage.finish().unwrap();
        assert_eq!(String::from_utf8(sink.bytes()).unwrap(), "one\nTWO\nthree\n\n");
    }

    #[test]
    fn test_uppercase() {
        let sink = Collect::new();
        let mut stage = Uppercase::new(sink.clone());
        stage.push(Bytes::from_static(b"beep boop\n")).unwrap();
        stage.finish().unwrap();
        assert_eq!(sink.bytes(), b"BEEP BOOP\n");
        assert!(sink.is_finished());
    }

    #[test]
    fn test_tally() {
        let counts = Rc::new(RefCell::new(None));
        let out = counts.clone();
        let mut tally = Tally::new("country", move |c| *out.borrow_mut() = Some(c));
        for doc in docs(vec![
            json!({"country": "NZ"}),
            json!({"country": "AU"}),
            json!({"country": "NZ"}),
            json!({"country": 7}),
        ]) {
            tally.push(doc).unwrap();
        }
        tally.finish().unwrap();

        let counts = counts.borrow_mut().take().unwrap();
        let expected: Counts = [("7", 1), ("AU", 1), ("NZ", 2)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(counts, expected);
    }

    #[test]
    fn test_tally_aborted_reports_nothing() {
        let called = Rc::new(RefCell::new(false));
        let flag = called.clone();
        let mut tally = Tally::new("country", move |_| *flag.borrow_mut() = true);
        tally.push(Record::JsonDoc(json!({"country": "NZ"}))).unwrap();
        tally.abort(&PipelineError::Closed);
        assert!(matches!(tally.finish(), Err(PipelineError::Closed)));
        assert!(!*called.borrow());
    }
}
