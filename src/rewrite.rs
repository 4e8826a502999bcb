//! The duplex rewrite loop.
//!
//! A [`Rewriter`] runs an HTML byte stream through [`lol_html`], which tokenizes it
//! and matches elements against a CSS [`Selector`].  The inner content of every
//! match is streamed through a transform built for that match, and the transform's
//! output lands back in the original position.  Ordering is kept by a
//! [`SpliceBuffer`]: an append-only sequence of passthrough segments and reserved
//! slots.  Only the prefix of the buffer that no longer depends on an open slot is
//! flushed downstream.

use std::{borrow::Cow, cell::RefCell, collections::VecDeque, fmt, rc::Rc, str::FromStr};

use bytes::Bytes;
use lol_html::{
    errors::RewritingError, ElementContentHandlers, HtmlRewriter, MemorySettings, OutputSink,
    Settings,
};

use crate::{
    error::{PipelineError, Result},
    stage::{guard, BackpressureCallback, Flow, Lifecycle, Stage},
};

/// Default cap on the bytes the tokenizer may hold for one incomplete tag or
/// comment.
pub const MARKUP_LIMIT: usize = 64 * 1024;

/// A CSS selector, e.g. `.loud`, `p#main`, `div.a.b`, `b, i`.
///
/// Validated on parse and compiled again for every [`Rewriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
}

impl Selector {
    fn compile(&self) -> Result<lol_html::Selector> {
        self.source
            .parse()
            .map_err(|e| PipelineError::MalformedRecord(format!("selector {:?}: {e}", self.source)))
    }
}

impl FromStr for Selector {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let selector = Selector {
            source: s.trim().to_string(),
        };
        selector.compile()?;
        Ok(selector)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Passthrough,
    Slot(u64),
}

#[derive(Debug)]
struct Segment {
    kind: SegmentKind,
    data: Vec<Bytes>,
    closed: bool,
}

#[derive(Debug, Default)]
struct SpliceState {
    segments: VecDeque<Segment>,
    next_slot: u64,
    failure: Option<String>,
}

/// Append-only sequence of passthrough bytes and reserved slots.
#[derive(Debug, Clone, Default)]
pub struct SpliceBuffer {
    inner: Rc<RefCell<SpliceState>>,
}

impl SpliceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes after everything reserved so far.
    pub fn passthrough(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut state = self.inner.borrow_mut();
        match state.segments.back_mut() {
            Some(segment) if segment.kind == SegmentKind::Passthrough && !segment.closed => {
                segment.data.push(data)
            }
            _ => state.segments.push_back(Segment {
                kind: SegmentKind::Passthrough,
                data: vec![data],
                closed: false,
            }),
        }
    }

    /// Reserves a slot at the current end of the buffer.
    pub fn open_slot(&self) -> SlotWriter {
        let mut state = self.inner.borrow_mut();
        if let Some(segment) = state.segments.back_mut() {
            if segment.kind == SegmentKind::Passthrough {
                segment.closed = true;
            }
        }
        let id = state.next_slot;
        state.next_slot += 1;
        state.segments.push_back(Segment {
            kind: SegmentKind::Slot(id),
            data: vec![],
            closed: false,
        });
        SlotWriter {
            buffer: self.clone(),
            id,
        }
    }

    /// Marks the trailing passthrough segment complete.
    pub fn close(&self) {
        let mut state = self.inner.borrow_mut();
        if let Some(segment) = state.segments.back_mut() {
            if segment.kind == SegmentKind::Passthrough {
                segment.closed = true;
            }
        }
    }

    /// Removes and returns the bytes that are ready to go downstream: everything up
    /// to, and including what has been written so far into, the first open segment.
    pub fn take_ready(&self) -> Vec<Bytes> {
        let mut state = self.inner.borrow_mut();
        let mut ready = vec![];
        while let Some(front) = state.segments.front_mut() {
            ready.append(&mut front.data);
            if !front.closed {
                break;
            }
            state.segments.pop_front();
        }
        ready
    }

    /// Number of slots whose writer has not finished yet.
    pub fn open_slots(&self) -> usize {
        self.inner
            .borrow()
            .segments
            .iter()
            .filter(|s| matches!(s.kind, SegmentKind::Slot(_)) && !s.closed)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().segments.is_empty()
    }

    fn failure(&self) -> Option<String> {
        self.inner.borrow().failure.clone()
    }

    fn with_slot<T>(&self, id: u64, f: impl FnOnce(&mut Segment) -> T) -> Result<T> {
        let mut state = self.inner.borrow_mut();
        state
            .segments
            .iter_mut()
            .find(|s| s.kind == SegmentKind::Slot(id))
            .map(f)
            .ok_or(PipelineError::Closed)
    }
}

/// The write side of one reserved slot.  Finishing it releases everything behind
/// the slot for flushing.
#[derive(Debug)]
pub struct SlotWriter {
    buffer: SpliceBuffer,
    id: u64,
}

impl Stage<Bytes> for SlotWriter {
    fn push(&mut self, chunk: Bytes) -> Result<Flow> {
        self.buffer.with_slot(self.id, |slot| {
            if slot.closed {
                return Err(PipelineError::Closed);
            }
            if !chunk.is_empty() {
                slot.data.push(chunk);
            }
            Ok(Flow::Ready)
        })?
    }

    fn finish(&mut self) -> Result<()> {
        // a slot that was already flushed and dropped is finished too
        let _ = self.buffer.with_slot(self.id, |slot| slot.closed = true);
        Ok(())
    }

    fn abort(&mut self, error: &PipelineError) {
        let mut state = self.buffer.inner.borrow_mut();
        if state.failure.is_none() {
            state.failure = Some(error.to_string());
        }
    }
}

/// What the tokenizer produced, in output order.
#[derive(Debug)]
enum Event {
    Passthrough(Bytes),
    /// The start tag of a match is out; its content follows.
    Open,
    Content(Bytes),
    /// The end tag of a match is next.
    Close,
}

/// Shared between the tokenizer callbacks and the [`Rewriter`].
#[derive(Debug, Default)]
struct Scan {
    events: VecDeque<Event>,
    /// Open matched elements, counting nested matches.
    depth: usize,
    /// A match started but its start tag has not been written yet.
    pending: bool,
    inside: bool,
    matches: u64,
}

impl Scan {
    /// Opens the slot of a pending match once its start tag has been written.
    fn resolve(&mut self) {
        if self.pending {
            self.pending = false;
            self.inside = true;
            self.events.push_back(Event::Open);
        }
    }

    fn enter(&mut self) {
        if self.depth == 0 {
            self.pending = true;
            self.matches += 1;
        } else {
            self.resolve();
        }
        self.depth += 1;
    }

    fn leave(&mut self) {
        self.resolve();
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.close();
        }
    }

    fn close(&mut self) {
        if self.inside {
            self.inside = false;
            self.events.push_back(Event::Close);
        }
    }

    fn output(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let data = Bytes::copy_from_slice(chunk);
        self.events.push_back(if self.inside {
            Event::Content(data)
        } else {
            Event::Passthrough(data)
        });
    }
}

struct Output(Rc<RefCell<Scan>>);

impl OutputSink for Output {
    fn handle_chunk(&mut self, chunk: &[u8]) {
        self.0.borrow_mut().output(chunk);
    }
}

fn tokenizer(
    selector: &Selector,
    scan: &Rc<RefCell<Scan>>,
    limit: usize,
) -> Result<HtmlRewriter<'static, Output>> {
    // any element inside a pending match means its start tag is out
    let any = {
        let scan = scan.clone();
        ElementContentHandlers::default().element(move |_| {
            scan.borrow_mut().resolve();
            Ok(())
        })
    };

    let (on_element, on_text, on_comment) = (scan.clone(), scan.clone(), scan.clone());
    let matched = ElementContentHandlers::default()
        .element(move |el| {
            // void elements have no content to rewrite
            if let Some(handlers) = el.end_tag_handlers() {
                on_element.borrow_mut().enter();
                let scan = on_element.clone();
                handlers.push(Box::new(move |_end| {
                    scan.borrow_mut().leave();
                    Ok(())
                }));
            }
            Ok(())
        })
        .text(move |_| {
            on_text.borrow_mut().resolve();
            Ok(())
        })
        .comments(move |_| {
            on_comment.borrow_mut().resolve();
            Ok(())
        });

    let all: lol_html::Selector = "*"
        .parse()
        .map_err(|e| PipelineError::MalformedRecord(format!("selector \"*\": {e}")))?;
    let settings = Settings {
        // registration order is call order for an element matching both
        element_content_handlers: vec![
            (Cow::Owned(all), any),
            (Cow::Owned(selector.compile()?), matched),
        ],
        memory_settings: MemorySettings {
            preallocated_parsing_buffer_size: limit.min(1024),
            max_allowed_memory_usage: limit,
        },
        ..Settings::default()
    };
    Ok(HtmlRewriter::new(settings, Output(scan.clone())))
}

/// Rewrites the inner content of every element matching `selector`.
///
/// `factory` is called once per match with the [`SlotWriter`] the transform must
/// write its output to (and finish).  A nested match is part of the content of the
/// outer one.  An element left open at end of input is closed there.
pub struct Rewriter<F, T, S> {
    selector: Selector,
    html: Option<HtmlRewriter<'static, Output>>,
    scan: Rc<RefCell<Scan>>,
    limit: usize,
    factory: F,
    transform: Option<T>,
    downstream: S,
    buffer: SpliceBuffer,
    lifecycle: Lifecycle,
}

impl<F, T, S> fmt::Debug for Rewriter<F, T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rewriter")
            .field("selector", &self.selector)
            .field("scan", &self.scan)
            .field("buffer", &self.buffer)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl<F, T, S> Rewriter<F, T, S>
where
    F: FnMut(SlotWriter) -> T,
    T: Stage<Bytes>,
    S: Stage<Bytes>,
{
    pub fn new(selector: Selector, factory: F, downstream: S) -> Result<Self> {
        Self::with_limit(selector, factory, downstream, MARKUP_LIMIT)
    }

    /// Like [`Rewriter::new`], failing with [`PipelineError::MalformedRecord`] once
    /// a single tag or comment needs more than `limit` bytes of buffering.
    pub fn with_limit(selector: Selector, factory: F, downstream: S, limit: usize) -> Result<Self> {
        let scan = Rc::new(RefCell::new(Scan::default()));
        let html = tokenizer(&selector, &scan, limit)?;
        Ok(Rewriter {
            selector,
            html: Some(html),
            scan,
            limit,
            factory,
            transform: None,
            downstream,
            buffer: SpliceBuffer::new(),
            lifecycle: Lifecycle::default(),
        })
    }

    /// Number of matched elements so far.
    pub fn matches(&self) -> u64 {
        self.scan.borrow().matches
    }

    fn rewriting_error(&self, err: RewritingError) -> PipelineError {
        match err {
            RewritingError::MemoryLimitExceeded(_) => PipelineError::MalformedRecord(format!(
                "unterminated markup longer than {} bytes",
                self.limit
            )),
            other => PipelineError::MalformedRecord(format!("html: {other}")),
        }
    }

    fn next_event(&self) -> Option<Event> {
        self.scan.borrow_mut().events.pop_front()
    }

    /// Moves tokenizer output into the splice buffer and the active transform.
    fn apply(&mut self) -> Result<Flow> {
        let mut flow = Flow::Ready;
        while let Some(event) = self.next_event() {
            match event {
                Event::Passthrough(data) => self.buffer.passthrough(data),
                Event::Open => {
                    log::trace!("match {} opens a slot", self.matches());
                    self.transform = Some((self.factory)(self.buffer.open_slot()));
                }
                Event::Content(data) => match &mut self.transform {
                    Some(transform) => flow = flow.and(transform.push(data)?),
                    None => self.buffer.passthrough(data),
                },
                Event::Close => {
                    if let Some(mut transform) = self.transform.take() {
                        transform.finish()?;
                    }
                }
            }
        }
        Ok(flow)
    }

    fn process(&mut self, chunk: Bytes) -> Result<Flow> {
        let html = self.html.as_mut().ok_or(PipelineError::Closed)?;
        if let Err(err) = html.write(&chunk) {
            // the tokenizer cannot be used after an error
            self.html = None;
            return Err(self.rewriting_error(err));
        }
        let flow = self.apply()?;
        self.check_slots()?;
        Ok(flow.and(self.flush()?))
    }

    fn check_slots(&self) -> Result<()> {
        match self.buffer.failure() {
            Some(reason) => Err(PipelineError::Aborted(reason)),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> Result<Flow> {
        let mut flow = Flow::Ready;
        for data in self.buffer.take_ready() {
            flow = flow.and(self.downstream.push(data)?);
        }
        Ok(flow)
    }

    fn end(&mut self) -> Result<()> {
        if let Some(html) = self.html.take() {
            html.end().map_err(|e| self.rewriting_error(e))?;
        }
        {
            let mut scan = self.scan.borrow_mut();
            if scan.depth > 0 {
                log::debug!("{} matched element(s) still open at end of input", scan.depth);
                scan.resolve();
                scan.depth = 0;
                scan.close();
            }
        }
        self.apply()?;
        self.buffer.close();
        self.check_slots()?;

        let open = self.buffer.open_slots();
        if open > 0 {
            return Err(PipelineError::TruncatedInput(format!(
                "{open} rewrite slot(s) never finished"
            )));
        }
        self.flush()?;
        log::debug!("rewrote {} element(s)", self.matches());
        Ok(())
    }
}

impl<F, T, S> Stage<Bytes> for Rewriter<F, T, S>
where
    F: FnMut(SlotWriter) -> T,
    T: Stage<Bytes>,
    S: Stage<Bytes>,
{
    fn push(&mut self, chunk: Bytes) -> Result<Flow> {
        self.lifecycle.check_open()?;
        let result = self.process(chunk);
        if let (Err(err), Some(transform)) = (&result, self.transform.as_mut()) {
            if self.lifecycle == Lifecycle::Open {
                transform.abort(err);
            }
        }
        guard(&mut self.lifecycle, &mut self.downstream, result)
    }

    fn finish(&mut self) -> Result<()> {
        if !self.lifecycle.should_finish()? {
            return Ok(());
        }
        let result = self.end();
        guard(&mut self.lifecycle, &mut self.downstream, result)?;
        self.lifecycle.close();
        self.downstream.finish()
    }

    fn abort(&mut self, error: &PipelineError) {
        if self.lifecycle.begin_abort() {
            self.html = None;
            if let Some(mut transform) = self.transform.take() {
                transform.abort(error);
            }
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
