//! Sinks: the stages at the end of a chain.
//!
//! [`WriteSink`] adapts any [`Write`] (stdout, a file, a socket) into a byte stage
//! with a bounded output buffer.  [`Collect`] keeps items in memory and is what the
//! tests and the in-process compositions use.

use std::{
    cell::RefCell,
    io::{ErrorKind, Write},
    rc::Rc,
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    error::{PipelineError, Result},
    stage::{BackpressureCallback, Flow, Lifecycle, Stage, Valve},
};

/// Writes bytes to `W`, buffering at most `high_water_mark` bytes.
///
/// When the writer reports `WouldBlock` (a non-blocking socket, for example) the
/// unwritten bytes stay buffered; once the buffer reaches the high-water mark the
/// sink pauses and only resumes after `poll_ready` has drained it.  `finish`
/// keeps draining until the buffer is empty, failing with
/// [`PipelineError::DownstreamBackpressureTimeout`] if the writer stays blocked for
/// longer than the drain timeout.
#[derive(Debug)]
pub struct WriteSink<W: Write> {
    writer: W,
    buffer: Vec<u8>,
    high_water_mark: usize,
    drain_timeout: Duration,
    poll_interval: Duration,
    valve: Valve,
    lifecycle: Lifecycle,
}

impl<W: Write> WriteSink<W> {
    pub fn new(writer: W, high_water_mark: usize) -> Self {
        WriteSink {
            writer,
            buffer: vec![],
            high_water_mark: high_water_mark.max(1),
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            valve: Valve::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    /// How long `finish` waits for a blocked writer, and how often it retries.
    pub fn with_drain_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.drain_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn valve(&self) -> &Valve {
        &self.valve
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Writes as much of the buffer as the writer takes without blocking.
    fn drain(&mut self) -> Result<()> {
        while !self.buffer.is_empty() {
            match self.writer.write(&self.buffer) {
                Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.buffer.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        if self.buffer.is_empty() {
            self.writer.flush()?;
        }
        Ok(())
    }

    /// Drains the whole buffer, waiting out `WouldBlock` up to the drain timeout.
    fn drain_all(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            self.drain()?;
            if self.buffer.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                log::debug!("writer still blocked with {} bytes buffered", self.buffer.len());
                return Err(PipelineError::DownstreamBackpressureTimeout(self.drain_timeout));
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn update_valve(&self) -> Flow {
        if self.buffer.len() >= self.high_water_mark {
            self.valve.pause();
        } else {
            self.valve.resume();
        }
        self.valve.flow()
    }
}

impl<W: Write> Stage<Bytes> for WriteSink<W> {
    fn push(&mut self, chunk: Bytes) -> Result<Flow> {
        self.lifecycle.check_open()?;
        self.buffer.extend_from_slice(&chunk);
        if let Err(err) = self.drain() {
            self.lifecycle.begin_abort();
            return Err(err);
        }
        Ok(self.update_valve())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.lifecycle.should_finish()? {
            return Ok(());
        }
        if let Err(err) = self.drain_all() {
            self.lifecycle.begin_abort();
            return Err(err);
        }
        self.lifecycle.close();
        self.valve.resume();
        Ok(())
    }

    fn abort(&mut self, error: &PipelineError) {
        if self.lifecycle.begin_abort() {
            log::debug!("write sink aborted, dropping {} bytes: {error}", self.buffer.len());
            self.buffer.clear();
        }
    }

    fn poll_ready(&mut self) -> Result<Flow> {
        self.drain()?;
        Ok(self.update_valve())
    }

    fn on_backpressure(&mut self, callback: BackpressureCallback) {
        self.valve.subscribe(callback);
    }
}

#[derive(Debug)]
struct CollectState<T> {
    items: Vec<T>,
    capacity: Option<usize>,
    finish_calls: usize,
    abort_calls: usize,
    abort_reason: Option<String>,
    lifecycle: Lifecycle,
}

/// In-memory sink.  Clones share the same storage, so one handle can be moved into
/// a pipeline while another inspects what arrived.
///
/// A bounded collector pauses once it holds `capacity` items and resumes when the
/// consumer takes them.
#[derive(Debug)]
pub struct Collect<T> {
    state: Rc<RefCell<CollectState<T>>>,
    valve: Valve,
}

impl<T> Clone for Collect<T> {
    fn clone(&self) -> Self {
        Collect {
            state: self.state.clone(),
            valve: self.valve.clone(),
        }
    }
}

impl<T> Default for Collect<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Collect<T> {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Collect {
            state: Rc::new(RefCell::new(CollectState {
                items: vec![],
                capacity,
                finish_calls: 0,
                abort_calls: 0,
                abort_reason: None,
                lifecycle: Lifecycle::default(),
            })),
            valve: Valve::new(),
        }
    }

    /// Removes and returns everything collected so far, resuming a paused sink.
    pub fn take(&self) -> Vec<T> {
        let items = std::mem::take(&mut self.state.borrow_mut().items);
        self.valve.resume();
        items
    }

    pub fn len(&self) -> usize {
        self.state.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().lifecycle == Lifecycle::Finished
    }

    pub fn finish_calls(&self) -> usize {
        self.state.borrow().finish_calls
    }

    pub fn abort_calls(&self) -> usize {
        self.state.borrow().abort_calls
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.state.borrow().abort_reason.clone()
    }

    pub fn valve(&self) -> &Valve {
        &self.valve
    }

    fn update_valve(&self) -> Flow {
        let state = self.state.borrow();
        match state.capacity {
            Some(capacity) if state.items.len() >= capacity => {
                drop(state);
                self.valve.pause();
            }
            _ => {
                drop(state);
                self.valve.resume();
            }
        }
        self.valve.flow()
    }
}

impl<T: Clone> Collect<T> {
    pub fn items(&self) -> Vec<T> {
        self.state.borrow().items.clone()
    }
}

impl Collect<Bytes> {
    /// Concatenates every collected chunk.
    pub fn bytes(&self) -> Vec<u8> {
        self.state.borrow().items.iter().flatten().copied().collect()
    }
}

impl<T> Stage<T> for Collect<T> {
    fn push(&mut self, item: T) -> Result<Flow> {
        {
            let mut state = self.state.borrow_mut();
            state.lifecycle.check_open()?;
            state.items.push(item);
        }
        Ok(self.update_valve())
    }

    fn finish(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.finish_calls += 1;
        if state.lifecycle.should_finish()? {
            state.lifecycle.close();
        }
        Ok(())
    }

    fn abort(&mut self, error: &PipelineError) {
        let mut state = self.state.borrow_mut();
        state.abort_calls += 1;
        if state.lifecycle.begin_abort() {
            state.abort_reason = Some(PipelineError::aborted_by(error).to_string());
        }
    }

    fn poll_ready(&mut self) -> Result<Flow> {
        Ok(self.update_valve())
    }

    fn on_backpressure(&mut self, callback: BackpressureCallback) {
        self.valve.subscribe(callback);
    }
}
