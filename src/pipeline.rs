//! Driving a chain of stages from a byte source, and the ready-made chains.

use std::{
    io::{ErrorKind, Read},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    cipher::{CipherSpec, CipherStage},
    compress::{CompressStage, Encoding},
    container::ContainerParser,
    error::{PipelineError, Result},
    hash::{HashAlgorithm, HashStage, Report},
    rewrite::{Rewriter, Selector, SlotWriter},
    splitter::RecordSplitter,
    stage::{Flow, Stage},
    transform::{CaseFold, Counts, GroupStage, JsonLines, Tally, Uppercase},
};

/// Tunables for [`pump`] and the sinks it feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Bytes read from the source per push.
    pub chunk_size: usize,
    /// Output buffered by a [`WriteSink`](crate::sink::WriteSink) before it pauses.
    pub high_water_mark: usize,
    /// How long a paused chain may stay paused before the pipeline fails.
    pub backpressure_timeout: Duration,
    /// Delay between `poll_ready` calls while paused.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            chunk_size: 64 * 1024,
            high_water_mark: 256 * 1024,
            backpressure_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub chunks: u64,
    pub bytes: u64,
    /// Times the chain reported `Paused`.
    pub pauses: u64,
}

/// Reads `source` to the end, pushing each chunk into `head`, then finishes it.
///
/// The source is not read while the chain is paused.  Any failure (a read error, a
/// stage error or a backpressure timeout) aborts `head` and is returned.
pub fn pump(
    source: &mut impl Read,
    head: &mut impl Stage<Bytes>,
    config: &PipelineConfig,
) -> Result<PumpStats> {
    let mut buf = vec![0u8; config.chunk_size.max(1)];
    let chunks = std::iter::from_fn(|| loop {
        match source.read(&mut buf) {
            Ok(0) => return None,
            Ok(n) => return Some(Ok(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Some(Err(PipelineError::from(e))),
        }
    });
    feed(chunks, head, config)
}

/// Like [`pump`], over chunks that are already in memory (or produced lazily).
pub fn feed<I>(chunks: I, head: &mut impl Stage<Bytes>, config: &PipelineConfig) -> Result<PumpStats>
where
    I: IntoIterator<Item = Result<Bytes>>,
{
    let mut stats = PumpStats::default();
    let result = drive(chunks, head, config, &mut stats);
    match result {
        Ok(()) => {
            log::debug!(
                "pumped {} bytes in {} chunks ({} pauses)",
                stats.bytes,
                stats.chunks,
                stats.pauses
            );
            Ok(stats)
        }
        Err(err) => {
            log::debug!("pipeline failed after {} bytes: {err}", stats.bytes);
            head.abort(&err);
            Err(err)
        }
    }
}

fn drive<I>(
    chunks: I,
    head: &mut impl Stage<Bytes>,
    config: &PipelineConfig,
    stats: &mut PumpStats,
) -> Result<()>
where
    I: IntoIterator<Item = Result<Bytes>>,
{
    for chunk in chunks {
        let chunk = chunk?;
        stats.chunks += 1;
        stats.bytes += chunk.len() as u64;
        if head.push(chunk)?.is_paused() {
            stats.pauses += 1;
            wait_ready(head, config)?;
        }
    }
    head.finish()
}

fn wait_ready(head: &mut impl Stage<Bytes>, config: &PipelineConfig) -> Result<()> {
    log::trace!("downstream paused");
    let deadline = Instant::now() + config.backpressure_timeout;
    loop {
        if head.poll_ready()? == Flow::Ready {
            log::trace!("downstream resumed");
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(PipelineError::DownstreamBackpressureTimeout(
                config.backpressure_timeout,
            ));
        }
        thread::sleep(config.poll_interval.min(deadline - now));
    }
}

/// Optional decryption, tar parsing, per-file digests, `<hex> <path>` lines.
pub fn hash_report<S>(
    cipher: Option<&CipherSpec>,
    algorithm: HashAlgorithm,
    sink: S,
) -> Result<Box<dyn Stage<Bytes>>>
where
    S: Stage<Bytes> + 'static,
{
    let parser = ContainerParser::new(HashStage::new(algorithm, Report::new(sink)));
    Ok(match cipher {
        Some(spec) => Box::new(CipherStage::decrypt(spec, parser)?),
        None => Box::new(parser),
    })
}

/// NDJSON genres and books, grouped, one JSON line per genre, compressed.
pub fn group_genres<S: Stage<Bytes>>(encoding: Encoding, sink: S) -> Result<impl Stage<Bytes>> {
    let compress = CompressStage::new(encoding, sink)?;
    Ok(RecordSplitter::json(GroupStage::new(JsonLines::new(compress))))
}

/// Lines with alternating lower and upper case.
pub fn fold_lines<S: Stage<Bytes>>(sink: S) -> impl Stage<Bytes> {
    RecordSplitter::lines(CaseFold::new(sink))
}

pub fn uppercase<S: Stage<Bytes>>(sink: S) -> impl Stage<Bytes> {
    Uppercase::new(sink)
}

/// Upper-cases the inner content of every element matching `selector`.
pub fn rewrite<S: Stage<Bytes>>(selector: Selector, sink: S) -> Result<impl Stage<Bytes>> {
    Rewriter::new(selector, Uppercase::<SlotWriter>::new, sink)
}

/// Counts NDJSON documents by `field`.
pub fn tally<F: FnOnce(Counts)>(field: &str, on_counts: F) -> impl Stage<Bytes> {
    RecordSplitter::json(Tally::new(field, on_counts))
}
