//! Streaming compression and content-encoding negotiation.

use std::{fmt, io::Write, str::FromStr};

use bytes::Bytes;
use flate2::{
    write::{GzEncoder, ZlibEncoder},
    Compression,
};

use crate::{
    error::{PipelineError, Result},
    stage::{guard, BackpressureCallback, Flow, Lifecycle, Stage},
};

/// Brotli quality used when no level is given.
const BROTLI_QUALITY: u32 = 11;
/// Brotli window size, log2.
const BROTLI_LGWIN: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// zlib-wrapped deflate, as HTTP's `deflate` token means.
    Deflate,
    Brotli,
    Gzip,
    Zstd,
}

impl Encoding {
    /// Server preference order, used to break ties.
    pub const SUPPORTED: [Encoding; 4] = [
        Encoding::Deflate,
        Encoding::Brotli,
        Encoding::Gzip,
        Encoding::Zstd,
    ];

    /// The `Accept-Encoding` token.
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Deflate => "deflate",
            Encoding::Brotli => "br",
            Encoding::Gzip => "gzip",
            Encoding::Zstd => "zstd",
        }
    }

    /// Picks an encoding from an `Accept-Encoding` style list such as
    /// `"br;q=1.0, gzip;q=0.8, *;q=0.1"`.
    ///
    /// Candidates are ranked by quality, then by an explicit name beating `*`, then
    /// by their position in `accept`.  Entries with `q=0` are refused.
    pub fn negotiate(accept: &str) -> Result<Encoding> {
        let entries: Vec<(&str, f32)> = accept
            .split(',')
            .filter_map(|item| {
                let mut parts = item.split(';');
                let name = parts.next()?.trim();
                if name.is_empty() {
                    return None;
                }
                let q = parts
                    .filter_map(|p| p.trim().strip_prefix("q="))
                    .find_map(|q| q.trim().parse::<f32>().ok())
                    .unwrap_or(1.0);
                Some((name, q))
            })
            .collect();

        let mut best: Option<(f32, u8, usize, usize, Encoding)> = None;
        for (pref, encoding) in Self::SUPPORTED.into_iter().enumerate() {
            let matched = entries
                .iter()
                .enumerate()
                .filter_map(|(order, (name, q))| {
                    if name.eq_ignore_ascii_case(encoding.name()) {
                        Some((*q, 1, order))
                    } else if *name == "*" {
                        Some((*q, 0, order))
                    } else {
                        None
                    }
                })
                // an explicit entry overrides the wildcard
                .max_by_key(|(_, specificity, _)| *specificity);

            let Some((q, specificity, order)) = matched else {
                continue;
            };
            if q <= 0.0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((bq, bs, bo, bp, _)) => {
                    (q, specificity) > (bq, bs) || ((q, specificity) == (bq, bs) && (order, pref) < (bo, bp))
                }
            };
            if better {
                best = Some((q, specificity, order, pref, encoding));
            }
        }

        match best {
            Some((.., encoding)) => {
                log::debug!("negotiated {} from {accept:?}", encoding.name());
                Ok(encoding)
            }
            None => Err(PipelineError::UnsupportedEncoding(accept.to_string())),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::SUPPORTED
            .into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::UnsupportedEncoding(s.to_string()))
    }
}

enum Encoder {
    Deflate(ZlibEncoder<Vec<u8>>),
    Brotli(Box<brotli::CompressorWriter<Vec<u8>>>),
    Gzip(GzEncoder<Vec<u8>>),
    Zstd(zstd::Encoder<'static, Vec<u8>>),
}

impl Encoder {
    fn new(encoding: Encoding, level: Option<u32>) -> Result<Self> {
        Ok(match encoding {
            Encoding::Deflate => Encoder::Deflate(ZlibEncoder::new(vec![], flate_level(level))),
            Encoding::Brotli => Encoder::Brotli(Box::new(brotli::CompressorWriter::new(
                vec![],
                4096,
                level.map_or(BROTLI_QUALITY, |level| level.min(11)),
                BROTLI_LGWIN,
            ))),
            Encoding::Gzip => Encoder::Gzip(GzEncoder::new(vec![], flate_level(level))),
            Encoding::Zstd => Encoder::Zstd(zstd::Encoder::new(vec![], level.unwrap_or(0) as i32)?),
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let out = match self {
            Encoder::Deflate(e) => {
                e.write_all(data)?;
                e.get_mut()
            }
            Encoder::Brotli(e) => {
                e.write_all(data)?;
                e.get_mut()
            }
            Encoder::Gzip(e) => {
                e.write_all(data)?;
                e.get_mut()
            }
            Encoder::Zstd(e) => {
                e.write_all(data)?;
                e.get_mut()
            }
        };
        Ok(std::mem::take(out))
    }

    fn finish(self) -> Result<Vec<u8>> {
        Ok(match self {
            Encoder::Deflate(e) => e.finish()?,
            Encoder::Brotli(e) => e.into_inner(),
            Encoder::Gzip(e) => e.finish()?,
            Encoder::Zstd(e) => e.finish()?,
        })
    }
}

fn flate_level(level: Option<u32>) -> Compression {
    match level {
        Some(level @ 0..=9) => Compression::new(level),
        _ => Compression::default(),
    }
}

/// Compresses the byte stream, forwarding compressed output as the encoder
/// produces it.
pub struct CompressStage<S> {
    downstream: S,
    encoding: Encoding,
    encoder: Option<Encoder>,
    bytes_in: u64,
    bytes_out: u64,
    lifecycle: Lifecycle,
}

impl<S> fmt::Debug for CompressStage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressStage")
            .field("encoding", &self.encoding)
            .field("bytes_in", &self.bytes_in)
            .field("bytes_out", &self.bytes_out)
            .finish_non_exhaustive()
    }
}

impl<S: Stage<Bytes>> CompressStage<S> {
    pub fn new(encoding: Encoding, downstream: S) -> Result<Self> {
        Self::with_level(encoding, None, downstream)
    }

    /// `level` is 0-9 for gzip/deflate, 0-11 for brotli and the zstd level for
    /// zstd; `None` picks the codec default.
    pub fn with_level(encoding: Encoding, level: Option<u32>, downstream: S) -> Result<Self> {
        Ok(CompressStage {
            downstream,
            encoding,
            encoder: Some(Encoder::new(encoding, level)?),
            bytes_in: 0,
            bytes_out: 0,
            lifecycle: Lifecycle::default(),
        })
    }

    pub fn gzip(downstream: S) -> Result<Self> {
        Self::new(Encoding::Gzip, downstream)
    }

    fn forward(&mut self, out: Vec<u8>) -> Result<Flow> {
        if out.is_empty() {
            return self.downstream.poll_ready();
        }
        self.bytes_out += out.len() as u64;
        self.downstream.push(Bytes::from(out))
    }

    fn process(&mut self, chunk: &[u8]) -> Result<Flow> {
        self.bytes_in += chunk.len() as u64;
        let out = match self.encoder.as_mut() {
            Some(encoder) => encoder.write(chunk)?,
            None => return Err(PipelineError::Closed),
        };
        self.forward(out)
    }

    fn flush(&mut self) -> Result<()> {
        let out = match self.encoder.take() {
            Some(encoder) => encoder.finish()?,
            None => return Err(PipelineError::Closed),
        };
        self.forward(out)?;
        log::debug!(
            "{}: {} bytes in, {} bytes out",
            self.encoding,
            self.bytes_in,
            self.bytes_out
        );
        Ok(())
    }
}

impl<S: Stage<Bytes>> Stage<Bytes> for CompressStage<S> {
    fn push(&mut self, chunk: Bytes) -> Result<Flow> {
        self.lifecycle.check_open()?;
        let result = self.process(&chunk);
        guard(&mut self.lifecycle, &mut self.downstream, result)
    }

    fn finish(&mut self) -> Result<()> {
        if !self.lifecycle.should_finish()? {
            return Ok(());
        }
        let result = self.flush();
        guard(&mut self.lifecycle, &mut self.downstream, result)?;
        self.lifecycle.close();
        self.downstream.finish()
    }

    fn abort(&mut self, error: &PipelineError) {
        if self.lifecycle.begin_abort() {
            self.encoder = None;
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
