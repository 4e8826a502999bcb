//! Incremental symmetric encryption and decryption.
//!
//! The cipher context (chaining value or counter) lives in the stage and carries
//! across chunk boundaries, so each chunk is transformed as soon as it arrives.  CBC
//! decryption is the one exception: the last complete block is held back until
//! `finish` so its PKCS#7 padding can be checked and removed.

use std::{fmt, str::FromStr};

use aes::{
    cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher},
    Aes128, Aes192, Aes256,
};
use bytes::Bytes;
use cbc::cipher::block_padding::{Pkcs7, RawPadding};

use crate::{
    error::{PipelineError, Result},
    stage::{guard, BackpressureCallback, Flow, Lifecycle, Stage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Decrypt,
    Encrypt,
}

/// Supported algorithms, named the way OpenSSL names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Aes128Cbc => "aes-128-cbc",
            Algorithm::Aes192Cbc => "aes-192-cbc",
            Algorithm::Aes256Cbc => "aes-256-cbc",
            Algorithm::Aes128Ctr => "aes-128-ctr",
            Algorithm::Aes192Ctr => "aes-192-ctr",
            Algorithm::Aes256Ctr => "aes-256-ctr",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "aes-128-cbc" | "aes128" => Algorithm::Aes128Cbc,
            "aes-192-cbc" | "aes192" => Algorithm::Aes192Cbc,
            "aes-256-cbc" | "aes256" => Algorithm::Aes256Cbc,
            "aes-128-ctr" => Algorithm::Aes128Ctr,
            "aes-192-ctr" => Algorithm::Aes192Ctr,
            "aes-256-ctr" => Algorithm::Aes256Ctr,
            _ => {
                return Err(PipelineError::CipherFailure(format!(
                    "unknown cipher algorithm {s:?}"
                )))
            }
        })
    }
}

/// Algorithm name, key and IV as handed over by whoever configures the pipeline.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherSpec {
    pub algorithm: String,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl CipherSpec {
    pub fn new(algorithm: impl Into<String>, key: impl Into<Vec<u8>>, iv: impl Into<Vec<u8>>) -> Self {
        CipherSpec {
            algorithm: algorithm.into(),
            key: key.into(),
            iv: iv.into(),
        }
    }
}

impl fmt::Debug for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // keep key material out of logs
        f.debug_struct("CipherSpec")
            .field("algorithm", &self.algorithm)
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .field("iv", &format_args!("<{} bytes>", self.iv.len()))
            .finish()
    }
}

trait Engine {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>>;
    fn finalize(&mut self) -> Result<Vec<u8>>;
}

struct CbcDecrypt<D> {
    cipher: D,
    pending: Vec<u8>,
}

impl<D: BlockDecryptMut> CbcDecrypt<D> {
    fn decrypt_blocks(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(D::block_size()) {
            self.cipher.decrypt_block_mut(block.into());
        }
    }
}

impl<D: BlockDecryptMut> Engine for CbcDecrypt<D> {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let block_size = D::block_size();
        self.pending.extend_from_slice(input);

        let mut ready = self.pending.len() / block_size * block_size;
        if ready == self.pending.len() {
            // the final block might carry padding
            ready = ready.saturating_sub(block_size);
        }
        let rest = self.pending.split_off(ready);
        let mut out = std::mem::replace(&mut self.pending, rest);
        self.decrypt_blocks(&mut out);
        Ok(out)
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        let block_size = D::block_size();
        let mut block = std::mem::take(&mut self.pending);
        if block.len() != block_size {
            return Err(PipelineError::CipherFailure("wrong final block length".into()));
        }
        self.decrypt_blocks(&mut block);

        let len = Pkcs7::raw_unpad(&block)
            .map_err(|_| PipelineError::CipherFailure("bad decrypt".into()))?
            .len();
        block.truncate(len);
        Ok(block)
    }
}

struct CbcEncrypt<E> {
    cipher: E,
    pending: Vec<u8>,
}

impl<E: BlockEncryptMut> CbcEncrypt<E> {
    fn encrypt_blocks(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(E::block_size()) {
            self.cipher.encrypt_block_mut(block.into());
        }
    }
}

impl<E: BlockEncryptMut> Engine for CbcEncrypt<E> {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let block_size = E::block_size();
        self.pending.extend_from_slice(input);
        let ready = self.pending.len() / block_size * block_size;
        let rest = self.pending.split_off(ready);
        let mut out = std::mem::replace(&mut self.pending, rest);
        self.encrypt_blocks(&mut out);
        Ok(out)
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        let block_size = E::block_size();
        let mut block = std::mem::take(&mut self.pending);
        let len = block.len();
        block.resize(block_size, 0);
        Pkcs7::raw_pad(&mut block, len);
        self.encrypt_blocks(&mut block);
        Ok(block)
    }
}

struct Keystream<C>(C);

impl<C: StreamCipher> Engine for Keystream<C> {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = input.to_vec();
        self.0
            .try_apply_keystream(&mut out)
            .map_err(|e| PipelineError::CipherFailure(e.to_string()))?;
        Ok(out)
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        Ok(vec![])
    }
}

fn invalid_length(spec: &CipherSpec) -> impl Fn(aes::cipher::InvalidLength) -> PipelineError + '_ {
    move |_| {
        PipelineError::CipherFailure(format!(
            "invalid key or iv length for {} (key {} bytes, iv {} bytes)",
            spec.algorithm,
            spec.key.len(),
            spec.iv.len()
        ))
    }
}

fn engine(algorithm: Algorithm, direction: Direction, spec: &CipherSpec) -> Result<Box<dyn Engine>> {
    let (key, iv) = (spec.key.as_slice(), spec.iv.as_slice());
    let err = invalid_length(spec);

    fn cbc_decrypt<D: BlockDecryptMut + 'static>(cipher: D) -> Box<dyn Engine> {
        Box::new(CbcDecrypt { cipher, pending: vec![] })
    }
    fn cbc_encrypt<E: BlockEncryptMut + 'static>(cipher: E) -> Box<dyn Engine> {
        Box::new(CbcEncrypt { cipher, pending: vec![] })
    }

    use Direction::*;
    Ok(match (algorithm, direction) {
        (Algorithm::Aes128Cbc, Decrypt) => {
            cbc_decrypt(cbc::Decryptor::<Aes128>::new_from_slices(key, iv).map_err(err)?)
        }
        (Algorithm::Aes192Cbc, Decrypt) => {
            cbc_decrypt(cbc::Decryptor::<Aes192>::new_from_slices(key, iv).map_err(err)?)
        }
        (Algorithm::Aes256Cbc, Decrypt) => {
            cbc_decrypt(cbc::Decryptor::<Aes256>::new_from_slices(key, iv).map_err(err)?)
        }
        (Algorithm::Aes128Cbc, Encrypt) => {
            cbc_encrypt(cbc::Encryptor::<Aes128>::new_from_slices(key, iv).map_err(err)?)
        }
        (Algorithm::Aes192Cbc, Encrypt) => {
            cbc_encrypt(cbc::Encryptor::<Aes192>::new_from_slices(key, iv).map_err(err)?)
        }
        (Algorithm::Aes256Cbc, Encrypt) => {
            cbc_encrypt(cbc::Encryptor::<Aes256>::new_from_slices(key, iv).map_err(err)?)
        }
        // CTR is symmetric
        (Algorithm::Aes128Ctr, _) => Box::new(Keystream(
            ctr::Ctr128BE::<Aes128>::new_from_slices(key, iv).map_err(err)?,
        )),
        (Algorithm::Aes192Ctr, _) => Box::new(Keystream(
            ctr::Ctr128BE::<Aes192>::new_from_slices(key, iv).map_err(err)?,
        )),
        (Algorithm::Aes256Ctr, _) => Box::new(Keystream(
            ctr::Ctr128BE::<Aes256>::new_from_slices(key, iv).map_err(err)?,
        )),
    })
}

/// Byte stage applying a symmetric cipher chunk by chunk.
pub struct CipherStage<S> {
    downstream: S,
    algorithm: Algorithm,
    direction: Direction,
    engine: Option<Box<dyn Engine>>,
    lifecycle: Lifecycle,
}

impl<S> fmt::Debug for CipherStage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherStage")
            .field("algorithm", &self.algorithm)
            .field("direction", &self.direction)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl<S: Stage<Bytes>> CipherStage<S> {
    /// Sets up the cipher context; an unknown algorithm or a key/IV of the wrong
    /// length is a [`PipelineError::CipherFailure`].
    pub fn new(spec: &CipherSpec, direction: Direction, downstream: S) -> Result<Self> {
        let algorithm: Algorithm = spec.algorithm.parse()?;
        let engine = engine(algorithm, direction, spec)?;
        log::debug!("{direction:?} with {algorithm}");
        Ok(CipherStage {
            downstream,
            algorithm,
            direction,
            engine: Some(engine),
            lifecycle: Lifecycle::default(),
        })
    }

    pub fn decrypt(spec: &CipherSpec, downstream: S) -> Result<Self> {
        Self::new(spec, Direction::Decrypt, downstream)
    }

    pub fn encrypt(spec: &CipherSpec, downstream: S) -> Result<Self> {
        Self::new(spec, Direction::Encrypt, downstream)
    }

    fn forward(&mut self, output: Vec<u8>) -> Result<Flow> {
        if output.is_empty() {
            return self.downstream.poll_ready();
        }
        self.downstream.push(Bytes::from(output))
    }

    fn process(&mut self, chunk: &[u8]) -> Result<Flow> {
        let output = match self.engine.as_mut() {
            Some(engine) => engine.update(chunk)?,
            None => return Err(PipelineError::Closed),
        };
        self.forward(output)
    }

    fn flush(&mut self) -> Result<()> {
        let output = match self.engine.take() {
            Some(mut engine) => engine.finalize()?,
            None => return Err(PipelineError::Closed),
        };
        if !output.is_empty() {
            self.downstream.push(Bytes::from(output))?;
        }
        Ok(())
    }
}

impl<S: Stage<Bytes>> Stage<Bytes> for CipherStage<S> {
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
            // drop the cipher context
            self.engine = None;
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
