use std::{cell::RefCell, io::Write, rc::Rc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};

use stagepipe::{
    cipher::{CipherSpec, CipherStage},
    compress::Encoding,
    hash::HashAlgorithm,
    pipeline::{self, PipelineConfig},
    rewrite::Selector,
    sink::WriteSink,
    Stage,
};

/// stagepipe
#[derive(Debug, Parser)]
#[clap(name = "stagepipe", version)]
pub struct App {
    /// bytes read from stdin per chunk
    #[clap(long, default_value_t = 64 * 1024)]
    chunk_size: usize,
    /// bytes of output buffered before the pipeline pauses
    #[clap(long, default_value_t = 256 * 1024)]
    high_water_mark: usize,
    /// seconds a paused pipeline may wait for its output to drain
    #[clap(long, default_value_t = 30)]
    timeout: u64,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Args)]
struct CipherArgs {
    /// e.g. aes-256-cbc, aes-128-ctr
    algorithm: String,
    key: String,
    iv: String,
    /// key and iv are hex-encoded rather than raw strings
    #[clap(long)]
    hex: bool,
}

impl CipherArgs {
    fn spec(&self) -> Result<CipherSpec> {
        if self.hex {
            let key = hex::decode(&self.key).context("decoding key")?;
            let iv = hex::decode(&self.iv).context("decoding iv")?;
            Ok(CipherSpec::new(&self.algorithm, key, iv))
        } else {
            Ok(CipherSpec::new(
                &self.algorithm,
                self.key.as_bytes(),
                self.iv.as_bytes(),
            ))
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decrypts a tar stream and prints `<digest> <path>` for every file in it
    Secretz {
        #[clap(flatten)]
        cipher: CipherArgs,
        #[clap(long, default_value = "md5")]
        digest: HashAlgorithm,
    },
    /// Prints `<digest> <path>` for every file in a plain tar stream
    Hash {
        #[clap(long, default_value = "md5")]
        digest: HashAlgorithm,
    },
    Encrypt {
        #[clap(flatten)]
        cipher: CipherArgs,
    },
    Decrypt {
        #[clap(flatten)]
        cipher: CipherArgs,
    },
    /// Groups newline-delimited genre/book JSON records and compresses the result
    Group {
        #[clap(long, conflicts_with = "accept")]
        encoding: Option<Encoding>,
        /// Accept-Encoding style preference list, e.g. "zstd;q=0.9, gzip"
        #[clap(long)]
        accept: Option<String>,
    },
    /// Alternates lower-case and upper-case lines
    Lines,
    /// Upper-cases everything
    Upper,
    /// Upper-cases the content of HTML elements matching a selector
    Rewrite { selector: Selector },
    /// Counts newline-delimited JSON records by the value of a field
    Tally { field: String },
}

fn run(mut head: impl Stage<Bytes>, config: &PipelineConfig) -> Result<()> {
    let stats = pipeline::pump(&mut std::io::stdin().lock(), &mut head, config)?;
    log::info!("processed {} bytes", stats.bytes);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    let config = PipelineConfig {
        chunk_size: args.chunk_size,
        high_water_mark: args.high_water_mark,
        backpressure_timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    };
    let stdout = || {
        WriteSink::new(std::io::stdout().lock(), config.high_water_mark)
            .with_drain_timeout(config.backpressure_timeout, config.poll_interval)
    };

    match args.cmd {
        Command::Secretz { cipher, digest } => {
            let spec = cipher.spec()?;
            let head = pipeline::hash_report(Some(&spec), digest, stdout())?;
            run(head, &config).context("hashing encrypted archive")?;
        }
        Command::Hash { digest } => {
            let head = pipeline::hash_report(None, digest, stdout())?;
            run(head, &config).context("hashing archive")?;
        }
        Command::Encrypt { cipher } => {
            let head = CipherStage::encrypt(&cipher.spec()?, stdout())?;
            run(head, &config).context("encrypting")?;
        }
        Command::Decrypt { cipher } => {
            let head = CipherStage::decrypt(&cipher.spec()?, stdout())?;
            run(head, &config).context("decrypting")?;
        }
        Command::Group { encoding, accept } => {
            let encoding = match (encoding, accept) {
                (Some(encoding), _) => encoding,
                (None, Some(accept)) => Encoding::negotiate(&accept)?,
                (None, None) => Encoding::Gzip,
            };
            run(pipeline::group_genres(encoding, stdout())?, &config).context("grouping")?;
        }
        Command::Lines => run(pipeline::fold_lines(stdout()), &config)?,
        Command::Upper => run(pipeline::uppercase(stdout()), &config)?,
        Command::Rewrite { selector } => {
            run(pipeline::rewrite(selector, stdout())?, &config).context("rewriting")?
        }
        Command::Tally { field } => {
            let counts = Rc::new(RefCell::new(None));
            let out = counts.clone();
            let head = pipeline::tally(&field, move |c| *out.borrow_mut() = Some(c));
            run(head, &config).context("counting")?;

            let mut stdout = std::io::stdout().lock();
            for (key, count) in counts.take().unwrap_or_default() {
                writeln!(stdout, "{key} {count}")?;
            }
        }
    }

    Ok(())
}
