//! Streaming transform pipelines built from push-based stages.
//!
//! A pipeline is a chain of [`Stage`](stage::Stage)s, each owning the next one.  A
//! source pushes chunks into the head of the chain with [`pipeline::pump`]; every
//! stage transforms what it receives and pushes its output further down, so input
//! is processed incrementally and never buffered whole.  Flow control travels back
//! up the chain as the [`Flow`](stage::Flow) returned by every `push`.
//!
//! The building blocks are byte-level ([`cipher`], [`compress`], [`rewrite`]),
//! record-level ([`splitter`], [`transform`]) and container-level ([`container`],
//! [`hash`]); [`pipeline`] wires them into the common compositions.

pub mod cipher;
pub mod compress;
pub mod container;
pub mod error;
pub mod hash;
pub mod pipeline;
pub mod rewrite;
pub mod sink;
pub mod splitter;
pub mod stage;
pub mod transform;


pub use error::{PipelineError, Result};
pub use stage::{Flow, Stage};
