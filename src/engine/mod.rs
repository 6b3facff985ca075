//! Decode Engine interface.
//!
//! The engine is the opaque bitstream-to-sample/pixel stage. Orchestrators
//! configure it, submit [`DecodeUnit`]s, and read its output from an
//! [`EngineSink`] channel, which engines may feed from any task or thread and
//! in any order. Which implementation runs is decided once, by
//! [`select_engine`], from each candidate's capability query.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::types::AccelerationPreference;

pub mod software;

pub use software::{NullVideoCodec, SilentAudioCodec, SoftwareCodec, SoftwareFallback};

/// One unit of compressed input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeUnit {
    pub timestamp_us: i64,
    pub is_key: bool,
    pub data: Bytes,
}

#[derive(Debug)]
pub enum EngineEvent<O> {
    Output { timestamp_us: i64, output: O },
    Error(EngineError),
}

/// Output side of an engine; cheap to clone and usable from any thread
pub struct EngineSink<O> {
    tx: mpsc::UnboundedSender<EngineEvent<O>>,
}

impl<O> Clone for EngineSink<O> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<O> EngineSink<O> {
    /// Returns false once the orchestrator side is gone
    pub fn output(&self, timestamp_us: i64, output: O) -> bool {
        self.tx
            .send(EngineEvent::Output {
                timestamp_us,
                output,
            })
            .is_ok()
    }

    pub fn error(&self, error: EngineError) -> bool {
        self.tx.send(EngineEvent::Error(error)).is_ok()
    }
}

pub fn output_channel<O>() -> (EngineSink<O>, mpsc::UnboundedReceiver<EngineEvent<O>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EngineSink { tx }, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineKind {
    HardwareAccelerated,
    SoftwareFallback,
}

#[async_trait]
pub trait DecodeEngine: Send {
    type Config: Send + Sync;
    type Output: Send + 'static;

    fn kind(&self) -> EngineKind;

    fn name(&self) -> &str;

    /// Capability query; must not change engine state
    fn is_config_supported(&self, config: &Self::Config) -> bool;

    /// Registers where decoded output goes. Called before the first `configure`.
    fn set_output(&mut self, sink: EngineSink<Self::Output>);

    fn configure(&mut self, config: &Self::Config) -> Result<(), EngineError>;

    fn decode(&mut self, unit: DecodeUnit) -> Result<(), EngineError>;

    /// Resolves once every submitted unit has produced its output
    async fn flush(&mut self) -> Result<(), EngineError>;

    /// Drops queued input; the engine stays configured
    fn reset(&mut self);

    fn close(&mut self);
}

pub type BoxedEngine<C, O> = Box<dyn DecodeEngine<Config = C, Output = O>>;

/// Picks the engine to use for `config`: the first candidate, in preference
/// order, whose capability query accepts it.
pub fn select_engine<C, O>(
    candidates: &[BoxedEngine<C, O>],
    config: &C,
    preference: AccelerationPreference,
) -> Option<usize>
where
    C: Send + Sync,
    O: Send + 'static,
{
    let rank = |kind: EngineKind| match (preference, kind) {
        (AccelerationPreference::PreferSoftware, EngineKind::SoftwareFallback) => 0,
        (AccelerationPreference::PreferSoftware, EngineKind::HardwareAccelerated) => 1,
        (_, EngineKind::HardwareAccelerated) => 0,
        (_, EngineKind::SoftwareFallback) => 1,
    };

    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by_key(|&i| rank(candidates[i].kind()));
    order
        .into_iter()
        .find(|&i| candidates[i].is_config_supported(config))
}
