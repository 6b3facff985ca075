//! Engine-facing half of an orchestrator, shared by audio and video.
//!
//! Owns the candidate engines, the lifecycle state, the engine output channel
//! and the presentation queue. Codec knowledge stays in the orchestrators.

use std::fmt::Debug;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::engine::{BoxedEngine, DecodeUnit, EngineEvent, output_channel, select_engine};
use crate::error::{EngineError, PipelineError};
use crate::frame::Release;
use crate::queue::PresentationQueue;
use crate::stats::{Metrics, MetricsSnapshot};
use crate::types::{AccelerationPreference, DecoderState, PipelineConfig};

pub struct DecodePipeline<C, O: Release> {
    label: &'static str,
    engines: Vec<BoxedEngine<C, O>>,
    active: Option<usize>,
    state: DecoderState,
    config: Option<C>,
    preference: AccelerationPreference,
    events: mpsc::UnboundedReceiver<EngineEvent<O>>,
    pub queue: PresentationQueue<O>,
    pub metrics: Metrics,
}

impl<C, O> DecodePipeline<C, O>
where
    C: Clone + Debug + Send + Sync,
    O: Release + Send + 'static,
{
    pub fn new(label: &'static str, mut engines: Vec<BoxedEngine<C, O>>, config: &PipelineConfig) -> Self {
        let (sink, events) = output_channel();
        for engine in engines.iter_mut() {
            engine.set_output(sink.clone());
        }
        Self {
            label,
            engines,
            active: None,
            state: DecoderState::Unconfigured,
            config: None,
            preference: config.acceleration,
            events,
            queue: PresentationQueue::with_limits(
                Duration::from_millis(config.queue_timeout_ms),
                config.queue_capacity,
            ),
            metrics: Metrics::new(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn config(&self) -> Option<&C> {
        self.config.as_ref()
    }

    pub fn engine_name(&self) -> Option<&str> {
        self.active.map(|i| self.engines[i].name())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(&self.queue)
    }

    fn transition(&mut self, next: DecoderState) {
        if self.state != next {
            info!(stream = self.label, from = ?self.state, to = ?next, "decoder state");
            self.state = next;
        }
    }

    fn fail(&mut self, e: EngineError) -> PipelineError {
        error!(stream = self.label, error = %e, "decode engine failure");
        self.transition(DecoderState::Error);
        PipelineError::Engine(e)
    }

    /// Selects an engine for `config` and configures it.
    pub fn initialize(&mut self, config: C) -> Result<(), PipelineError> {
        if !matches!(self.state, DecoderState::Unconfigured | DecoderState::Closed) {
            return Err(PipelineError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }
        let index = select_engine(&self.engines, &config, self.preference)
            .ok_or_else(|| PipelineError::Configuration(format!("{config:?}")))?;
        info!(
            stream = self.label,
            engine = self.engines[index].name(),
            kind = ?self.engines[index].kind(),
            "decode engine selected"
        );
        if let Err(e) = self.engines[index].configure(&config) {
            return Err(self.fail(e));
        }
        self.active = Some(index);
        self.config = Some(config);
        self.transition(DecoderState::Configured);
        Ok(())
    }

    /// Applies configuration extracted from the stream. The engine is re-selected
    /// only if the active one refuses the new configuration.
    pub fn reconfigure(&mut self, config: C) -> Result<(), PipelineError> {
        if !matches!(self.state, DecoderState::Configured | DecoderState::Decoding) {
            return Err(PipelineError::InvalidState {
                operation: "reconfigure",
                state: self.state,
            });
        }
        let current = self.active.filter(|&i| self.engines[i].is_config_supported(&config));
        let index = match current.or_else(|| select_engine(&self.engines, &config, self.preference)) {
            Some(index) => index,
            None => {
                self.transition(DecoderState::Error);
                return Err(PipelineError::Configuration(format!("{config:?}")));
            }
        };
        if Some(index) != self.active {
            if let Some(previous) = self.active {
                self.engines[previous].close();
            }
            info!(stream = self.label, engine = self.engines[index].name(), "decode engine switched");
        }
        info!(stream = self.label, config = ?config, "reconfiguring decode engine");
        if let Err(e) = self.engines[index].configure(&config) {
            return Err(self.fail(e));
        }
        self.active = Some(index);
        self.config = Some(config);
        Ok(())
    }

    pub fn submit(&mut self, unit: DecodeUnit) -> Result<(), PipelineError> {
        let index = match (self.state, self.active) {
            (DecoderState::Configured | DecoderState::Decoding, Some(index)) => index,
            (state, _) => {
                return Err(PipelineError::InvalidState {
                    operation: "decode",
                    state,
                });
            }
        };
        self.transition(DecoderState::Decoding);
        if let Err(e) = self.engines[index].decode(unit) {
            return Err(self.fail(e));
        }
        self.metrics.frames_processed += 1;
        Ok(())
    }

    /// Moves engine output into the queue, presenting one unit after each insertion.
    pub fn pump(&mut self, present: &mut dyn FnMut(i64, O)) -> Result<(), PipelineError> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                EngineEvent::Output {
                    timestamp_us,
                    output,
                } => {
                    if matches!(self.state, DecoderState::Closed | DecoderState::Error) {
                        output.release();
                        self.metrics.frames_discarded += 1;
                        continue;
                    }
                    self.queue.insert(timestamp_us, output);
                    if let Some((pts, output)) = self.queue.present_next() {
                        present(pts, output);
                    }
                }
                EngineEvent::Error(e) => {
                    if self.state == DecoderState::Error {
                        continue;
                    }
                    return Err(self.fail(e));
                }
            }
        }
        Ok(())
    }

    /// Waits for the engine to finish every submission, then presents everything queued.
    pub async fn flush(&mut self, present: &mut dyn FnMut(i64, O)) -> Result<(), PipelineError> {
        let index = match (self.state, self.active) {
            (DecoderState::Configured | DecoderState::Decoding, Some(index)) => index,
            (state, _) => {
                return Err(PipelineError::InvalidState {
                    operation: "flush",
                    state,
                });
            }
        };
        self.transition(DecoderState::Flushing);
        if let Err(e) = self.engines[index].flush().await {
            return Err(self.fail(e));
        }
        self.pump(present)?;
        while let Some((pts, output)) = self.queue.present_next() {
            present(pts, output);
        }
        self.transition(DecoderState::Configured);
        Ok(())
    }

    fn discard_events(&mut self) -> usize {
        let mut released = 0;
        while let Ok(event) = self.events.try_recv() {
            if let EngineEvent::Output { output, .. } = event {
                output.release();
                released += 1;
            }
        }
        released
    }

    /// Drops in-flight work and buffered output; configuration survives.
    pub fn reset(&mut self) {
        if let Some(index) = self.active {
            self.engines[index].reset();
        }
        let released = self.discard_events() + self.queue.reset();
        self.metrics.frames_discarded += released as u64;
        debug!(stream = self.label, released, "pipeline reset");
        if matches!(self.state, DecoderState::Decoding | DecoderState::Flushing) {
            self.transition(DecoderState::Configured);
        }
    }

    pub fn close(&mut self) {
        if let Some(index) = self.active.take() {
            self.engines[index].close();
        }
        let released = self.discard_events() + self.queue.reset();
        self.metrics.frames_discarded += released as u64;
        self.config = None;
        self.transition(DecoderState::Closed);
    }
}
