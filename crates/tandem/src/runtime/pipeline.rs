//! N-stage pipelines of invocations across sessions.
//!
//! A pipeline is plain data: an ordered list of stages, each an entry point on a session with
//! wired arguments. Arguments produced by an earlier stage on another device become transfer
//! edges, materialised host-mediated when the pipeline runs.

use std::fmt;

use tracing::debug;

use crate::backend::device::{BufferParams, Timeout};
use crate::error::{Result, RuntimeError};
use crate::runtime::buffer::{BufferView, HostTensor};
use crate::runtime::call::{Call, InvokeFlags};
use crate::runtime::device::DeviceId;
use crate::runtime::session::Session;
use crate::runtime::transfer::transfer_buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(usize);

impl StageId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage{}", self.0)
    }
}

/// Source of one stage argument.
#[derive(Debug, Clone)]
pub enum StageInput {
    /// Uploaded to the stage's device when the pipeline runs.
    Host(HostTensor),
    /// Used as is; must already reside on the stage's device.
    Buffer(BufferView),
    /// Output `index` of an earlier stage.
    Output { stage: StageId, index: usize },
}

/// Cross-device hop between a producing and a consuming stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEdge {
    pub from: StageId,
    pub output: usize,
    pub to: StageId,
    pub src_device: DeviceId,
    pub dst_device: DeviceId,
}

struct Stage<'s> {
    session: &'s Session,
    entry: String,
    inputs: Vec<StageInput>,
}

#[derive(Default)]
pub struct PipelineBuilder<'s> {
    stages: Vec<Stage<'s>>,
    dangling: Vec<StageId>,
}

impl<'s> PipelineBuilder<'s> {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            dangling: Vec::new(),
        }
    }

    /// Appends a stage running `entry` on `session`.
    pub fn stage(&mut self, session: &'s Session, entry: impl Into<String>) -> StageId {
        self.stages.push(Stage {
            session,
            entry: entry.into(),
            inputs: Vec::new(),
        });
        StageId(self.stages.len() - 1)
    }

    /// Wires the next argument of `stage`.
    pub fn input(&mut self, stage: StageId, input: StageInput) -> &mut Self {
        match self.stages.get_mut(stage.0) {
            Some(target) => target.inputs.push(input),
            None => self.dangling.push(stage),
        }
        self
    }

    pub fn build(self) -> Result<Pipeline<'s>> {
        if let Some(stage) = self.dangling.first() {
            return Err(RuntimeError::InvalidPipeline(format!(
                "input wired to {stage}, which does not exist"
            )));
        }
        if self.stages.is_empty() {
            return Err(RuntimeError::InvalidPipeline(
                "pipeline has no stages".to_string(),
            ));
        }
        let mut edges = Vec::new();
        for (position, stage) in self.stages.iter().enumerate() {
            let consumer = StageId(position);
            stage.session.lookup_function(&stage.entry)?;
            for input in &stage.inputs {
                let StageInput::Output { stage: producer, index } = input else {
                    continue;
                };
                if producer.0 >= position {
                    return Err(RuntimeError::InvalidPipeline(format!(
                        "{consumer} consumes {producer}, which does not run before it"
                    )));
                }
                let src_device = self.stages[producer.0].session.device().id();
                let dst_device = stage.session.device().id();
                if src_device != dst_device {
                    edges.push(TransferEdge {
                        from: *producer,
                        output: *index,
                        to: consumer,
                        src_device,
                        dst_device,
                    });
                }
            }
        }
        Ok(Pipeline {
            stages: self.stages,
            edges,
        })
    }
}

/// Validated pipeline, ready to run any number of times.
pub struct Pipeline<'s> {
    stages: Vec<Stage<'s>>,
    edges: Vec<TransferEdge>,
}

/// Result of one pipeline run.
#[derive(Debug)]
pub struct PipelineRun {
    /// Outputs of every stage, in stage order then declared return order.
    pub outputs: Vec<Vec<BufferView>>,
    /// Host-mediated transfers performed.
    pub transfers: usize,
}

impl PipelineRun {
    pub fn stage_outputs(&self, stage: StageId) -> &[BufferView] {
        self.outputs.get(stage.0).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Outputs of the last stage.
    pub fn final_outputs(&self) -> &[BufferView] {
        self.outputs.last().map(Vec::as_slice).unwrap_or(&[])
    }
}

impl<'s> Pipeline<'s> {
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn transfer_edges(&self) -> &[TransferEdge] {
        &self.edges
    }

    /// Runs every stage in order; `timeout` bounds each device-to-host read.
    pub fn run(&self, timeout: Timeout) -> Result<PipelineRun> {
        let mut outputs: Vec<Vec<BufferView>> = Vec::with_capacity(self.stages.len());
        let mut transfers = 0;
        for (position, stage) in self.stages.iter().enumerate() {
            let session = stage.session;
            let mut call = Call::initialize_by_name(session, &stage.entry)?;
            for input in &stage.inputs {
                let buffer = match input {
                    StageInput::Host(tensor) => tensor.upload(session.device(), BufferParams::default())?,
                    StageInput::Buffer(buffer) => buffer.clone(),
                    StageInput::Output { stage: producer, index } => {
                        let produced = outputs[producer.0].get(*index).ok_or_else(|| {
                            RuntimeError::InvalidPipeline(format!(
                                "{producer} has {} output(s), output {index} requested by stage{position}",
                                outputs[producer.0].len()
                            ))
                        })?;
                        if produced.device() == session.device().id() {
                            produced.clone()
                        } else {
                            let moved = transfer_buffer(
                                produced,
                                produced.device_handle(),
                                session.device(),
                                session.host_allocator(),
                                timeout,
                            )?;
                            transfers += 1;
                            moved
                        }
                    }
                };
                call.push_input(&buffer)?;
            }
            call.invoke(InvokeFlags::release_inputs())?;
            let mut produced = Vec::with_capacity(call.signature().1.len());
            for _ in 0..call.signature().1.len() {
                produced.push(call.pop_output()?);
            }
            call.deinitialize();
            debug!(stage = position, entry = %stage.entry, outputs = produced.len(), "stage complete");
            outputs.push(produced);
        }
        Ok(PipelineRun { outputs, transfers })
    }
}

impl fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<&str> = self.stages.iter().map(|s| s.entry.as_str()).collect();
        f.debug_struct("Pipeline")
            .field("stages", &entries)
            .field("edges", &self.edges)
            .finish()
    }
}
