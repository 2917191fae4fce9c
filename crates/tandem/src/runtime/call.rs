//! Invocation protocol: bind an entry point, push inputs, invoke, pop outputs.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use tracing::{debug, warn};

use crate::backend::device::AllocationHandle;
use crate::backend::spec::{BackendError, TensorSpec};
use crate::error::{Result, RuntimeError};
use crate::runtime::buffer::BufferView;
use crate::runtime::session::{FunctionRef, Session};

/// Where a [`Call`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Bound to an entry point; inputs may be pushed.
    AcceptingInputs,
    /// Invoked successfully; outputs may be popped.
    AcceptingOutputs,
    /// Invocation failed; only deinitialize is legal.
    Failed,
    /// Deinitialized; holds no references.
    Uninitialized,
}

impl CallState {
    pub fn name(self) -> &'static str {
        match self {
            CallState::AcceptingInputs => "accepting inputs",
            CallState::AcceptingOutputs => "accepting outputs",
            CallState::Failed => "failed",
            CallState::Uninitialized => "uninitialized",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvokeFlags {
    /// Drop the call's input references once the invocation succeeds.
    pub release_inputs: bool,
}

impl InvokeFlags {
    pub fn release_inputs() -> Self {
        Self {
            release_inputs: true,
        }
    }
}

/// One invocation of a named entry point on a session.
pub struct Call<'s> {
    session: &'s Session,
    entry: FunctionRef,
    inputs: Vec<BufferView>,
    outputs: VecDeque<BufferView>,
    popped: usize,
    state: CallState,
}

impl<'s> Call<'s> {
    /// Binds `name` (`module.function`, or a bare function name unique across the session).
    ///
    /// No work is started on the device.
    pub fn initialize_by_name(session: &'s Session, name: &str) -> Result<Self> {
        let entry = session.lookup_function(name)?;
        debug!(session = session.id(), entry = %entry.qualified_name(), "initialized call");
        Ok(Self {
            session,
            entry,
            inputs: Vec::new(),
            outputs: VecDeque::new(),
            popped: 0,
            state: CallState::AcceptingInputs,
        })
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    pub fn entry_name(&self) -> String {
        self.entry.qualified_name()
    }

    /// Declared `(parameters, results)` of the bound entry point.
    pub fn signature(&self) -> (&[TensorSpec], &[TensorSpec]) {
        let function = self.entry.function();
        (&function.parameters, &function.results)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn outputs_remaining(&self) -> usize {
        self.outputs.len()
    }

    fn require(&self, state: CallState, operation: &'static str) -> Result<()> {
        if self.state != state {
            return Err(RuntimeError::InvalidState {
                operation,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    /// Appends `buffer` as the next argument.
    ///
    /// The buffer must reside on the session's device; on mismatch nothing is appended.
    pub fn push_input(&mut self, buffer: &BufferView) -> Result<()> {
        self.require(CallState::AcceptingInputs, "push_input")?;
        let expected = self.session.device().id();
        if buffer.device() != expected {
            return Err(RuntimeError::DeviceMismatch {
                expected,
                actual: buffer.device(),
            });
        }
        self.inputs.push(buffer.clone());
        Ok(())
    }

    /// Executes the entry point synchronously against the pushed inputs.
    ///
    /// On failure the call holds no outputs and only [`Call::deinitialize`] remains legal.
    pub fn invoke(&mut self, flags: InvokeFlags) -> Result<()> {
        self.require(CallState::AcceptingInputs, "invoke")?;
        let entry_name = self.entry.qualified_name();
        match self.execute() {
            Ok(outputs) => {
                self.outputs = outputs.into();
                self.state = CallState::AcceptingOutputs;
                if flags.release_inputs {
                    self.inputs.clear();
                }
                Ok(())
            }
            Err(source) => {
                warn!(entry = %entry_name, error = %source, "invocation failed");
                self.outputs.clear();
                self.state = CallState::Failed;
                Err(RuntimeError::Invocation {
                    entry: entry_name,
                    source,
                })
            }
        }
    }

    fn execute(&self) -> std::result::Result<Vec<BufferView>, BackendError> {
        let function = self.entry.function();
        if self.inputs.len() != function.parameters.len() {
            return Err(BackendError::spec(format!(
                "expected {} input(s), got {}",
                function.parameters.len(),
                self.inputs.len()
            )));
        }
        for (index, (input, declared)) in self.inputs.iter().zip(&function.parameters).enumerate() {
            if input.spec() != declared {
                return Err(BackendError::spec(format!(
                    "input {index} is {} but the entry point expects {declared}",
                    input.spec()
                )));
            }
        }

        let handles: Vec<&AllocationHandle> =
            self.inputs.iter().map(BufferView::allocation_handle).collect();
        let device = self.session.device();
        let started = Instant::now();
        let produced = device
            .backend()
            .execute(self.entry.module.spec(), function, &handles)?;
        debug!(
            entry = %self.entry.qualified_name(),
            device = %device.id(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "invoked"
        );

        if produced.len() != function.results.len() {
            return Err(BackendError::execution(format!(
                "device produced {} output(s) for {} declared result(s)",
                produced.len(),
                function.results.len()
            )));
        }
        let mut outputs = Vec::with_capacity(produced.len());
        for (index, (output, declared)) in produced.into_iter().zip(&function.results).enumerate() {
            if &output.spec != declared {
                return Err(BackendError::execution(format!(
                    "output {index} is {} but the entry point declares {declared}",
                    output.spec
                )));
            }
            outputs.push(BufferView::from_device_output(
                device,
                output.spec,
                output.allocation,
            ));
        }
        Ok(outputs)
    }

    /// Pops the next output in declared return order.
    pub fn pop_output(&mut self) -> Result<BufferView> {
        self.require(CallState::AcceptingOutputs, "pop_output")?;
        match self.outputs.pop_front() {
            Some(output) => {
                self.popped += 1;
                Ok(output)
            }
            None => Err(RuntimeError::OutputsExhausted {
                popped: self.popped,
            }),
        }
    }

    /// Releases every input and output reference the call still holds.
    ///
    /// Buffers already popped are unaffected. Legal in any state.
    pub fn deinitialize(&mut self) {
        if self.state == CallState::Uninitialized {
            return;
        }
        debug!(
            entry = %self.entry.qualified_name(),
            inputs = self.inputs.len(),
            unpopped = self.outputs.len(),
            "deinitialized call"
        );
        self.inputs.clear();
        self.outputs.clear();
        self.state = CallState::Uninitialized;
    }
}

impl fmt::Debug for Call<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("entry", &self.entry)
            .field("state", &self.state)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl Drop for Call<'_> {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
