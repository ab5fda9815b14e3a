//! Scripted backend used by unit and HTTP tests

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

use super::runtime::{Interpreter, InterpreterBackend};
use super::tensor::{ElementType, TensorSpec};

/// Stage at which the mock should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Delegate,
    Interpreter,
    Allocate,
    Invoke,
}

/// Tracks invocations and detects overlapping ones
#[derive(Debug, Default)]
pub struct InvokeProbe {
    active: AtomicUsize,
    calls: AtomicUsize,
    overlaps: AtomicUsize,
}

impl InvokeProbe {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

pub struct MockBackend {
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    failure: Option<MockFailure>,
    invoke_delay: Duration,
    probe: Arc<InvokeProbe>,
}

impl MockBackend {
    pub fn new(inputs: Vec<TensorSpec>, outputs: Vec<TensorSpec>) -> Self {
        Self {
            inputs,
            outputs,
            failure: None,
            invoke_delay: Duration::ZERO,
            probe: Arc::new(InvokeProbe::default()),
        }
    }

    /// Quantized MobileNetV1 layout: uint8 [1,224,224,3] in, uint8 [1,1001] out
    pub fn mobilenet() -> Self {
        Self::new(
            vec![TensorSpec::new("input", 0, vec![1, 224, 224, 3], ElementType::UInt8)],
            vec![TensorSpec::new(
                "MobilenetV1/Predictions/Reshape_1",
                0,
                vec![1, 1001],
                ElementType::UInt8,
            )],
        )
    }

    pub fn failing(mut self, failure: MockFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_invoke_delay(mut self, delay: Duration) -> Self {
        self.invoke_delay = delay;
        self
    }

    pub fn probe(&self) -> Arc<InvokeProbe> {
        self.probe.clone()
    }
}

pub struct MockDelegate;

pub struct MockInterpreter {
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    fail_allocate: bool,
    fail_invoke: bool,
    delay: Duration,
    probe: Arc<InvokeProbe>,
    input: Vec<u8>,
}

impl InterpreterBackend for MockBackend {
    type Delegate = MockDelegate;
    type Interpreter = MockInterpreter;

    fn load_delegate(&self, library: &Path) -> Result<MockDelegate> {
        if self.failure == Some(MockFailure::Delegate) {
            return Err(Error::DelegateLoad(format!(
                "{}: undefined symbol tflite_plugin_create_delegate",
                library.display()
            )));
        }
        Ok(MockDelegate)
    }

    fn create_interpreter(&self, model: &Path, _delegate: &MockDelegate) -> Result<MockInterpreter> {
        if self.failure == Some(MockFailure::Interpreter) {
            return Err(Error::ModelLoad(format!("{}: not a flatbuffer", model.display())));
        }
        Ok(MockInterpreter {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            fail_allocate: self.failure == Some(MockFailure::Allocate),
            fail_invoke: self.failure == Some(MockFailure::Invoke),
            delay: self.invoke_delay,
            probe: self.probe.clone(),
            input: Vec::new(),
        })
    }
}

impl Interpreter for MockInterpreter {
    fn allocate_tensors(&mut self) -> Result<()> {
        if self.fail_allocate {
            return Err(Error::Allocation("out of NPU memory".to_string()));
        }
        Ok(())
    }

    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn input_spec(&self, index: usize) -> Result<TensorSpec> {
        self.inputs
            .get(index)
            .cloned()
            .ok_or_else(|| Error::ModelLoad(format!("no input {}", index)))
    }

    fn output_spec(&self, index: usize) -> Result<TensorSpec> {
        self.outputs
            .get(index)
            .cloned()
            .ok_or_else(|| Error::ModelLoad(format!("no output {}", index)))
    }

    fn copy_input(&mut self, _index: usize, data: &[u8]) -> Result<()> {
        self.input = data.to_vec();
        Ok(())
    }

    fn invoke(&mut self) -> Result<()> {
        if self.probe.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.probe.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_invoke {
            return Err(Error::Invoke("NPU job timed out".to_string()));
        }
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Deterministic scores: a peak of 255 at index 500, then 200 at 7
    /// and a tie of 100 at 3 and 900; everything else is 1.
    fn copy_output(&self, _index: usize, out: &mut [u8]) -> Result<()> {
        out.fill(1);
        for (i, v) in [(500usize, 255u8), (7, 200), (3, 100), (900, 100)] {
            if let Some(slot) = out.get_mut(i) {
                *slot = v;
            }
        }
        Ok(())
    }
}
