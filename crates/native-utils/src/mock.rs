//! Scripted audio backend for tests: samples are pushed into the open input
//! stream and pulled out of the open output stream by hand.

use crate::{
    device::{ActiveStream, AudioBackend, InputCallback, OutputCallback, StreamSpec},
    error::DeviceError,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct MockState {
    input: Option<InputCallback>,
    output: Option<OutputCallback>,
    input_rate: Option<u32>,
    output_rate: Option<u32>,
    fail_input: bool,
    fail_output: bool,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("input_open", &self.input_open())
            .field("output_open", &self.output_open())
            .finish()
    }
}

struct InputGuard(Arc<Mutex<MockState>>);

impl Drop for InputGuard {
    fn drop(&mut self) {
        lock(&self.0).input = None;
    }
}

struct OutputGuard(Arc<Mutex<MockState>>);

impl Drop for OutputGuard {
    fn drop(&mut self) {
        lock(&self.0).output = None;
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the input at `rate` regardless of the requested spec.
    pub fn with_input_rate(self, rate: u32) -> Self {
        lock(&self.state).input_rate = Some(rate);
        self
    }

    pub fn with_output_rate(self, rate: u32) -> Self {
        lock(&self.state).output_rate = Some(rate);
        self
    }

    pub fn fail_input(&self, fail: bool) {
        lock(&self.state).fail_input = fail;
    }

    pub fn fail_output(&self, fail: bool) {
        lock(&self.state).fail_output = fail;
    }

    pub fn input_open(&self) -> bool {
        lock(&self.state).input.is_some()
    }

    pub fn output_open(&self) -> bool {
        lock(&self.state).output.is_some()
    }

    /// Delivers samples as if the microphone produced them. False when no
    /// input stream is open.
    pub fn push_input(&self, samples: &[f32]) -> bool {
        let mut state = lock(&self.state);
        match state.input.as_mut() {
            Some(callback) => {
                callback(samples);
                true
            }
            None => false,
        }
    }

    /// Pulls `len` samples from the output stream, if one is open.
    pub fn pull_output(&self, len: usize) -> Option<Vec<f32>> {
        let mut state = lock(&self.state);
        let callback = state.output.as_mut()?;
        let mut out = vec![0.0; len];
        callback(&mut out);
        Some(out)
    }
}

impl AudioBackend for MockBackend {
    fn open_input(&self, spec: StreamSpec, on_samples: InputCallback) -> Result<ActiveStream, DeviceError> {
        let mut state = lock(&self.state);
        if state.fail_input {
            return Err(DeviceError::NoDevice("input"));
        }
        state.input = Some(on_samples);
        let rate = state.input_rate.unwrap_or(spec.sample_rate);
        Ok(ActiveStream::new(rate, InputGuard(self.state.clone())))
    }

    fn open_output(&self, spec: StreamSpec, fill: OutputCallback) -> Result<ActiveStream, DeviceError> {
        let mut state = lock(&self.state);
        if state.fail_output {
            return Err(DeviceError::NoDevice("output"));
        }
        state.output = Some(fill);
        let rate = state.output_rate.unwrap_or(spec.sample_rate);
        Ok(ActiveStream::new(rate, OutputGuard(self.state.clone())))
    }
}
