//! Shared helpers for unit tests.

use std::sync::mpsc::{self, Receiver};

use crate::error::SchedulerError;
use crate::request::{CompletionSink, InputSpec, Request};

/// Minimal [`Request`] for exercising the scheduler.
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub batch_size: u64,
    pub timeout_us: u64,
    pub inputs: Vec<InputSpec>,
}

impl TestRequest {
    pub fn new(batch_size: u64) -> Self {
        Self { batch_size, timeout_us: 0, inputs: Vec::new() }
    }

    pub fn with_timeout_us(mut self, timeout_us: u64) -> Self {
        self.timeout_us = timeout_us;
        self
    }

    pub fn with_input(mut self, name: &str, dims: Vec<i64>) -> Self {
        self.inputs.push(InputSpec::new(name, dims, "INT64"));
        self
    }
}

impl Request for TestRequest {
    fn inputs(&self) -> &[InputSpec] {
        &self.inputs
    }

    fn batch_size(&self) -> u64 {
        self.batch_size
    }

    fn timeout_us(&self) -> u64 {
        self.timeout_us
    }
}

/// A completion sink that forwards the result to a channel.
pub fn probe_sink() -> (CompletionSink, Receiver<Result<(), SchedulerError>>) {
    let (tx, rx) = mpsc::channel();
    let sink: CompletionSink = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (sink, rx)
}
