//! Inference engine module
//!
//! Provides TensorFlow Lite inference on the NPU with:
//! - Delegate library discovery
//! - Single-instance model runtime with all-or-nothing loading
//! - Serialized invocation with cumulative metrics

pub mod resolver;
pub mod tensor;
pub mod runtime;
pub mod tflite;
pub mod preprocess;
pub mod inference;
pub mod metrics;

#[cfg(test)]
pub(crate) mod mock;

pub use resolver::LibraryResolver;
pub use runtime::{Interpreter, InterpreterBackend, ModelRuntime};
pub use tflite::TfLiteBackend;
pub use inference::{InferenceEngine, InferenceResult};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use tensor::{ElementType, Tensor, TensorSpec};
