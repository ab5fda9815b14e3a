//! Model Runtime
//!
//! Owns the interpreter and the delegate it is bound to. Loading is
//! all-or-nothing: the runtime only becomes loaded once every stage
//! (delegate, interpreter, allocation, spec introspection) has succeeded.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use crate::error::{Error, Result};

use super::tensor::{Tensor, TensorSpec};

/// A native interpreter with allocated tensor buffers
///
/// `copy_input`, `invoke` and `copy_output` mutate shared internal buffers,
/// so callers must serialize them.
pub trait Interpreter: Send {
    fn allocate_tensors(&mut self) -> Result<()>;

    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    fn input_spec(&self, index: usize) -> Result<TensorSpec>;

    fn output_spec(&self, index: usize) -> Result<TensorSpec>;

    fn copy_input(&mut self, index: usize, data: &[u8]) -> Result<()>;

    fn invoke(&mut self) -> Result<()>;

    fn copy_output(&self, index: usize, out: &mut [u8]) -> Result<()>;
}

/// Factory for delegates and interpreters
pub trait InterpreterBackend: Send + Sync + 'static {
    type Delegate: Send;
    type Interpreter: Interpreter;

    /// Load the acceleration plugin at `library`
    fn load_delegate(&self, library: &Path) -> Result<Self::Delegate>;

    /// Build an interpreter for `model` with `delegate` attached
    fn create_interpreter(&self, model: &Path, delegate: &Self::Delegate) -> Result<Self::Interpreter>;
}

/// Everything that exists only after a successful load.
/// Field order matters: the interpreter is dropped before the delegate.
struct LoadedModel<B: InterpreterBackend> {
    interpreter: B::Interpreter,
    #[allow(dead_code)]
    delegate: B::Delegate,
    input: TensorSpec,
    output: TensorSpec,
    library_path: PathBuf,
}

/// Single-model runtime bound to one delegate
pub struct ModelRuntime<B: InterpreterBackend> {
    backend: B,
    model: Option<LoadedModel<B>>,
}

impl<B: InterpreterBackend> ModelRuntime<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, model: None }
    }

    /// Load the model with the delegate at `library_path`
    ///
    /// On failure the previous state (loaded or not) is kept.
    pub fn load(&mut self, model_path: &Path, library_path: Option<&Path>) -> Result<()> {
        let library_path = library_path.ok_or(Error::NoAccelerator)?;

        if !model_path.is_file() {
            return Err(Error::ModelLoad(format!(
                "model not found: {}",
                model_path.display()
            )));
        }

        info!("Loading model {} with delegate {}", model_path.display(), library_path.display());
        let start = Instant::now();

        let delegate = self.backend.load_delegate(library_path)?;
        info!("Delegate loaded: {}", library_path.display());

        let mut interpreter = self.backend.create_interpreter(model_path, &delegate)?;
        interpreter.allocate_tensors()?;

        let (input, output) = read_specs(&interpreter)?;

        info!("Model loaded in {:?}: {}", start.elapsed(), model_path.display());
        info!("  Input shape: {:?}", input.shape);
        info!("  Input dtype: {}", input.element_type);
        info!("  Output shape: {:?}", output.shape);

        self.model = Some(LoadedModel {
            interpreter,
            delegate,
            input,
            output,
            library_path: library_path.to_path_buf(),
        });

        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn input_spec(&self) -> Option<&TensorSpec> {
        self.model.as_ref().map(|m| &m.input)
    }

    pub fn output_spec(&self) -> Option<&TensorSpec> {
        self.model.as_ref().map(|m| &m.output)
    }

    pub fn library_path(&self) -> Option<&Path> {
        self.model.as_ref().map(|m| m.library_path.as_path())
    }

    /// Run one forward pass
    pub fn invoke(&mut self, input: &Tensor) -> Result<Tensor> {
        let model = self.model.as_mut().ok_or(Error::NotLoaded)?;
        model.input.check(input)?;

        model.interpreter.copy_input(model.input.index, input.as_bytes())?;
        model.interpreter.invoke()?;

        let mut output = Tensor::zeros(&model.output);
        model
            .interpreter
            .copy_output(model.output.index, output.as_bytes_mut())?;

        Ok(output)
    }
}

fn read_specs<I: Interpreter>(interpreter: &I) -> Result<(TensorSpec, TensorSpec)> {
    let inputs = interpreter.input_count();
    let outputs = interpreter.output_count();

    if inputs == 0 || outputs == 0 {
        return Err(Error::ModelLoad(format!(
            "model has {} input and {} output tensors",
            inputs, outputs
        )));
    }
    if inputs > 1 || outputs > 1 {
        warn!(
            "Model has {} inputs and {} outputs, only the first of each is used",
            inputs, outputs
        );
    }

    let input = interpreter.input_spec(0)?;
    let output = interpreter.output_spec(0)?;

    for spec in [&input, &output] {
        if spec.shape.is_empty() || spec.shape.iter().any(|&d| d == 0) {
            return Err(Error::ModelLoad(format!(
                "tensor '{}' has invalid shape {:?}",
                spec.name, spec.shape
            )));
        }
    }

    Ok((input, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockBackend, MockFailure};
    use crate::engine::tensor::ElementType;

    fn model_file() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    #[test]
    fn test_load_and_invoke() {
        let file = model_file();
        let mut runtime = ModelRuntime::new(MockBackend::mobilenet());
        assert!(!runtime.is_loaded());

        runtime.load(file.path(), Some(Path::new("/mock/libteflon.so"))).unwrap();
        assert!(runtime.is_loaded());
        assert_eq!(runtime.input_spec().unwrap().shape, vec![1, 224, 224, 3]);
        assert_eq!(runtime.output_spec().unwrap().shape, vec![1, 1001]);
        assert_eq!(runtime.library_path(), Some(Path::new("/mock/libteflon.so")));

        let input = Tensor::zeros(runtime.input_spec().unwrap());
        let output = runtime.invoke(&input).unwrap();
        assert_eq!(output.shape(), &[1, 1001]);
        assert_eq!(output.element_type(), ElementType::UInt8);
    }

    #[test]
    fn test_invoke_before_load() {
        let mut runtime = ModelRuntime::new(MockBackend::mobilenet());
        let spec = TensorSpec::new("input", 0, vec![1, 224, 224, 3], ElementType::UInt8);
        let err = runtime.invoke(&Tensor::zeros(&spec)).unwrap_err();
        assert!(matches!(err, Error::NotLoaded));
    }

    #[test]
    fn test_missing_library_is_no_accelerator() {
        let file = model_file();
        let mut runtime = ModelRuntime::new(MockBackend::mobilenet());
        let err = runtime.load(file.path(), None).unwrap_err();
        assert!(matches!(err, Error::NoAccelerator));
        assert!(!runtime.is_loaded());
    }

    #[test]
    fn test_missing_model_file() {
        let mut runtime = ModelRuntime::new(MockBackend::mobilenet());
        let err = runtime
            .load(Path::new("/nonexistent/model.tflite"), Some(Path::new("/mock/lib.so")))
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[test]
    fn test_each_load_stage_failure_leaves_runtime_unloaded() {
        let file = model_file();
        let cases = [
            (MockFailure::Delegate, "delegate"),
            (MockFailure::Interpreter, "interpreter"),
            (MockFailure::Allocate, "allocate"),
        ];

        for (failure, label) in cases {
            let mut runtime = ModelRuntime::new(MockBackend::mobilenet().failing(failure));
            let err = runtime
                .load(file.path(), Some(Path::new("/mock/libteflon.so")))
                .unwrap_err();
            match (failure, &err) {
                (MockFailure::Delegate, Error::DelegateLoad(_)) => {}
                (MockFailure::Interpreter, Error::ModelLoad(_)) => {}
                (MockFailure::Allocate, Error::Allocation(_)) => {}
                _ => panic!("{}: unexpected error {:?}", label, err),
            }
            assert!(!runtime.is_loaded(), "{}", label);
            assert!(runtime.input_spec().is_none());
        }
    }

    #[test]
    fn test_failed_reload_keeps_previous_model() {
        let file = model_file();
        let mut runtime = ModelRuntime::new(MockBackend::mobilenet());
        runtime.load(file.path(), Some(Path::new("/mock/libteflon.so"))).unwrap();

        let err = runtime.load(file.path(), None).unwrap_err();
        assert!(matches!(err, Error::NoAccelerator));
        assert!(runtime.is_loaded());
    }

    #[test]
    fn test_shape_mismatch_on_invoke() {
        let file = model_file();
        let mut runtime = ModelRuntime::new(MockBackend::mobilenet());
        runtime.load(file.path(), Some(Path::new("/mock/libteflon.so"))).unwrap();

        let wrong = Tensor::from_u8(vec![1, 10, 10, 3], vec![0; 300]).unwrap();
        assert!(matches!(runtime.invoke(&wrong), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_model_without_outputs_fails_to_load() {
        let file = model_file();
        let backend = MockBackend::new(
            vec![TensorSpec::new("input", 0, vec![1, 224, 224, 3], ElementType::UInt8)],
            vec![],
        );
        let mut runtime = ModelRuntime::new(backend);
        let err = runtime
            .load(file.path(), Some(Path::new("/mock/libteflon.so")))
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[test]
    fn test_extra_tensors_only_first_tracked() {
        let file = model_file();
        let backend = MockBackend::new(
            vec![
                TensorSpec::new("input", 0, vec![1, 224, 224, 3], ElementType::UInt8),
                TensorSpec::new("aux", 1, vec![1, 4], ElementType::UInt8),
            ],
            vec![
                TensorSpec::new("logits", 0, vec![1, 1001], ElementType::UInt8),
                TensorSpec::new("boxes", 1, vec![1, 4], ElementType::Float32),
            ],
        );
        let mut runtime = ModelRuntime::new(backend);
        runtime.load(file.path(), Some(Path::new("/mock/libteflon.so"))).unwrap();
        assert_eq!(runtime.input_spec().unwrap().name, "input");
        assert_eq!(runtime.output_spec().unwrap().name, "logits");
    }
}
