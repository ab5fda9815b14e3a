//! TensorFlow Lite backend
//!
//! Binds the TensorFlow Lite C API and an external delegate plugin at
//! runtime through `libloading`, so the service starts (degraded) on
//! machines without either library.

use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::runtime::{Interpreter, InterpreterBackend};
use super::tensor::{ElementType, TensorSpec};

type TfLiteStatus = c_int;
const TFLITE_OK: TfLiteStatus = 0;

type ModelCreateFromFile = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type ModelDelete = unsafe extern "C" fn(*mut c_void);
type OptionsCreate = unsafe extern "C" fn() -> *mut c_void;
type OptionsDelete = unsafe extern "C" fn(*mut c_void);
type OptionsSetNumThreads = unsafe extern "C" fn(*mut c_void, i32);
type OptionsAddDelegate = unsafe extern "C" fn(*mut c_void, *mut c_void);
type InterpreterCreate = unsafe extern "C" fn(*const c_void, *const c_void) -> *mut c_void;
type InterpreterDelete = unsafe extern "C" fn(*mut c_void);
type InterpreterStatusFn = unsafe extern "C" fn(*mut c_void) -> TfLiteStatus;
type TensorCount = unsafe extern "C" fn(*const c_void) -> i32;
type TensorAt = unsafe extern "C" fn(*const c_void, i32) -> *mut c_void;
type TensorType = unsafe extern "C" fn(*const c_void) -> c_int;
type TensorNumDims = unsafe extern "C" fn(*const c_void) -> i32;
type TensorDim = unsafe extern "C" fn(*const c_void, i32) -> i32;
type TensorByteSize = unsafe extern "C" fn(*const c_void) -> usize;
type TensorName = unsafe extern "C" fn(*const c_void) -> *const c_char;
type TensorCopyFrom = unsafe extern "C" fn(*mut c_void, *const c_void, usize) -> TfLiteStatus;
type TensorCopyTo = unsafe extern "C" fn(*const c_void, *mut c_void, usize) -> TfLiteStatus;

type ErrorReporter = extern "C" fn(*const c_char);
type PluginCreate =
    unsafe extern "C" fn(*const *const c_char, *const *const c_char, usize, Option<ErrorReporter>) -> *mut c_void;
type PluginDestroy = unsafe extern "C" fn(*mut c_void);

/// Function table of the TensorFlow Lite C API
struct TfLiteApi {
    model_create_from_file: ModelCreateFromFile,
    model_delete: ModelDelete,
    options_create: OptionsCreate,
    options_delete: OptionsDelete,
    options_set_num_threads: OptionsSetNumThreads,
    options_add_delegate: OptionsAddDelegate,
    interpreter_create: InterpreterCreate,
    interpreter_delete: InterpreterDelete,
    allocate_tensors: InterpreterStatusFn,
    invoke: InterpreterStatusFn,
    input_count: TensorCount,
    input_tensor: TensorAt,
    output_count: TensorCount,
    output_tensor: TensorAt,
    tensor_type: TensorType,
    tensor_num_dims: TensorNumDims,
    tensor_dim: TensorDim,
    tensor_byte_size: TensorByteSize,
    tensor_name: TensorName,
    tensor_copy_from_buffer: TensorCopyFrom,
    tensor_copy_to_buffer: TensorCopyTo,
    // Keeps every pointer above valid
    _library: Library,
}

/// Resolve one symbol as a plain function pointer
///
/// # Safety
/// `T` must match the C signature of `name`.
unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> std::result::Result<T, String> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    library
        .get::<T>(&bytes)
        .map(|s| *s)
        .map_err(|e| format!("missing symbol {}: {}", name, e))
}

impl TfLiteApi {
    fn open(path: &Path) -> std::result::Result<Self, String> {
        // SAFETY: loading a shared library runs its initializers; the
        // TensorFlow Lite C library has no unusual ones.
        let library = unsafe { Library::new(path) }
            .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;

        // SAFETY: signatures follow tensorflow/lite/core/c/c_api.h
        unsafe {
            Ok(Self {
                model_create_from_file: symbol(&library, "TfLiteModelCreateFromFile")?,
                model_delete: symbol(&library, "TfLiteModelDelete")?,
                options_create: symbol(&library, "TfLiteInterpreterOptionsCreate")?,
                options_delete: symbol(&library, "TfLiteInterpreterOptionsDelete")?,
                options_set_num_threads: symbol(&library, "TfLiteInterpreterOptionsSetNumThreads")?,
                options_add_delegate: symbol(&library, "TfLiteInterpreterOptionsAddDelegate")?,
                interpreter_create: symbol(&library, "TfLiteInterpreterCreate")?,
                interpreter_delete: symbol(&library, "TfLiteInterpreterDelete")?,
                allocate_tensors: symbol(&library, "TfLiteInterpreterAllocateTensors")?,
                invoke: symbol(&library, "TfLiteInterpreterInvoke")?,
                input_count: symbol(&library, "TfLiteInterpreterGetInputTensorCount")?,
                input_tensor: symbol(&library, "TfLiteInterpreterGetInputTensor")?,
                output_count: symbol(&library, "TfLiteInterpreterGetOutputTensorCount")?,
                output_tensor: symbol(&library, "TfLiteInterpreterGetOutputTensor")?,
                tensor_type: symbol(&library, "TfLiteTensorType")?,
                tensor_num_dims: symbol(&library, "TfLiteTensorNumDims")?,
                tensor_dim: symbol(&library, "TfLiteTensorDim")?,
                tensor_byte_size: symbol(&library, "TfLiteTensorByteSize")?,
                tensor_name: symbol(&library, "TfLiteTensorName")?,
                tensor_copy_from_buffer: symbol(&library, "TfLiteTensorCopyFromBuffer")?,
                tensor_copy_to_buffer: symbol(&library, "TfLiteTensorCopyToBuffer")?,
                _library: library,
            })
        }
    }
}

extern "C" fn report_delegate_error(message: *const c_char) {
    if message.is_null() {
        return;
    }
    // SAFETY: the plugin passes a NUL-terminated string valid for this call
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    warn!("Delegate: {}", message);
}

/// A loaded external delegate plugin
pub struct Delegate {
    handle: *mut c_void,
    destroy: PluginDestroy,
    path: PathBuf,
    _library: Library,
}

// The delegate is only touched from the thread holding the runtime lock
unsafe impl Send for Delegate {}

impl Delegate {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Delegate {
    fn drop(&mut self) {
        // SAFETY: handle came from tflite_plugin_create_delegate of this
        // library, and every interpreter using it has been dropped already.
        unsafe { (self.destroy)(self.handle) };
    }
}

/// An interpreter created through the C API
pub struct TfLiteInterpreter {
    api: Arc<TfLiteApi>,
    model: *mut c_void,
    interpreter: *mut c_void,
}

// Access is serialized by the engine mutex, so moving the handle across
// threads is sound.
unsafe impl Send for TfLiteInterpreter {}

impl Drop for TfLiteInterpreter {
    fn drop(&mut self) {
        // SAFETY: both pointers were created by this API and are deleted once
        unsafe {
            (self.api.interpreter_delete)(self.interpreter);
            (self.api.model_delete)(self.model);
        }
    }
}

impl TfLiteInterpreter {
    fn spec_of(&self, tensor: *const c_void, index: usize) -> Result<TensorSpec> {
        let api = &self.api;
        // SAFETY: tensor is a live pointer owned by self.interpreter
        unsafe {
            let code = (api.tensor_type)(tensor);
            let element_type = ElementType::from_tflite(code)
                .ok_or_else(|| Error::ModelLoad(format!("unsupported tensor type code {}", code)))?;

            let rank = (api.tensor_num_dims)(tensor);
            let mut shape = Vec::with_capacity(rank.max(0) as usize);
            for d in 0..rank {
                let dim = (api.tensor_dim)(tensor, d);
                if dim <= 0 {
                    return Err(Error::ModelLoad(format!("dimension {} is {}", d, dim)));
                }
                shape.push(dim as usize);
            }

            let name_ptr = (api.tensor_name)(tensor);
            let name = if name_ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(name_ptr).to_string_lossy().into_owned()
            };

            Ok(TensorSpec::new(name, index, shape, element_type))
        }
    }

    fn input_tensor(&self, index: usize) -> Option<*mut c_void> {
        if index >= self.input_count() {
            return None;
        }
        // SAFETY: index is within the tensor count
        let ptr = unsafe { (self.api.input_tensor)(self.interpreter, index as i32) };
        (!ptr.is_null()).then_some(ptr)
    }

    fn output_tensor(&self, index: usize) -> Option<*mut c_void> {
        if index >= self.output_count() {
            return None;
        }
        // SAFETY: index is within the tensor count
        let ptr = unsafe { (self.api.output_tensor)(self.interpreter, index as i32) };
        (!ptr.is_null()).then_some(ptr)
    }
}

impl Interpreter for TfLiteInterpreter {
    fn allocate_tensors(&mut self) -> Result<()> {
        // SAFETY: interpreter is live
        let status = unsafe { (self.api.allocate_tensors)(self.interpreter) };
        if status != TFLITE_OK {
            return Err(Error::Allocation(format!("TfLiteInterpreterAllocateTensors returned {}", status)));
        }
        Ok(())
    }

    fn input_count(&self) -> usize {
        // SAFETY: interpreter is live
        unsafe { (self.api.input_count)(self.interpreter) }.max(0) as usize
    }

    fn output_count(&self) -> usize {
        // SAFETY: interpreter is live
        unsafe { (self.api.output_count)(self.interpreter) }.max(0) as usize
    }

    fn input_spec(&self, index: usize) -> Result<TensorSpec> {
        let tensor = self
            .input_tensor(index)
            .ok_or_else(|| Error::ModelLoad(format!("no input tensor {}", index)))?;
        self.spec_of(tensor, index)
    }

    fn output_spec(&self, index: usize) -> Result<TensorSpec> {
        let tensor = self
            .output_tensor(index)
            .ok_or_else(|| Error::ModelLoad(format!("no output tensor {}", index)))?;
        self.spec_of(tensor, index)
    }

    fn copy_input(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let tensor = self
            .input_tensor(index)
            .ok_or_else(|| Error::Invoke(format!("no input tensor {}", index)))?;
        // SAFETY: tensor is live and the copy is bounded by data.len(),
        // which the C API checks against the tensor byte size
        unsafe {
            let expected = (self.api.tensor_byte_size)(tensor);
            if expected != data.len() {
                return Err(Error::shape_mismatch(expected, data.len()));
            }
            let status = (self.api.tensor_copy_from_buffer)(tensor, data.as_ptr() as *const c_void, data.len());
            if status != TFLITE_OK {
                return Err(Error::Invoke(format!("TfLiteTensorCopyFromBuffer returned {}", status)));
            }
        }
        Ok(())
    }

    fn invoke(&mut self) -> Result<()> {
        // SAFETY: interpreter is live and tensors are allocated
        let status = unsafe { (self.api.invoke)(self.interpreter) };
        if status != TFLITE_OK {
            return Err(Error::Invoke(format!("TfLiteInterpreterInvoke returned {}", status)));
        }
        Ok(())
    }

    fn copy_output(&self, index: usize, out: &mut [u8]) -> Result<()> {
        let tensor = self
            .output_tensor(index)
            .ok_or_else(|| Error::Invoke(format!("no output tensor {}", index)))?;
        // SAFETY: see copy_input
        unsafe {
            let size = (self.api.tensor_byte_size)(tensor);
            if size != out.len() {
                return Err(Error::shape_mismatch(size, out.len()));
            }
            let status = (self.api.tensor_copy_to_buffer)(tensor, out.as_mut_ptr() as *mut c_void, out.len());
            if status != TFLITE_OK {
                return Err(Error::Invoke(format!("TfLiteTensorCopyToBuffer returned {}", status)));
            }
        }
        Ok(())
    }
}

/// Production backend: TensorFlow Lite C library plus an external delegate
pub struct TfLiteBackend {
    runtime_library: PathBuf,
    num_threads: Option<i32>,
    delegate_options: BTreeMap<String, String>,
    api: Mutex<Option<Arc<TfLiteApi>>>,
}

impl TfLiteBackend {
    pub fn new(runtime_library: impl Into<PathBuf>) -> Self {
        Self {
            runtime_library: runtime_library.into(),
            num_threads: None,
            delegate_options: BTreeMap::new(),
            api: Mutex::new(None),
        }
    }

    pub fn with_num_threads(mut self, num_threads: Option<i32>) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_delegate_options(mut self, options: BTreeMap<String, String>) -> Self {
        self.delegate_options = options;
        self
    }

    fn api(&self) -> Result<Arc<TfLiteApi>> {
        let mut slot = self.api.lock();
        if let Some(api) = slot.as_ref() {
            return Ok(api.clone());
        }
        let api = Arc::new(TfLiteApi::open(&self.runtime_library).map_err(Error::ModelLoad)?);
        info!("TensorFlow Lite C API loaded from {}", self.runtime_library.display());
        *slot = Some(api.clone());
        Ok(api)
    }
}

impl InterpreterBackend for TfLiteBackend {
    type Delegate = Delegate;
    type Interpreter = TfLiteInterpreter;

    fn load_delegate(&self, library: &Path) -> Result<Delegate> {
        // SAFETY: see TfLiteApi::open
        let lib = unsafe { Library::new(library) }
            .map_err(|e| Error::DelegateLoad(format!("cannot open {}: {}", library.display(), e)))?;

        // SAFETY: external delegate ABI from tensorflow/lite/delegates/external
        let (create, destroy) = unsafe {
            let create: PluginCreate = symbol(&lib, "tflite_plugin_create_delegate").map_err(Error::DelegateLoad)?;
            let destroy: PluginDestroy = symbol(&lib, "tflite_plugin_destroy_delegate").map_err(Error::DelegateLoad)?;
            (create, destroy)
        };

        let to_cstrings = |items: Vec<&String>| -> Result<Vec<CString>> {
            items
                .into_iter()
                .map(|s| CString::new(s.as_str()).map_err(|e| Error::DelegateLoad(e.to_string())))
                .collect()
        };
        let keys = to_cstrings(self.delegate_options.keys().collect())?;
        let values = to_cstrings(self.delegate_options.values().collect())?;
        let key_ptrs: Vec<*const c_char> = keys.iter().map(|k| k.as_ptr()).collect();
        let value_ptrs: Vec<*const c_char> = values.iter().map(|v| v.as_ptr()).collect();

        // SAFETY: option arrays outlive the call and have matching lengths
        let handle = unsafe {
            create(
                key_ptrs.as_ptr(),
                value_ptrs.as_ptr(),
                key_ptrs.len(),
                Some(report_delegate_error as ErrorReporter),
            )
        };
        if handle.is_null() {
            return Err(Error::DelegateLoad(format!(
                "{} returned a null delegate",
                library.display()
            )));
        }

        Ok(Delegate {
            handle,
            destroy,
            path: library.to_path_buf(),
            _library: lib,
        })
    }

    fn create_interpreter(&self, model: &Path, delegate: &Delegate) -> Result<TfLiteInterpreter> {
        let api = self.api()?;
        let model_path = CString::new(model.as_os_str().as_bytes())
            .map_err(|e| Error::ModelLoad(e.to_string()))?;

        // SAFETY: pointers are created and released in pairs below
        unsafe {
            let model_ptr = (api.model_create_from_file)(model_path.as_ptr());
            if model_ptr.is_null() {
                return Err(Error::ModelLoad(format!("cannot read model {}", model.display())));
            }

            let options = (api.options_create)();
            if let Some(n) = self.num_threads {
                (api.options_set_num_threads)(options, n);
            }
            (api.options_add_delegate)(options, delegate.handle);

            let interpreter = (api.interpreter_create)(model_ptr, options);
            (api.options_delete)(options);

            if interpreter.is_null() {
                (api.model_delete)(model_ptr);
                return Err(Error::ModelLoad(format!(
                    "interpreter creation failed for {} with delegate {}",
                    model.display(),
                    delegate.path().display()
                )));
            }

            Ok(TfLiteInterpreter {
                api: api.clone(),
                model: model_ptr,
                interpreter,
            })
        }
    }
}
