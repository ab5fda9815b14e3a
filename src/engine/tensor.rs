//! Typed tensor metadata and buffers

use std::fmt;

use crate::error::{Error, Result};

/// Element types the runtime understands
///
/// Discriminants follow the TensorFlow Lite `TfLiteType` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Float32,
    Int32,
    UInt8,
    Int64,
    Int16,
    Int8,
}

impl ElementType {
    /// Map a raw `TfLiteType` code
    pub fn from_tflite(code: i32) -> Option<Self> {
        match code {
            1 => Some(ElementType::Float32),
            2 => Some(ElementType::Int32),
            3 => Some(ElementType::UInt8),
            4 => Some(ElementType::Int64),
            7 => Some(ElementType::Int16),
            9 => Some(ElementType::Int8),
            _ => None,
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::UInt8 | ElementType::Int8 => 1,
            ElementType::Int16 => 2,
            ElementType::Float32 | ElementType::Int32 => 4,
            ElementType::Int64 => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Float32 => "float32",
            ElementType::Int32 => "int32",
            ElementType::UInt8 => "uint8",
            ElementType::Int64 => "int64",
            ElementType::Int16 => "int16",
            ElementType::Int8 => "int8",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape, element type and buffer index of one model tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub index: usize,
    pub shape: Vec<usize>,
    pub element_type: ElementType,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, index: usize, shape: Vec<usize>, element_type: ElementType) -> Self {
        Self {
            name: name.into(),
            index,
            shape,
            element_type,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.element_type.size_bytes()
    }

    /// Spatial size of an NHWC image input as (width, height)
    pub fn image_size(&self) -> Option<(u32, u32)> {
        match self.shape.as_slice() {
            [1, h, w, 3] => Some((*w as u32, *h as u32)),
            _ => None,
        }
    }

    /// Check that a tensor matches this spec exactly
    pub fn check(&self, tensor: &Tensor) -> Result<()> {
        if tensor.shape != self.shape || tensor.element_type != self.element_type {
            return Err(Error::ShapeMismatch {
                expected: format!("{:?} {}", self.shape, self.element_type),
                actual: format!("{:?} {}", tensor.shape, tensor.element_type),
            });
        }
        Ok(())
    }
}

/// Dense tensor buffer stored as native-endian bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    element_type: ElementType,
    data: Vec<u8>,
}

impl Tensor {
    /// Wrap raw bytes, checking that the length matches the shape
    pub fn from_bytes(shape: Vec<usize>, element_type: ElementType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * element_type.size_bytes();
        if data.len() != expected {
            return Err(Error::ShapeMismatch {
                expected: format!("{} bytes for {:?} {}", expected, shape, element_type),
                actual: format!("{} bytes", data.len()),
            });
        }
        Ok(Self {
            shape,
            element_type,
            data,
        })
    }

    pub fn from_u8(shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        Self::from_bytes(shape, ElementType::UInt8, data)
    }

    pub fn from_f32(shape: Vec<usize>, data: &[f32]) -> Result<Self> {
        let bytes = data.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(shape, ElementType::Float32, bytes)
    }

    /// Zero-filled tensor matching a spec
    pub fn zeros(spec: &TensorSpec) -> Self {
        Self {
            shape: spec.shape.clone(),
            element_type: spec.element_type,
            data: vec![0u8; spec.byte_size()],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode every element to f32 without dequantization
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let width = self.element_type.size_bytes();
        self.data
            .chunks_exact(width)
            .map(|c| match self.element_type {
                ElementType::UInt8 => c[0] as f32,
                ElementType::Int8 => c[0] as i8 as f32,
                ElementType::Int16 => i16::from_ne_bytes([c[0], c[1]]) as f32,
                ElementType::Int32 => i32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f32,
                ElementType::Float32 => f32::from_ne_bytes([c[0], c[1], c[2], c[3]]),
                ElementType::Int64 => {
                    let mut arr = [0u8; 8];
                    arr.copy_from_slice(c);
                    i64::from_ne_bytes(arr) as f32
                }
            })
            .collect()
    }
}
