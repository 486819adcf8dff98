//! Little-endian byte packing for the safetensors files written by this crate.
use crate::error::{Result, SurfScoreError};
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::path::Path;

/// An owned tensor waiting to be serialized.
pub(crate) struct RawTensor {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl RawTensor {
    pub fn f32<'a>(shape: Vec<usize>, values: impl IntoIterator<Item = &'a f32>) -> Self {
        Self {
            dtype: Dtype::F32,
            shape,
            data: values.into_iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn i64(shape: Vec<usize>, values: impl IntoIterator<Item = i64>) -> Self {
        Self {
            dtype: Dtype::I64,
            shape,
            data: values.into_iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn u32<'a>(shape: Vec<usize>, values: impl IntoIterator<Item = &'a u32>) -> Self {
        Self {
            dtype: Dtype::U32,
            shape,
            data: values.into_iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn u8(shape: Vec<usize>, values: Vec<u8>) -> Self {
        Self {
            dtype: Dtype::U8,
            shape,
            data: values,
        }
    }
}

pub(crate) fn write_file(
    path: &Path,
    tensors: &[(&str, RawTensor)],
    metadata: HashMap<String, String>,
) -> Result<()> {
    let views = tensors
        .iter()
        .map(|(name, raw)| {
            TensorView::new(raw.dtype, raw.shape.clone(), &raw.data).map(|view| (*name, view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(SurfScoreError::safetensors(path))?;
    safetensors::serialize_to_file(views, &Some(metadata), path)
        .map_err(SurfScoreError::safetensors(path))
}

/// Parsed file contents: header metadata and the tensor table.
pub(crate) struct TensorFile<'a> {
    path: &'a Path,
    pub metadata: HashMap<String, String>,
    tensors: SafeTensors<'a>,
}

impl<'a> TensorFile<'a> {
    pub fn parse(path: &'a Path, buffer: &'a [u8]) -> Result<Self> {
        let (_, header) =
            SafeTensors::read_metadata(buffer).map_err(SurfScoreError::safetensors(path))?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = SafeTensors::deserialize(buffer).map_err(SurfScoreError::safetensors(path))?;
        Ok(Self {
            path,
            metadata,
            tensors,
        })
    }

    /// Checks the `format` and `schema_version` header entries.
    pub fn expect_format(&self, format: &str, version: u32) -> Result<()> {
        match self.metadata.get("format") {
            Some(found) if found == format => {}
            Some(found) => {
                return Err(SurfScoreError::schema(
                    self.path,
                    format!("expected format `{format}`, found `{found}`"),
                ))
            }
            None => return Err(SurfScoreError::schema(self.path, "missing `format` metadata")),
        }
        let found: u32 = self
            .metadata
            .get("schema_version")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| SurfScoreError::schema(self.path, "missing `schema_version` metadata"))?;
        if found != version {
            return Err(SurfScoreError::schema(
                self.path,
                format!("unsupported schema version {found}, expected {version}"),
            ));
        }
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Result<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| SurfScoreError::schema(self.path, format!("missing `{key}` metadata")))
    }

    fn view(&self, name: &str, dtype: Dtype) -> Result<TensorView<'a>> {
        let view = self
            .tensors
            .tensor(name)
            .map_err(|_| SurfScoreError::schema(self.path, format!("missing tensor `{name}`")))?;
        if view.dtype() != dtype {
            return Err(SurfScoreError::schema(
                self.path,
                format!("tensor `{name}` is {:?}, expected {dtype:?}", view.dtype()),
            ));
        }
        Ok(view)
    }

    pub fn f32(&self, name: &str) -> Result<ArrayD<f32>> {
        let view = self.view(name, Dtype::F32)?;
        let values = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        self.shaped(name, view.shape(), values)
    }

    pub fn i64(&self, name: &str) -> Result<ArrayD<i64>> {
        let view = self.view(name, Dtype::I64)?;
        let values = view
            .data()
            .chunks_exact(8)
            .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect();
        self.shaped(name, view.shape(), values)
    }

    pub fn u32(&self, name: &str) -> Result<ArrayD<u32>> {
        let view = self.view(name, Dtype::U32)?;
        let values = view
            .data()
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        self.shaped(name, view.shape(), values)
    }

    pub fn u8(&self, name: &str) -> Result<ArrayD<u8>> {
        let view = self.view(name, Dtype::U8)?;
        self.shaped(name, view.shape(), view.data().to_vec())
    }

    fn shaped<T>(&self, name: &str, shape: &[usize], values: Vec<T>) -> Result<ArrayD<T>> {
        ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|e| {
            SurfScoreError::schema(self.path, format!("tensor `{name}`: {e}"))
        })
    }

    pub fn schema_error(&self, message: impl Into<String>) -> SurfScoreError {
        SurfScoreError::schema(self.path, message)
    }
}
