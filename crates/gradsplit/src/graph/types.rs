use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Element type of a tensor reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    I8,
    U8,
    I32,
    I64,
    F16,
    Bf16,
    F32,
    F64,
}

impl DType {
    pub fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::F16 | DType::Bf16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bool" => DType::Bool,
            "i8" => DType::I8,
            "u8" => DType::U8,
            "i32" => DType::I32,
            "i64" => DType::I64,
            "f16" => DType::F16,
            "bf16" => DType::Bf16,
            "f32" => DType::F32,
            "f64" => DType::F64,
            other => return Err(format!("unknown dtype `{other}`")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(i64),
    Symbolic(String),
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Static(value) => write!(f, "{value}"),
            Dimension::Symbolic(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: Vec<Dimension>) -> Self {
        Shape { dims }
    }

    pub fn from_static(dims: &[i64]) -> Self {
        Shape {
            dims: dims.iter().copied().map(Dimension::Static).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns the concrete extents when no dimension is symbolic.
    pub fn static_dims(&self) -> Option<Vec<i64>> {
        self.dims
            .iter()
            .map(|dim| match dim {
                Dimension::Static(value) => Some(*value),
                Dimension::Symbolic(_) => None,
            })
            .collect()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

/// Optional element type and shape carried by a tensor reference.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TypeInfo {
    pub dtype: Option<DType>,
    pub shape: Option<Shape>,
}

impl TypeInfo {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        TypeInfo {
            dtype: Some(dtype),
            shape: Some(shape),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.dtype.is_none() && self.shape.is_none()
    }

    /// Same element type, shape dropped.
    pub fn without_shape(&self) -> TypeInfo {
        TypeInfo {
            dtype: self.dtype,
            shape: None,
        }
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dtype {
            Some(dtype) => write!(f, "{dtype}")?,
            None => f.write_str("?")?,
        }
        if let Some(shape) = &self.shape {
            write!(f, "{shape}")?;
        }
        Ok(())
    }
}

/// Named tensor reference record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    #[serde(default)]
    pub ty: TypeInfo,
}

impl ValueInfo {
    pub fn new(name: impl Into<String>) -> Self {
        ValueInfo {
            name: name.into(),
            ty: TypeInfo::default(),
        }
    }

    pub fn with_type(name: impl Into<String>, ty: TypeInfo) -> Self {
        ValueInfo {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Str(String),
    Strs(Vec<String>),
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            f.write_str("[")?;
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            f.write_str("]")
        }

        match self {
            Attribute::Int(value) => write!(f, "{value}"),
            Attribute::Float(value) => write!(f, "{value:?}"),
            Attribute::Ints(values) => list(f, values),
            Attribute::Floats(values) => {
                let rendered: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
                list(f, &rendered)
            }
            Attribute::Str(value) => write!(f, "{value:?}"),
            Attribute::Strs(values) => {
                let rendered: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
                list(f, &rendered)
            }
        }
    }
}

/// Name-addressed constant tensor. The payload is opaque little-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initializer {
    pub dtype: DType,
    pub dims: Vec<i64>,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Initializer {
    pub fn new(dtype: DType, dims: Vec<i64>, data: Vec<u8>) -> Self {
        Initializer { dtype, dims, data }
    }

    pub fn zeros(dtype: DType, dims: Vec<i64>) -> Self {
        let elements: i64 = dims.iter().product();
        let len = elements.max(0) as usize * dtype.size_in_bytes();
        Initializer {
            dtype,
            dims,
            data: vec![0; len],
        }
    }

    pub fn type_info(&self) -> TypeInfo {
        TypeInfo::new(self.dtype, Shape::from_static(&self.dims))
    }
}
