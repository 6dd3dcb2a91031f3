//! Serialized model container and the codecs used to move it across the
//! builder boundary.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Graph;
use crate::error::{GraphError, GraphResult};

pub const SPEC_VERSION: &str = "gradsplit.v1";

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

fn default_producer() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

/// A graph plus the metadata that travels with it on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    #[serde(default = "default_producer")]
    pub producer: String,
    /// Operator domain to opset version.
    #[serde(default)]
    pub opset_imports: BTreeMap<String, i64>,
    pub graph: Graph,
}

#[derive(Debug, Error)]
pub enum ModelSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("model spec version '{found}' does not match expected '{expected}'")]
    SpecVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ModelIoError {
    #[error(transparent)]
    Serialization(#[from] ModelSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Model {
    pub fn new(graph: Graph) -> Self {
        Model {
            spec_version: SPEC_VERSION.to_string(),
            producer: default_producer(),
            opset_imports: BTreeMap::new(),
            graph,
        }
    }

    pub fn with_opset(mut self, domain: impl Into<String>, version: i64) -> Self {
        self.opset_imports.insert(domain.into(), version);
        self
    }

    /// Same metadata, different graph.
    pub fn with_graph(&self, graph: Graph) -> Model {
        Model {
            spec_version: self.spec_version.clone(),
            producer: self.producer.clone(),
            opset_imports: self.opset_imports.clone(),
            graph,
        }
    }

    pub fn to_json_string(&self) -> Result<String, ModelSerdeError> {
        serde_json::to_string_pretty(self).map_err(ModelSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ModelSerdeError> {
        let mut model: Model = serde_json::from_str(src).map_err(ModelSerdeError::from)?;
        model.spec_version = normalize_spec_version(model.spec_version)?;
        Ok(model)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, ModelSerdeError> {
        bincode::serialize(self).map_err(ModelSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, ModelSerdeError> {
        let mut model: Model = bincode::deserialize(bytes).map_err(ModelSerdeError::from)?;
        model.spec_version = normalize_spec_version(model.spec_version)?;
        Ok(model)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(ModelIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ModelIoError> {
        let contents = fs::read_to_string(path).map_err(ModelIoError::from)?;
        Model::from_json_str(&contents).map_err(ModelIoError::from)
    }

    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelIoError> {
        let bytes = self.to_bincode_bytes()?;
        fs::write(path, bytes).map_err(ModelIoError::from)
    }

    pub fn load_bincode<P: AsRef<Path>>(path: P) -> Result<Self, ModelIoError> {
        let bytes = fs::read(path).map_err(ModelIoError::from)?;
        Model::from_bincode_slice(&bytes).map_err(ModelIoError::from)
    }
}

fn normalize_spec_version(version: String) -> Result<String, ModelSerdeError> {
    if version.is_empty() {
        return Ok(SPEC_VERSION.to_string());
    }
    if version == SPEC_VERSION {
        Ok(version)
    } else {
        Err(ModelSerdeError::SpecVersionMismatch {
            found: version,
            expected: SPEC_VERSION,
        })
    }
}

/// Wire format understood by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    #[default]
    Bincode,
    Json,
}

impl ModelFormat {
    pub fn codec(self) -> &'static dyn ModelCodec {
        match self {
            ModelFormat::Bincode => &BincodeCodec,
            ModelFormat::Json => &JsonCodec,
        }
    }
}

/// Turns bytes into a resolved [`Model`] and back.
pub trait ModelCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, bytes: &[u8]) -> Result<Model, ModelSerdeError>;

    fn encode(&self, model: &Model) -> Result<Vec<u8>, ModelSerdeError>;

    /// Decodes and resolves. Both failures surface as [`GraphError::ModelLoad`].
    fn load(&self, bytes: &[u8]) -> GraphResult<Model> {
        let mut model = self
            .decode(bytes)
            .map_err(|err| GraphError::ModelLoad(format!("{} decode: {err}", self.name())))?;
        model
            .graph
            .resolve()
            .map_err(|err| GraphError::ModelLoad(err.to_string()))?;
        Ok(model)
    }

    fn save(&self, model: &Model) -> GraphResult<Vec<u8>> {
        self.encode(model)
            .map_err(|err| GraphError::Serialization(format!("{} encode: {err}", self.name())))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl ModelCodec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Model, ModelSerdeError> {
        Model::from_bincode_slice(bytes)
    }

    fn encode(&self, model: &Model) -> Result<Vec<u8>, ModelSerdeError> {
        model.to_bincode_bytes()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ModelCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Model, ModelSerdeError> {
        let mut model: Model = serde_json::from_slice(bytes)?;
        model.spec_version = normalize_spec_version(model.spec_version)?;
        Ok(model)
    }

    fn encode(&self, model: &Model) -> Result<Vec<u8>, ModelSerdeError> {
        model.to_json_string().map(String::into_bytes)
    }
}
