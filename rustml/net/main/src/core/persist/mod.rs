//! On-disk formats: model packages (v2 packed tensors, v1 legacy graph) and
//! sharded training checkpoints.

pub mod checkpoint;
pub mod codec;
pub mod legacy;
pub mod package;

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::error::{NetError, NetResult};

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> NetResult<T> {
    if !path.is_file() {
        return Err(NetError::MissingFile(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> NetResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text)?;
    Ok(())
}

use crate::core::params::{ParamId, ParamStore};

/// Which buffer of a parameter tensor a stored record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorPart {
    Value,
    /// AdamW first moment or SGD velocity.
    FirstMoment,
    SecondMoment,
}

impl TensorPart {
    pub const ALL: [TensorPart; 3] = [TensorPart::Value, TensorPart::FirstMoment, TensorPart::SecondMoment];

    /// Record-name suffix appended to the tensor name.
    pub fn suffix(self) -> &'static str {
        match self {
            TensorPart::Value => "",
            TensorPart::FirstMoment => ".m",
            TensorPart::SecondMoment => ".v",
        }
    }

    pub fn record_name(self, tensor: &str) -> String {
        format!("{}{}", tensor, self.suffix())
    }
}

/// Copies `data` into the named tensor after checking the exact element count.
pub(crate) fn assign_tensor(store: &mut ParamStore, name: &str, part: TensorPart, data: &[f32]) -> NetResult<ParamId> {
    let id = store
        .find(name)
        .ok_or_else(|| NetError::BuildFailed(format!("unknown tensor '{}'", name)))?;
    let t = store.get_mut(id);
    let dst = match part {
        TensorPart::Value => &mut t.value,
        TensorPart::FirstMoment => &mut t.m,
        TensorPart::SecondMoment => &mut t.v,
    };
    if dst.len() != data.len() {
        return Err(NetError::TensorMismatch {
            name: part.record_name(name),
            expected: dst.len(),
            found: data.len(),
        });
    }
    dst.copy_from_slice(data);
    Ok(id)
}
