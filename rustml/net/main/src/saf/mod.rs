//! Facade re-exports for rustml-net

pub use crate::api::config::*;
pub use crate::api::error::*;
pub use crate::api::traits::*;
pub use crate::api::types::*;
pub use crate::core::data::memory::InMemoryDataset;
pub use crate::core::data::mmap::MmapDataset;
pub use crate::core::data::spans::SequenceSpans;
pub use crate::core::data::tensor_file::{
    write_tensor_file, TensorFile, TensorFileHeader, DTYPE_F32, TENSOR_FILE_HEADER_LEN, TENSOR_FILE_MAGIC,
    TENSOR_FILE_VERSION,
};
pub use crate::core::data::tokens::TokenDataset;
pub use crate::core::model::kv::{DecodeScratch, KvBuffers, PositionalCache};
pub use crate::core::network::{Network, NetworkReadGuard, TransformerHandle};
pub use crate::core::persist::checkpoint::{
    shard_file_name, CheckpointManifest, CheckpointOptions, ShardEntry, ShardTensor, CHECKPOINT_FORMAT_VERSION,
    CHECKPOINT_MANIFEST, DEFAULT_SHARD_CAP,
};
pub use crate::core::persist::codec::{record_len, write_record, RecordReader, TensorRecord};
pub use crate::core::persist::legacy::{LegacyEdge, LegacyGraph, LegacyNode, GRAPH_FILE, LEGACY_FORMAT_VERSION};
pub use crate::core::persist::package::{
    ArchitectureFile, PackageManifest, TensorEntry, ARCHITECTURE_FILE, MANIFEST_FILE, PACKAGE_FORMAT_VERSION,
    WEIGHTS_FILE,
};
pub use crate::core::persist::TensorPart;
pub use rustml_kernels::{argmax, Activation, AttentionStrategy, NormKind, PackedDType};
