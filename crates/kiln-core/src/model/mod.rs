//! Model configuration: typed structs, validation, and pbtxt parsing.

mod config;
mod pbtxt;

pub use config::{
    BatchProfile, DynamicBatching, ModelConfig, Reshape, TensorConfig, VersionPolicy,
};
