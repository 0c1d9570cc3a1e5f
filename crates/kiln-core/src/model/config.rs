//! Typed model configuration and its validator.
//!
//! The on-disk `config.pbtxt` is lowered to JSON by [`super::pbtxt`] and then
//! deserialized into [`ModelConfig`]. A configuration is immutable once its
//! model loads; [`ModelConfig::validate`] runs before any load and names the
//! first offending field on failure.

use serde::{Deserialize, Deserializer, Serialize};

use kiln_types::{DataType, WILDCARD_DIM};

use crate::error::Error;

/// Declarative per-model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Model name; must match the repository directory name.
    #[serde(default)]
    pub name: String,

    /// `0` means the model does not support framework batching.
    #[serde(default)]
    pub max_batch_size: u32,

    /// Declared inputs, in order.
    #[serde(default, rename = "input", deserialize_with = "one_or_many")]
    pub inputs: Vec<TensorConfig>,

    /// Declared outputs, in order.
    #[serde(default, rename = "output", deserialize_with = "one_or_many")]
    pub outputs: Vec<TensorConfig>,

    /// Which versions of this model are eligible to serve.
    #[serde(default)]
    pub version_policy: VersionPolicy,

    /// Dynamic batching preferences; absent means one request per batch.
    #[serde(default)]
    pub dynamic_batching: Option<DynamicBatching>,

    /// Normalization profile, selected once per model.
    #[serde(default)]
    pub batch_profile: BatchProfile,

    /// Parallel execution instances the backend should create.
    #[serde(default = "default_instance_count")]
    pub instance_count: u32,

    /// Set on configurations synthesized for models without a `config.pbtxt`.
    #[serde(default, skip_serializing)]
    pub auto_generated: bool,
}

/// One declared input or output tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorConfig {
    pub name: String,
    pub data_type: DataType,
    /// `-1` entries are wildcard dimensions.
    #[serde(default, deserialize_with = "one_or_many")]
    pub dims: Vec<i64>,
    /// Optional rewrite of the declared shape; wildcards pair in order with
    /// the wildcards of `dims`.
    #[serde(default)]
    pub reshape: Option<Reshape>,
    #[serde(default)]
    pub is_shape_tensor: bool,
}

/// Reshape block: `reshape { shape: [ ... ] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reshape {
    #[serde(default, deserialize_with = "one_or_many")]
    pub shape: Vec<i64>,
}

/// Version eligibility policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Serve the `num_versions` highest-numbered versions.
    Latest {
        #[serde(default = "default_num_versions")]
        num_versions: u32,
    },
    /// Serve every version present in the repository.
    All {},
    /// Serve exactly the listed versions.
    Specific {
        #[serde(default, deserialize_with = "one_or_many")]
        versions: Vec<i64>,
    },
}

impl Default for VersionPolicy {
    fn default() -> Self {
        VersionPolicy::Latest { num_versions: 1 }
    }
}

/// Scheduling preferences for the dynamic batcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicBatching {
    /// Batch sizes that trigger immediate dispatch. Empty means any size.
    #[serde(
        default,
        rename = "preferred_batch_size",
        deserialize_with = "one_or_many"
    )]
    pub preferred_batch_sizes: Vec<u32>,

    /// Longest time a request may wait for co-batching, in microseconds.
    #[serde(default)]
    pub max_queue_delay_us: u64,

    /// Number of priority levels; higher numeric levels are served first.
    #[serde(default = "default_priority_levels")]
    pub priority_levels: u32,

    /// Level assigned to requests with priority `0` or out of range.
    #[serde(default = "default_priority_levels")]
    pub default_priority_level: u32,
}

impl Default for DynamicBatching {
    fn default() -> Self {
        Self {
            preferred_batch_sizes: Vec::new(),
            max_queue_delay_us: 0,
            priority_levels: 1,
            default_priority_level: 1,
        }
    }
}

/// How request batch sizes relate to input shapes.
///
/// The profile is part of the model contract and is chosen once, at load
/// time; callers never select it per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchProfile {
    /// Batch size is the common leading dimension of every input; the
    /// leading dimension is stripped into the working shape.
    #[default]
    LeadingDim,
    /// Batch size is a request-level integer; input shapes do not carry a
    /// batch dimension and caller byte sizes are cross-validated.
    RequestLevel,
}

fn default_instance_count() -> u32 {
    1
}

fn default_num_versions() -> u32 {
    1
}

fn default_priority_levels() -> u32 {
    1
}

/// Accept either a single value or a list for repeated text-format fields.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

// ─── Parsing and validation ───────────────────────────────────────────────────

impl ModelConfig {
    /// Parse a `config.pbtxt` body.
    ///
    /// `directory_name` fills a missing `name` field; a present name that
    /// contradicts the directory is rejected.
    pub fn from_pbtxt(text: &str, directory_name: &str) -> Result<Self, Error> {
        let value = super::pbtxt::parse(text)?;
        let mut config: ModelConfig = serde_json::from_value(value)
            .map_err(|e| Error::invalid_config("config.pbtxt", e.to_string()))?;
        if config.name.is_empty() {
            config.name = directory_name.to_owned();
        } else if config.name != directory_name {
            return Err(Error::invalid_config(
                "name",
                format!(
                    "configured name '{}' does not match directory '{}'",
                    config.name, directory_name
                ),
            ));
        }
        Ok(config)
    }

    /// Synthesize a minimal configuration for a model directory without a
    /// `config.pbtxt` (non-strict mode only). Skips validation; the backend
    /// factory is expected to know the model's real contract.
    pub fn auto_generated(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            max_batch_size: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            version_policy: VersionPolicy::default(),
            dynamic_batching: None,
            batch_profile: BatchProfile::default(),
            instance_count: 1,
            auto_generated: true,
        }
    }

    /// Cross-check the configuration; returns [`Error::InvalidConfig`] naming
    /// the first offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::invalid_config("name", "must not be empty"));
        }
        if self.inputs.is_empty() {
            return Err(Error::invalid_config("input", "at least one input required"));
        }
        if self.outputs.is_empty() {
            return Err(Error::invalid_config(
                "output",
                "at least one output required",
            ));
        }
        if self.instance_count == 0 {
            return Err(Error::invalid_config("instance_count", "must be >= 1"));
        }

        for (kind, tensors) in [("input", &self.inputs), ("output", &self.outputs)] {
            let mut seen = std::collections::BTreeSet::new();
            for tensor in tensors.iter() {
                let field = format!("{kind} '{}'", tensor.name);
                if tensor.name.is_empty() {
                    return Err(Error::invalid_config(
                        format!("{kind}.name"),
                        "must not be empty",
                    ));
                }
                if !seen.insert(tensor.name.as_str()) {
                    return Err(Error::invalid_config(field, "duplicate tensor name"));
                }
                if tensor.dims.is_empty() {
                    return Err(Error::invalid_config(
                        format!("{field}.dims"),
                        "at least one dimension required",
                    ));
                }
                if let Some(&bad) = tensor
                    .dims
                    .iter()
                    .find(|&&d| d != WILDCARD_DIM && d <= 0)
                {
                    return Err(Error::invalid_config(
                        format!("{field}.dims"),
                        format!("dimension {bad} must be -1 or positive"),
                    ));
                }
                if let Some(reshape) = &tensor.reshape {
                    if let Some(&bad) = reshape
                        .shape
                        .iter()
                        .find(|&&d| d != WILDCARD_DIM && d <= 0)
                    {
                        return Err(Error::invalid_config(
                            format!("{field}.reshape.shape"),
                            format!("dimension {bad} must be -1 or positive"),
                        ));
                    }
                    let dims_wild =
                        tensor.dims.iter().filter(|&&d| d == WILDCARD_DIM).count();
                    let reshape_wild =
                        reshape.shape.iter().filter(|&&d| d == WILDCARD_DIM).count();
                    if dims_wild != reshape_wild {
                        return Err(Error::invalid_config(
                            format!("{field}.reshape.shape"),
                            format!(
                                "{reshape_wild} wildcard(s) cannot pair with {dims_wild} in dims"
                            ),
                        ));
                    }
                }
            }
        }

        if let VersionPolicy::Specific { versions } = &self.version_policy {
            if versions.is_empty() {
                return Err(Error::invalid_config(
                    "version_policy.specific.versions",
                    "at least one version required",
                ));
            }
            if let Some(&bad) = versions.iter().find(|&&v| v < 1) {
                return Err(Error::invalid_config(
                    "version_policy.specific.versions",
                    format!("version {bad} must be >= 1"),
                ));
            }
        }
        if let VersionPolicy::Latest { num_versions } = &self.version_policy {
            if *num_versions == 0 {
                return Err(Error::invalid_config(
                    "version_policy.latest.num_versions",
                    "must be >= 1",
                ));
            }
        }

        if let Some(batching) = &self.dynamic_batching {
            if self.max_batch_size == 0 {
                return Err(Error::invalid_config(
                    "dynamic_batching",
                    "requires max_batch_size > 0",
                ));
            }
            if let Some(&bad) = batching
                .preferred_batch_sizes
                .iter()
                .find(|&&s| s == 0 || s > self.max_batch_size)
            {
                return Err(Error::invalid_config(
                    "dynamic_batching.preferred_batch_size",
                    format!("{bad} outside 1..={}", self.max_batch_size),
                ));
            }
            if batching.priority_levels == 0 {
                return Err(Error::invalid_config(
                    "dynamic_batching.priority_levels",
                    "must be >= 1",
                ));
            }
            if batching.default_priority_level == 0
                || batching.default_priority_level > batching.priority_levels
            {
                return Err(Error::invalid_config(
                    "dynamic_batching.default_priority_level",
                    format!("must be within 1..={}", batching.priority_levels),
                ));
            }
        }

        Ok(())
    }

    // ── accessors ─────────────────────────────────────────────────────────────

    /// Look up a declared input by name.
    pub fn input(&self, name: &str) -> Option<&TensorConfig> {
        self.inputs.iter().find(|t| t.name == name)
    }

    /// Look up a declared output by name.
    pub fn output(&self, name: &str) -> Option<&TensorConfig> {
        self.outputs.iter().find(|t| t.name == name)
    }

    /// Highest priority level the scheduler recognizes for this model.
    pub fn max_priority_level(&self) -> u32 {
        self.dynamic_batching
            .as_ref()
            .map_or(1, |b| b.priority_levels)
    }

    /// Level assigned to requests with priority `0` or out of range.
    pub fn default_priority_level(&self) -> u32 {
        self.dynamic_batching
            .as_ref()
            .map_or(1, |b| b.default_priority_level)
    }

    /// Preferred batch sizes, ascending. Empty when batching is disabled or
    /// unconstrained.
    pub fn preferred_batch_sizes(&self) -> Vec<u32> {
        let mut sizes = self
            .dynamic_batching
            .as_ref()
            .map(|b| b.preferred_batch_sizes.clone())
            .unwrap_or_default();
        sizes.sort_unstable();
        sizes
    }

    /// Longest co-batching wait.
    pub fn max_queue_delay(&self) -> std::time::Duration {
        std::time::Duration::from_micros(
            self.dynamic_batching
                .as_ref()
                .map_or(0, |b| b.max_queue_delay_us),
        )
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(name: &str, dims: &[i64]) -> TensorConfig {
        TensorConfig {
            name: name.to_owned(),
            data_type: DataType::Fp32,
            dims: dims.to_vec(),
            reshape: None,
            is_shape_tensor: false,
        }
    }

    fn base_config() -> ModelConfig {
        ModelConfig {
            name: "m".to_owned(),
            max_batch_size: 8,
            inputs: vec![tensor("in", &[4])],
            outputs: vec![tensor("out", &[4])],
            version_policy: VersionPolicy::default(),
            dynamic_batching: None,
            batch_profile: BatchProfile::LeadingDim,
            instance_count: 1,
            auto_generated: false,
        }
    }

    #[test]
    fn full_pbtxt_roundtrip() {
        let config = ModelConfig::from_pbtxt(
            r#"
            name: "classifier"
            max_batch_size: 8
            input {
              name: "pixels"
              data_type: TYPE_FP32
              dims: [ -1, 3 ]
              reshape { shape: [ 3, -1 ] }
            }
            input {
              name: "mask"
              data_type: TYPE_UINT8
              dims: [ 3 ]
            }
            output {
              name: "labels"
              data_type: TYPE_INT64
              dims: [ 10 ]
            }
            version_policy: { latest { num_versions: 2 } }
            dynamic_batching {
              preferred_batch_size: [ 4, 8 ]
              max_queue_delay_us: 5000
              priority_levels: 2
              default_priority_level: 1
            }
            "#,
            "classifier",
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.inputs.len(), 2);
        assert_eq!(config.inputs[0].data_type, DataType::Fp32);
        assert_eq!(
            config.inputs[0].reshape.as_ref().unwrap().shape,
            vec![3, -1]
        );
        assert_eq!(
            config.version_policy,
            VersionPolicy::Latest { num_versions: 2 }
        );
        assert_eq!(config.preferred_batch_sizes(), vec![4, 8]);
        assert_eq!(config.max_priority_level(), 2);
    }

    #[test]
    fn single_input_block_parses_as_list() {
        let config = ModelConfig::from_pbtxt(
            r#"
            max_batch_size: 0
            input { name: "x" data_type: TYPE_FP32 dims: [ 2 ] }
            output { name: "y" data_type: TYPE_FP32 dims: [ 2 ] }
            "#,
            "solo",
        )
        .unwrap();
        assert_eq!(config.name, "solo");
        assert_eq!(config.inputs.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn name_mismatch_rejected() {
        let err = ModelConfig::from_pbtxt(r#"name: "other""#, "m").unwrap_err();
        assert!(err.to_string().contains("does not match directory"));
    }

    #[test]
    fn unknown_field_rejected() {
        let err =
            ModelConfig::from_pbtxt("max_batch_siez: 4", "m").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn validate_rejects_unpaired_reshape_wildcards() {
        let mut config = base_config();
        config.inputs[0].dims = vec![-1, 3];
        config.inputs[0].reshape = Some(Reshape {
            shape: vec![-1, -1],
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reshape"));
    }

    #[test]
    fn validate_rejects_zero_dimension() {
        let mut config = base_config();
        config.inputs[0].dims = vec![0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let mut config = base_config();
        config.inputs.push(tensor("in", &[2]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn validate_rejects_batching_without_batch_support() {
        let mut config = base_config();
        config.max_batch_size = 0;
        config.dynamic_batching = Some(DynamicBatching::default());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn validate_rejects_oversized_preferred_batch() {
        let mut config = base_config();
        config.dynamic_batching = Some(DynamicBatching {
            preferred_batch_sizes: vec![16],
            ..DynamicBatching::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_specific_policy() {
        let mut config = base_config();
        config.version_policy = VersionPolicy::Specific {
            versions: Vec::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn batch_profile_from_pbtxt() {
        let config = ModelConfig::from_pbtxt(
            r#"
            batch_profile: request_level
            input { name: "x" data_type: TYPE_FP32 dims: [ 2 ] }
            output { name: "y" data_type: TYPE_FP32 dims: [ 2 ] }
            "#,
            "m",
        )
        .unwrap();
        assert_eq!(config.batch_profile, BatchProfile::RequestLevel);
    }

    #[test]
    fn auto_generated_config_is_marked() {
        let config = ModelConfig::auto_generated("anon");
        assert!(config.auto_generated);
        assert_eq!(config.max_batch_size, 0);
    }
}
