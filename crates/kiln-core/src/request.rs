//! Inference requests: builder surface and normalization.
//!
//! A request is mutable while the caller assembles it (inputs, outputs,
//! priority, deadlines), then [`InferenceRequest::prepare`] normalizes it
//! against the model configuration and freezes it for the scheduler. Every
//! mutator flips `needs_normalization`, so `prepare` is cheap to call again
//! and a prepared request is never silently stale.

use std::collections::BTreeSet;

use bytes::Bytes;
use uuid::Uuid;

use kiln_types::{batch_byte_size, compare_dims_with_wildcard, resolve_reshape, DataType};

use crate::error::Error;
use crate::model::{BatchProfile, ModelConfig};

/// Request flag: first request of a sequence.
pub const FLAG_SEQUENCE_START: u32 = 1 << 0;
/// Request flag: last request of a sequence.
pub const FLAG_SEQUENCE_END: u32 = 1 << 1;

/// One input tensor attached to a request.
///
/// `data` is a shared, reference-counted buffer: attaching it to a request
/// never copies, and a frozen request shares it with the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    name: String,
    shape: Vec<i64>,
    data: Bytes,
    data_type: Option<DataType>,
    working_shape: Vec<i64>,
    batch_byte_size: u64,
}

impl InputTensor {
    fn new(name: String, shape: Vec<i64>, data: Bytes) -> Self {
        Self {
            name,
            shape,
            data,
            data_type: None,
            working_shape: Vec::new(),
            batch_byte_size: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shape as supplied by the caller.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Normalized shape: batch dimension stripped (when the model batches)
    /// and any configured reshape applied. Empty until `prepare` runs.
    pub fn working_shape(&self) -> &[i64] {
        &self.working_shape
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Datatype resolved from the model configuration at `prepare`.
    pub fn data_type(&self) -> Option<DataType> {
        self.data_type
    }

    /// Caller-supplied buffer length in bytes.
    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Byte size of the full batched tensor, computed at `prepare` (or
    /// caller-supplied for variable-size datatypes).
    pub fn batch_byte_size(&self) -> u64 {
        self.batch_byte_size
    }
}

/// An owned inference request.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    id: String,
    correlation_id: u64,
    flags: u32,
    model_name: String,
    requested_version: i64,
    priority: u32,
    timeout_us: u64,
    batch_size: u32,
    original_inputs: Vec<InputTensor>,
    override_inputs: Vec<InputTensor>,
    requested_outputs: BTreeSet<String>,
    effective_inputs: Vec<InputTensor>,
    needs_normalization: bool,
}

impl InferenceRequest {
    /// Create an empty request for `model_name`, targeting the version chosen
    /// by the model's policy.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: 0,
            flags: 0,
            model_name: model_name.into(),
            requested_version: -1,
            priority: 0,
            timeout_us: 0,
            batch_size: 0,
            original_inputs: Vec::new(),
            override_inputs: Vec::new(),
            requested_outputs: BTreeSet::new(),
            effective_inputs: Vec::new(),
            needs_normalization: true,
        }
    }

    // ── builder surface ───────────────────────────────────────────────────────

    /// Attach a caller input. Rejects duplicate names.
    pub fn add_original_input(
        &mut self,
        name: impl Into<String>,
        shape: Vec<i64>,
        data: Bytes,
    ) -> Result<&mut Self, Error> {
        let name = name.into();
        if self.original_inputs.iter().any(|i| i.name == name) {
            return Err(Error::InvalidArg(format!("duplicate input '{name}'")));
        }
        self.original_inputs.push(InputTensor::new(name, shape, data));
        self.needs_normalization = true;
        Ok(self)
    }

    /// Remove a caller input by name. Returns whether it was present.
    pub fn remove_original_input(&mut self, name: &str) -> bool {
        let before = self.original_inputs.len();
        self.original_inputs.retain(|i| i.name != name);
        self.needs_normalization = true;
        self.original_inputs.len() != before
    }

    /// Attach an override input (injected by pipelines/ensembling). An
    /// override with the same name as an original shadows it at `prepare`.
    pub fn add_override_input(
        &mut self,
        name: impl Into<String>,
        shape: Vec<i64>,
        data: Bytes,
    ) -> Result<&mut Self, Error> {
        let name = name.into();
        if self.override_inputs.iter().any(|i| i.name == name) {
            return Err(Error::InvalidArg(format!(
                "duplicate override input '{name}'"
            )));
        }
        self.override_inputs.push(InputTensor::new(name, shape, data));
        self.needs_normalization = true;
        Ok(self)
    }

    /// Request a named output. Absent any requested outputs, `prepare`
    /// defaults to every declared output.
    pub fn add_requested_output(&mut self, name: impl Into<String>) -> &mut Self {
        self.requested_outputs.insert(name.into());
        self.needs_normalization = true;
        self
    }

    /// Drop a requested output. Returns whether it was present.
    pub fn remove_requested_output(&mut self, name: &str) -> bool {
        self.needs_normalization = true;
        self.requested_outputs.remove(name)
    }

    pub fn set_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.id = id.into();
        self
    }

    pub fn set_correlation_id(&mut self, correlation_id: u64) -> &mut Self {
        self.correlation_id = correlation_id;
        self.needs_normalization = true;
        self
    }

    pub fn set_flags(&mut self, flags: u32) -> &mut Self {
        self.flags = flags;
        self.needs_normalization = true;
        self
    }

    pub fn set_requested_version(&mut self, version: i64) -> &mut Self {
        self.requested_version = version;
        self.needs_normalization = true;
        self
    }

    pub fn set_priority(&mut self, priority: u32) -> &mut Self {
        self.priority = priority;
        self.needs_normalization = true;
        self
    }

    /// Queue deadline in microseconds, measured from enqueue. `0` disables.
    pub fn set_timeout_us(&mut self, timeout_us: u64) -> &mut Self {
        self.timeout_us = timeout_us;
        self.needs_normalization = true;
        self
    }

    /// Request-level batch size; only meaningful under
    /// [`BatchProfile::RequestLevel`].
    pub fn set_batch_size(&mut self, batch_size: u32) -> &mut Self {
        self.batch_size = batch_size;
        self.needs_normalization = true;
        self
    }

    // ── accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn requested_version(&self) -> i64 {
        self.requested_version
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn timeout_us(&self) -> u64 {
        self.timeout_us
    }

    /// Derived batch size; meaningful only after `prepare`.
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// The frozen input set after `prepare` (originals with overrides
    /// applied); the raw originals before.
    pub fn inputs(&self) -> &[InputTensor] {
        if self.needs_normalization {
            &self.original_inputs
        } else {
            &self.effective_inputs
        }
    }

    /// Look up a frozen input by name.
    pub fn input(&self, name: &str) -> Option<&InputTensor> {
        self.inputs().iter().find(|i| i.name == name)
    }

    pub fn requested_outputs(&self) -> &BTreeSet<String> {
        &self.requested_outputs
    }

    pub fn needs_normalization(&self) -> bool {
        self.needs_normalization
    }

    /// `true` once `prepare` has run with no mutation since.
    pub fn is_prepared(&self) -> bool {
        !self.needs_normalization
    }

    // ── normalization ─────────────────────────────────────────────────────────

    /// Normalize the request against `config` and freeze it.
    ///
    /// Idempotent: a second call without intervening mutation does nothing.
    pub fn prepare(&mut self, config: &ModelConfig) -> Result<(), Error> {
        if !self.needs_normalization {
            return Ok(());
        }

        // Priority outside the model's range falls back to the default level.
        if self.priority == 0 || self.priority > config.max_priority_level() {
            self.priority = config.default_priority_level();
        }

        if self.requested_outputs.is_empty() {
            self.requested_outputs =
                config.outputs.iter().map(|o| o.name.clone()).collect();
        } else if let Some(unknown) = self
            .requested_outputs
            .iter()
            .find(|name| config.output(name).is_none())
        {
            return Err(Error::NotFound(format!(
                "requested output '{unknown}' is not an output of model '{}'",
                config.name
            )));
        }

        // Rebuild the effective input set: originals in order, overrides
        // shadowing by name, unmatched overrides appended.
        let mut effective = self.original_inputs.clone();
        for ov in &self.override_inputs {
            match effective.iter_mut().find(|i| i.name == ov.name) {
                Some(slot) => *slot = ov.clone(),
                None => effective.push(ov.clone()),
            }
        }

        if effective.len() != config.inputs.len() {
            return Err(Error::InvalidArg(format!(
                "model '{}' expects {} input(s), request has {}",
                config.name,
                config.inputs.len(),
                effective.len()
            )));
        }

        let batch = Self::derive_batch(config, self.batch_size, &mut effective)?;

        for input in &mut effective {
            let tensor = config.input(&input.name).ok_or_else(|| {
                Error::InvalidArg(format!(
                    "unexpected inference input '{}' for model '{}'",
                    input.name, config.name
                ))
            })?;
            input.data_type = Some(tensor.data_type);

            if !compare_dims_with_wildcard(&tensor.dims, &input.working_shape) {
                return Err(Error::InvalidArg(format!(
                    "input '{}' shape {:?} is incompatible with configured dims {:?}",
                    input.name, input.working_shape, tensor.dims
                )));
            }

            if let Some(reshape) = &tensor.reshape {
                input.working_shape =
                    resolve_reshape(&tensor.dims, &reshape.shape, &input.working_shape)?;
            } else if input.working_shape.iter().any(|&d| d < 0) {
                return Err(Error::InvalidArg(format!(
                    "input '{}' has a variable-size dimension; the request must specify a concrete shape",
                    input.name
                )));
            }

            match batch_byte_size(
                tensor.data_type,
                &input.working_shape,
                batch,
                tensor.is_shape_tensor,
            ) {
                Some(expected) => {
                    // The request-level profile cross-validates the caller's
                    // buffer; the leading-dim profile derives the size.
                    if config.batch_profile == BatchProfile::RequestLevel
                        && input.byte_size() != expected
                    {
                        return Err(Error::InvalidArg(format!(
                            "input '{}' carries {} byte(s) but shape implies {}",
                            input.name,
                            input.byte_size(),
                            expected
                        )));
                    }
                    input.batch_byte_size = expected;
                }
                // Variable-size datatypes: the caller-supplied size stands.
                None => input.batch_byte_size = input.byte_size(),
            }
        }

        self.batch_size = batch;
        self.effective_inputs = effective;
        self.needs_normalization = false;
        Ok(())
    }

    /// Derive the batch size and set every input's pre-reshape working shape.
    fn derive_batch(
        config: &ModelConfig,
        request_batch: u32,
        effective: &mut [InputTensor],
    ) -> Result<u32, Error> {
        if config.max_batch_size == 0 {
            for input in effective.iter_mut() {
                input.working_shape = input.shape.clone();
            }
            return Ok(1);
        }

        match config.batch_profile {
            BatchProfile::LeadingDim => {
                let mut batch: Option<i64> = None;
                for input in effective.iter_mut() {
                    let Some((&lead, rest)) = input.shape.split_first() else {
                        return Err(Error::InvalidArg(format!(
                            "input '{}' must carry a leading batch dimension",
                            input.name
                        )));
                    };
                    match batch {
                        None => batch = Some(lead),
                        Some(b) if b != lead => {
                            return Err(Error::InvalidArg(format!(
                                "input '{}' batch dimension {lead} differs from {b}",
                                input.name
                            )));
                        }
                        Some(_) => {}
                    }
                    input.working_shape = rest.to_vec();
                }
                let lead = batch.ok_or_else(|| {
                    Error::InvalidArg("batching model requires at least one input".into())
                })?;
                Self::check_batch_bounds(lead, config.max_batch_size)
            }
            BatchProfile::RequestLevel => {
                for input in effective.iter_mut() {
                    input.working_shape = input.shape.clone();
                }
                Self::check_batch_bounds(request_batch as i64, config.max_batch_size)
            }
        }
    }

    fn check_batch_bounds(batch: i64, max_batch_size: u32) -> Result<u32, Error> {
        if batch < 1 {
            return Err(Error::InvalidArg(format!(
                "batch size {batch} must be >= 1"
            )));
        }
        if batch as u64 > max_batch_size as u64 {
            return Err(Error::InvalidArg(format!(
                "batch size {batch} exceeds max_batch_size {max_batch_size}"
            )));
        }
        Ok(batch as u32)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DynamicBatching, Reshape, TensorConfig, VersionPolicy};
    use proptest::prelude::*;

    fn tensor(name: &str, dims: &[i64]) -> TensorConfig {
        TensorConfig {
            name: name.to_owned(),
            data_type: DataType::Fp32,
            dims: dims.to_vec(),
            reshape: None,
            is_shape_tensor: false,
        }
    }

    fn config(max_batch_size: u32, inputs: Vec<TensorConfig>) -> ModelConfig {
        ModelConfig {
            name: "m".to_owned(),
            max_batch_size,
            inputs,
            outputs: vec![tensor("out", &[4])],
            version_policy: VersionPolicy::default(),
            dynamic_batching: None,
            batch_profile: BatchProfile::LeadingDim,
            instance_count: 1,
            auto_generated: false,
        }
    }

    fn fp32_data(elements: usize) -> Bytes {
        Bytes::from(vec![0u8; elements * 4])
    }

    #[test]
    fn non_batching_keeps_shapes() {
        let config = config(0, vec![tensor("in", &[2, 3])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![2, 3], fp32_data(6)).unwrap();
        req.prepare(&config).unwrap();
        assert_eq!(req.batch_size(), 1);
        assert_eq!(req.input("in").unwrap().working_shape(), &[2, 3]);
        assert_eq!(req.input("in").unwrap().batch_byte_size(), 24);
    }

    #[test]
    fn leading_dim_profile_strips_batch() {
        let config = config(8, vec![tensor("a", &[3]), tensor("b", &[3])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("a", vec![4, 3], fp32_data(12)).unwrap();
        req.add_original_input("b", vec![4, 3], fp32_data(12)).unwrap();
        req.prepare(&config).unwrap();
        assert_eq!(req.batch_size(), 4);
        assert_eq!(req.input("a").unwrap().working_shape(), &[3]);
        assert_eq!(req.input("a").unwrap().batch_byte_size(), 4 * 3 * 4);
    }

    #[test]
    fn inconsistent_batch_dims_rejected() {
        let config = config(8, vec![tensor("a", &[3]), tensor("b", &[3])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("a", vec![4, 3], fp32_data(12)).unwrap();
        req.add_original_input("b", vec![2, 3], fp32_data(6)).unwrap();
        let err = req.prepare(&config).unwrap_err();
        assert!(err.to_string().contains("batch dimension"));
    }

    #[test]
    fn batch_size_bounds() {
        let config = config(4, vec![tensor("in", &[2])]);

        // batch == 0 rejected
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![0, 2], Bytes::new()).unwrap();
        assert!(matches!(
            req.prepare(&config).unwrap_err(),
            Error::InvalidArg(_)
        ));

        // batch == max accepted
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![4, 2], fp32_data(8)).unwrap();
        req.prepare(&config).unwrap();
        assert_eq!(req.batch_size(), 4);

        // batch == max + 1 rejected
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![5, 2], fp32_data(10)).unwrap();
        assert!(matches!(
            req.prepare(&config).unwrap_err(),
            Error::InvalidArg(_)
        ));
    }

    #[test]
    fn input_count_must_match_config() {
        let config = config(0, vec![tensor("a", &[2]), tensor("b", &[2])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("a", vec![2], fp32_data(2)).unwrap();
        let err = req.prepare(&config).unwrap_err();
        assert!(err.to_string().contains("expects 2 input(s)"));
    }

    #[test]
    fn unexpected_input_name_rejected() {
        let config = config(0, vec![tensor("a", &[2])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("zz", vec![2], fp32_data(2)).unwrap();
        let err = req.prepare(&config).unwrap_err();
        assert!(err.to_string().contains("unexpected inference input"));
    }

    #[test]
    fn unknown_requested_output_not_found() {
        let config = config(0, vec![tensor("in", &[2])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![2], fp32_data(2)).unwrap();
        req.add_requested_output("nope");
        assert!(matches!(
            req.prepare(&config).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn empty_requested_outputs_default_to_all() {
        let config = config(0, vec![tensor("in", &[2])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![2], fp32_data(2)).unwrap();
        req.prepare(&config).unwrap();
        assert!(req.requested_outputs().contains("out"));
    }

    #[test]
    fn reshape_applies_wildcard_pairing() {
        // dims [-1, 3], reshape [3, -1]: input [4, 3] becomes [3, 4].
        let mut input = tensor("in", &[-1, 3]);
        input.reshape = Some(Reshape { shape: vec![3, -1] });
        let config = config(0, vec![input]);

        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![4, 3], fp32_data(12)).unwrap();
        req.prepare(&config).unwrap();
        assert_eq!(req.input("in").unwrap().working_shape(), &[3, 4]);
    }

    #[test]
    fn variable_dim_without_reshape_rejected() {
        let config = config(0, vec![tensor("in", &[-1, 3])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![-1, 3], Bytes::new()).unwrap();
        let err = req.prepare(&config).unwrap_err();
        assert!(err.to_string().contains("must specify"));
    }

    #[test]
    fn duplicate_original_input_rejected() {
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![2], Bytes::new()).unwrap();
        let err = req
            .add_original_input("in", vec![2], Bytes::new())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn add_then_remove_leaves_inputs_unchanged_and_flags_normalization() {
        let config = config(0, vec![tensor("in", &[2])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![2], fp32_data(2)).unwrap();
        req.prepare(&config).unwrap();
        assert!(req.is_prepared());

        let names_before: Vec<String> =
            req.inputs().iter().map(|i| i.name().to_owned()).collect();
        req.add_original_input("extra", vec![2], fp32_data(2)).unwrap();
        assert!(req.remove_original_input("extra"));
        assert!(req.needs_normalization());

        req.prepare(&config).unwrap();
        let names_after: Vec<String> =
            req.inputs().iter().map(|i| i.name().to_owned()).collect();
        assert_eq!(names_before, names_after);
    }

    #[test]
    fn override_shadows_original_after_prepare() {
        let config = config(0, vec![tensor("in", &[2])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![2], Bytes::from_static(&[0; 8]))
            .unwrap();
        req.add_override_input("in", vec![2], Bytes::from_static(&[1; 8]))
            .unwrap();
        req.prepare(&config).unwrap();
        assert_eq!(req.inputs().len(), 1);
        assert_eq!(req.input("in").unwrap().data()[0], 1);
    }

    #[test]
    fn remove_then_override_same_name_is_permitted() {
        let config = config(0, vec![tensor("in", &[2])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![2], Bytes::from_static(&[0; 8]))
            .unwrap();
        assert!(req.remove_original_input("in"));
        req.add_override_input("in", vec![2], Bytes::from_static(&[7; 8]))
            .unwrap();
        req.prepare(&config).unwrap();
        assert_eq!(req.input("in").unwrap().data()[0], 7);
    }

    #[test]
    fn prepare_is_idempotent() {
        let config = config(8, vec![tensor("in", &[3])]);
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![2, 3], fp32_data(6)).unwrap();
        req.set_priority(9);
        req.prepare(&config).unwrap();

        let inputs_once = req.effective_inputs.clone();
        let (batch_once, priority_once) = (req.batch_size(), req.priority());
        req.prepare(&config).unwrap();
        assert_eq!(req.effective_inputs, inputs_once);
        assert_eq!(req.batch_size(), batch_once);
        assert_eq!(req.priority(), priority_once);
    }

    #[test]
    fn priority_clamps_to_default_level() {
        let mut cfg = config(8, vec![tensor("in", &[3])]);
        cfg.dynamic_batching = Some(DynamicBatching {
            preferred_batch_sizes: vec![],
            max_queue_delay_us: 0,
            priority_levels: 3,
            default_priority_level: 2,
        });

        // Zero priority falls back to the default.
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![1, 3], fp32_data(3)).unwrap();
        req.prepare(&cfg).unwrap();
        assert_eq!(req.priority(), 2);

        // Out-of-range priority falls back as well.
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![1, 3], fp32_data(3)).unwrap();
        req.set_priority(9);
        req.prepare(&cfg).unwrap();
        assert_eq!(req.priority(), 2);

        // In-range priority is kept.
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![1, 3], fp32_data(3)).unwrap();
        req.set_priority(3);
        req.prepare(&cfg).unwrap();
        assert_eq!(req.priority(), 3);
    }

    #[test]
    fn request_level_profile_uses_request_batch_and_checks_bytes() {
        let mut cfg = config(8, vec![tensor("in", &[3])]);
        cfg.batch_profile = BatchProfile::RequestLevel;

        let mut req = InferenceRequest::new("m");
        // Shapes do not carry the batch dim under this profile.
        req.add_original_input("in", vec![3], fp32_data(3 * 2)).unwrap();
        req.set_batch_size(2);
        req.prepare(&cfg).unwrap();
        assert_eq!(req.batch_size(), 2);
        assert_eq!(req.input("in").unwrap().working_shape(), &[3]);

        // Byte-size cross-validation.
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![3], fp32_data(3)).unwrap();
        req.set_batch_size(2);
        let err = req.prepare(&cfg).unwrap_err();
        assert!(err.to_string().contains("shape implies"));

        // Missing batch size is rejected.
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![3], fp32_data(3)).unwrap();
        assert!(req.prepare(&cfg).is_err());
    }

    #[test]
    fn variable_size_datatype_accepts_caller_byte_size() {
        let mut input = tensor("in", &[4]);
        input.data_type = DataType::Bytes;
        let config = config(0, vec![input]);

        let payload = kiln_types::pack_byte_strings(&[b"a" as &[u8], b"bb", b"c", b"dd"]);
        let len = payload.len() as u64;
        let mut req = InferenceRequest::new("m");
        req.add_original_input("in", vec![4], Bytes::from(payload)).unwrap();
        req.prepare(&config).unwrap();
        assert_eq!(req.input("in").unwrap().batch_byte_size(), len);
    }

    proptest! {
        /// Non-batching models always normalize to batch 1 with untouched
        /// shapes.
        #[test]
        fn non_batching_preserves_shapes(
            shape in proptest::collection::vec(1i64..6, 1..4),
        ) {
            let config = config(0, vec![tensor("in", &shape)]);
            let elements: i64 = shape.iter().product();
            let mut req = InferenceRequest::new("m");
            req.add_original_input("in", shape.clone(), fp32_data(elements as usize))
                .unwrap();
            req.prepare(&config).unwrap();
            prop_assert_eq!(req.batch_size(), 1);
            prop_assert_eq!(req.input("in").unwrap().working_shape(), &shape[..]);
        }

        /// Batching models strip the common leading dim into the batch size.
        #[test]
        fn leading_dim_always_stripped(
            batch in 1i64..8,
            inner in proptest::collection::vec(1i64..5, 1..3),
        ) {
            let config = config(8, vec![tensor("in", &inner)]);
            let mut shape = vec![batch];
            shape.extend(&inner);
            let elements: i64 = shape.iter().product();

            let mut req = InferenceRequest::new("m");
            req.add_original_input("in", shape, fp32_data(elements as usize))
                .unwrap();
            req.prepare(&config).unwrap();
            prop_assert_eq!(req.batch_size(), batch as u32);
            prop_assert_eq!(req.input("in").unwrap().working_shape(), &inner[..]);
        }
    }
}
