//! Job-type registry: compile- and run-time validation of chain shapes (C1, §4.1).
//!
//! Modeled on two registries in the wider codebase: `seesaw::job::CommandRegistry`
//! (type-erased, keyed-by-string dispatch) for the shape, and
//! `kernel/jobs/registry.rs`'s closure-based `JobRegistry` for the idea of
//! registering a validator/handler pair under a type name at startup.
//! Schemas here are delegated to caller-provided `(value) -> Result<value,
//! String>` closures exactly as the design notes (§9) prescribe: "the core
//! sees only `(value -> normalizedValue | error)` functions."

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

/// Machine-checkable error code for a registry validation failure (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryErrorCode {
    UnknownType,
    NotEntry,
    InvalidInput,
    InvalidOutput,
    OutputRequired,
    ContinuationUnsupported,
    ContinuationTargetDisallowed,
    BlockersUnsupported,
    BlockerTargetDisallowed,
}

impl RegistryErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryErrorCode::UnknownType => "UNKNOWN_TYPE",
            RegistryErrorCode::NotEntry => "NOT_ENTRY",
            RegistryErrorCode::InvalidInput => "INVALID_INPUT",
            RegistryErrorCode::InvalidOutput => "INVALID_OUTPUT",
            RegistryErrorCode::OutputRequired => "OUTPUT_REQUIRED",
            RegistryErrorCode::ContinuationUnsupported => "CONTINUATION_UNSUPPORTED",
            RegistryErrorCode::ContinuationTargetDisallowed => "CONTINUATION_TARGET_DISALLOWED",
            RegistryErrorCode::BlockersUnsupported => "BLOCKERS_UNSUPPORTED",
            RegistryErrorCode::BlockerTargetDisallowed => "BLOCKER_TARGET_DISALLOWED",
        }
    }
}

/// Whether a failure should be treated as fatal (complete-with-error, never
/// rescheduled) by the worker loop. Per §4.4: `OUTPUT_REQUIRED`,
/// `INVALID_OUTPUT`, and continuation/blocker validation errors are fatal;
/// `INVALID_INPUT` at chain-start time simply rejects `startJobChain`.
impl RegistryErrorCode {
    pub fn is_fatal_attempt_error(&self) -> bool {
        matches!(
            self,
            RegistryErrorCode::OutputRequired
                | RegistryErrorCode::InvalidOutput
                | RegistryErrorCode::ContinuationUnsupported
                | RegistryErrorCode::ContinuationTargetDisallowed
                | RegistryErrorCode::BlockersUnsupported
                | RegistryErrorCode::BlockerTargetDisallowed
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("registry error {code:?} for type {type_name:?}: {detail}")]
pub struct RegistryError {
    pub code: RegistryErrorCode,
    pub type_name: String,
    pub detail: String,
}

impl RegistryError {
    pub fn new(code: RegistryErrorCode, type_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code,
            type_name: type_name.into(),
            detail: detail.into(),
        }
    }
}

/// A validator: takes a raw JSON value and returns a normalized value or a
/// human-readable rejection reason. Kept as a plain closure per the design
/// notes rather than a trait object hierarchy, since the registry is the
/// only place that needs to hold one.
pub type Validator = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Continuation/blocker target policy for a job type.
#[derive(Clone)]
pub enum TargetPolicy {
    /// The type does not support this kind of reference at all.
    Unsupported,
    /// The type supports references to any of the named target types.
    Targets(HashSet<String>),
}

impl TargetPolicy {
    fn permits(&self, target: &str) -> bool {
        match self {
            TargetPolicy::Unsupported => false,
            TargetPolicy::Targets(set) => set.contains(target),
        }
    }
}

/// Definition of a single job type, as registered at startup.
#[derive(Clone)]
pub struct JobTypeDef {
    pub type_name: String,
    pub entry: bool,
    pub input_validator: Validator,
    /// `None` means the type has no output schema and *must* continue
    /// (§3 Registry: "output schema (absent => must continue)").
    pub output_validator: Option<Validator>,
    pub continuation_targets: TargetPolicy,
    pub blocker_targets: TargetPolicy,
}

impl JobTypeDef {
    /// Convenience builder for a type whose input/output are accepted
    /// as-is (identity validators) and that neither continues nor blocks.
    /// Handlers and tests commonly start from this and layer on policy.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            entry: false,
            input_validator: Arc::new(|v| Ok(v.clone())),
            output_validator: Some(Arc::new(|v| Ok(v.clone()))),
            continuation_targets: TargetPolicy::Unsupported,
            blocker_targets: TargetPolicy::Unsupported,
        }
    }

    pub fn entry(mut self) -> Self {
        self.entry = true;
        self
    }

    pub fn input_validator(mut self, f: Validator) -> Self {
        self.input_validator = f;
        self
    }

    /// No output schema: the type's handler must always produce a continuation.
    pub fn no_output(mut self) -> Self {
        self.output_validator = None;
        self
    }

    pub fn output_validator(mut self, f: Validator) -> Self {
        self.output_validator = Some(f);
        self
    }

    pub fn continues_to(mut self, targets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.continuation_targets = TargetPolicy::Targets(targets.into_iter().map(Into::into).collect());
        self
    }

    pub fn blocked_by(mut self, targets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.blocker_targets = TargetPolicy::Targets(targets.into_iter().map(Into::into).collect());
        self
    }
}

/// Process-wide, read-only-after-construction map of type-name -> definition
/// (§3 "the registry is process-wide read-only after construction").
#[derive(Default, Clone)]
pub struct TypeRegistry {
    types: HashMap<String, JobTypeDef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: JobTypeDef) {
        self.types.insert(def.type_name.clone(), def);
    }

    fn get(&self, type_name: &str) -> Result<&JobTypeDef, RegistryError> {
        self.types.get(type_name).ok_or_else(|| {
            RegistryError::new(RegistryErrorCode::UnknownType, type_name, "type is not registered")
        })
    }

    /// `validateEntry(typeName)` - fails unless `type_name` exists and is
    /// marked `entry: true`.
    pub fn validate_entry(&self, type_name: &str) -> Result<(), RegistryError> {
        let def = self.get(type_name)?;
        if !def.entry {
            return Err(RegistryError::new(
                RegistryErrorCode::NotEntry,
                type_name,
                "type is not an entry type; chains may only be started with entry types",
            ));
        }
        Ok(())
    }

    /// `parseInput(typeName, value)`.
    pub fn parse_input(&self, type_name: &str, value: &Value) -> Result<Value, RegistryError> {
        let def = self.get(type_name)?;
        (def.input_validator)(value).map_err(|detail| {
            RegistryError::new(RegistryErrorCode::InvalidInput, type_name, detail)
        })
    }

    /// `parseOutput(typeName, value)`. `value = None` represents "the
    /// handler produced a continuation instead of an output"; this is only
    /// valid when the type has no output schema.
    pub fn parse_output(&self, type_name: &str, value: Option<&Value>) -> Result<Option<Value>, RegistryError> {
        let def = self.get(type_name)?;
        match (&def.output_validator, value) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(RegistryError::new(
                RegistryErrorCode::InvalidOutput,
                type_name,
                "type has no output schema but a terminal output was produced",
            )),
            (Some(_), None) => Err(RegistryError::new(
                RegistryErrorCode::OutputRequired,
                type_name,
                "type has an output schema but the handler produced a continuation instead",
            )),
            (Some(validator), Some(v)) => validator(v)
                .map(Some)
                .map_err(|detail| RegistryError::new(RegistryErrorCode::InvalidOutput, type_name, detail)),
        }
    }

    /// `validateContinuation(typeName, {targetTypeName, targetInput})`.
    pub fn validate_continuation(
        &self,
        type_name: &str,
        target_type_name: &str,
        target_input: &Value,
    ) -> Result<Value, RegistryError> {
        let def = self.get(type_name)?;
        if !def.continuation_targets.permits(target_type_name) {
            let code = match def.continuation_targets {
                TargetPolicy::Unsupported => RegistryErrorCode::ContinuationUnsupported,
                TargetPolicy::Targets(_) => RegistryErrorCode::ContinuationTargetDisallowed,
            };
            return Err(RegistryError::new(
                code,
                type_name,
                format!("continuation to {:?} is not permitted", target_type_name),
            ));
        }
        self.parse_input(target_type_name, target_input)
    }

    /// `validateBlockers(typeName, refs[])`.
    pub fn validate_blockers(&self, type_name: &str, blocker_type_names: &[String]) -> Result<(), RegistryError> {
        let def = self.get(type_name)?;
        if blocker_type_names.is_empty() {
            // Design notes (c): zero blockers behaves as if the option were omitted.
            return Ok(());
        }
        for target in blocker_type_names {
            if !def.blocker_targets.permits(target) {
                let code = match def.blocker_targets {
                    TargetPolicy::Unsupported => RegistryErrorCode::BlockersUnsupported,
                    TargetPolicy::Targets(_) => RegistryErrorCode::BlockerTargetDisallowed,
                };
                return Err(RegistryError::new(
                    code,
                    type_name,
                    format!("blocker of type {:?} is not permitted", target),
                ));
            }
        }
        Ok(())
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        let mut r = TypeRegistry::new();
        r.register(
            JobTypeDef::new("greet")
                .entry()
                .output_validator(Arc::new(|v| {
                    if v.get("msg").is_some() {
                        Ok(v.clone())
                    } else {
                        Err("missing msg".to_string())
                    }
                })),
        );
        r.register(JobTypeDef::new("fetch").entry().no_output().continues_to(["process"]));
        r.register(JobTypeDef::new("process"));
        r.register(JobTypeDef::new("a").entry());
        r.register(JobTypeDef::new("b").entry().blocked_by(["a"]));
        r
    }

    #[test]
    fn unknown_type_is_rejected() {
        let r = registry();
        let err = r.validate_entry("ghost").unwrap_err();
        assert_eq!(err.code, RegistryErrorCode::UnknownType);
    }

    #[test]
    fn non_entry_type_cannot_start_a_chain() {
        let r = registry();
        let err = r.validate_entry("process").unwrap_err();
        assert_eq!(err.code, RegistryErrorCode::NotEntry);
    }

    #[test]
    fn entry_type_validates() {
        let r = registry();
        assert!(r.validate_entry("greet").is_ok());
    }

    #[test]
    fn output_required_when_schema_present_but_continuation_returned() {
        let r = registry();
        let err = r.parse_output("greet", None).unwrap_err();
        assert_eq!(err.code, RegistryErrorCode::OutputRequired);
        assert!(err.code.is_fatal_attempt_error());
    }

    #[test]
    fn invalid_output_when_schema_absent_but_output_given() {
        let r = registry();
        let err = r.parse_output("fetch", Some(&serde_json::json!({}))).unwrap_err();
        assert_eq!(err.code, RegistryErrorCode::InvalidOutput);
    }

    #[test]
    fn no_output_schema_accepts_none() {
        let r = registry();
        assert_eq!(r.parse_output("fetch", None).unwrap(), None);
    }

    #[test]
    fn output_schema_validates_shape() {
        let r = registry();
        let err = r.parse_output("greet", Some(&serde_json::json!({}))).unwrap_err();
        assert_eq!(err.code, RegistryErrorCode::InvalidOutput);

        let ok = r
            .parse_output("greet", Some(&serde_json::json!({"msg": "hi"})))
            .unwrap();
        assert_eq!(ok, Some(serde_json::json!({"msg": "hi"})));
    }

    #[test]
    fn continuation_to_disallowed_target_is_rejected() {
        let r = registry();
        let err = r
            .validate_continuation("fetch", "greet", &serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err.code, RegistryErrorCode::ContinuationTargetDisallowed);
        assert!(err.code.is_fatal_attempt_error());
    }

    #[test]
    fn continuation_to_unsupported_type_is_rejected() {
        let r = registry();
        let err = r
            .validate_continuation("greet", "process", &serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err.code, RegistryErrorCode::ContinuationUnsupported);
    }

    #[test]
    fn continuation_to_permitted_target_validates_its_input() {
        let r = registry();
        let value = r
            .validate_continuation("fetch", "process", &serde_json::json!({"data": [1, 2, 3]}))
            .unwrap();
        assert_eq!(value, serde_json::json!({"data": [1, 2, 3]}));
    }

    #[test]
    fn blockers_unsupported_when_type_declares_none() {
        let r = registry();
        let err = r.validate_blockers("a", &["a".to_string()]).unwrap_err();
        assert_eq!(err.code, RegistryErrorCode::BlockersUnsupported);
    }

    #[test]
    fn blockers_permitted_target_validates() {
        let r = registry();
        assert!(r.validate_blockers("b", &["a".to_string()]).is_ok());
    }

    #[test]
    fn blockers_disallowed_target_is_rejected() {
        let r = registry();
        let err = r.validate_blockers("b", &["process".to_string()]).unwrap_err();
        assert_eq!(err.code, RegistryErrorCode::BlockerTargetDisallowed);
    }

    #[test]
    fn zero_blockers_is_treated_as_omitted() {
        let r = registry();
        assert!(r.validate_blockers("a", &[]).is_ok());
    }
}
