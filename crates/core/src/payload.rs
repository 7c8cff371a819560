//! Submission payloads for each job kind and their validation rules.
//!
//! Payloads are validated before a job is inserted into its queue; a
//! payload that fails here never reaches a worker.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::types::JobKind;

/// Sample rate used when a prep payload does not specify one.
pub const DEFAULT_SAMPLE_RATE: u32 = 22_050;

/// Maximum clip length (seconds) used when a prep payload does not specify one.
pub const DEFAULT_MAX_LEN: u32 = 15;

/// Maximum length of a language code such as `en` or `pt-br`.
const MAX_LANGUAGE_LEN: usize = 8;

/// Maximum length of a run name (it becomes a directory name).
const MAX_RUN_NAME_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// Parameters for a dataset preparation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PrepPayload {
    #[validate(length(min = 1, message = "inputDir must not be empty"))]
    pub input_dir: String,
    #[validate(length(min = 1, message = "transcriptFile must not be empty"))]
    pub transcript_file: String,
    #[validate(length(min = 1, message = "outputDir must not be empty"))]
    pub output_dir: String,
    #[validate(length(min = 1, message = "speaker must not be empty"))]
    pub speaker: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 8000, max = 96000, message = "sampleRate must be between 8000 and 96000"))]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, max = 600, message = "maxLen must be between 1 and 600 seconds"))]
    pub max_len: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vad: Option<bool>,
}

/// Parameters for a training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TrainPayload {
    #[validate(length(min = 1, message = "configPath must not be empty"))]
    pub config_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, message = "modelName must not be empty"))]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, message = "datasetPath must not be empty"))]
    pub dataset_path: Option<String>,
}

/// A validated, kind-tagged payload.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Prep(PrepPayload),
    Train(TrainPayload),
}

impl JobPayload {
    /// Parse and validate a raw JSON payload for the given kind.
    ///
    /// Missing required fields, wrong types and rule violations are
    /// reported as [`CoreError::InvalidPayload`]. Fields the kind does not
    /// define are ignored and do not survive [`JobPayload::to_value`].
    pub fn parse(kind: JobKind, raw: serde_json::Value) -> Result<Self, CoreError> {
        let payload = match kind {
            JobKind::Prep => JobPayload::Prep(decode(raw)?),
            JobKind::Train => JobPayload::Train(decode(raw)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// The kind this payload belongs to.
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Prep(_) => JobKind::Prep,
            JobPayload::Train(_) => JobKind::Train,
        }
    }

    /// Serialize back to the JSON form stored on the job record.
    pub fn to_value(&self) -> Result<serde_json::Value, CoreError> {
        let value = match self {
            JobPayload::Prep(p) => serde_json::to_value(p),
            JobPayload::Train(t) => serde_json::to_value(t),
        };
        value.map_err(|e| CoreError::Internal(format!("Failed to encode payload: {e}")))
    }

    fn validate(&self) -> Result<(), CoreError> {
        match self {
            JobPayload::Prep(p) => {
                p.validate().map_err(invalid)?;
                validate_language(&p.language)
            }
            JobPayload::Train(t) => {
                t.validate().map_err(invalid)?;
                match &t.run_name {
                    Some(name) => validate_run_name(name),
                    None => Ok(()),
                }
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(raw: serde_json::Value) -> Result<T, CoreError> {
    serde_json::from_value(raw).map_err(|e| CoreError::InvalidPayload(e.to_string()))
}

fn invalid(errors: validator::ValidationErrors) -> CoreError {
    CoreError::InvalidPayload(errors.to_string())
}

// ---------------------------------------------------------------------------
// Field rules
// ---------------------------------------------------------------------------

/// Validate a language code.
///
/// Rules:
/// - 2 to `MAX_LANGUAGE_LEN` characters.
/// - ASCII letters and hyphens only.
pub fn validate_language(code: &str) -> Result<(), CoreError> {
    if code.len() < 2 || code.len() > MAX_LANGUAGE_LEN {
        return Err(CoreError::InvalidPayload(format!(
            "language must be between 2 and {MAX_LANGUAGE_LEN} characters"
        )));
    }
    if !code.chars().all(|c| c.is_ascii_alphabetic() || c == '-') {
        return Err(CoreError::InvalidPayload(
            "language may only contain ASCII letters and hyphens".to_string(),
        ));
    }
    Ok(())
}

/// Validate a training run name. It is used as a directory name under the
/// runs directory, so path separators and `..` are rejected.
pub fn validate_run_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || name.len() > MAX_RUN_NAME_LEN {
        return Err(CoreError::InvalidPayload(format!(
            "runName must be between 1 and {MAX_RUN_NAME_LEN} characters"
        )));
    }
    if name == "." || name == ".." {
        return Err(CoreError::InvalidPayload(
            "runName must not be a relative path component".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::InvalidPayload(
            "runName may only contain alphanumeric, hyphen, underscore, or dot characters"
                .to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn prep_json() -> serde_json::Value {
        json!({
            "inputDir": "a",
            "transcriptFile": "t.tsv",
            "outputDir": "out",
            "speaker": "s1",
            "language": "en",
        })
    }

    #[test]
    fn minimal_prep_payload_is_valid() {
        let payload = JobPayload::parse(JobKind::Prep, prep_json()).unwrap();
        assert_eq!(payload.kind(), JobKind::Prep);
        let JobPayload::Prep(prep) = payload else {
            panic!("expected prep payload");
        };
        assert_eq!(prep.speaker, "s1");
        assert_eq!(prep.sample_rate, None);
        assert_eq!(prep.vad, None);
    }

    #[test]
    fn prep_missing_required_field_is_rejected() {
        let mut raw = prep_json();
        raw.as_object_mut().unwrap().remove("speaker");
        let err = JobPayload::parse(JobKind::Prep, raw).unwrap_err();
        assert_matches!(err, CoreError::InvalidPayload(msg) if msg.contains("speaker"));
    }

    #[test]
    fn prep_empty_field_is_rejected() {
        let mut raw = prep_json();
        raw["outputDir"] = json!("");
        assert_matches!(
            JobPayload::parse(JobKind::Prep, raw),
            Err(CoreError::InvalidPayload(_))
        );
    }

    #[test]
    fn prep_sample_rate_out_of_range_is_rejected() {
        let mut raw = prep_json();
        raw["sampleRate"] = json!(100);
        assert_matches!(
            JobPayload::parse(JobKind::Prep, raw),
            Err(CoreError::InvalidPayload(_))
        );
    }

    #[test]
    fn prep_wrong_type_is_rejected() {
        let mut raw = prep_json();
        raw["vad"] = json!("yes");
        assert_matches!(
            JobPayload::parse(JobKind::Prep, raw),
            Err(CoreError::InvalidPayload(_))
        );
    }

    #[test]
    fn unknown_fields_are_dropped() {
        let mut raw = prep_json();
        raw["gpu"] = json!(2);
        let payload = JobPayload::parse(JobKind::Prep, raw).unwrap();
        assert_eq!(payload.to_value().unwrap(), prep_json());

        let payload =
            JobPayload::parse(JobKind::Train, json!({ "configPath": "c.json", "epochs": 3 }))
                .unwrap();
        assert_eq!(payload.to_value().unwrap(), json!({ "configPath": "c.json" }));
    }

    #[test]
    fn bad_language_code_is_rejected() {
        assert!(validate_language("en").is_ok());
        assert!(validate_language("pt-br").is_ok());
        assert!(validate_language("e").is_err());
        assert!(validate_language("en_US").is_err());
        assert!(validate_language("englishlang").is_err());
    }

    #[test]
    fn train_payload_requires_config_path() {
        assert_matches!(
            JobPayload::parse(JobKind::Train, json!({ "runName": "r1" })),
            Err(CoreError::InvalidPayload(_))
        );
        let payload =
            JobPayload::parse(JobKind::Train, json!({ "configPath": "c.json" })).unwrap();
        assert_eq!(payload.kind(), JobKind::Train);
    }

    #[test]
    fn run_name_must_be_a_safe_path_component() {
        assert!(validate_run_name("house_en-xtts.v2").is_ok());
        assert!(validate_run_name("../etc").is_err());
        assert!(validate_run_name("a/b").is_err());
        assert!(validate_run_name("..").is_err());
        assert_matches!(
            JobPayload::parse(
                JobKind::Train,
                json!({ "configPath": "c.json", "runName": "x/../y" })
            ),
            Err(CoreError::InvalidPayload(_))
        );
    }

    #[test]
    fn to_value_omits_unset_optionals() {
        let payload = JobPayload::parse(JobKind::Prep, prep_json()).unwrap();
        let value = payload.to_value().unwrap();
        assert_eq!(value, prep_json());
    }
}
