use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use vox_core::payload::{JobPayload, PrepPayload, DEFAULT_MAX_LEN, DEFAULT_SAMPLE_RATE};
use vox_core::progress::parse_prep_line;

use super::payload_of;
use crate::handler::{HandlerError, JobContext, JobHandler, ProgressReporter};
use crate::process::{run_command, CommandSpec};

/// Runs the dataset preparation script.
pub struct PrepHandler {
    python: String,
    script: PathBuf,
}

impl PrepHandler {
    pub fn new(python: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            script: script.into(),
        }
    }
}

/// Build the preparation command line for a payload.
pub fn prep_command(python: &str, script: &Path, payload: &PrepPayload) -> CommandSpec {
    let sample_rate = payload.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
    let max_len = payload.max_len.unwrap_or(DEFAULT_MAX_LEN);

    let spec = CommandSpec::new(python)
        .arg(script.to_string_lossy())
        .flag("--input-dir", &payload.input_dir)
        .flag("--transcript-file", &payload.transcript_file)
        .flag("--output-dir", &payload.output_dir)
        .flag("--speaker", &payload.speaker)
        .flag("--language", &payload.language)
        .flag("--sample-rate", sample_rate.to_string())
        .flag("--max-len", max_len.to_string());

    if payload.vad.unwrap_or(false) {
        spec.arg("--vad")
    } else {
        spec
    }
}

#[async_trait]
impl JobHandler for PrepHandler {
    async fn run(
        &self,
        ctx: &JobContext,
        progress: &ProgressReporter,
    ) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::Prep(payload) = payload_of(ctx)? else {
            return Err(HandlerError::Failed(format!(
                "prep handler received a {} job",
                ctx.kind
            )));
        };

        let spec = prep_command(&self.python, &self.script, &payload).with_job_env(ctx);
        run_command(ctx, &spec, parse_prep_line, progress).await?;

        Ok(json!({ "outputDir": payload.output_dir }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> PrepPayload {
        PrepPayload {
            input_dir: "data/raw".into(),
            transcript_file: "data/raw/metadata.csv".into(),
            output_dir: "data/prepared".into(),
            speaker: "alice".into(),
            language: "en".into(),
            sample_rate: None,
            max_len: None,
            vad: None,
        }
    }

    #[test]
    fn defaults_fill_sample_rate_and_max_len() {
        let spec = prep_command("python3", Path::new("scripts/prep_xtts_data.py"), &payload());
        assert_eq!(spec.program, "python3");
        assert_eq!(
            spec.args,
            vec![
                "scripts/prep_xtts_data.py",
                "--input-dir",
                "data/raw",
                "--transcript-file",
                "data/raw/metadata.csv",
                "--output-dir",
                "data/prepared",
                "--speaker",
                "alice",
                "--language",
                "en",
                "--sample-rate",
                "22050",
                "--max-len",
                "15",
            ]
        );
    }

    #[test]
    fn vad_flag_and_overrides() {
        let mut p = payload();
        p.sample_rate = Some(16_000);
        p.max_len = Some(11);
        p.vad = Some(true);

        let spec = prep_command("py", Path::new("prep.py"), &p);
        let args = spec.args.join(" ");
        assert!(args.contains("--sample-rate 16000"));
        assert!(args.contains("--max-len 11"));
        assert_eq!(spec.args.last().map(String::as_str), Some("--vad"));
    }

    #[test]
    fn vad_false_adds_nothing() {
        let mut p = payload();
        p.vad = Some(false);
        let spec = prep_command("py", Path::new("prep.py"), &p);
        assert!(!spec.args.iter().any(|a| a == "--vad"));
    }
}
