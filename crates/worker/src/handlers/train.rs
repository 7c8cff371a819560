use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use vox_core::payload::{JobPayload, TrainPayload};
use vox_core::progress::parse_train_line;

use super::payload_of;
use crate::handler::{HandlerError, JobContext, JobHandler, ProgressReporter};
use crate::process::{run_command, CommandSpec};

/// Runs a Coqui TTS training session.
pub struct TrainHandler {
    python: String,
    runs_dir: PathBuf,
}

impl TrainHandler {
    pub fn new(python: impl Into<String>, runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            runs_dir: runs_dir.into(),
        }
    }
}

/// Run name used when the payload does not set one.
pub fn default_run_name(job_id: &str) -> String {
    format!("run-{job_id}")
}

/// Build the training command line. Returns the spec and the resolved
/// run name.
pub fn train_command(
    python: &str,
    runs_dir: &Path,
    job_id: &str,
    payload: &TrainPayload,
) -> (CommandSpec, String) {
    let run_name = payload
        .run_name
        .clone()
        .unwrap_or_else(|| default_run_name(job_id));
    let output_path = runs_dir.join(&run_name);

    let mut spec = CommandSpec::new(python)
        .flag("-m", "TTS.bin.train")
        .flag("--config_path", &payload.config_path)
        .flag("--run_name", &run_name)
        .flag("--output_path", output_path.to_string_lossy());

    if let Some(model) = &payload.model_name {
        spec = spec.env("MODEL_NAME", model);
    }
    if let Some(dataset) = &payload.dataset_path {
        spec = spec.env("DATASET_PATH", dataset);
    }
    (spec, run_name)
}

#[async_trait]
impl JobHandler for TrainHandler {
    async fn run(
        &self,
        ctx: &JobContext,
        progress: &ProgressReporter,
    ) -> Result<serde_json::Value, HandlerError> {
        let JobPayload::Train(payload) = payload_of(ctx)? else {
            return Err(HandlerError::Failed(format!(
                "train handler received a {} job",
                ctx.kind
            )));
        };

        let (spec, run_name) = train_command(&self.python, &self.runs_dir, &ctx.job_id, &payload);
        let spec = spec.with_job_env(ctx);
        run_command(ctx, &spec, parse_train_line, progress).await?;

        let output_path = self.runs_dir.join(&run_name);
        Ok(json!({
            "outputPath": output_path.to_string_lossy(),
            "runName": run_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> TrainPayload {
        TrainPayload {
            config_path: "configs/xtts.json".into(),
            run_name: None,
            model_name: None,
            dataset_path: None,
        }
    }

    #[test]
    fn run_name_defaults_to_job_id() {
        let (spec, run) = train_command("python3", Path::new("runs"), "abc", &payload());
        assert_eq!(run, "run-abc");
        assert_eq!(
            spec.args,
            vec![
                "-m",
                "TTS.bin.train",
                "--config_path",
                "configs/xtts.json",
                "--run_name",
                "run-abc",
                "--output_path",
                "runs/run-abc",
            ]
        );
        assert!(spec.envs.is_empty());
    }

    #[test]
    fn explicit_run_name_and_model_env() {
        let mut p = payload();
        p.run_name = Some("alice-v2".into());
        p.model_name = Some("xtts_v2".into());
        p.dataset_path = Some("data/prepared".into());

        let (spec, run) = train_command("py", Path::new("/srv/runs"), "abc", &p);
        assert_eq!(run, "alice-v2");
        assert!(spec.args.contains(&"/srv/runs/alice-v2".to_string()));
        assert_eq!(spec.env_value("MODEL_NAME"), Some("xtts_v2"));
        assert_eq!(spec.env_value("DATASET_PATH"), Some("data/prepared"));
    }
}
