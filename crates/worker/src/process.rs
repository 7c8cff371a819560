//! External process execution shared by the job handlers.
//!
//! [`run_command`] spawns the child with piped output, streams stdout and
//! stderr into the job log line by line, offers every line to the kind's
//! progress parser, and maps a non-zero exit to [`HandlerError::Exited`].

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use vox_core::progress::ProgressParser;

use crate::handler::{HandlerError, JobContext, ProgressReporter};

/// Number of log lines attached to a failure reason.
pub const FAILURE_TAIL_LINES: usize = 20;

/// Longest output line offered to a progress parser.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// A fully resolved command line, built by a handler from its payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a `--flag value` pair.
    pub fn flag(self, name: &str, value: impl Into<String>) -> Self {
        self.arg(name).arg(value)
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Look up an environment variable set on this spec.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Add the variables every job process receives.
    pub fn with_job_env(self, ctx: &JobContext) -> Self {
        let request_id = ctx.request_id.clone().unwrap_or_default();
        self.env("JOB_ID", ctx.job_id.clone())
            .env("REQUEST_ID", request_id)
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Run `spec` to completion for the job in `ctx`.
///
/// Both output streams are drained until EOF even if appending to the log
/// fails, so the child never blocks on a full pipe. Returns `Ok(())` only
/// for a zero exit status.
pub async fn run_command(
    ctx: &JobContext,
    spec: &CommandSpec,
    parser: ProgressParser,
    reporter: &ProgressReporter,
) -> Result<(), HandlerError> {
    let mut child = spec.to_command().spawn().map_err(|source| HandlerError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    tracing::info!(
        job_id = %ctx.job_id,
        kind = %ctx.kind,
        program = %spec.program,
        pid = child.id(),
        "Job process started",
    );

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (_, _, status) = tokio::join!(
        pump(ctx, stdout, parser, reporter),
        pump(ctx, stderr, parser, reporter),
        child.wait(),
    );
    let status = status?;

    tracing::info!(
        job_id = %ctx.job_id,
        kind = %ctx.kind,
        code = status.code(),
        "Job process exited",
    );

    if status.success() {
        return Ok(());
    }

    // A process that printed nothing has no log file.
    let output_tail = ctx
        .logs
        .read_tail(&ctx.job_id, FAILURE_TAIL_LINES)
        .await
        .unwrap_or_default();

    Err(HandlerError::Exited {
        kind: ctx.kind,
        status: describe_status(status),
        output_tail,
    })
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

/// Copy one output stream into the job log and feed its lines to `parser`.
///
/// Both `\n` and `\r` end a line, so carriage-return progress bars are
/// seen as they redraw. At most [`MAX_LINE_BYTES`] are buffered; the rest
/// of a longer line is written to the log as it arrives and never parsed.
async fn pump<R>(
    ctx: &JobContext,
    stream: Option<R>,
    parser: ProgressParser,
    reporter: &ProgressReporter,
) where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut overlong = false;

    loop {
        let buf = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(job_id = %ctx.job_id, error = %e, "Failed to read job process output");
                break;
            }
        };

        let (taken, ended) = match buf.iter().position(|b| matches!(b, b'\n' | b'\r')) {
            Some(i) => (i + 1, true),
            None => (buf.len(), false),
        };
        line.extend_from_slice(&buf[..taken]);
        reader.consume(taken);

        if ended {
            let parser = (!overlong).then_some(parser);
            emit_line(ctx, &line, parser, reporter).await;
            line.clear();
            overlong = false;
        } else if line.len() >= MAX_LINE_BYTES {
            emit_line(ctx, &line, None, reporter).await;
            line.clear();
            overlong = true;
        }
    }

    if !line.is_empty() {
        let parser = (!overlong).then_some(parser);
        emit_line(ctx, &line, parser, reporter).await;
    }
}

async fn emit_line(
    ctx: &JobContext,
    line: &[u8],
    parser: Option<ProgressParser>,
    reporter: &ProgressReporter,
) {
    if let Err(e) = ctx.logs.append(&ctx.job_id, line).await {
        tracing::warn!(job_id = %ctx.job_id, error = %e, "Failed to append to job log");
    }

    let Some(parser) = parser else {
        return;
    };
    let text = String::from_utf8_lossy(line);
    if let Some(value) = parser(text.trim()) {
        reporter.report(value).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use serde_json::json;
    use vox_core::job_log::JobLogSink;
    use vox_core::progress::parse_prep_line;
    use vox_core::types::JobKind;
    use vox_db::models::job::NewJob;
    use vox_db::repositories::JobRepo;
    use vox_events::ProgressEventBus;

    use super::*;

    struct Fixture {
        ctx: JobContext,
        reporter: ProgressReporter,
        pool: vox_db::DbPool,
        _dir: tempfile::TempDir,
    }

    async fn fixture(kind: JobKind) -> Fixture {
        let pool = vox_db::create_in_memory_pool().await.unwrap();
        let input = NewJob {
            id: vox_core::types::new_job_id(),
            kind,
            payload: json!({}),
            request_id: Some("req-42".into()),
        };
        JobRepo::insert(&pool, &input).await.unwrap();
        let job = JobRepo::claim_next(&pool, kind, "test").await.unwrap().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let ctx = JobContext {
            job_id: job.id.clone(),
            kind,
            payload: job.payload.clone(),
            attempt: job.attempts_made,
            request_id: job.request_id.clone(),
            logs: Arc::new(JobLogSink::new(dir.path())),
        };
        let reporter = ProgressReporter::new(job.id, pool.clone(), Arc::new(ProgressEventBus::default()));
        Fixture { ctx, reporter, pool, _dir: dir }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn output_is_logged_and_progress_reported() {
        let f = fixture(JobKind::Prep).await;
        let spec = sh("echo 10; echo 'working' 1>&2; echo 55; echo 30");

        run_command(&f.ctx, &spec, parse_prep_line, &f.reporter).await.unwrap();

        // 30 arrives after 55 and is ignored.
        assert_eq!(f.reporter.current().await, Some(55.0));
        let job = JobRepo::find_by_id(&f.pool, &f.ctx.job_id).await.unwrap().unwrap();
        assert_eq!(job.progress, Some(55.0));

        let log = f.ctx.logs.read_tail(&f.ctx.job_id, 10).await.unwrap();
        assert!(log.contains("working"));
        assert!(log.contains("55"));
    }

    #[tokio::test]
    async fn job_env_reaches_the_child() {
        let f = fixture(JobKind::Prep).await;
        let spec = sh("echo \"$JOB_ID $REQUEST_ID\"").with_job_env(&f.ctx);

        run_command(&f.ctx, &spec, parse_prep_line, &f.reporter).await.unwrap();

        let log = f.ctx.logs.read_tail(&f.ctx.job_id, 1).await.unwrap();
        assert_eq!(log, format!("{} req-42", f.ctx.job_id));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_code_and_output_tail() {
        let f = fixture(JobKind::Train).await;
        let spec = sh("echo 'loading config'; echo 'bad config' 1>&2; exit 3");

        let err = run_command(&f.ctx, &spec, parse_prep_line, &f.reporter)
            .await
            .unwrap_err();
        assert_matches!(&err, HandlerError::Exited { status, .. } if status == "exited with code 3");

        let reason = err.to_string();
        assert!(reason.starts_with("train process exited with code 3\n"));
        assert!(reason.contains("bad config"));
    }

    #[tokio::test]
    async fn silent_failure_has_no_tail() {
        let f = fixture(JobKind::Train).await;
        let err = run_command(&f.ctx, &sh("exit 1"), parse_prep_line, &f.reporter)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "train process exited with code 1");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let f = fixture(JobKind::Prep).await;
        let spec = CommandSpec::new("/nonexistent/vox-python");
        let err = run_command(&f.ctx, &spec, parse_prep_line, &f.reporter)
            .await
            .unwrap_err();
        assert_matches!(err, HandlerError::Spawn { ref program, .. } if program == "/nonexistent/vox-python");
    }

    #[tokio::test]
    async fn large_output_on_both_streams_does_not_block() {
        let f = fixture(JobKind::Prep).await;
        let spec = sh("i=0; while [ $i -lt 5000 ]; do echo \"out line $i\"; echo \"err line $i\" 1>&2; i=$((i+1)); done");

        tokio::time::timeout(
            std::time::Duration::from_secs(30),
            run_command(&f.ctx, &spec, parse_prep_line, &f.reporter),
        )
        .await
        .expect("process should finish")
        .unwrap();

        let chunk = f.ctx.logs.read_range(&f.ctx.job_id, 0).await.unwrap();
        let text = String::from_utf8_lossy(&chunk.data);
        assert_eq!(text.lines().count(), 10_000);
    }

    #[tokio::test]
    async fn carriage_return_updates_are_parsed() {
        let f = fixture(JobKind::Prep).await;
        let spec = sh(r"printf '10%%\r20%%\r30%%\n'");

        run_command(&f.ctx, &spec, parse_prep_line, &f.reporter).await.unwrap();

        assert_eq!(f.reporter.current().await, Some(30.0));
        let chunk = f.ctx.logs.read_range(&f.ctx.job_id, 0).await.unwrap();
        assert_eq!(chunk.data, b"10%\r20%\r30%\n");
    }

    #[tokio::test]
    async fn overlong_line_is_logged_but_not_parsed() {
        let f = fixture(JobKind::Prep).await;
        let spec = sh(r"head -c 200000 /dev/zero | tr '\0' x; printf ' 99%%\n42\n'");

        run_command(&f.ctx, &spec, parse_prep_line, &f.reporter).await.unwrap();

        assert_eq!(f.reporter.current().await, Some(42.0));
        let chunk = f.ctx.logs.read_range(&f.ctx.job_id, 0).await.unwrap();
        assert_eq!(chunk.data.len(), 200_000 + " 99%\n42\n".len());
        assert!(chunk.data.ends_with(b"x 99%\n42\n"));
    }
}
