use super::{types::*, Engine};
use crate::config::{Config, ENGINE_PATH_ENV};
use crate::error::{ConversionError, ConversionResult};
use crate::util::{absolute, expand_tilde};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Export filter handed to `--convert-to`.
pub const PDF_EXPORT_FILTER: &str = "pdf:writer_pdf_Export";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
// How long to wait for pipe readers once the child is gone. A grandchild that
// inherited the pipes can keep them open long after the engine exited.
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// Headless LibreOffice (`soffice`) driven as a one-shot subprocess.
pub struct SofficeEngine {
    executable: Option<PathBuf>,
    env: BTreeMap<String, String>,
    doctor_timeout: Duration,
}

impl SofficeEngine {
    pub fn new(cfg: &Config) -> Self {
        Self {
            executable: resolve_engine_exe(&cfg.engine.executable),
            env: cfg.engine.env.clone(),
            doctor_timeout: Duration::from_secs(cfg.engine.doctor_timeout_seconds),
        }
    }

    pub fn with_executable(mut self, executable: Option<PathBuf>) -> Self {
        self.executable = executable;
        self
    }

    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    fn command(&self, executable: &Path, input: &Path, output_dir: &Path) -> Command {
        let mut cmd = Command::new(executable);
        cmd.arg("--headless")
            .arg("--convert-to")
            .arg(PDF_EXPORT_FILTER)
            .arg("--outdir")
            .arg(output_dir)
            .arg(input);
        self.prepare(&mut cmd);
        cmd
    }

    fn prepare(&self, cmd: &mut Command) {
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        hide_console_window(cmd);
        own_process_group(cmd);
    }

    fn launch(&self, mut cmd: Command, timeout: Duration) -> Result<Waited> {
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to launch {}", cmd.get_program().to_string_lossy()))?;
        wait_with_timeout(&mut child, timeout)
    }
}

fn resolve_engine_exe(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("auto") {
        return std::env::var(ENGINE_PATH_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| expand_tilde(v.trim()));
    }
    Some(expand_tilde(raw))
}

fn fail(message: String) -> ConversionError {
    error!("{message}");
    ConversionError::new(message)
}

impl Engine for SofficeEngine {
    fn doctor(&self) -> Result<EngineDiag> {
        let Some(exe) = self.executable.as_deref() else {
            return Ok(EngineDiag {
                executable: None,
                version: None,
                ok: false,
                error: Some(format!(
                    "engine executable is not configured; set engine.executable or {ENGINE_PATH_ENV}"
                )),
            });
        };

        let mut cmd = Command::new(exe);
        cmd.arg("--version");
        self.prepare(&mut cmd);

        let (version, error) = match self.launch(cmd, self.doctor_timeout) {
            Ok(Waited::Exited(out)) if out.status.success() => {
                let version = out.stdout.lines().next().map(|l| l.trim().to_string());
                (version, None)
            }
            Ok(Waited::Exited(out)) => (
                None,
                Some(format!(
                    "exit code {}: {}",
                    describe_code(out.status),
                    out.stderr.trim()
                )),
            ),
            Ok(Waited::TimedOut) => (
                None,
                Some(format!(
                    "timed out after {}s",
                    self.doctor_timeout.as_secs_f64()
                )),
            ),
            Err(e) => (None, Some(format!("{e:#}"))),
        };

        Ok(EngineDiag {
            executable: Some(exe.display().to_string()),
            ok: error.is_none(),
            version,
            error,
        })
    }

    fn convert(&self, req: &ConversionRequest) -> ConversionResult<PathBuf> {
        let span = info_span!("convert", input = %req.input.display());
        let _enter = span.enter();

        let input = req.input.canonicalize().map_err(|_| {
            fail(format!(
                "input file does not exist: {}",
                absolute(&req.input).display()
            ))
        })?;

        let output_dir = std::fs::create_dir_all(&req.output_dir)
            .and_then(|_| req.output_dir.canonicalize())
            .map_err(|e| {
                fail(format!(
                    "failed to create output directory: {}, error: {e}",
                    absolute(&req.output_dir).display()
                ))
            })?;

        info!("converting {}", input.display());
        info!("output directory {}", output_dir.display());

        let stem = input
            .file_stem()
            .ok_or_else(|| fail(format!("conversion error: input has no file name: {}", input.display())))?;
        let artifact = output_dir.join(format!("{}.pdf", stem.to_string_lossy()));

        let executable = self.executable.as_deref().ok_or_else(|| {
            fail(format!(
                "conversion error: engine executable is not configured; set engine.executable or {ENGINE_PATH_ENV}"
            ))
        })?;

        let cmd = self.command(executable, &input, &output_dir);
        info!("running {}", render_command(&cmd));

        let out = match self.launch(cmd, req.timeout) {
            Ok(Waited::Exited(out)) => out,
            Ok(Waited::TimedOut) => {
                let message = format!("conversion timed out after {}s", req.timeout.as_secs_f64());
                warn!("{message}");
                return Err(ConversionError::new(message));
            }
            Err(e) => return Err(fail(format!("conversion error: {e:#}"))),
        };

        if !out.stdout.is_empty() {
            info!(stdout = %out.stdout.trim_end(), "engine stdout");
        }
        if !out.stderr.is_empty() {
            warn!(stderr = %out.stderr.trim_end(), "engine stderr");
        }

        if out.status.success() && artifact.is_file() {
            info!("converted {}", artifact.display());
            return Ok(artifact);
        }

        if out.status.success() {
            debug!("exit code 0 but {} is missing", artifact.display());
        }
        let message = format!(
            "conversion failed, exit code: {}\nstdout: {}\nstderr: {}",
            describe_code(out.status),
            out.stdout,
            out.stderr
        );
        warn!("{message}");
        Err(ConversionError::new(message))
    }
}

fn render_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn describe_code(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => code.to_string(),
        None => format!("none ({status})"),
    }
}

#[cfg(windows)]
fn hide_console_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console_window(_cmd: &mut Command) {}

// soffice is a wrapper that forks soffice.bin; the engine gets its own process
// group so a timeout can take down every process it started.
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// Kills the engine and, on unix, everything in its process group.
///
/// Must run before the child is reaped so the group id cannot be reused.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        match i32::try_from(child.id()) {
            Ok(pgid) => match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) => return,
                Err(e) => debug!("killpg {pgid}: {e}"),
            },
            Err(e) => debug!("pid out of range: {e}"),
        }
    }
    if let Err(e) = child.kill() {
        // Already exited between try_wait and kill; wait() reaps it.
        debug!("kill: {e}");
    }
}

/// Captured, leniently decoded output of a finished child.
struct Captured {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

enum Waited {
    Exited(Captured),
    TimedOut,
}

fn spawn_reader<R: Read + Send + 'static>(src: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut src) = src {
            // Keep whatever was read before an I/O error.
            let _ = src.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

fn collect(rx: &Receiver<Vec<u8>>, stream: &str) -> String {
    match rx.recv_timeout(PIPE_GRACE) {
        Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
        Err(_) => {
            warn!("{stream} still held open after engine exit; dropping it");
            String::new()
        }
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Waited> {
    // Drain pipes while waiting so a chatty engine can't block on a full buffer.
    let stdout_rx = spawn_reader(child.stdout.take());
    let stderr_rx = spawn_reader(child.stderr.take());

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().with_context(|| "try_wait")? {
            return Ok(Waited::Exited(Captured {
                status,
                stdout: collect(&stdout_rx, "stdout"),
                stderr: collect(&stderr_rx, "stderr"),
            }));
        }

        if start.elapsed() >= timeout {
            warn!("engine process timed out after {:?}; killing pid {}", timeout, child.id());
            kill_tree(child);
            child
                .wait()
                .map_err(|e| anyhow!("wait after kill: {e}"))?;
            let stdout = collect(&stdout_rx, "stdout");
            if !stdout.is_empty() {
                warn!(stdout = %stdout.trim_end(), "engine stdout before timeout");
            }
            let stderr = collect(&stderr_rx, "stderr");
            if !stderr.is_empty() {
                warn!(stderr = %stderr.trim_end(), "engine stderr before timeout");
            }
            return Ok(Waited::TimedOut);
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_has_fixed_shape() {
        let engine = SofficeEngine::new(&Config::default());
        let cmd = engine.command(
            Path::new("/opt/lo/soffice"),
            Path::new("/in/report.docx"),
            Path::new("/out"),
        );
        assert_eq!(
            render_command(&cmd),
            "/opt/lo/soffice --headless --convert-to pdf:writer_pdf_Export --outdir /out /in/report.docx"
        );
    }

    #[test]
    fn explicit_executable_wins_over_auto() {
        assert_eq!(
            resolve_engine_exe(" /usr/bin/soffice "),
            Some(PathBuf::from("/usr/bin/soffice"))
        );
    }
}
