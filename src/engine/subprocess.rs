//! Runner that executes each script in its own interpreter process.
//!
//! The interpreter runs the bootstrap harness, which installs a plot sink
//! as matplotlib's display backend, executes the submission in a fresh
//! namespace and streams events back over its stdout. Because every run is
//! a new process, the plotting library's global state can never leak from
//! one run into the next.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{Completion, Fault, FaultKind, PlotImage, PlotSink, RunnerError, Script, ScriptRunner};
use crate::config::InterpreterConfig;
use crate::transport::{recv_event, send_request, HarnessEvent, HarnessFaultKind, HarnessRequest};

/// Python program run with `-c` inside every interpreter.
pub const BOOTSTRAP: &str = include_str!("bootstrap.py");

/// Keep at most this much stderr in crash reports.
const STDERR_TAIL_CHARS: usize = 4000;

/// How long stderr may stay open once the interpreter is gone.
const STDERR_GRACE: Duration = Duration::from_millis(500);

static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Runner backed by a fresh interpreter process per script.
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner {
    interpreter: InterpreterConfig,
}

impl SubprocessRunner {
    pub const fn new(interpreter: InterpreterConfig) -> Self {
        Self { interpreter }
    }

    fn command(&self, script: &Script) -> Command {
        let mut cmd = Command::new(&self.interpreter.program);
        cmd.args(&self.interpreter.args)
            .arg("-c")
            .arg(BOOTSTRAP)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env_remove("MPLBACKEND")
            .envs(&self.interpreter.env);

        // Own process group, so everything the script starts can be killed
        // together with the interpreter.
        #[cfg(unix)]
        cmd.process_group(0);

        if self.interpreter.run_in_script_dir {
            if let Some(dir) = script.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                cmd.current_dir(dir);
            }
        }

        cmd
    }
}

#[async_trait]
impl ScriptRunner for SubprocessRunner {
    #[instrument(
        skip(self, script, sink),
        fields(program = %self.interpreter.program, script = %script.path.display())
    )]
    async fn execute(
        &self,
        script: &Script,
        sink: &mut dyn PlotSink,
    ) -> Result<Completion, RunnerError> {
        debug!(code_len = script.source.len(), "Spawning interpreter");

        let mut child = self
            .command(script)
            .spawn()
            .map_err(|source| RunnerError::Launch {
                program: self.interpreter.program.clone(),
                source,
            })?;
        // `id()` is gone once the child is reaped; the group outlives it.
        let group = child.id();

        let mut stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let mut stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        // Drain stderr on the side so a chatty script cannot fill the pipe
        // and stall while we wait for events.
        let captured = Arc::new(Mutex::new(Vec::new()));
        let mut stderr_task = tokio::spawn(drain(stderr, Arc::clone(&captured)));

        let request = HarnessRequest::Execute {
            id: RUN_COUNTER.fetch_add(1, Ordering::Relaxed).to_string(),
            filename: script.display_name(),
            path: absolute(&script.path).display().to_string(),
            code: script.source.clone(),
        };
        // If the interpreter died on startup this fails with a broken pipe;
        // the missing final event below reports it as a crash.
        if let Err(e) = send_request(&mut stdin, &request).await {
            debug!(error = %e, "Failed to send request to harness");
        }
        drop(stdin); // Close stdin so `input()` in the script sees EOF

        let pump = pump_events(&mut stdout, sink);
        let outcome = match self.interpreter.timeout() {
            Some(limit) => {
                if let Ok(outcome) = tokio::time::timeout(limit, pump).await {
                    outcome
                } else {
                    warn!(timeout_secs = limit.as_secs(), "Script timed out, killing interpreter");
                    kill_group(group);
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Err(RunnerError::Timeout(limit));
                }
            }
            None => pump.await,
        };

        if outcome.is_err() {
            let _ = child.kill().await;
        }
        let status = child.wait().await?;
        // Background processes the script left behind go with it.
        kill_group(group);
        let stderr = finish_stderr(&mut stderr_task, &captured).await;

        match outcome? {
            Some(ending) => {
                debug!(%status, failed = ending.fault.is_some(), "Interpreter finished");
                Ok(Completion {
                    trailing: ending.trailing,
                    fault: ending.fault,
                    stderr,
                })
            }
            None => Err(RunnerError::Crashed {
                status: status.to_string(),
                stderr: tail(&stderr, STDERR_TAIL_CHARS).to_string(),
            }),
        }
    }
}

async fn drain(mut stderr: ChildStderr, captured: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => captured.lock().await.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Failed to read interpreter stderr");
                break;
            }
        }
    }
}

/// Wait briefly for stderr to close, then keep whatever arrived.
///
/// A process that left the interpreter's group can hold the pipe open
/// indefinitely.
async fn finish_stderr(task: &mut JoinHandle<()>, captured: &Mutex<Vec<u8>>) -> String {
    if tokio::time::timeout(STDERR_GRACE, &mut *task).await.is_err() {
        debug!("stderr still open after the interpreter exited, abandoning it");
        task.abort();
    }
    String::from_utf8_lossy(&captured.lock().await).into_owned()
}

/// Kill every process left in the interpreter's process group.
#[cfg(unix)]
fn kill_group(group: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = group.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!(error = %e, pgid, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) {}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
}

/// Final event of a run.
struct Ending {
    trailing: String,
    fault: Option<Fault>,
}

/// Forward harness events to `sink` until the run ends.
///
/// Returns `Ok(None)` if the event stream closed before a final event.
async fn pump_events<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    sink: &mut dyn PlotSink,
) -> Result<Option<Ending>, RunnerError> {
    while let Some(event) = recv_event(reader)
        .await
        .map_err(|e| RunnerError::Protocol(format!("{e:#}")))?
    {
        match event {
            HarnessEvent::Ready { python, matplotlib } => {
                debug!(%python, matplotlib = ?matplotlib, "Harness ready");
                if matplotlib.is_none() {
                    warn!("matplotlib is not importable in the interpreter; plots cannot be captured");
                }
            }
            HarnessEvent::Segment {
                text,
                image,
                mime_type,
            } => {
                let image = image
                    .map(|data| {
                        PlotImage::from_base64(mime_type.as_deref().unwrap_or(PlotImage::PNG), &data)
                    })
                    .transpose()
                    .map_err(|e| RunnerError::Protocol(format!("invalid image payload: {e}")))?;
                debug!(text_len = text.len(), has_image = image.is_some(), "Captured plot");
                sink.plot(&text, image);
            }
            HarnessEvent::Finished { trailing } => {
                return Ok(Some(Ending {
                    trailing,
                    fault: None,
                }));
            }
            HarnessEvent::Fault {
                kind,
                exception,
                message,
                line,
                trailing,
            } => {
                let kind = match kind {
                    HarnessFaultKind::Syntax => FaultKind::Syntax,
                    HarnessFaultKind::Runtime => FaultKind::Runtime,
                    HarnessFaultKind::Exit => FaultKind::Exit,
                    HarnessFaultKind::Protocol => FaultKind::Protocol,
                };
                debug!(?kind, %exception, "Script faulted");
                return Ok(Some(Ending {
                    trailing,
                    fault: Some(
                        Fault::new(kind, message)
                            .with_exception(exception)
                            .with_line(line),
                    ),
                }));
            }
        }
    }
    Ok(None)
}

fn missing_pipe(name: &str) -> RunnerError {
    RunnerError::Protocol(format!("interpreter {name} was not captured"))
}

/// Last `max_chars` characters of `text`.
fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    text.char_indices()
        .nth(skip)
        .map_or(text, |(idx, _)| &text[idx..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, SegmentCollector};
    use crate::transport::send_message;
    use std::path::PathBuf;

    async fn frames(events: &[HarnessEvent]) -> std::io::Cursor<Vec<u8>> {
        let mut buf = Vec::new();
        for event in events {
            let bytes = serde_json::to_vec(event).unwrap();
            send_message(&mut buf, &bytes).await.unwrap();
        }
        std::io::Cursor::new(buf)
    }

    #[tokio::test]
    async fn pump_delivers_segments_then_finishes() {
        let mut reader = frames(&[
            HarnessEvent::Ready {
                python: "3.12.3".into(),
                matplotlib: Some("3.9.0".into()),
            },
            HarnessEvent::Segment {
                text: "hello\n".into(),
                image: Some("iVBORw0KGgo=".into()),
                mime_type: Some("image/png".into()),
            },
            HarnessEvent::Finished {
                trailing: "world\n".into(),
            },
        ])
        .await;
        let mut sink = SegmentCollector::default();

        let ending = pump_events(&mut reader, &mut sink).await.unwrap().unwrap();

        assert_eq!(ending.trailing, "world\n");
        assert!(ending.fault.is_none());
        assert_eq!(sink.segments().len(), 1);
        assert_eq!(sink.segments()[0].text, "hello");
        assert!(sink.segments()[0].image.as_ref().unwrap().is_png());
    }

    #[tokio::test]
    async fn pump_maps_fault() {
        let mut reader = frames(&[HarnessEvent::Fault {
            kind: HarnessFaultKind::Syntax,
            exception: "SyntaxError".into(),
            message: "invalid syntax (s_A1.py, line 2)".into(),
            line: Some(2),
            trailing: String::new(),
        }])
        .await;
        let mut sink = SegmentCollector::default();

        let ending = pump_events(&mut reader, &mut sink).await.unwrap().unwrap();

        let fault = ending.fault.unwrap();
        assert_eq!(fault.kind, FaultKind::Syntax);
        assert_eq!(fault.exception.as_deref(), Some("SyntaxError"));
        assert_eq!(fault.line, Some(2));
        assert!(sink.segments().is_empty());
    }

    #[tokio::test]
    async fn pump_without_final_event_is_none() {
        let mut reader = frames(&[HarnessEvent::Segment {
            text: "partial".into(),
            image: None,
            mime_type: None,
        }])
        .await;
        let mut sink = SegmentCollector::default();

        assert!(pump_events(&mut reader, &mut sink).await.unwrap().is_none());
        // Segments delivered before the stream broke are kept
        assert_eq!(sink.segments().len(), 1);
    }

    #[tokio::test]
    async fn pump_rejects_bad_image() {
        let mut reader = frames(&[HarnessEvent::Segment {
            text: String::new(),
            image: Some("%%%".into()),
            mime_type: None,
        }])
        .await;
        let mut sink = SegmentCollector::default();

        let err = pump_events(&mut reader, &mut sink).await.err().unwrap();
        assert!(matches!(err, RunnerError::Protocol(_)));
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail("abcdef", 10), "abcdef");
        assert_eq!(tail("abcdef", 2), "ef");
        assert_eq!(tail("ääüü", 2), "üü");
    }

    #[test]
    fn bootstrap_is_embedded() {
        assert!(BOOTSTRAP.contains("def _show"));
        assert!(BOOTSTRAP.contains("os._exit(0)"));
    }

    #[tokio::test]
    async fn missing_interpreter_is_launch_fault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s_A1.py");
        std::fs::write(&path, "print('hi')\n").unwrap();

        let runner = SubprocessRunner::new(InterpreterConfig {
            program: "/nonexistent/python3".into(),
            ..InterpreterConfig::default()
        });
        let result = Engine::new(runner).run(&path).await;

        assert_eq!(result.error.unwrap().kind, FaultKind::Launch);
        assert!(result.segments.is_empty());
    }

    #[tokio::test]
    async fn interpreter_without_harness_is_crash() {
        // `true` ignores the harness and exits without sending anything.
        if !PathBuf::from("/bin/true").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s_A1.py");
        std::fs::write(&path, "print('hi')\n").unwrap();

        let runner = SubprocessRunner::new(InterpreterConfig {
            program: "/bin/true".into(),
            ..InterpreterConfig::default()
        });
        let result = Engine::new(runner).run(&path).await;

        assert_eq!(result.error.unwrap().kind, FaultKind::Crashed);
    }

    // The tests below run the real harness. They are skipped when no Python
    // interpreter is available; plotting tests also need matplotlib.

    fn python_program() -> String {
        std::env::var("SCRIPTGRADE_PYTHON").unwrap_or_else(|_| "python3".into())
    }

    fn python_succeeds(args: &[&str]) -> bool {
        std::process::Command::new(python_program())
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    fn runner_with_timeout(seconds: u64) -> SubprocessRunner {
        SubprocessRunner::new(InterpreterConfig {
            program: python_program(),
            timeout_seconds: Some(seconds),
            ..InterpreterConfig::default()
        })
    }

    fn python_runner() -> Option<SubprocessRunner> {
        python_succeeds(&["--version"]).then(|| runner_with_timeout(60))
    }

    fn plotting_runner() -> Option<SubprocessRunner> {
        python_succeeds(&["-c", "import matplotlib"]).then(|| runner_with_timeout(60))
    }

    fn script(dir: &tempfile::TempDir, name: &str, source: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, source).unwrap();
        path
    }

    #[tokio::test]
    async fn python_hello_plot_world() {
        let Some(runner) = plotting_runner() else { return };
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            &dir,
            "s_A1.py",
            "import matplotlib.pyplot as plt\n\
             print('hello')\n\
             plt.plot([1, 2, 3])\n\
             plt.show()\n\
             print('world')\n",
        );

        let result = Engine::new(runner).run(&path).await;

        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].text, "hello");
        assert!(result.segments[0].image.as_ref().unwrap().is_png());
        assert_eq!(result.trailing_text, "world");
    }

    #[tokio::test]
    async fn python_syntax_error() {
        let Some(runner) = python_runner() else { return };
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "s_A2.py", "print('a'\nx = = 1\n");

        let result = Engine::new(runner).run(&path).await;

        assert!(result.segments.is_empty());
        assert!(result.trailing_text.is_empty());
        let fault = result.error.unwrap();
        assert_eq!(fault.kind, FaultKind::Syntax);
        assert!(!fault.message.is_empty());
    }

    #[tokio::test]
    async fn python_runtime_fault_keeps_printed_text() {
        let Some(runner) = python_runner() else { return };
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "s_A2.py", "print('A')\n1 / 0\n");

        let result = Engine::new(runner).run(&path).await;

        assert!(result.segments.is_empty());
        assert_eq!(result.trailing_text, "A");
        let fault = result.error.unwrap();
        assert_eq!(fault.kind, FaultKind::Runtime);
        assert_eq!(fault.exception.as_deref(), Some("ZeroDivisionError"));
        assert_eq!(fault.line, Some(2));
    }

    #[tokio::test]
    async fn python_fault_after_plot() {
        let Some(runner) = plotting_runner() else { return };
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            &dir,
            "s_A3.py",
            "import matplotlib\n\
             matplotlib.use('Agg')\n\
             import matplotlib.pyplot as plt\n\
             print('A')\n\
             plt.plot([0, 1])\n\
             plt.show()\n\
             print('B')\n\
             1 / 0\n",
        );

        let result = Engine::new(runner).run(&path).await;

        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].text, "A");
        assert_eq!(result.trailing_text, "B");
        let fault = result.error.unwrap();
        assert_eq!(fault.kind, FaultKind::Runtime);
        assert_eq!(fault.exception.as_deref(), Some("ZeroDivisionError"));
        assert_eq!(fault.line, Some(8));
    }

    #[tokio::test]
    async fn python_runs_do_not_share_state() {
        let Some(runner) = python_runner() else { return };
        let dir = tempfile::tempdir().unwrap();
        let first = script(&dir, "a_A1.py", "import sys\nsys.leftover = 1\nsecret = 42\n");
        let second = script(
            &dir,
            "b_A1.py",
            "import sys\n\
             print(hasattr(sys, 'leftover'))\n\
             print(secret)\n",
        );
        let engine = Engine::new(runner);

        let r1 = engine.run(&first).await;
        assert!(r1.error.is_none(), "{:?}", r1.error);

        let r2 = engine.run(&second).await;
        assert_eq!(r2.trailing_text, "False");
        assert_eq!(r2.error.unwrap().exception.as_deref(), Some("NameError"));
    }

    #[tokio::test]
    async fn python_open_figures_do_not_leak() {
        let Some(runner) = plotting_runner() else { return };
        let dir = tempfile::tempdir().unwrap();
        let first = script(
            &dir,
            "a_A1.py",
            "import matplotlib.pyplot as plt\nplt.plot([1])\n",
        );
        let second = script(
            &dir,
            "b_A1.py",
            "import matplotlib.pyplot as plt\nprint(len(plt.get_fignums()))\n",
        );
        let engine = Engine::new(runner);

        let r1 = engine.run(&first).await;
        assert!(r1.error.is_none(), "{:?}", r1.error);
        // The first script left a figure open without showing it
        assert!(r1.segments.is_empty());

        let r2 = engine.run(&second).await;
        assert_eq!(r2.trailing_text, "0");
    }

    #[tokio::test]
    async fn python_file_is_absolute_path() {
        let Some(mut runner) = python_runner() else { return };
        runner.interpreter.run_in_script_dir = false;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "42\n").unwrap();
        let path = script(
            &dir,
            "s_A6.py",
            "import os\n\
             here = os.path.dirname(__file__)\n\
             print(open(os.path.join(here, 'data.txt')).read())\n\
             1 / 0\n",
        );

        let result = Engine::new(runner).run(&path).await;

        assert_eq!(result.trailing_text, "42");
        // Line lookup still matches the name used in tracebacks
        let fault = result.error.unwrap();
        assert_eq!(fault.exception.as_deref(), Some("ZeroDivisionError"));
        assert_eq!(fault.line, Some(4));
    }

    #[tokio::test]
    async fn python_stdout_noise_does_not_break_framing() {
        let Some(runner) = python_runner() else { return };
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            &dir,
            "s_A4.py",
            "import os, sys\n\
             os.write(1, b'raw bytes on fd 1\\n')\n\
             print('to stderr', file=sys.stderr)\n\
             print('captured')\n",
        );

        let result = Engine::new(runner).run(&path).await;

        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.trailing_text, "captured");
        assert!(result.stderr.contains("raw bytes on fd 1"));
        assert!(result.stderr.contains("to stderr"));
    }

    #[tokio::test]
    async fn python_exit_codes() {
        let Some(runner) = python_runner() else { return };
        let dir = tempfile::tempdir().unwrap();
        let clean = script(&dir, "a_A1.py", "import sys\nprint('done')\nsys.exit(0)\n");
        let failing = script(&dir, "b_A1.py", "import sys\nsys.exit(3)\n");
        let engine = Engine::new(runner);

        let r1 = engine.run(&clean).await;
        assert!(r1.error.is_none());
        assert_eq!(r1.trailing_text, "done");

        let r2 = engine.run(&failing).await;
        let fault = r2.error.unwrap();
        assert_eq!(fault.kind, FaultKind::Exit);
        assert_eq!(fault.message, "exit status 3");
    }

    #[tokio::test]
    async fn python_timeout_kills_run() {
        let Some(mut runner) = python_runner() else { return };
        runner.interpreter.timeout_seconds = Some(1);
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "s_A5.py", "while True:\n    pass\n");

        let result = Engine::new(runner).run(&path).await;
        assert_eq!(result.error.unwrap().kind, FaultKind::Timeout);
    }

    #[tokio::test]
    async fn python_background_process_does_not_hold_run() {
        let Some(runner) = python_runner() else { return };
        if !PathBuf::from("/bin/sleep").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            &dir,
            "s_A7.py",
            "import subprocess\n\
             subprocess.Popen(['/bin/sleep', '30'])\n\
             print('done')\n",
        );

        let started = std::time::Instant::now();
        let result = Engine::new(runner).run(&path).await;

        assert!(started.elapsed() < Duration::from_secs(15), "{:?}", started.elapsed());
        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.trailing_text, "done");
    }

    #[tokio::test]
    async fn python_timeout_reaches_background_process() {
        let Some(mut runner) = python_runner() else { return };
        if !PathBuf::from("/bin/sleep").exists() {
            return;
        }
        runner.interpreter.timeout_seconds = Some(1);
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            &dir,
            "s_A8.py",
            "import subprocess\n\
             subprocess.Popen(['/bin/sleep', '30'])\n\
             while True:\n    pass\n",
        );

        let started = std::time::Instant::now();
        let result = Engine::new(runner).run(&path).await;

        assert!(started.elapsed() < Duration::from_secs(15), "{:?}", started.elapsed());
        assert_eq!(result.error.unwrap().kind, FaultKind::Timeout);
    }
}
