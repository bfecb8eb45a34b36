use anyhow::{anyhow, Result};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

static CAPTURE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was killed by a signal or by the timeout.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }

    /// Stderr when it has content, otherwise stdout.
    pub fn diagnostic_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

struct CaptureFiles {
    stdout: PathBuf,
    stderr: PathBuf,
}

impl CaptureFiles {
    fn new() -> Self {
        let tag = format!(
            "{}_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            CAPTURE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let dir = std::env::temp_dir();
        Self {
            stdout: dir.join(format!("routelab_proc_{}.out", tag)),
            stderr: dir.join(format!("routelab_proc_{}.err", tag)),
        }
    }

    fn read(&self) -> (String, String) {
        let read = |p: &PathBuf| {
            fs::read(p)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default()
        };
        (read(&self.stdout), read(&self.stderr))
    }
}

impl Drop for CaptureFiles {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.stdout);
        let _ = fs::remove_file(&self.stderr);
    }
}

/// Runs `cmd` to completion or until `timeout` elapses. Output goes to temp
/// files rather than pipes so a grandchild holding the descriptors open cannot
/// stall collection. On timeout the whole process group is killed and the
/// child is reaped before returning.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<ProcessOutput> {
    let capture = CaptureFiles::new();
    let stdout = fs::File::create(&capture.stdout)?;
    let stderr = fs::File::create(&capture.stderr)?;
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(stdout));
    cmd.stderr(Stdio::from(stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow!("failed to spawn {:?}: {}", cmd.get_program(), e))?;
    let deadline = started + timeout;
    let (status, timed_out) = loop {
        if let Some(status) = child.try_wait()? {
            break (status.code(), false);
        }
        if Instant::now() >= deadline {
            kill_tree(&mut child);
            let _ = child.wait();
            break (None, true);
        }
        thread::sleep(POLL_INTERVAL);
    };
    let (stdout, stderr) = capture.read();
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        timed_out,
        elapsed: started.elapsed(),
    })
}

fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return,
            Ok(_) | Err(_) => warn!(pid = child.id(), "process group kill failed, killing child only"),
        }
    }
    let _ = child.kill();
}
