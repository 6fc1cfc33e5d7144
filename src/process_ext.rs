use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Captured result of a deadline-bounded subprocess run.
pub(crate) struct CapturedRun {
    pub(crate) status: ExitStatus,
    pub(crate) timed_out: bool,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

/// Run a command to completion under a deadline, capturing bounded stdout
/// and stderr. The child is killed when the deadline elapses.
pub(crate) fn run_with_deadline(
    mut cmd: Command,
    deadline: Duration,
    capture_limit: usize,
) -> Result<CapturedRun, std::io::Error> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = std::thread::spawn(move || read_capped(stdout, capture_limit));
    let stderr_handle = std::thread::spawn(move || read_capped(stderr, capture_limit));

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= deadline {
            timed_out = true;
            drop(child.kill());
            break child.wait()?;
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(CapturedRun {
        status,
        timed_out,
        stdout,
        stderr,
    })
}

fn read_capped<R: Read>(source: Option<R>, limit: usize) -> Vec<u8> {
    let Some(mut source) = source else {
        return Vec::new();
    };

    let mut captured: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if captured.len() < limit {
            let remaining = limit - captured.len();
            let to_copy = remaining.min(n);
            captured.extend_from_slice(&buf[..to_copy]);
        }
    }
    captured
}
