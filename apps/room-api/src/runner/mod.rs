//! One-shot sandboxed execution of untrusted code.
//!
//! Each run gets a disposable container: no network, pid and memory caps,
//! read-only rootfs, the source bind-mounted read-only under `/app`, and a
//! wall-clock deadline enforced from outside. The runner is stateless;
//! parallel invocations are independent. Rate limiting happens upstream in
//! the hub before anything reaches this module.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Cap applied to stdout and stderr independently.
const OUTPUT_LIMIT: usize = 8 * 1024;

struct Recipe {
    image: &'static str,
    /// Shell command with a `{src}` placeholder for the mounted source.
    cmd: &'static str,
    memory: &'static str,
    cpus: &'static str,
    extra_args: &'static [&'static str],
}

fn recipe_for(language: &str) -> Option<&'static Recipe> {
    match language {
        "python" => Some(&Recipe {
            image: "runner-python:latest",
            cmd: "python3 {src}",
            memory: "50m",
            cpus: "0.5",
            extra_args: &[],
        }),
        "javascript" => Some(&Recipe {
            image: "runner-node:latest",
            cmd: "node {src}",
            memory: "50m",
            cpus: "0.5",
            extra_args: &[],
        }),
        "go" => Some(&Recipe {
            image: "runner-go:latest",
            cmd: "go run {src}",
            memory: "50m",
            cpus: "1",
            extra_args: &[
                "--tmpfs",
                "/tmp:rw,exec,nosuid,nodev,size=50m",
                "-v",
                "/var/go-cache:/root/.cache:rw",
                "-v",
                "go-build-cache:/root/.cache/go-build",
            ],
        }),
        "cpp" => Some(&Recipe {
            image: "runner-cpp:latest",
            cmd: "g++ {src} -O2 -std=c++17 -o /tmp/a && /tmp/a",
            memory: "50m",
            cpus: "1",
            extra_args: &["--tmpfs", "/tmp:rw,exec,nosuid,nodev,size=50m"],
        }),
        _ => None,
    }
}

fn filename_for(language: &str) -> &'static str {
    match language {
        "python" => "main.py",
        "javascript" => "main.js",
        "go" => "main.go",
        "cpp" => "main.cpp",
        _ => "code.txt",
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub language: String,
    pub code: String,
}

/// What one run produced. `error` is empty on a clean run; limit
/// violations and setup failures carry `exit_code = -1`.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub error: String,
    pub duration: String,
}

impl RunOutcome {
    fn failed(error: &str) -> Self {
        Self {
            exit_code: -1,
            error: error.to_string(),
            ..Self::default()
        }
    }
}

/// Scratch directory for one job, removed on every exit path.
struct JobDir {
    path: PathBuf,
}

impl Drop for JobDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Reads a stream into a bounded buffer. After the cap is hit the stream
/// keeps draining so the child never blocks on a full pipe; the overflow
/// flag is reported alongside the collected prefix.
async fn collect_limited<R: AsyncRead + Unpin>(mut reader: R) -> (String, bool) {
    let mut collected = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let mut overflowed = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if overflowed {
                    continue;
                }
                let remaining = OUTPUT_LIMIT - collected.len();
                if n > remaining {
                    collected.extend_from_slice(&chunk[..remaining]);
                    overflowed = true;
                } else {
                    collected.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }

    (String::from_utf8_lossy(&collected).into_owned(), overflowed)
}

async fn kill_container(name: &str) {
    let _ = Command::new("docker")
        .args(["kill", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;
}

/// Runs `req.code` inside a one-shot container rooted at
/// `work_dir/<job id>`, enforcing the wall-clock `run_timeout` from the
/// host side. All failures are folded into the returned outcome.
pub async fn run_user_code(work_dir: &Path, run_timeout: Duration, req: &RunRequest) -> RunOutcome {
    let Some(recipe) = recipe_for(&req.language) else {
        return RunOutcome::failed("unsupported language");
    };

    let job_id = coderoom_common::random_token(12);
    let job_dir = JobDir {
        path: work_dir.join(&job_id),
    };
    if tokio::fs::create_dir_all(&job_dir.path).await.is_err() {
        return RunOutcome::failed("failed to create job dir");
    }
    let _ = std::fs::set_permissions(&job_dir.path, std::fs::Permissions::from_mode(0o700));

    let filename = filename_for(&req.language);
    let host_path = job_dir.path.join(filename);
    if tokio::fs::write(&host_path, &req.code).await.is_err() {
        return RunOutcome::failed("failed to write code file");
    }
    let _ = std::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(0o600));

    let container_path = format!("/app/{filename}");
    let container_name = format!("job-{job_id}");
    let shell_cmd = recipe.cmd.replace("{src}", &container_path);

    let mut command = Command::new("docker");
    command
        .arg("run")
        .args(["--rm", "--name", &container_name])
        .arg("--network=none")
        .arg("--pids-limit=64")
        .arg(format!("--memory={}", recipe.memory))
        .arg(format!("--cpus={}", recipe.cpus))
        .arg("--read-only")
        .args(["--security-opt", "no-new-privileges"])
        .args([
            "-v",
            &format!("{}:{}:ro", host_path.display(), container_path),
        ])
        .args(["-w", "/app"])
        .args(recipe.extra_args)
        .arg(recipe.image)
        .args(["sh", "-c", &shell_cmd])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(?err, "failed to spawn sandbox container");
            return RunOutcome::failed("failed to start sandbox");
        }
    };

    // Stdout/stderr must drain concurrently with the wait, or a chatty
    // child deadlocks on a full pipe.
    let stdout_task = child.stdout.take().map(|r| tokio::spawn(collect_limited(r)));
    let stderr_task = child.stderr.take().map(|r| tokio::spawn(collect_limited(r)));

    let status = match tokio::time::timeout(run_timeout, child.wait()).await {
        Err(_) => {
            tracing::info!(container = %container_name, "run hit wall-clock limit");
            kill_container(&container_name).await;
            return RunOutcome {
                error: "Time Limit Error".to_string(),
                exit_code: -1,
                duration: format_duration(started.elapsed()),
                ..RunOutcome::default()
            };
        }
        Ok(Err(err)) => {
            tracing::error!(?err, container = %container_name, "sandbox wait failed");
            kill_container(&container_name).await;
            return RunOutcome::failed("sandbox failure");
        }
        Ok(Ok(status)) => status,
    };

    let (stdout, stdout_hit) = match stdout_task {
        Some(task) => task.await.unwrap_or_default(),
        None => (String::new(), false),
    };
    let (stderr, stderr_hit) = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => (String::new(), false),
    };

    let mut outcome = RunOutcome {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
        error: String::new(),
        duration: format_duration(started.elapsed()),
    };

    if stdout_hit || stderr_hit {
        outcome.error = "Output Limit Error".to_string();
        outcome.exit_code = -1;
        outcome.stdout = String::new();
        return outcome;
    }

    // 137 = SIGKILL, the cgroup OOM kill under --memory.
    if outcome.exit_code == 137 {
        outcome.error = "Memory Limit Error".to_string();
    }

    outcome
}

fn format_duration(elapsed: Duration) -> String {
    format!("{:.2}s", elapsed.as_secs_f64())
}
