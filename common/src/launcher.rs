use std::{
    collections::HashMap,
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines},
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::error::HarnessError;

/// Time a terminated group gets before it is killed outright
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Sizing flags for a benchmark booted inside an OSv guest
#[derive(Debug, Clone)]
pub struct GuestSizing {
    pub runner: String,
    pub runner_args: Vec<String>,
    pub vcpus: u32,
    pub memsize: String,
}

/// Builds the shell command line for `program`, pinned to `cpus` when given
/// as an inclusive `(first, last)` range.
///
/// With `guest`, `program` is passed to the runner as the guest command line.
pub fn shell_command(cpus: Option<(u32, u32)>, guest: Option<&GuestSizing>, program: &str) -> String {
    let mut parts = Vec::new();
    if let Some((first, last)) = cpus {
        parts.push(format!("taskset -c {first}-{last}"));
    }
    match guest {
        Some(guest) => {
            parts.push(guest.runner.clone());
            parts.extend(guest.runner_args.iter().cloned());
            parts.push(format!("--vcpus {}", guest.vcpus));
            parts.push(format!("--memsize {}", guest.memsize));
            parts.push(format!("-e \"{program}\""));
        }
        None => parts.push(program.to_owned()),
    }
    parts.join(" ")
}

/// Warns when a pinning range reaches past the CPUs of this host
pub fn check_cpu_range(last_cpu: u32) {
    let cpus = num_cpus::get();
    if last_cpu as usize >= cpus {
        warn!("CPU range ends at {last_cpu} but the host only has {cpus} CPUs");
    }
}

/// Outcome of one finished attempt
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// A shell command running as the leader of its own process group
#[derive(Debug)]
pub struct Launched {
    command: String,
    child: Child,
    pgid: Pid,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<JoinHandle<std::io::Result<String>>>,
}

impl Launched {
    pub fn spawn(command: &str, env: Option<&HashMap<String, String>>) -> Result<Self, HarnessError> {
        let launch_err = |source| HarnessError::Launch {
            command: command.to_owned(),
            source,
        };

        debug!("Executing: {command}");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(env.into_iter().flatten())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(launch_err)?;

        let pid = child
            .id()
            .ok_or_else(|| launch_err(std::io::Error::other("process exited before its pid was read")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_err(std::io::Error::other("could not take stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| launch_err(std::io::Error::other("could not take stderr")))?;

        Ok(Self {
            command: command.to_owned(),
            child,
            pgid: Pid::from_raw(pid as i32),
            stdout: Some(BufReader::new(stdout).lines()),
            stderr: Some(tokio::spawn(drain(stderr))),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Next stdout line, `None` at EOF
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        match self.stdout.as_mut() {
            Some(lines) => lines.next_line().await,
            None => Ok(None),
        }
    }

    /// Sends SIGTERM to every process of the group
    pub fn terminate(&self) -> Result<(), Errno> {
        signal_group(self.pgid, Signal::SIGTERM)
    }

    /// Terminates the group and reaps the leader, killing the group when it
    /// outlives the grace period.
    pub async fn stop(&mut self) -> std::io::Result<()> {
        if let Err(err) = self.terminate() {
            warn!("Could not terminate process group {}: {err}", self.pgid);
        }
        if timeout(TERMINATE_GRACE, self.child.wait()).await.is_err() {
            warn!("Process group {} ignored SIGTERM, killing it", self.pgid);
            if let Err(err) = signal_group(self.pgid, Signal::SIGKILL) {
                warn!("Could not kill process group {}: {err}", self.pgid);
            }
            self.child.wait().await?;
        }
        Ok(())
    }

    /// Reads the rest of stdout, then waits for the leader to exit.
    pub async fn wait(mut self) -> std::io::Result<RunResult> {
        let mut stdout = String::new();
        while let Some(line) = self.next_line().await? {
            stdout.push_str(&line);
            stdout.push('\n');
        }
        let status = self.child.wait().await?;
        Ok(RunResult {
            exit_code: status.code(),
            stdout,
            stderr: self.stderr().await?,
            timed_out: false,
        })
    }

    /// Collects stdout and stderr and waits for the leader, all within `limit`.
    ///
    /// Descendants that keep a pipe open count against the limit too. On
    /// timeout the group is stopped and the partial stdout is returned with
    /// [`RunResult::timed_out`] set.
    pub async fn wait_with_timeout(mut self, limit: Duration) -> std::io::Result<RunResult> {
        let buffer = Arc::new(Mutex::new(String::new()));
        let mut stdout_task = self.stdout.take().map(|lines| tokio::spawn(collect(lines, buffer.clone())));
        let mut stderr_task = self.stderr.take();

        let finished = timeout(limit, async {
            let status = self.child.wait().await?;
            if let Some(task) = stdout_task.as_mut() {
                task.await.map_err(std::io::Error::other)??;
            }
            let stderr = match stderr_task.as_mut() {
                Some(task) => task.await.map_err(std::io::Error::other)??,
                None => String::new(),
            };
            Ok::<_, std::io::Error>((status, stderr))
        })
        .await;

        let (exit_code, stderr, timed_out) = match finished {
            Ok(res) => {
                let (status, stderr) = res?;
                (status.code(), stderr, false)
            }
            Err(_) => {
                debug!("Timed out after {limit:?}: {}", self.command);
                self.stop().await?;
                if let Some(mut task) = stdout_task.filter(|task| !task.is_finished()) {
                    // lines already in the pipe, unless something outside the group holds it
                    if timeout(TERMINATE_GRACE, &mut task).await.is_err() {
                        task.abort();
                    }
                }
                (None, String::new(), true)
            }
        };

        let stdout = std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(RunResult {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }

    async fn stderr(&mut self) -> std::io::Result<String> {
        match self.stderr.take() {
            Some(task) => task.await.map_err(std::io::Error::other)?,
            None => Ok(String::new()),
        }
    }
}

fn signal_group(pgid: Pid, signal: Signal) -> Result<(), Errno> {
    match killpg(pgid, signal) {
        // group already gone
        Err(Errno::ESRCH) => Ok(()),
        res => res,
    }
}

async fn collect(mut lines: Lines<BufReader<ChildStdout>>, buffer: Arc<Mutex<String>>) -> std::io::Result<()> {
    while let Some(line) = lines.next_line().await? {
        let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push_str(&line);
        buffer.push('\n');
    }
    Ok(())
}

async fn drain(mut stderr: ChildStderr) -> std::io::Result<String> {
    let mut buffer = Vec::new();
    stderr.read_to_end(&mut buffer).await?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
