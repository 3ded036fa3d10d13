//! Two-stage spawn/link of a child process.
//!
//! The daemon never forks a container's child process directly;
//! instead it shells out to two helper binaries per container: `iomux-spawn`
//! starts the child with its descriptors wired into the container's
//! work directory, and `iomux-link` attaches to that work directory to
//! stream output and report an exit status. `spawn` launches the
//! spawner and, once it signals the child is alive, eagerly launches
//! the linker in the background so the child's stdio has a reader from
//! the start. `link` may be called any number of times; only the
//! first call actually runs the linker, the rest await the same
//! result.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::error::JobError;

use super::sink::FanoutSink;

pub struct Job {
    pub spawner_bin: PathBuf,
    pub linker_bin: PathBuf,
    pub workdir: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,

    pub stdout: FanoutSink,
    pub stderr: FanoutSink,

    exit_status: OnceCell<i32>,
}

impl Job {
    pub fn new(
        spawner_bin: PathBuf,
        linker_bin: PathBuf,
        workdir: PathBuf,
        args: Vec<String>,
        env: Vec<(String, String)>,
        stdin: Option<Vec<u8>>,
    ) -> Self {
        Self {
            spawner_bin,
            linker_bin,
            workdir,
            args,
            env,
            stdin,
            stdout: FanoutSink::new(),
            stderr: FanoutSink::new(),
            exit_status: OnceCell::new(),
        }
    }

    /// Spawn protocol: launch the spawner, wait for its "child_pid"
    /// line, launch the linker eagerly in parallel, then wait for its
    /// "child active" line. Either EOF before a signal line is a spawn
    /// failure; the spawner is killed and reaped in the background.
    pub async fn spawn(self: &std::sync::Arc<Self>) -> Result<(), JobError> {
        let mut cmd = Command::new(&self.spawner_bin);
        cmd.arg(&self.workdir);
        cmd.args(&self.args);
        cmd.envs(self.env.iter().cloned());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(false);

        let mut child = cmd.spawn().map_err(JobError::Io)?;

        if let Some(data) = self.stdin.clone() {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = stdin.write_all(&data).await;
                });
            }
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut reader = BufReader::new(stdout);

        if !read_signal_line(&mut reader).await? {
            reap_in_background(child);
            return Err(JobError::SpawnerEarlyExit);
        }

        // Launch the linker eagerly so the child gets its kickstart.
        let job = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            job.link().await;
        });

        if !read_signal_line(&mut reader).await? {
            reap_in_background(child);
            return Err(JobError::SpawnerNotActive);
        }

        // The spawner's own exit status doesn't matter; it did its job.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(())
    }

    /// Link protocol, memoised: the first caller runs the linker and
    /// every caller (including the first) receives the published exit
    /// status once it's available.
    pub async fn link(&self) -> i32 {
        *self.exit_status.get_or_init(|| self.run_linker()).await
    }

    async fn run_linker(&self) -> i32 {
        let mut cmd = Command::new(&self.linker_bin);
        cmd.arg(&self.workdir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let status = match cmd.spawn() {
            Ok(mut child) => {
                let mut stdout = child.stdout.take().expect("stdout was piped");
                let mut stderr = child.stderr.take().expect("stderr was piped");

                let (_, _, wait) = tokio::join!(
                    copy_into_sink(&mut stdout, &self.stdout),
                    copy_into_sink(&mut stderr, &self.stderr),
                    child.wait(),
                );

                match wait {
                    Ok(status) if status.success() => 0,
                    Ok(_) => 1,
                    Err(_) => 255,
                }
            }
            Err(_) => 255,
        };

        self.stdout.close();
        self.stderr.close();
        status
    }
}

/// Read one line off the spawner's stdout; `Ok(true)` means a line
/// arrived, `Ok(false)` means EOF before any line (spawn failure).
async fn read_signal_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<bool, JobError> {
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.map_err(JobError::Io)?;
    Ok(n > 0)
}

fn reap_in_background(mut child: tokio::process::Child) {
    let _ = child.start_kill();
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}

async fn copy_into_sink<R: AsyncRead + Unpin>(reader: &mut R, sink: &FanoutSink) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => sink.write(&buf[..n]),
        }
    }
}
