//! Running the external filesystem formatting tool.
//!
//! The tool is run with a hard deadline: if it fails or hangs, the caller gets an error back
//! instead of a stuck thread.  Keeping a failed guest around for debugging is up to whoever calls
//! this.

use std::{
    ffi::{OsStr, OsString},
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use log::{debug, info};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};

use crate::error::{BuildError, Result};

pub const DEFAULT_MKFS_PROGRAM: &str = "mkfs.ext4";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

// Only the tail of stderr goes into errors; mke2fs can be chatty.
const MAX_STDERR_BYTES: usize = 1024;

/// How to invoke the formatting tool.
#[derive(Clone, Debug)]
pub struct Mkfs {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl Default for Mkfs {
    fn default() -> Self {
        Mkfs {
            program: PathBuf::from(DEFAULT_MKFS_PROGRAM),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&stderr[start..]).into_owned()
}

impl Mkfs {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Mkfs {
            program: program.into(),
            ..Mkfs::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the tool with the given arguments, blocking the calling thread until it exits or the
    /// timeout elapses.  On timeout the child is killed and reaped.
    ///
    /// The child is driven by a single-threaded tokio runtime of its own.  When called from
    /// within a runtime, that runtime is run on a separate thread, since `block_on` can't nest.
    pub fn run<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let run = move || -> Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(self.run_async(args))
        };

        if tokio::runtime::Handle::try_current().is_err() {
            return run();
        }
        debug!("inside a tokio runtime, running {:?} from a helper thread", self.program);
        std::thread::scope(|scope| scope.spawn(run).join()).unwrap_or_else(|_| {
            Err(BuildError::Io(std::io::Error::other(format!(
                "thread running {:?} panicked",
                self.program
            ))))
        })
    }

    async fn run_async(&self, args: Vec<OsString>) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("running {:?} {:?}", self.program, args);
        let mut child = cmd.spawn().map_err(|source| BuildError::FormatSpawn {
            program: self.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let waited = tokio::time::timeout(self.timeout, async {
            let (status, stdout, stderr) =
                tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr));
            Ok::<_, std::io::Error>((status?, stdout?, stderr?))
        })
        .await;

        let (status, stdout, stderr) = match waited {
            Ok(output) => output?,
            Err(_) => {
                child.start_kill()?;
                child.wait().await?;
                return Err(BuildError::FormatTimeout {
                    program: self.program.clone(),
                    timeout: self.timeout,
                });
            }
        };

        debug!("{:?} stdout: {}", self.program, String::from_utf8_lossy(&stdout));
        if !status.success() {
            return Err(BuildError::FormatFailed {
                program: self.program.clone(),
                status,
                stderr: stderr_tail(&stderr),
            });
        }
        Ok(())
    }
}

async fn read_pipe(pipe: Option<impl AsyncRead + Unpin>) -> std::io::Result<Vec<u8>> {
    let mut buffer = vec![];
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}
