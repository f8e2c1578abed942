//! Running nftables scripts through the `nft` binary.

use std::{future::Future, io, process::Stdio};

use tokio::{io::AsyncWriteExt as _, process::Command};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("nft exited with {}: {}", .0.status, .0.stderr.trim())]
    NonZero(Output),
}

#[derive(Debug, Clone)]
pub struct Output {
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for Output {
    fn from(value: std::process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Applies nftables scripts. Each script is applied as a single transaction: either all of it
/// takes effect or none of it does.
pub trait ScriptRunner: Send {
    fn apply(&mut self, script: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Runs `nft -f -`, feeding the script on stdin.
#[derive(Debug, Clone)]
pub struct Nft {
    program: String,
}

impl Default for Nft {
    fn default() -> Self {
        Self { program: "nft".to_owned() }
    }
}

impl Nft {
    /// Uses `program` instead of the `nft` found in `PATH`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl ScriptRunner for Nft {
    async fn apply(&mut self, script: &str) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::trace!(?cmd, script, "running nft");

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            // Dropping stdin closes it, so nft sees the end of the script.
        }

        let output: Output = child.wait_with_output().await?.into();
        if !output.status.success() {
            tracing::debug!(?output.stderr, ?output.status, "nft returned non-zero status");
            return Err(Error::NonZero(output));
        }

        Ok(())
    }
}
