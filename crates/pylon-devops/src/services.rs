//! Services an agent exposes to the control server.

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use pylon_core::{Payload, Response, ServiceContext};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

pub const EXECUTE: &str = "execute";
pub const DOWNLOAD: &str = "download";

const TEMP_SUFFIX: &str = ".part";

fn required<'a>(payload: &'a Payload, key: &str) -> Result<&'a str> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("missing parameter [{}]", key))
}

/// `execute {cmd}`: run a shell command and return its output.
pub async fn execute(ctx: ServiceContext, payload: Payload) -> Result<Response> {
    let cmd = required(&payload, "cmd")?;
    info!(request_id = %ctx.request_id(), "Executing [{}]", cmd);
    let output = run_shell(cmd).await?;
    Ok(Response::ok_with(output))
}

/// Run `cmd` through the platform shell.
///
/// Returns stdout lines followed by stderr lines, joined by `\n`. A non-zero
/// exit status is not an error; the output is what the caller wants.
pub async fn run_shell(cmd: &str) -> Result<String> {
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C");
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c");
        c
    };

    let output = command
        .arg(cmd)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run [{}]", cmd))?;

    debug!(status = ?output.status, "Command finished");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    Ok(lines.join("\n"))
}

/// `download {url, dir, fileName}`: fetch a file over HTTP into `dir`.
pub async fn download(ctx: ServiceContext, payload: Payload) -> Result<Response> {
    let url = required(&payload, "url")?;
    let dir = required(&payload, "dir")?;
    let file_name = required(&payload, "fileName")?;

    info!(request_id = %ctx.request_id(), "Downloading {} into {}", url, dir);
    let destination = Path::new(dir).join(file_name);
    let bytes = download_to(url, &destination).await?;
    Ok(Response::ok_with(format!(
        "downloaded {} bytes to {}",
        bytes,
        destination.display()
    )))
}

/// Stream `url` into `destination` through a temporary file.
pub async fn download_to(url: &str, destination: &Path) -> Result<u64> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let temp_path = PathBuf::from(format!("{}{}", destination.display(), TEMP_SUFFIX));

    match fetch(url, &temp_path).await {
        Ok(bytes) => {
            if let Err(e) = tokio::fs::rename(&temp_path, destination).await {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e).with_context(|| {
                    format!("failed to move download to {}", destination.display())
                });
            }
            info!("Downloaded {} bytes to {}", bytes, destination.display());
            Ok(bytes)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            Err(e)
        }
    }
}

async fn fetch(url: &str, temp_path: &Path) -> Result<u64> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("request to {} failed", url))?;

    let status = response.status();
    if !status.is_success() {
        bail!("download of {} failed with status {}", url, status);
    }

    let mut file = tokio::fs::File::create(temp_path)
        .await
        .with_context(|| format!("failed to create {}", temp_path.display()))?;

    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("error reading download stream")?;
        file.write_all(&chunk)
            .await
            .context("failed to write to temp file")?;
        written += chunk.len() as u64;
    }

    file.flush().await.context("failed to flush temp file")?;
    Ok(written)
}
