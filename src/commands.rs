use anyhow::{bail, Context, Result};
use chrono::Local;
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use std::io::{self, BufRead, IsTerminal, Write};
use std::time::Instant;
use tracing::{debug, info};
use url::Url;

use rsdl::{
    DownloadCoordinator, FailureReason, FollowRedirects, JobEvent, JobHandle, JobRequest, RefuseRedirects,
};

use crate::cli::RedirectMode;

pub struct RunOptions {
    pub redirects: RedirectMode,
    pub json: bool,
    pub force: bool,
}

#[derive(Serialize)]
struct EventLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a JobEvent,
}

enum Outcome {
    Completed,
    AuthRequired(FailureReason),
    Failed(FailureReason),
    Cancelled,
}

pub async fn run_download(mut request: JobRequest, options: RunOptions) -> Result<()> {
    let destination = request.destination_path.clone();
    if destination.exists() {
        if !options.force {
            bail!("{:?} already exists (use --force to overwrite)", destination);
        }
        tokio::fs::remove_file(&destination)
            .await
            .context("Failed to remove existing file")?;
    }

    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create output directory")?;
        }
    }

    // Credentials may be entered once after the server asks for them.
    let mut may_prompt_credentials = io::stdin().is_terminal();
    let started = Instant::now();

    loop {
        let coordinator = DownloadCoordinator::new(request.clone());
        let coordinator = match options.redirects {
            RedirectMode::Follow => coordinator.with_redirect_approver(FollowRedirects),
            RedirectMode::Refuse => coordinator.with_redirect_approver(RefuseRedirects),
            RedirectMode::Ask => coordinator.with_redirect_approver(|_: &Url, to: &Url| {
                tokio::task::block_in_place(|| confirm(&format!("Redirect to {} ?", to)))
            }),
        };
        let job = coordinator.start().context("Failed to start download")?;

        match drive(job, &options, &request).await? {
            Outcome::Completed => {
                let size = tokio::fs::metadata(&destination).await.map(|m| m.len()).unwrap_or(0);
                if !options.json {
                    println!(
                        "Downloaded {} to {:?} in {:.1?}",
                        HumanBytes(size),
                        destination,
                        started.elapsed()
                    );
                }
                return Ok(());
            }
            Outcome::AuthRequired(reason) if may_prompt_credentials => {
                may_prompt_credentials = false;
                eprintln!("{}", reason);
                let (user, password) = tokio::task::spawn_blocking(prompt_credentials)
                    .await
                    .context("Credential prompt failed")??;
                request.username = Some(user);
                request.password = Some(password);
                info!("retrying with new credentials");
            }
            Outcome::AuthRequired(reason) | Outcome::Failed(reason) => {
                bail!("Download failed: {}", reason);
            }
            Outcome::Cancelled => {
                bail!("Download cancelled");
            }
        }
    }
}

/// Consumes job events until the job ends, rendering them as a progress bar or JSON lines.
async fn drive(mut job: JobHandle, options: &RunOptions, request: &JobRequest) -> Result<Outcome> {
    let canceller = job.canceller();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, cancelling");
            if let Err(e) = canceller.cancel().await {
                eprintln!("Cannot cancel: {}", e);
            }
        }
    });

    let name = request
        .destination_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let pb = ProgressBar::new(0);
    if options.json {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    }
    pb.set_style(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
        .context("Invalid progress template")?
        .progress_chars("=>-"));
    pb.set_message(format!("Downloading {}", name));

    let mut outcome = Outcome::Cancelled;
    while let Some(event) = job.next_event().await {
        if options.json {
            let line = EventLine {
                timestamp: Local::now().to_rfc3339(),
                event: &event,
            };
            let mut stdout = io::stdout().lock();
            serde_json::to_writer(&mut stdout, &line)?;
            writeln!(stdout)?;
        }

        match event {
            JobEvent::Progress { bytes_done, total_bytes } => {
                pb.set_length(total_bytes);
                pb.set_position(bytes_done);
            }
            JobEvent::Restarted { url } => {
                pb.set_message(format!("Redirected, downloading {} from {}", name, url));
            }
            JobEvent::Completed { .. } => {
                pb.finish_with_message(format!("Completed   {}", name));
                outcome = Outcome::Completed;
            }
            JobEvent::Failed { reason } => {
                pb.abandon_with_message(format!("Failed      {}", name));
                outcome = match reason {
                    FailureReason::AuthRequired(_) => Outcome::AuthRequired(reason),
                    other => Outcome::Failed(other),
                };
            }
            JobEvent::Cancelled => {
                pb.abandon_with_message(format!("Cancelled   {}", name));
                outcome = Outcome::Cancelled;
            }
        }
    }

    interrupt.abort();
    let state = job.wait().await;
    debug!(?state, "job finished");
    Ok(outcome)
}

fn confirm(question: &str) -> bool {
    eprint!("{} [y/N] ", question);
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn prompt_credentials() -> Result<(String, String)> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    eprint!("User: ");
    io::stderr().flush()?;
    let user = lines.next().context("No user name entered")??;

    eprint!("Password: ");
    io::stderr().flush()?;
    let password = lines.next().context("No password entered")??;

    Ok((user.trim().to_string(), password))
}
