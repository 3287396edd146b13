//! Outcome notification.
//!
//! Notification is best effort: [`deliver`] logs failures and never turns
//! them into a run failure.

use crate::error::{Result, StageError};
use crate::integrity::ChecksumRecord;
use crate::stage::StageStats;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Delivery channel for run summaries
pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str, recipient: &str) -> Result<()>;
}

/// Final result of a run, as reported to a human
#[derive(Debug, Clone)]
pub struct Outcome {
    pub success: bool,
    pub destination: PathBuf,
    pub checksum: Option<ChecksumRecord>,
    pub stats: StageStats,
    pub error: Option<String>,
}

impl Outcome {
    pub fn subject(&self) -> String {
        if self.success {
            format!("Image created: {}", self.destination.display())
        } else {
            format!("Image creation failed: {}", self.destination.display())
        }
    }

    pub fn body(&self) -> String {
        let mut body = String::new();
        if self.success {
            body.push_str(&format!(
                "The image {} has been created successfully.\n",
                self.destination.display()
            ));
        } else {
            body.push_str(&format!(
                "Creating the image {} failed.\n",
                self.destination.display()
            ));
        }
        if let Some(error) = &self.error {
            body.push_str(&format!("Error: {}\n", error));
        }
        if let Some(checksum) = &self.checksum {
            body.push_str(&format!(
                "Checksum ({}): {}\n",
                checksum.algorithm, checksum.digest_hex
            ));
        }
        body.push_str(&format!(
            "Files staged: {}\nDirectories: {}\nAlready done: {}\nSkipped: {}\nFailed: {}\nBytes staged: {}\n",
            self.stats.files_staged,
            self.stats.dirs_created,
            self.stats.files_already_done,
            self.stats.files_skipped,
            self.stats.files_failed,
            self.stats.bytes_staged,
        ));
        body
    }
}

/// Writes the summary to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str, recipient: &str) -> Result<()> {
        tracing::info!("Notification for {}: {}\n{}", recipient, subject, body);
        Ok(())
    }
}

/// Pipes an RFC 822 message into `sendmail -t`.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    program: PathBuf,
    sender: Option<String>,
}

impl SendmailNotifier {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("sendmail"),
            sender: None,
        }
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    fn message(&self, subject: &str, body: &str, recipient: &str) -> String {
        let mut msg = String::new();
        if let Some(from) = &self.sender {
            msg.push_str(&format!("From: {}\n", from));
        }
        msg.push_str(&format!("To: {}\n", recipient));
        msg.push_str(&format!("Subject: {}\n", subject));
        msg.push_str(&format!("Date: {}\n", chrono::Utc::now().to_rfc2822()));
        msg.push_str("Content-Type: text/plain; charset=utf-8\n\n");
        msg.push_str(body);
        msg
    }
}

impl Default for SendmailNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for SendmailNotifier {
    fn notify(&self, subject: &str, body: &str, recipient: &str) -> Result<()> {
        let fail = |what: &str, e: &dyn std::fmt::Display| {
            StageError::Notification(format!("{} {}: {}", what, self.program.display(), e))
        };

        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| fail("failed to spawn", &e))?;

        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| StageError::Notification("failed to open stdin".to_string()))?;
            stdin
                .write_all(self.message(subject, body, recipient).as_bytes())
                .map_err(|e| fail("failed to write to", &e))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| fail("failed to wait for", &e))?;
        if !output.status.success() {
            return Err(StageError::Notification(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Deliver `outcome`, logging instead of propagating any failure.
pub fn deliver(notifier: &dyn Notifier, outcome: &Outcome, recipient: &str) -> bool {
    match notifier.notify(&outcome.subject(), &outcome.body(), recipient) {
        Ok(()) => {
            tracing::info!("Notification sent to {}", recipient);
            true
        }
        Err(e) => {
            tracing::warn!("Failed to send notification to {}: {}", recipient, e);
            false
        }
    }
}
