//! Delivery of pass reports to an operator.
//!
//! Reports are handed to a [`NotificationQueue`], whose worker thread owns the
//! configured [`Notifier`]. Delivery happens off the watcher thread and is
//! best-effort: a failed send is retried, then logged, and never touches the
//! store.

use crate::config::{NotifyConfig, TransportConfig};
use crate::error::{Result, SyncError};
use crate::report::Report;
use chrono::{Local, NaiveDate};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// An outbound operator message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Message {
    /// Build the message for a completed pass. `{date}` in the subject template
    /// becomes `date` formatted as `YYYY-MM-DD`.
    pub fn for_report(config: &NotifyConfig, report: &Report, date: NaiveDate) -> Self {
        Message {
            from: config.from.clone(),
            to: config.to.clone(),
            subject: config
                .subject
                .replace("{date}", &date.format("%Y-%m-%d").to_string()),
            body: report.build(),
        }
    }

    /// Render as an RFC 5322 message with CRLF line endings.
    pub fn to_rfc5322(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("From: {}\r\n", header_value(&self.from)));
        out.push_str(&format!("To: {}\r\n", header_value(&self.to)));
        out.push_str(&format!("Subject: {}\r\n", header_value(&self.subject)));
        out.push_str(&format!("Date: {}\r\n", Local::now().to_rfc2822()));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        out.push_str("\r\n");
        for line in self.body.lines() {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }
}

/// Header values come from configuration; strip line breaks so they cannot
/// start a new header.
fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// A channel that can deliver a message to an operator.
pub trait Notifier: Send {
    fn send(&mut self, message: &Message) -> Result<()>;
}

/// Build the notifier selected by `notify.transport`.
pub fn build_notifier(config: &NotifyConfig) -> Result<Box<dyn Notifier>> {
    let notifier: Box<dyn Notifier> = match &config.transport {
        TransportConfig::Sendmail { program, args } => Box::new(SendmailNotifier {
            program: program.clone(),
            args: args.clone(),
            timeout: config.timeout(),
        }),
        TransportConfig::Pickup { dir } => Box::new(PickupNotifier::new(dir.clone())?),
        TransportConfig::Log => Box::new(LogNotifier),
    };
    Ok(notifier)
}

// ── Transports ───────────────────────────────────────────────────

/// Pipes the message into a mail submission program such as `sendmail -t -i`.
pub struct SendmailNotifier {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Notifier for SendmailNotifier {
    fn send(&mut self, message: &Message) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SyncError::Notify(format!("Cannot start {}: {e}", self.program)))?;

        // The child may never read its input, so write from a helper thread and
        // let the deadline cover the write as well.
        let deadline = Instant::now() + self.timeout;
        let writer = child.stdin.take().map(|mut stdin| {
            let raw = message.to_rfc5322();
            std::thread::spawn(move || stdin.write_all(raw.as_bytes()))
        });

        loop {
            if let Some(status) = child.try_wait()? {
                let written = match writer {
                    Some(handle) => handle
                        .join()
                        .unwrap_or_else(|_| Err(std::io::Error::other("writer thread panicked"))),
                    None => Ok(()),
                };
                if !status.success() {
                    return Err(SyncError::Notify(format!(
                        "{} exited with {status}",
                        self.program
                    )));
                }
                return written.map_err(|e| {
                    SyncError::Notify(format!("Writing to {} failed: {e}", self.program))
                });
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                // The pipe is closed now, so the writer ends with an error.
                if let Some(handle) = writer {
                    let _ = handle.join();
                }
                return Err(SyncError::Timeout(format!(
                    "{} did not finish within {:?}",
                    self.program, self.timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// Writes each message as an `.eml` file into a relay pickup directory.
pub struct PickupNotifier {
    dir: PathBuf,
}

static PICKUP_SEQ: AtomicU64 = AtomicU64::new(0);

impl PickupNotifier {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(PickupNotifier { dir })
    }
}

impl Notifier for PickupNotifier {
    fn send(&mut self, message: &Message) -> Result<()> {
        let seq = PICKUP_SEQ.fetch_add(1, Ordering::Relaxed);
        let stem = format!(
            "{}-{}-{seq}",
            Local::now().format("%Y%m%d%H%M%S%f"),
            std::process::id()
        );
        // Relays only pick up `.eml`, so write under a temp name and rename.
        let tmp = self.dir.join(format!("{stem}.tmp"));
        let dest = self.dir.join(format!("{stem}.eml"));
        std::fs::write(&tmp, message.to_rfc5322())?;
        std::fs::rename(&tmp, &dest)?;
        log::debug!("Report dropped into pickup directory: {}", dest.display());
        Ok(())
    }
}

/// Logs the message instead of sending it.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&mut self, message: &Message) -> Result<()> {
        log::info!(
            "Notification to {} ({}):\n{}",
            message.to,
            message.subject,
            message.body
        );
        Ok(())
    }
}

// ── Delivery queue ───────────────────────────────────────────────

/// How often and how patiently a message is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NotifyConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            delay: config.retry_delay(),
        }
    }
}

/// Send one message, retrying per `policy`. Returns the last error if every
/// attempt failed.
pub fn deliver(notifier: &mut dyn Notifier, message: &Message, policy: RetryPolicy) -> Result<()> {
    let mut attempt = 1;
    loop {
        match notifier.send(message) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.max_attempts => {
                log::warn!(
                    "Delivery attempt {attempt}/{} of {:?} failed: {e}",
                    policy.max_attempts,
                    message.subject
                );
                attempt += 1;
                std::thread::sleep(policy.delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// A bounded queue of messages drained by one worker thread.
pub struct NotificationQueue {
    tx: Option<SyncSender<Message>>,
    worker: Option<JoinHandle<()>>,
}

impl NotificationQueue {
    /// Spawn the worker that owns `notifier`.
    pub fn start(mut notifier: Box<dyn Notifier>, capacity: usize, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::sync_channel::<Message>(capacity.max(1));
        let worker = std::thread::spawn(move || {
            for message in rx {
                match deliver(notifier.as_mut(), &message, policy) {
                    Ok(()) => log::info!("Report delivered to {}", message.to),
                    Err(e) => log::warn!(
                        "Report {:?} not delivered after {} attempts: {e}",
                        message.subject,
                        policy.max_attempts
                    ),
                }
            }
        });

        NotificationQueue {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Queue a message without blocking. Returns false if it was dropped.
    pub fn enqueue(&self, message: Message) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                log::warn!(
                    "Notification queue full; dropping report {:?}",
                    message.subject
                );
                false
            }
            Err(TrySendError::Disconnected(message)) => {
                log::warn!(
                    "Notification worker has stopped; dropping report {:?}",
                    message.subject
                );
                false
            }
        }
    }

    /// Close the queue and wait until every queued message has been handled.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Notification worker panicked");
            }
        }
    }
}

impl Drop for NotificationQueue {
    fn drop(&mut self) {
        self.close();
    }
}
