//! `wisp simulate`: one sender and N receivers on an in-process network.

use crate::progress::{TransferProgress, format_bytes, format_duration, format_speed};
use anyhow::Context;
use bytes::Bytes;
use clap::{Args, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use wisp_core::{Completion, Node, NodeConfig, OutgoingFile, TransferEvent};
use wisp_files::{CHUNK_SIZE, ChunkBackend, FileChunker, MemoryBackend, SqliteBackend};
use wisp_transport::SimNetwork;

/// Sender progress (percent) at which late receivers accept
const LATE_JOIN_PERCENT: f64 = 25.0;

/// Chunk storage used by the simulated receivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Keep chunks in memory
    Memory,
    /// One SQLite database per receiver in the output directory
    Sqlite,
}

/// Arguments of `wisp simulate`
#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// File to send
    pub file: PathBuf,

    /// Number of receivers
    #[arg(short, long, default_value_t = 2)]
    pub receivers: usize,

    /// How many of the receivers accept only once the transfer is under way
    #[arg(long, default_value_t = 0)]
    pub late_join: usize,

    /// Datagram loss probability (0.0 - 1.0)
    #[arg(long, default_value_t = 0.0)]
    pub loss: f64,

    /// One-way latency in milliseconds
    #[arg(long, default_value_t = 10)]
    pub latency: u64,

    /// Receiver chunk storage
    #[arg(long, value_enum, default_value_t = StoreKind::Memory)]
    pub store: StoreKind,

    /// Directory for received files
    #[arg(short, long, default_value = "wisp-out")]
    pub out: PathBuf,

    /// Give up on receivers that have not finished after this many seconds
    #[arg(long, default_value_t = 300)]
    pub deadline: u64,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// What happened at one receiver
#[derive(Debug, Serialize)]
pub struct ReceiverReport {
    /// Receiver peer ID
    pub peer: String,
    /// Accepted mid-transfer
    pub late: bool,
    /// `completed`, `failed`, `refused`, `no-offer` or `timed-out`
    pub outcome: String,
    /// Written file matches the source byte for byte
    pub verified: bool,
    /// Chunks missing from a best-effort completion
    pub missing_chunks: Vec<u64>,
    /// Integrity warnings raised for the file
    pub warnings: Vec<String>,
    /// Where the file was written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a simulation run
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Source file name
    pub file: String,
    /// Size in bytes
    pub size: u64,
    /// Chunks in the file
    pub chunks: u64,
    /// Datagram loss probability
    pub loss: f64,
    /// One-way latency in milliseconds
    pub latency_ms: u64,
    /// Receiver storage
    pub store: StoreKind,
    /// Sender finished without error
    pub sender_completed: bool,
    /// Sender failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_error: Option<String>,
    /// Wall time until every receiver finished
    pub elapsed_ms: u64,
    /// Per-receiver results
    pub receivers: Vec<ReceiverReport>,
}

impl SimulationReport {
    /// Every receiver got a verified copy
    pub fn all_verified(&self) -> bool {
        self.receivers.iter().all(|r| r.verified)
    }

    /// Human-readable summary
    pub fn print(&self) {
        let elapsed = Duration::from_millis(self.elapsed_ms);
        println!();
        println!("File: {} ({}, {} chunks)", self.file, format_bytes(self.size), self.chunks);
        println!(
            "Network: loss {:.1}%, latency {} ms, store {:?}",
            self.loss * 100.0,
            self.latency_ms,
            self.store
        );
        match &self.sender_error {
            None => println!("Sender: completed"),
            Some(error) => println!("Sender: failed ({error})"),
        }
        println!();
        println!("Receivers:");
        for r in &self.receivers {
            let mark = if r.verified { "ok" } else { "FAIL" };
            let late = if r.late { " (late)" } else { "" };
            print!("  [{mark}] {}{late}: {}", r.peer, r.outcome);
            if !r.missing_chunks.is_empty() {
                print!(", missing chunks {:?}", r.missing_chunks);
            }
            if let Some(error) = &r.error {
                print!(", {error}");
            }
            println!();
        }
        println!();
        let throughput = if self.elapsed_ms == 0 {
            0.0
        } else {
            self.size as f64 / elapsed.as_secs_f64()
        };
        println!(
            "Elapsed: {} ({} per receiver)",
            format_duration(elapsed),
            format_speed(throughput)
        );
    }
}

/// Run a simulation
///
/// # Errors
///
/// Returns an error if the source cannot be read, the output directory or a
/// store cannot be created, or a node cannot be built.
pub async fn run(args: &SimulateArgs, config: NodeConfig) -> anyhow::Result<SimulationReport> {
    if args.receivers == 0 {
        anyhow::bail!("at least one receiver is required");
    }
    if args.late_join > args.receivers {
        anyhow::bail!(
            "--late-join ({}) exceeds --receivers ({})",
            args.late_join,
            args.receivers
        );
    }
    if !(0.0..=1.0).contains(&args.loss) {
        anyhow::bail!("--loss must be between 0 and 1");
    }

    let source = Bytes::from(
        tokio::fs::read(&args.file)
            .await
            .with_context(|| format!("reading {}", args.file.display()))?,
    );
    let outgoing = OutgoingFile::from_path(&args.file).await?;
    let name = outgoing.name.clone();
    let size = outgoing.size();
    tokio::fs::create_dir_all(&args.out)
        .await
        .with_context(|| format!("creating {}", args.out.display()))?;

    tracing::info!(
        file = %args.file.display(),
        size,
        receivers = args.receivers,
        late = args.late_join,
        loss = args.loss,
        latency_ms = args.latency,
        "starting simulation"
    );

    let net = SimNetwork::new();
    net.set_latency(Duration::from_millis(args.latency));
    net.set_loss_rate(args.loss);

    let (endpoint, inbox) = net.join("sender");
    let (sender, sender_events) = Node::new(
        config.clone(),
        Arc::new(endpoint),
        inbox,
        Arc::new(MemoryBackend::new()),
    )?;

    let (go_tx, go_rx) = watch::channel(false);
    let deadline = Duration::from_secs(args.deadline);
    let mut receivers = Vec::with_capacity(args.receivers);
    for i in 1..=args.receivers {
        let peer = format!("receiver-{i}");
        let late = i > args.receivers - args.late_join;
        let backend = open_backend(args.store, &args.out, &peer)?;
        let (endpoint, inbox) = net.join(peer.as_str());
        let (node, events) = Node::new(config.clone(), Arc::new(endpoint), inbox, backend)?;
        node.start()?;
        let job = ReceiverJob {
            node: node.clone(),
            peer,
            late,
            go: go_rx.clone(),
            source: source.clone(),
            out: args.out.clone(),
        };
        receivers.push((node, tokio::spawn(job.run(events, deadline))));
    }
    sender.start()?;

    let started = Instant::now();
    let progress = TransferProgress::new(size, &name, args.json);
    sender.offer_files(vec![outgoing]).await?;
    let sender_task = tokio::spawn(watch_sender(sender_events, progress, go_tx, deadline));

    let mut reports = Vec::with_capacity(receivers.len());
    for (node, task) in receivers {
        reports.push(task.await?);
        if let Err(e) = node.shutdown() {
            tracing::debug!(error = %e, "receiver already stopped");
        }
    }
    let elapsed = started.elapsed();
    let sender_error = sender_task.await?;
    if let Err(e) = sender.shutdown() {
        tracing::debug!(error = %e, "sender already stopped");
    }

    Ok(SimulationReport {
        file: name,
        size,
        chunks: FileChunker::with_chunk_size(CHUNK_SIZE).chunk_count(size),
        loss: args.loss,
        latency_ms: args.latency,
        store: args.store,
        sender_completed: sender_error.is_none(),
        sender_error,
        elapsed_ms: elapsed.as_millis() as u64,
        receivers: reports,
    })
}

fn open_backend(kind: StoreKind, out: &Path, peer: &str) -> anyhow::Result<Arc<dyn ChunkBackend>> {
    Ok(match kind {
        StoreKind::Memory => Arc::new(MemoryBackend::new()),
        StoreKind::Sqlite => {
            let path = out.join(format!("{peer}.sqlite3"));
            Arc::new(
                SqliteBackend::open(&path)
                    .with_context(|| format!("opening {}", path.display()))?,
            )
        }
    })
}

/// Follow the sender until its transfer ends; returns the failure, if any
async fn watch_sender(
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
    progress: TransferProgress,
    go: watch::Sender<bool>,
    deadline: Duration,
) -> Option<String> {
    let outcome = tokio::time::timeout(deadline, async {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Accepted { peer, .. } => {
                    progress.set_message(format!("Sending, accepted by {peer}"));
                }
                TransferEvent::Progress {
                    percent, throughput, ..
                } => {
                    progress.update_percent(percent);
                    if percent >= LATE_JOIN_PERCENT {
                        go.send_replace(true);
                    }
                    tracing::debug!(percent, speed = %format_speed(throughput), "sender progress");
                }
                TransferEvent::Completed {
                    completion: Completion::Sent,
                    ..
                } => {
                    go.send_replace(true);
                    progress.finish_with_message("Sent".to_string());
                    return None;
                }
                TransferEvent::Failed { error, .. } => {
                    go.send_replace(true);
                    progress.abandon(format!("Send failed: {error}"));
                    return Some(error.to_string());
                }
                _ => {}
            }
        }
        Some("sender stopped".to_string())
    })
    .await;

    outcome.unwrap_or_else(|_| {
        go.send_replace(true);
        progress.abandon("Send timed out".to_string());
        Some("timed out".to_string())
    })
}

struct ReceiverJob {
    node: Node,
    peer: String,
    late: bool,
    go: watch::Receiver<bool>,
    source: Bytes,
    out: PathBuf,
}

impl ReceiverJob {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransferEvent>,
        deadline: Duration,
    ) -> ReceiverReport {
        let mut report = ReceiverReport {
            peer: self.peer.clone(),
            late: self.late,
            outcome: "no-offer".to_string(),
            verified: false,
            missing_chunks: Vec::new(),
            warnings: Vec::new(),
            output: None,
            error: None,
        };

        let finished = tokio::time::timeout(deadline, self.follow(&mut events, &mut report)).await;
        if finished.is_err() {
            report.outcome = "timed-out".to_string();
        }
        if let Err(e) = finished.unwrap_or(Ok(())) {
            report.error = Some(e.to_string());
        }
        report
    }

    async fn follow(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<TransferEvent>,
        report: &mut ReceiverReport,
    ) -> anyhow::Result<()> {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Offered { offer, .. } => {
                    report.outcome = "offered".to_string();
                    if self.late {
                        // Fails only once the sender watcher is gone
                        let _ = self.go.wait_for(|go| *go).await;
                    }
                    self.node.accept(&offer.file_id).await?;
                    tracing::info!(peer = %self.peer, file_id = %offer.file_id, late = self.late, "accepted");
                }
                TransferEvent::IntegrityWarning { error, .. } => {
                    report.warnings.push(error.to_string());
                }
                TransferEvent::Completed {
                    completion: Completion::Received(file),
                    ..
                } => {
                    report.outcome = "completed".to_string();
                    report.missing_chunks = file.missing_chunks.clone();
                    report.verified = file.data == self.source;
                    let path = self.out.join(format!("{}-{}", self.peer, file.name));
                    tokio::fs::write(&path, &file.data)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    report.output = Some(path);
                    return Ok(());
                }
                TransferEvent::Rejected { reason, .. } => {
                    report.outcome = "refused".to_string();
                    report.error = reason;
                    return Ok(());
                }
                TransferEvent::Failed { error, .. } => {
                    report.outcome = "failed".to_string();
                    report.error = Some(error.to_string());
                    return Ok(());
                }
                _ => {}
            }
        }
        Ok(())
    }
}
