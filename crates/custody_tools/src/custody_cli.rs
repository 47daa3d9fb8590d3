#![forbid(unsafe_code)]

use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::Path;

use custody_contracts::envelope::EnvelopeState;
use custody_contracts::evidence::{ContextField, EvidenceKind, Fingerprint};
use custody_contracts::ledger::LedgerRecord;
use custody_contracts::track::Locale;
use custody_contracts::Validate;
use custody_engines::fingerprint::{canonical_text_encoding, FingerprintService};
use custody_engines::receipt::render_receipt;
use custody_os::ledger_client::EvidenceLedgerClient;
use custody_os::offline_queue::{FlushSchedule, OfflineQueue};

pub const USAGE: &str = "usage: custody <fingerprint-file <path> | fingerprint-text <kind> <statement> [--contact=<value>] [label=value ...] | verify-file <path> <fingerprint> | receipt <record.json> [en|uk] | queue <ls|flush|watch>>";

const NO_LEDGER: &str = "no ledger configured; set CUSTODY_LEDGER_ENDPOINT before flushing";

/// What the `queue` commands operate on. `client` is `None` when no ledger
/// endpoint is configured; delivering commands then refuse to run.
pub struct QueueContext {
    pub queue: OfflineQueue,
    pub client: Option<EvidenceLedgerClient>,
    pub schedule: FlushSchedule,
}

impl QueueContext {
    pub fn new(queue: OfflineQueue, client: Option<EvidenceLedgerClient>) -> Self {
        Self {
            queue,
            client,
            schedule: FlushSchedule::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: FlushSchedule) -> Self {
        self.schedule = schedule;
        self
    }
}

pub fn fingerprint_file(path: &Path) -> Result<String, String> {
    let file = File::open(path).map_err(|e| format!("failed to open {}: {e}", path.display()))?;
    FingerprintService::default()
        .fingerprint_reader(BufReader::new(file))
        .map(String::from)
        .map_err(|e| e.to_string())
}

/// Digest of the canonical text encoding, identical to what the submission pipeline freezes.
pub fn fingerprint_text(kind: &str, statement: &str, extra: &[String]) -> Result<String, String> {
    let kind = EvidenceKind::parse(kind).ok_or_else(|| {
        format!("unknown evidence kind '{kind}'. expected one of: testimony, physical-notice, direct-contact")
    })?;
    if kind == EvidenceKind::Document {
        return Err("document evidence is a file; use fingerprint-file".to_string());
    }
    let mut contact = None;
    let mut fields = Vec::with_capacity(extra.len());
    for arg in extra {
        if let Some(value) = arg.strip_prefix("--contact=") {
            contact = Some(value.to_string());
            continue;
        }
        let (label, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("context field '{arg}' must be label=value"))?;
        let field = ContextField {
            label: label.to_string(),
            value: value.to_string(),
        };
        field.validate().map_err(|e| e.to_string())?;
        fields.push(field);
    }
    let encoded = canonical_text_encoding(kind, statement, contact.as_deref(), &fields)
        .map_err(|e| e.to_string())?;
    FingerprintService::default()
        .fingerprint_bytes(&encoded)
        .map(String::from)
        .map_err(|e| e.to_string())
}

pub fn verify_file(path: &Path, expected: &str) -> Result<String, String> {
    let expected = Fingerprint::parse(expected.trim()).map_err(|e| e.to_string())?;
    let computed = fingerprint_file(path)?;
    if computed == expected.as_str() {
        Ok("MATCH".to_string())
    } else {
        Ok(format!("MISMATCH {computed}"))
    }
}

pub fn render_receipt_file(path: &Path, locale: Option<&str>) -> Result<String, String> {
    let locale = match locale {
        None => Locale::En,
        Some(raw) => Locale::parse(raw).ok_or_else(|| format!("unknown locale '{raw}'. expected en or uk"))?,
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let record: LedgerRecord =
        serde_json::from_str(&raw).map_err(|e| format!("invalid ledger record: {e}"))?;
    Ok(render_receipt(&record, locale))
}

fn current_thread_runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start runtime: {e}"))
}

/// Keeps flushing on the context's schedule until `shutdown` resolves.
pub fn watch_queue(
    ctx: &QueueContext,
    shutdown: impl Future<Output = ()>,
) -> Result<String, String> {
    let client = ctx.client.as_ref().ok_or_else(|| NO_LEDGER.to_string())?;
    current_thread_runtime()?
        .block_on(ctx.queue.run_flusher(client, ctx.schedule, shutdown))
        .map_err(|e| format!("watch stopped: {e}"))?;
    let remaining = ctx
        .queue
        .pending()
        .map_err(|e| format!("failed to list queue: {e}"))?
        .len();
    Ok(format!("stopped remaining={remaining}"))
}

pub fn execute_queue_command(ctx: &QueueContext, subcommand: &str) -> Result<String, String> {
    let queue = &ctx.queue;
    match subcommand {
        "ls" => {
            let envelopes = queue
                .pending()
                .and_then(|mut pending| {
                    pending.extend(queue.dead_letters()?);
                    Ok(pending)
                })
                .map_err(|e| format!("failed to list queue: {e}"))?;
            let lines: Vec<String> = envelopes
                .iter()
                .map(|e| {
                    let state = match e.state {
                        EnvelopeState::Pending => "pending",
                        EnvelopeState::DeadLetter => "dead-letter",
                    };
                    format!(
                        "{}\t{}\t{}\t{}\t{}",
                        e.submission_id,
                        e.track_kind.as_str(),
                        state,
                        e.attempt_count,
                        e.last_error.as_deref().unwrap_or("-")
                    )
                })
                .collect();
            Ok(lines.join("\n"))
        }
        "flush" => {
            let client = ctx.client.as_ref().ok_or_else(|| NO_LEDGER.to_string())?;
            let report = current_thread_runtime()?
                .block_on(queue.flush(client))
                .map_err(|e| format!("flush failed: {e}"))?;
            Ok(format!(
                "dispatched={} delivered={} retry_scheduled={} dead_lettered={} remaining={}",
                report.dispatched,
                report.delivered,
                report.retry_scheduled,
                report.dead_lettered,
                report.remaining
            ))
        }
        "watch" => watch_queue(ctx, async {
            let _ = tokio::signal::ctrl_c().await;
        }),
        _ => Err(format!(
            "unknown queue subcommand: {subcommand}. expected one of: ls, flush, watch"
        )),
    }
}

pub fn execute_command(
    args: &[String],
    queue: impl FnOnce() -> Result<QueueContext, String>,
) -> Result<String, String> {
    let arg = |i: usize| args.get(i).map(String::as_str).ok_or_else(|| USAGE.to_string());
    match arg(0)? {
        "fingerprint-file" => fingerprint_file(Path::new(arg(1)?)),
        "fingerprint-text" => fingerprint_text(arg(1)?, arg(2)?, args.get(3..).unwrap_or(&[])),
        "verify-file" => verify_file(Path::new(arg(1)?), arg(2)?),
        "receipt" => render_receipt_file(Path::new(arg(1)?), args.get(2).map(String::as_str)),
        "queue" => {
            let subcommand = arg(1)?;
            let ctx = queue()?;
            execute_queue_command(&ctx, subcommand)
        }
        _ => Err(USAGE.to_string()),
    }
}
