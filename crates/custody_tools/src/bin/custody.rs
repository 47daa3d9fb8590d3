#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;

use custody_os::config::CustodyConfig;
use custody_os::ledger_client::{EvidenceLedgerClient, HttpLedgerBackend};
use custody_os::offline_queue::OfflineQueue;
use custody_storage::envelope_store::EncryptedFileEnvelopeStore;
use custody_tools::custody_cli::{execute_command, QueueContext};
use tracing_subscriber::EnvFilter;

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let output = execute_command(&args, || {
        let config = CustodyConfig::from_env();
        let store = EncryptedFileEnvelopeStore::in_dir(config.envelope_dir());
        let queue = OfflineQueue::new(Arc::new(store))
            .with_max_in_flight(config.flush_max_in_flight)
            .with_network_timeout(config.network_timeout());
        let client = config
            .ledger
            .clone()
            .map(|ledger| EvidenceLedgerClient::new(Arc::new(HttpLedgerBackend::new(ledger))));
        Ok(QueueContext::new(queue, client).with_schedule(config.flush_schedule()))
    })?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
