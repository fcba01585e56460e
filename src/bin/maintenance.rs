use std::env;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use transport_sync::{
    backup::RecordFilter, config::AppConfig, models::SyncStatus, Orchestrator,
};

const USAGE: &str = "Usage: maintenance <list [pending|synced|failed] | reconcile | cleanup | delete-records <id>... | token-info>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };
    let rest: Vec<String> = args.collect();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        backup_file = %config.backup_file.display(),
        excel_file = %config.sharepoint.excel_file_name,
        "loaded configuration"
    );
    let orchestrator = Orchestrator::from_config(&config).context(
        "maintenance needs exclusive use of the backup log; stop the server or use its /api admin routes",
    )?;

    match command.as_str() {
        "list" => list_records(&orchestrator, rest.first().map(String::as_str)).await?,
        "reconcile" => {
            let report = orchestrator.reconciliation_pass().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "cleanup" => {
            let report = orchestrator.retention_cleanup().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "delete-records" => {
            if rest.is_empty() {
                bail!("delete-records needs at least one request id");
            }
            let deleted = orchestrator.delete_records(rest).await?;
            println!("Deleted {deleted} records.");
        }
        "token-info" => {
            let info = orchestrator.force_refresh().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        other => {
            eprintln!("Unknown command: {other}\n{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn list_records(orchestrator: &Orchestrator, status: Option<&str>) -> Result<()> {
    let sync_status = status
        .map(|raw| raw.parse::<SyncStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    let records = orchestrator
        .list_records(RecordFilter { sync_status })
        .await?;

    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }

    for record in &records {
        let summary = record.attachment_summary();
        println!(
            "{}  {}  {:<7}  attempts={}  attachments={}  {}",
            record.request_id,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.sync_status.as_str(),
            record.sync_attempts,
            summary.status_text(),
            record.last_error.as_deref().unwrap_or(""),
        );
    }
    println!("{} records.", records.len());
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
