//! slipway deploys smart contracts to EVM networks and verifies them on block explorers,
//! without ever broadcasting the same deployment twice.

mod cli;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::{Cli, Command, OutputFormat};
use slipway_deploy::{
    AnvilForkBackend, CONFIG_FILENAME, DeploymentRecord, DeploymentStatus, EnvSecrets, Pipeline,
    RehearsalVerification, SlipwayConfig, SlipwayError, StoreEntry, VerificationRecord,
    VerificationStatus, cancel, exit_code,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = e
                .downcast_ref::<SlipwayError>()
                .map(SlipwayError::exit_code)
                .unwrap_or(exit_code::FAILURE);
            tracing::error!(exit_code = code, "{e:#}");
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    if let Command::Init { force } = cli.command {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME));
        return init(path, force);
    }

    let config = SlipwayConfig::load(cli.config.as_deref()).map_err(SlipwayError::from)?;

    let (cancel_handle, cancellation) = cancel::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping at the next safe point...");
            cancel_handle.cancel();
        }
    });

    let pipeline = Pipeline::new(config, EnvSecrets)?.with_cancellation(cancellation);

    let code = match cli.command {
        Command::Deploy { network, contracts } => {
            let outcomes = pipeline.deploy(&network, &contracts).await?;

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(["Contract", "Status", "Address", "Transaction", "Detail"]);

            let mut code = 0;
            for (contract, outcome) in contracts.iter().zip(outcomes) {
                match outcome {
                    Ok(record) => {
                        if code == 0 {
                            code = deployment_exit_code(&record);
                        }
                        table.add_row(deployment_row(&record));
                    }
                    Err(e) => {
                        if code == 0 {
                            code = e.exit_code();
                        }
                        table.add_row([
                            contract.clone(),
                            "error".to_string(),
                            String::new(),
                            String::new(),
                            e.to_string(),
                        ]);
                    }
                }
            }

            println!("{table}");
            print_gas_report(&pipeline);
            code
        }

        Command::Verify { network, contract } => {
            let record = pipeline.verify(&network, &contract).await?;
            println!("{}", verification_summary(&record));
            verification_exit_code(&record)
        }

        Command::Rehearse { network, contract } => {
            let backend = AnvilForkBackend::connect(pipeline.config().fork.clone())
                .context("Rehearsals need a running Docker daemon")?;
            let report = pipeline
                .rehearse(Arc::new(backend), &network, &contract)
                .await?;

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(["Contract", "Status", "Address", "Transaction", "Detail"]);
            table.add_row(deployment_row(&report.deployment));

            println!("Rehearsal of {} on a fork of {}", contract, report.upstream);
            println!("{table}");
            match &report.verification {
                RehearsalVerification::OutOfScope(reason) => {
                    println!("Verification skipped: {reason}")
                }
                RehearsalVerification::NotAttempted => {
                    println!("Verification not attempted: the deployment did not confirm")
                }
                RehearsalVerification::Recorded(record) => {
                    println!("{}", verification_summary(record))
                }
            }
            print_gas_report(&pipeline);
            println!("Rehearsal results are advisory; nothing was recorded.");

            deployment_exit_code(&report.deployment)
        }

        Command::Status { network, format } => {
            let entries = pipeline
                .store()
                .list(network.as_deref())
                .map_err(SlipwayError::from)?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&entries)
                        .context("Failed to serialize store entries")?
                ),
                OutputFormat::Table => println!("{}", status_table(&entries)),
            }
            0
        }

        Command::Networks => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(["Network", "Chain ID", "RPC", "Confirmations", "Explorer"]);

            for name in pipeline.registry().names() {
                match pipeline.registry().resolve(name) {
                    Ok(ctx) => table.add_row([
                        ctx.name().to_string(),
                        ctx.chain_id().to_string(),
                        ctx.rpc_endpoint().to_string(),
                        ctx.confirmations().to_string(),
                        ctx.explorer()
                            .map(|e| e.api_url.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                    ]),
                    Err(e) => table.add_row([
                        name.to_string(),
                        "-".to_string(),
                        e.to_string(),
                        "-".to_string(),
                        "-".to_string(),
                    ]),
                };
            }

            println!("{table}");
            0
        }

        Command::Init { .. } => unreachable!("handled before loading the configuration"),
    };

    Ok(code)
}

fn init(path: PathBuf, force: bool) -> Result<u8> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }

    SlipwayConfig::default().save_to_file(&path)?;
    tracing::info!(path = %path.display(), "Configuration written");
    Ok(0)
}

fn deployment_exit_code(record: &DeploymentRecord) -> u8 {
    match (&record.status, &record.cause) {
        (DeploymentStatus::Confirmed, _) => 0,
        (DeploymentStatus::Failed, Some(cause)) => cause.kind.exit_code(),
        _ => exit_code::FAILURE,
    }
}

fn verification_exit_code(record: &VerificationRecord) -> u8 {
    match (&record.status, &record.cause) {
        (VerificationStatus::Verified, _) => 0,
        (VerificationStatus::Failed, Some(cause)) => cause.kind.exit_code(),
        _ => exit_code::FAILURE,
    }
}

fn deployment_row(record: &DeploymentRecord) -> [String; 5] {
    [
        record.contract.clone(),
        record.status.to_string(),
        record
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string()),
        record.tx_hash.to_string(),
        record
            .cause
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| format!("{} confirmations", record.confirmations)),
    ]
}

fn verification_summary(record: &VerificationRecord) -> String {
    let mut summary = format!(
        "{}/{}: verification {}",
        record.network, record.contract, record.status
    );
    if let Some(guid) = &record.explorer_guid {
        summary.push_str(&format!(" (guid {guid})"));
    }
    if let Some(error) = &record.last_error {
        summary.push_str(&format!(": {error}"));
    }
    summary
}

fn status_table(entries: &[StoreEntry]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Deployment", "Status", "Address", "Verification"]);

    for entry in entries {
        let deployment = &entry.deployment;
        table.add_row([
            deployment.key().to_string(),
            deployment.status.to_string(),
            deployment
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry
                .verification
                .as_ref()
                .map(|v| v.status.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }

    table
}

fn print_gas_report(pipeline: &Pipeline<EnvSecrets>) {
    if let Some(report) = pipeline.gas_report().filter(|r| !r.is_empty()) {
        println!("{}", report.render());
    }
}
