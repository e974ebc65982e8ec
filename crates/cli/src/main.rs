use anyhow::{Result, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::fmt::format::FmtSpan;

use iamrevert_aws::IamClient;
use iamrevert_core::{remediate, RemediationConfig, RemediationEvent, RemediationOutcome};
use iamrevert_policy::{check_document, RestrictedActions};

/// Environment fallback for the restricted-action list, comma-separated.
const RESTRICTED_ACTIONS_ENV: &str = "restrictedActions";

#[derive(Parser, Debug)]
#[command(author, version, about="iamrevert — revert overly permissive IAM policy versions")]
struct Cli {
    /// Remediation event file (JSON)
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// Comma-separated restricted actions (default: the restrictedActions env var)
    #[arg(long, global = true)]
    restricted_actions: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)] enum Cmd {
    /// Check the offending policy against the restricted set; no API calls
    Check,
    /// Install the placeholder version as default and report for approval
    Remedy {
        /// Also delete the previously-default non-compliant version
        #[arg(long, default_value_t=false)]
        delete_prior_version: bool,

        #[arg(long)] region: Option<String>,

        /// Override the IAM endpoint (e.g. LocalStack)
        #[arg(long)] endpoint_url: Option<String>,
    },
}

fn restricted_actions(cli: &Cli) -> Result<RestrictedActions> {
    let list = match &cli.restricted_actions {
        Some(l) => l.clone(),
        None => std::env::var(RESTRICTED_ACTIONS_ENV)
            .with_context(|| format!("no --restricted-actions flag and no {RESTRICTED_ACTIONS_ENV} env var"))?,
    };
    let restricted = RestrictedActions::parse(&list);
    if restricted.is_empty() {
        anyhow::bail!("restricted-action list is empty");
    }
    Ok(restricted)
}

fn load_event(cli: &Cli) -> Result<RemediationEvent> {
    let path = cli.file.as_ref().context("an event file is required (-f)")?;
    let raw = std::fs::read(path)
        .with_context(|| format!("read event {}", path.display()))?;
    let event: RemediationEvent = serde_json::from_slice(&raw)
        .with_context(|| format!("parse event {}", path.display()))?;
    Ok(event)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().json().with_span_events(FmtSpan::CLOSE).init();
    let cli = Cli::parse();
    let restricted = restricted_actions(&cli)?;
    let event = load_event(&cli)?;
    tracing::info!(
        policy=%event.policy_meta.policy_name,
        restricted=restricted.len(),
        "loaded remediation event"
    );

    match &cli.cmd {
        Cmd::Check => {
            let report = check_document(&event.policy, &restricted)
                .context("check policy document")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Cmd::Remedy { delete_prior_version, region, endpoint_url } => {
            let mut cfg = RemediationConfig::new(restricted);
            cfg.delete_prior_version = *delete_prior_version;

            let iam = IamClient::connect(region.clone(), endpoint_url.clone()).await;
            let result = remediate(&iam, &cfg, &event).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);

            // surface failed remediation to schedulers instead of a false success
            if matches!(result.outcome, RemediationOutcome::Failed { .. }) {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
