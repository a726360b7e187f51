//! Ops subcommands: tenant bootstrap against the database, plus thin
//! reqwest clients of the internal HTTP surface.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;

use crate::args::{CreateApiKeyArgs, CreateOrgArgs, GetExecutionArgs, HealthArgs, SubmitArgs};
use crate::credentials::CredentialStore;
use crate::db;
use crate::models::{Priority, now_ms};

pub async fn run_create_org(args: CreateOrgArgs) -> Result<()> {
    let pool = ferry_common::postgres::create_pool(args.postgres).await?;
    db::init_schema(&pool).await?;
    let store = CredentialStore::new(pool, Duration::from_millis(500));

    let org_id = store
        .create_organization(&args.name)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let (key_id, plaintext) = store.issue_api_key(org_id, None).await?;

    println!(
        "{}{}",
        "✅ Organization created • id=".green(),
        org_id.to_string().green().dimmed()
    );
    println!(
        "{}{}",
        "🔑 API key id=".green(),
        key_id.to_string().green().dimmed()
    );
    println!(
        "{} {}",
        "🔑 API key (shown once, store it now):".yellow(),
        plaintext
    );
    Ok(())
}

pub async fn run_create_api_key(args: CreateApiKeyArgs) -> Result<()> {
    let pool = ferry_common::postgres::create_pool(args.postgres).await?;
    db::init_schema(&pool).await?;
    let store = CredentialStore::new(pool, Duration::from_millis(500));

    let expires_at = args
        .expires_in_days
        .map(|days| now_ms() + days * 24 * 60 * 60 * 1000);
    let (key_id, plaintext) = store.issue_api_key(args.organization_id, expires_at).await?;

    println!(
        "{}{}",
        "🔑 API key id=".green(),
        key_id.to_string().green().dimmed()
    );
    println!(
        "{} {}",
        "🔑 API key (shown once, store it now):".yellow(),
        plaintext
    );
    Ok(())
}

pub async fn run_submit(args: SubmitArgs) -> Result<()> {
    let priority: Priority = args.priority.parse()?;
    let input: serde_json::Value = serde_json::from_str(&args.input)
        .with_context(|| format!("input is not valid JSON: {}", args.input))?;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/executions", args.endpoint))
        .header("x-api-key", &args.api_key)
        .json(&serde_json::json!({
            "agent": args.agent,
            "input": input,
            "priority": priority,
        }))
        .send()
        .await
        .context("failed to reach control plane")?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.context("invalid response body")?;
    if !status.is_success() && status != reqwest::StatusCode::ACCEPTED {
        bail!("submit failed ({}): {}", status, body);
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn run_get_execution(args: GetExecutionArgs) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/v1/executions/{}", args.endpoint, args.id))
        .header("x-api-key", &args.api_key)
        .send()
        .await
        .context("failed to reach control plane")?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.context("invalid response body")?;
    if !status.is_success() {
        bail!("lookup failed ({}): {}", status, body);
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn run_health(args: HealthArgs) -> Result<()> {
    let response = reqwest::get(format!("{}/healthz", args.endpoint))
        .await
        .context("failed to reach control plane")?;
    if response.status().is_success() {
        println!("{}", "✅ healthy".green());
        Ok(())
    } else {
        bail!("unhealthy: {}", response.status())
    }
}
