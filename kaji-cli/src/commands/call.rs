//! `kaji call <METHOD> <PATH>`: one request through the conditional client.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use kaji_sync::{ApiError, ApiRequest, ConditionalClient, Method, TokenStore, UreqTransport};

use super::{load_config, runtime};

#[derive(Args, Debug)]
pub struct CallArgs {
    /// GET, POST, PUT, PATCH or DELETE.
    pub method: Method,

    /// Path relative to the API base URL, e.g. /v1/tasks
    pub path: String,

    /// JSON request body.
    #[arg(long, short = 'd', value_name = "JSON")]
    pub data: Option<String>,

    /// Use this concurrency token instead of the one held by the client.
    #[arg(long, value_name = "TOKEN")]
    pub if_match: Option<String>,

    /// Read this path first so the client holds a current token.
    #[arg(long, value_name = "PATH")]
    pub prime: Option<String>,
}

impl CallArgs {
    pub fn run(self) -> Result<()> {
        let config = load_config()?;
        let body = self
            .data
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .context("--data is not valid JSON")?;

        let client = ConditionalClient::new(
            Arc::new(UreqTransport::new(&config)),
            TokenStore::new(),
        );
        let mut request = ApiRequest::new(self.method, self.path);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        if let Some(token) = self.if_match {
            request = request.with_if_match(token);
        }

        runtime()?.block_on(async {
            if let Some(prime) = self.prime {
                client
                    .send(ApiRequest::get(prime.clone()))
                    .await
                    .with_context(|| format!("priming read of {prime} failed"))?;
            }
            match client.send(request).await {
                Ok(response) => {
                    println!("{} HTTP {}", "✓".green(), response.status);
                    print_token(&client);
                    if !response.data.is_null() {
                        println!("{}", serde_json::to_string_pretty(&response.data)?);
                    }
                    Ok(())
                }
                Err(err) => {
                    report(&err);
                    print_token(&client);
                    Err(err.into())
                }
            }
        })
    }
}

fn print_token(client: &ConditionalClient) {
    match client.tokens().get() {
        Some(token) => println!("  token: {token}"),
        None => println!("  token: {}", "none".dimmed()),
    }
}

/// Classifies a failed call on stderr.
fn report(err: &ApiError) {
    let label = match err {
        ApiError::PreconditionRequired | ApiError::PreconditionFailed { .. } => "conflict".yellow(),
        ApiError::Unauthorized { .. } => "unauthorized".red(),
        _ => "error".red(),
    };
    // The error itself is printed once by main.
    match err.code() {
        Some(code) => eprintln!("{} {}", label.bold(), format!("(code: {code})").dimmed()),
        None => eprintln!("{}", label.bold()),
    }
}
