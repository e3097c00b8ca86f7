//! Tether: command-line client for the review server's resource API
//!
//! Subcommands:
//! - `fetch`: Load records of one resource type and print them
//! - `page`: Load one window of a paginated collection

use clap::{Parser, Subcommand};
use miette::Result;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_api::request::{include, method, payload, with_arguments, with_context, with_parameters};
use tether_api::{
    CacheState, ClientConfig, FetchOutcome, Identifiable, Method, PaginationCache, Record, RecordId,
    RequestOptions, ResourceClient, ResourceName,
};

fn parse_resource(s: &str) -> Result<ResourceName, String> {
    ResourceName::from_wire(s).ok_or_else(|| {
        let known: Vec<&str> = ResourceName::ALL.iter().map(|r| r.as_str()).collect();
        format!("unknown resource '{}', expected one of: {}", s, known.join(", "))
    })
}

/// Parse a `key=value` query parameter.
fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid parameter '{}', expected key=value", s))
}

fn parse_method(s: &str) -> Result<Method, String> {
    match s.to_uppercase().as_str() {
        "GET" => Ok(Method::Get),
        "POST" => Ok(Method::Post),
        "PUT" => Ok(Method::Put),
        "DELETE" => Ok(Method::Delete),
        _ => Err(format!("invalid method '{}'", s)),
    }
}

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Review server resource client", long_about = None)]
struct Cli {
    /// API root
    #[arg(long, global = true, env = "TETHER_BASE_URL")]
    base_url: Option<String>,

    /// Request timeout in seconds
    #[arg(long, global = true, env = "TETHER_TIMEOUT_SECS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch records and print them as JSON
    Fetch {
        /// Resource type, e.g. `reviews`
        #[arg(value_parser = parse_resource)]
        resource: ResourceName,

        /// Record ids
        ids: Vec<String>,

        /// Parent path, e.g. `repositories/1`
        #[arg(long)]
        context: Option<String>,

        /// Additional resource types to include
        #[arg(long, value_delimiter = ',', value_parser = parse_resource)]
        include: Vec<ResourceName>,

        /// Query parameter (repeatable)
        #[arg(long = "param", short = 'p', value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// HTTP method
        #[arg(long, value_parser = parse_method, default_value = "GET")]
        method: Method,

        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },

    /// Fetch one window of a paginated collection
    Page {
        /// Resource type, e.g. `commits`
        #[arg(value_parser = parse_resource)]
        resource: ResourceName,

        /// First item of the window
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Number of items
        #[arg(long, default_value = "20")]
        count: usize,

        /// Parent path, e.g. `repositories/1`
        #[arg(long)]
        context: Option<String>,

        /// Query parameter (repeatable)
        #[arg(long = "param", short = 'p', value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tether=info,tether_api=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::default();
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }

    let client = ResourceClient::new(&config).map_err(|e| miette::miette!("{}", e))?;

    match cli.command {
        Commands::Fetch {
            resource,
            ids,
            context,
            include: included,
            params,
            method: http_method,
            body,
        } => {
            let mut options = common_options(context, params);
            if !ids.is_empty() {
                options.push(with_arguments(ids));
            }
            if !included.is_empty() {
                options.push(include(included));
            }
            if http_method != Method::Get {
                options.push(method(http_method));
            }
            if let Some(body) = body {
                let body: Value = serde_json::from_str(&body)
                    .map_err(|e| miette::miette!("invalid --body JSON: {}", e))?;
                options.push(payload(body));
            }
            run_fetch(&client, resource, options).await
        }

        Commands::Page {
            resource,
            offset,
            count,
            context,
            params,
        } => {
            let scope = match &context {
                Some(context) => format!("{}/{}", context.trim_matches('/'), resource),
                None => resource.to_string(),
            };
            let options = common_options(context, params);
            run_page(&client, resource, &scope, offset, count, options).await
        }
    }
}

fn common_options(context: Option<String>, params: Vec<(String, String)>) -> Vec<RequestOptions> {
    let mut options = Vec::new();
    if let Some(context) = context {
        options.push(with_context(context));
    }
    if !params.is_empty() {
        options.push(with_parameters(params));
    }
    options
}

async fn run_fetch(
    client: &ResourceClient,
    resource: ResourceName,
    options: Vec<RequestOptions>,
) -> Result<()> {
    let outcome = client
        .fetch(resource, options)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    match outcome {
        FetchOutcome::Loaded { records, total } => {
            info!(resource = %resource, count = records.len(), ?total, "records loaded");
            print_records(&records)
        }
        FetchOutcome::Delayed => Err(miette::miette!("server is still preparing the response")),
        FetchOutcome::Deleted => {
            info!(resource = %resource, "deleted");
            Ok(())
        }
        FetchOutcome::Invalid => Err(miette::miette!("the addressed {} are invalid", resource)),
        FetchOutcome::NotFound => Err(miette::miette!("no such {}", resource)),
        FetchOutcome::Handled(err) | FetchOutcome::Failed(err) => Err(miette::miette!("{}", err)),
    }
}

async fn run_page(
    client: &ResourceClient,
    resource: ResourceName,
    scope: &str,
    offset: usize,
    count: usize,
    options: Vec<RequestOptions>,
) -> Result<()> {
    let pages = PaginationCache::new(client.store().clone());
    let fetch_client = client.clone();

    let range = pages.fetch_range(
        scope,
        offset,
        count,
        move |state: &CacheState, id: &RecordId| state.record(resource, id).cloned(),
        move |offset, count| async move {
            fetch_client
                .fetch_window(resource, offset, count, options)
                .await
        },
    );
    let page = range.pending.await.map_err(|e| miette::miette!("{}", e))?;

    let window = pages.window(scope);
    info!(
        scope,
        total = page.total,
        known = window.known(),
        cached = client.store().snapshot().count(resource),
        "window loaded"
    );

    let ids: Vec<String> = page.items.iter().map(|r| r.id().to_string()).collect();
    println!("{}", serde_json::json!({"total": page.total, "ids": ids}));
    print_records(&page.items)
}

fn print_records(records: &[Record]) -> Result<()> {
    let values: Vec<Value> = records.iter().map(|r| Value::Object(r.props())).collect();
    let json = serde_json::to_string_pretty(&values).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", json);
    Ok(())
}
