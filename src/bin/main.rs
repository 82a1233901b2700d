use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use subline::{Client, ClientConfig, ObjectRecord, Request, Response};

/// Talk to a line-delimited JSON controller from the command line
#[derive(Parser)]
#[command(name = "subline")]
#[command(version)]
#[command(about = "Send requests to a controller and watch its topic updates")]
struct Cli {
    /// TOML file with connection settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Controller host (overrides the config file)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Controller port (overrides the config file)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Request timeout in milliseconds (overrides the config file)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the response
    Send {
        /// Command name, e.g. GetQuery
        command: String,

        /// JSON object merged into the request
        #[arg(long)]
        params: Option<String>,
    },
    /// Subscribe to topics and print updates until interrupted
    Watch {
        /// Topic names (objnam), e.g. PMP1
        #[arg(required = true)]
        topics: Vec<String>,

        /// Parameter keys to request, comma separated
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,
    },
}

fn load_config(cli: &Cli) -> subline::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(timeout_ms));
    }
    config.validate()?;
    Ok(config)
}

fn print_response(response: &Response) {
    match serde_json::to_string_pretty(response) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Error: could not print response: {}", e),
    }
}

fn print_update(record: &ObjectRecord) {
    match serde_json::to_string(record.params()) {
        Ok(params) => println!("{} {}", record.topic(), params),
        Err(e) => eprintln!("Error: could not print update for {}: {}", record.topic(), e),
    }
}

async fn send(client: &Client, command: String, params: Option<String>) -> subline::Result<bool> {
    let mut request = Request::new(command);
    if let Some(params) = params {
        let value: Value = serde_json::from_str(&params)
            .map_err(|e| subline::ClientError::config(format!("--params is not valid JSON: {}", e)))?;
        request = request.with_params(value);
    }
    let response = client.submit(request)?.await?;
    print_response(&response);
    Ok(response.is_ok())
}

async fn watch(client: &Client, topics: Vec<String>, keys: Vec<String>) -> subline::Result<()> {
    let mut handles = Vec::with_capacity(topics.len());
    for topic in &topics {
        handles.push(
            client
                .subscribe_with_keys(topic, keys.clone(), print_update)
                .await?,
        );
        eprintln!("Watching {}", topic);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Error: could not wait for Ctrl-C: {}", e);
    }
    for handle in handles {
        client.unsubscribe(handle).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = load_config(&cli).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    });
    let client = Client::connect(config).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    let outcome = match cli.command {
        Commands::Send { command, params } => send(&client, command, params).await,
        Commands::Watch { topics, keys } => watch(&client, topics, keys).await.map(|()| true),
    };
    client.close().await;

    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
