use clap::{App, Arg};
use colored::*;
use showbus::config::DEFAULT_PORT;
use showbus::transport::Hub;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND: &str = "0.0.0.0";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let default_port = DEFAULT_PORT.to_string();
    let matches = App::new("showhub")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fan-out hub relaying show commands to every bound element")
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Address to listen on")
                .takes_value(true)
                .env("SHOWBUS_BIND")
                .default_value(DEFAULT_BIND),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to listen on")
                .takes_value(true)
                .env("SHOWBUS_PORT")
                .default_value(&default_port)
                .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|_| "Port must be a number".to_string())),
        )
        .get_matches();

    let bind = matches.value_of("bind").unwrap_or(DEFAULT_BIND);
    let port: u16 = matches.value_of("port").unwrap_or(&default_port).parse()?;

    let listener = TcpListener::bind((bind, port)).await?;
    println!("{} {}:{}", "Show hub listening on".bright_green(), bind, port);

    let hub = Arc::new(Hub::new());
    tokio::select! {
        result = Arc::clone(&hub).serve(listener) => {
            if let Err(e) = result {
                error!(error = %e, "Hub stopped");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(exchanges = ?hub.exchange_names().await, "Interrupt received, stopping hub");
        }
    }

    println!("{}", "Show hub stopped".dimmed());
    Ok(())
}
