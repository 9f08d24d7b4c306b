use clap::{App, Arg};
use colored::*;
use showbus::config::{BrokerConfig, ElementConfig, Identity, DEFAULT_EXCHANGE, DEFAULT_HOST, DEFAULT_PORT};
use showbus::element::ShowElement;
use showbus::pin::{parse_pattern, BlinkBehavior, MemoryPin};
use showbus::protocol::ShowCommand;
use showbus::transport::TcpSubscriber;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_PATTERN: &str = "on:250,off:250,on:250,off:250,on:1000";

fn number_validator(v: String) -> Result<(), String> {
    match v.parse::<u64>() {
        Ok(_) => Ok(()),
        Err(_) => Err(format!("'{v}' is not a valid number")),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let default_port = DEFAULT_PORT.to_string();
    let matches = App::new("showelement")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Show element node driving one output pin")
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Show hub host")
                .takes_value(true)
                .env("SHOWBUS_HOST")
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Show hub port")
                .takes_value(true)
                .env("SHOWBUS_PORT")
                .default_value(&default_port)
                .validator(number_validator),
        )
        .arg(
            Arg::with_name("exchange")
                .short("e")
                .long("exchange")
                .value_name("NAME")
                .help("Exchange to bind to")
                .takes_value(true)
                .env("SHOWBUS_EXCHANGE")
                .default_value(DEFAULT_EXCHANGE),
        )
        .arg(
            Arg::with_name("name")
                .long("name")
                .value_name("NAME")
                .help("Element name used in logs")
                .takes_value(true)
                .default_value("Lamp"),
        )
        .arg(
            Arg::with_name("id")
                .long("id")
                .value_name("ID")
                .help("Element id used in logs")
                .takes_value(true)
                .default_value("1")
                .validator(number_validator),
        )
        .arg(
            Arg::with_name("pattern")
                .long("pattern")
                .value_name("STEPS")
                .help("Show sequence, e.g. on:200,off:200")
                .takes_value(true)
                .default_value(DEFAULT_PATTERN),
        )
        .arg(
            Arg::with_name("idle-period")
                .long("idle-period")
                .value_name("MS")
                .help("Toggle period of the idle loop")
                .takes_value(true)
                .default_value("1000")
                .validator(number_validator),
        )
        .get_matches();

    let broker = BrokerConfig::new(
        matches.value_of("host").unwrap_or(DEFAULT_HOST),
        matches.value_of("port").unwrap_or(&default_port).parse()?,
        matches.value_of("exchange").unwrap_or(DEFAULT_EXCHANGE),
    );
    let identity = Identity::new(
        matches.value_of("name").unwrap_or("Lamp"),
        matches.value_of("id").unwrap_or("1").parse()?,
    );
    let pattern = parse_pattern(matches.value_of("pattern").unwrap_or(DEFAULT_PATTERN))?;
    let idle_period = Duration::from_millis(matches.value_of("idle-period").unwrap_or("1000").parse()?);

    println!("{} {}", "Starting show element".bright_green(), identity);
    let behavior = BlinkBehavior::new(MemoryPin::new(identity.name.clone()), pattern).with_idle_period(idle_period);
    let element = ShowElement::spawn(identity, behavior, ElementConfig::default());

    let subscriber = TcpSubscriber::connect_retrying(&broker, CONNECT_RETRY_DELAY).await?;
    let pump = element.attach(subscriber);

    tokio::select! {
        () = element.stopped() => {
            info!(element = %element.identity(), "Element stopped by SHUTDOWN");
        }
        _ = tokio::signal::ctrl_c() => {
            info!(element = %element.identity(), "Interrupt received, shutting down locally");
            if element.on_message_received(ShowCommand::shutdown()).is_ok() {
                element.stopped().await;
            }
        }
    }

    pump.abort();
    println!("{}", serde_json::to_string_pretty(&element.state())?);
    Ok(())
}
