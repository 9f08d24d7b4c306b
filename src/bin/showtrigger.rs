use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use showbus::config::{BrokerConfig, Identity, TriggerConfig, DEFAULT_EXCHANGE, DEFAULT_GO_TOKEN, DEFAULT_HOST, DEFAULT_PORT};
use showbus::protocol::{Instruction, ShowCommand};
use showbus::scheduler::CueList;
use showbus::transport::TcpPublisher;
use showbus::trigger::{listen, KeyMap, ListenerExit, ShowTrigger};
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

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
    let matches = App::new("showtrigger")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Operator trigger: broadcast GO, IDLE and SHUTDOWN to every show element")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Show hub host")
                .takes_value(true)
                .env("SHOWBUS_HOST")
                .default_value(DEFAULT_HOST)
                .global(true),
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
                .global(true)
                .validator(number_validator),
        )
        .arg(
            Arg::with_name("exchange")
                .short("e")
                .long("exchange")
                .value_name("NAME")
                .help("Exchange the elements are bound to")
                .takes_value(true)
                .env("SHOWBUS_EXCHANGE")
                .default_value(DEFAULT_EXCHANGE)
                .global(true),
        )
        .arg(
            Arg::with_name("sync-offset")
                .short("s")
                .long("sync-offset")
                .value_name("MS")
                .help("Delay GO and IDLE so every element receives them before they start")
                .takes_value(true)
                .env("SHOWBUS_SYNC_OFFSET_MS")
                .global(true)
                .validator(number_validator),
        )
        .arg(
            Arg::with_name("name")
                .long("name")
                .value_name("NAME")
                .help("Trigger name used in logs")
                .takes_value(true)
                .default_value("Trigger")
                .global(true),
        )
        .arg(
            Arg::with_name("id")
                .long("id")
                .value_name("ID")
                .help("Trigger id used in logs")
                .takes_value(true)
                .default_value("1")
                .global(true)
                .validator(number_validator),
        )
        .subcommand(SubCommand::with_name("go").about("Start the show sequence on every element"))
        .subcommand(SubCommand::with_name("idle").about("Return every element to its idle loop"))
        .subcommand(SubCommand::with_name("shutdown").about("Stop every element"))
        .subcommand(
            SubCommand::with_name("keyboard")
                .about("Read operator tokens from stdin (GO, IDLE, SHUTDOWN, EXIT)")
                .arg(
                    Arg::with_name("key")
                        .short("k")
                        .long("key")
                        .value_name("TOKEN")
                        .help("Token that sends GO")
                        .takes_value(true)
                        .default_value(DEFAULT_GO_TOKEN),
                ),
        )
        .subcommand(
            SubCommand::with_name("cues")
                .about("Play a JSON cue list")
                .arg(
                    Arg::with_name("file")
                        .value_name("FILE")
                        .help("Cue list, e.g. [{\"atMs\":0,\"instruction\":\"GO\"}]")
                        .required(true)
                        .index(1),
                ),
        )
        .get_matches();

    let broker = BrokerConfig::new(
        matches.value_of("host").unwrap_or(DEFAULT_HOST),
        matches.value_of("port").unwrap_or(&default_port).parse()?,
        matches.value_of("exchange").unwrap_or(DEFAULT_EXCHANGE),
    );
    let config = TriggerConfig {
        sync_offset_ms: matches.value_of("sync-offset").map(str::parse::<u64>).transpose()?,
        ..TriggerConfig::default()
    };
    let identity = Identity::new(
        matches.value_of("name").unwrap_or("Trigger"),
        matches.value_of("id").unwrap_or("1").parse()?,
    );

    println!("{} {} ({})", "Connecting to".dimmed(), broker.endpoint(), broker.exchange);
    let publisher = TcpPublisher::connect_retrying(&broker, CONNECT_RETRY_DELAY).await?;
    let trigger = ShowTrigger::new(identity, publisher, &config);

    match matches.subcommand() {
        ("go", _) => report(trigger.send_go().await?),
        ("idle", _) => report(trigger.send_idle().await?),
        ("shutdown", _) => report(trigger.send_shutdown().await?),
        ("keyboard", Some(sub)) => run_keyboard(&trigger, sub, &config).await?,
        ("cues", Some(sub)) => run_cues(&trigger, sub).await?,
        _ => println!("{}", "No command specified. Use --help for usage information.".yellow()),
    }

    Ok(())
}

fn report(command: ShowCommand) {
    let kind = match command.instruction() {
        Instruction::Go => command.instruction().as_str().bright_green().bold(),
        Instruction::Idle => command.instruction().as_str().bright_blue().bold(),
        Instruction::Shutdown => command.instruction().as_str().bright_red().bold(),
    };
    println!("{} {} {} {}", "Sent".bright_white(), kind, "starting at".dimmed(), command.start_time());
}

async fn run_keyboard(
    trigger: &ShowTrigger<TcpPublisher>,
    matches: &ArgMatches<'_>,
    config: &TriggerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let keymap = KeyMap::new(matches.value_of("key").unwrap_or(&config.go_token));
    println!(
        "{} {} {}",
        "Type".dimmed(),
        keymap.go_token().bright_green(),
        "to start, IDLE, SHUTDOWN or EXIT".dimmed()
    );

    let stdin = BufReader::new(tokio::io::stdin());
    match listen(trigger, &keymap, stdin).await? {
        ListenerExit::ExitRequested => println!("{}", "Listener stopped".dimmed()),
        ListenerExit::InputClosed => println!("{}", "Input closed".dimmed()),
    }
    Ok(())
}

async fn run_cues(trigger: &ShowTrigger<TcpPublisher>, matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let path = matches.value_of("file").unwrap_or_default();
    let cues = CueList::from_json(&tokio::fs::read_to_string(path).await?)?;
    println!("{} {} {}", "Playing".bright_white(), cues.len(), "cues".dimmed());

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling cue playback");
            interrupt.cancel();
        }
    });

    let stats = cues.play(trigger, cancel).await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
