use clap::{Arg, Command};
use log::LevelFilter;
use policyd_client::{Config, MemoryStore, PolicydClient};
use std::path::Path;
use std::process;
use std::sync::{mpsc, Arc};

fn main() {
    let matches = Command::new("policyd-client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Mirror sending policies from a policy keeper into an in-memory store")
        .long_about("Connects to a policy keeper, applies its policy and suspend\n\
                    directives to an in-memory queue store and keeps them in sync\n\
                    until interrupted. On exit the synchronized state is printed.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(Config::default_path()),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("URL")
                .help("Keeper address, overrides the configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(Config::default_path());
    let config_found = Path::new(config_path).exists();
    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    if let Some(address) = matches.get_one::<String>("address") {
        config.address = address.clone();
    }

    // -v wins over the configured level
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config
            .logging
            .as_ref()
            .and_then(|logging| logging.level_filter())
            .unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if !config_found {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    if matches.get_flag("test-config") {
        println!("Testing configuration...");
        match config.validate() {
            Ok(()) => {
                println!("Keeper address: {}", config.address);
                println!("Protocol: {:?}", config.protocol);
                println!("Reconnect backoff: {:?}", config.reconnect_backoff());
                match config.startup_timeout() {
                    Some(timeout) => println!("Startup timeout: {timeout:?}"),
                    None => println!("Startup timeout: none"),
                }
                println!("Configuration is valid");
            }
            Err(e) => {
                println!("Configuration validation failed: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = run(&config) {
        log::error!("{e:#}");
        process::exit(1);
    }
}

fn run(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());

    log::info!("Starting policyd client against {}", config.address);
    let mut client = PolicydClient::init(config, store.clone())?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, stopping...");
        let _ = shutdown_tx.send(());
    })?;

    println!("Synchronized. Press Ctrl-C to stop.");
    let _ = shutdown_rx.recv();
    client.cleanup();

    print_summary(&client, &store);
    Ok(())
}

fn print_summary(client: &PolicydClient, store: &MemoryStore) {
    let policies = store.policy_ids();
    println!();
    println!("Policies ({}):", policies.len());
    for id in &policies {
        match store.policy(id) {
            Some(policy) => println!("  {id} ({:?})", policy.kind),
            None => println!("  {id}"),
        }
    }

    let suspends = store.suspend_ids();
    println!("Suspends ({}):", suspends.len());
    for id in &suspends {
        println!("  {id}");
    }

    let predicates = client.warmup_index().snapshot();
    println!("Warm-up predicates ({}):", predicates.len());
    for predicate in &predicates {
        let address = if predicate.local_address.is_empty() {
            "<any>"
        } else {
            predicate.local_address.as_str()
        };
        let fields: Vec<String> = predicate
            .fields
            .compared()
            .map(|field| field.to_string())
            .collect();
        println!(
            "  {address} <- {} [{}] = {:?}",
            predicate.owner,
            fields.join(", "),
            predicate.values
        );
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if Path::new(path).exists() {
        Config::from_file(path)
    } else {
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}
