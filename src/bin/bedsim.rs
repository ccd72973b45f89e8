use bedsim::alarms::DEFAULT_ALARM_DICTIONARY;
use bedsim::{AlarmDictionary, FleetOrchestrator, SimulatorConfig, TcpDialer, TemplateSet};
use clap::{App, Arg};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let matches = App::new("bedsim")
        .version("0.1.0")
        .about("Bedside monitor fleet simulator. Hub address, bed count and alarms come from IP, PORT, BED_COUNT and SEND_ALARMS.")
        .arg(
            Arg::with_name("templates")
                .short("t")
                .long("templates")
                .value_name("DIR")
                .help("Directory with VitalTemplate.txt, WaveFormTemplate.txt and AlarmTemplate.txt (built-in templates when omitted)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("alarms")
                .short("a")
                .long("alarms")
                .value_name("CSV")
                .help("Alarm dictionary of name,code rows")
                .takes_value(true)
                .default_value(DEFAULT_ALARM_DICTIONARY),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed for alarm selection and timing")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Seed must be a valid number".into()),
                }),
        )
        .get_matches();

    let config = SimulatorConfig::from_env().map_err(|e| {
        error!("{}", e);
        e
    })?;
    println!("Using the following settings: {}", config);

    let templates = match matches.value_of("templates") {
        Some(dir) => TemplateSet::load_dir(dir),
        None => TemplateSet::builtin(),
    }
    .map_err(|e| {
        error!("{}", e);
        e
    })?;

    let alarms = if config.send_alarms {
        let path = matches.value_of("alarms").unwrap_or(DEFAULT_ALARM_DICTIONARY);
        let dictionary = AlarmDictionary::load_csv(path).map_err(|e| {
            error!("{}", e);
            e
        })?;
        info!(alarms = dictionary.len(), path, "loaded alarm dictionary");
        Some(dictionary)
    } else {
        None
    };

    let seed = matches.value_of("seed").and_then(|s| s.parse::<u64>().ok());
    let dialer = Arc::new(TcpDialer::new(config.address()));
    let fleet = FleetOrchestrator::new(config, templates, alarms, dialer)?.with_seed(seed);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        ctrl_c.cancel();
    });

    let report = fleet.run(shutdown).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
