use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use modbot::api::{self, AppState};
use modbot::commands;
use modbot::orchestrator::{EvaluationOptions, ModerationOrchestrator};
use modbot::platform::{self, LoggingPlatform, MessageContext};
use modbot::screening::{InboundMessage, MessageScreen, ScreenOutcome};
use modbot::warnings::{JsonFilePersistence, WarningStore};
use modbot::{Config, PerspectiveClient, StatisticsCollector};
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/modbot.yaml";

#[tokio::main]
async fn main() {
    let matches = Command::new("modbot")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Toxicity moderation service with per-user escalation tracking")
        .long_about("ModBot - scores chat messages with a remote toxicity classifier and\n\
                    turns the scores into moderation decisions:\n\
                    • per-attribute thresholds with per-call overrides\n\
                    • warn -> timeout escalation with an inactivity reset window\n\
                    • fail-open behaviour when the classifier is unavailable\n\
                    • HTTP API with API-key protection and rate limiting")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
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
            Arg::new("check-text")
                .long("check-text")
                .value_name("TEXT")
                .help("Evaluate a single text and print the decision")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .value_name("ID")
                .help("Treat --check-text as a chat message from this user (stateful)")
                .requires("check-text")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("channel")
                .long("channel")
                .value_name("ID")
                .help("Channel the --check-text message was posted in")
                .requires("user")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("enact")
                .long("enact")
                .help("Run the decision through the logging platform adapter")
                .requires("user")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("warnings")
                .long("warnings")
                .value_name("USER")
                .help("Show a user's warning state")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("clear-warnings")
                .long("clear-warnings")
                .value_name("USER")
                .help("Reset a user's warnings")
                .action(clap::ArgAction::Set),
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
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let (mut config, found) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    config.apply_env_overrides();

    // Initialize logger based on verbose flag, then the configured level
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::from_str(&config.logging.level).unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if !found {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Err(e) = config.validate() {
        log::error!("Invalid configuration: {e:#}");
        process::exit(1);
    }

    if let Err(e) = run(&matches, config).await {
        log::error!("{e:#}");
        process::exit(1);
    }
}

async fn run(matches: &ArgMatches, config: Config) -> anyhow::Result<()> {
    let orchestrator = Arc::new(build_orchestrator(&config).await?);

    if let Some(user_id) = matches.get_one::<String>("warnings") {
        let state = orchestrator.store().get(user_id).await;
        let effective = orchestrator.store().effective_count(user_id).await;
        println!("{}", serde_json::to_string_pretty(&state)?);
        println!("Effective warning count: {effective}");
        return Ok(());
    }

    if let Some(user_id) = matches.get_one::<String>("clear-warnings") {
        orchestrator
            .clear_warnings(user_id)
            .await
            .with_context(|| format!("Failed to persist cleared warnings for {user_id}"))?;
        println!("Warnings for {user_id} cleared");
        return Ok(());
    }

    if let Some(text) = matches.get_one::<String>("check-text") {
        let result = check_text(matches, &config, &orchestrator, text).await;
        flush_on_exit(&orchestrator).await;
        return result;
    }

    if config.uses_default_api_key() {
        log::warn!("server.api_key is the default value; set MODBOT_API_KEY before exposing the API");
    }
    if !orchestrator.classifier_configured() {
        log::warn!("No classifier API key configured; every evaluation will be degraded (allowed)");
    }
    if let Some(cache) = orchestrator.cache() {
        cache.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_seconds.max(1)));
    }

    let state = AppState::new(orchestrator.clone(), &config);
    let result = api::serve(state, &config.server.bind_address).await;
    flush_on_exit(&orchestrator).await;
    result
}

async fn build_orchestrator(config: &Config) -> anyhow::Result<ModerationOrchestrator> {
    let classifier = Arc::new(
        PerspectiveClient::new(&config.classifier).context("Failed to create classifier client")?,
    );

    let reset_window = i64::try_from(config.policy.reset_window_hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .with_context(|| {
            format!("policy.reset_window_hours out of range: {}", config.policy.reset_window_hours)
        })?;
    let store = match &config.storage.warnings_path {
        Some(path) => WarningStore::with_persistence(
            reset_window,
            Arc::new(JsonFilePersistence::new(path)),
        )
        .await
        .with_context(|| format!("Failed to load warning state from {path}"))?,
        None => WarningStore::new(reset_window),
    };

    let mut orchestrator = ModerationOrchestrator::from_config(config, classifier, Arc::new(store));
    if config.statistics.enabled {
        let collector = StatisticsCollector::new(
            config.statistics.path.as_ref().map(PathBuf::from),
            config.statistics.flush_interval_seconds,
        )?;
        orchestrator = orchestrator.with_statistics(Arc::new(collector));
    }
    Ok(orchestrator)
}

async fn check_text(
    matches: &ArgMatches,
    config: &Config,
    orchestrator: &ModerationOrchestrator,
    text: &str,
) -> anyhow::Result<()> {
    let options = EvaluationOptions::default();

    let Some(user_id) = matches.get_one::<String>("user") else {
        let evaluation = orchestrator.preview(text, &options).await?;
        println!("{}", serde_json::to_string_pretty(&evaluation.assessment)?);
        println!("{}", serde_json::to_string_pretty(&evaluation.decision)?);
        return Ok(());
    };

    let channel_id = matches
        .get_one::<String>("channel")
        .cloned()
        .unwrap_or_else(|| "cli".to_string());
    let message = InboundMessage {
        author_id: user_id.clone(),
        author_is_bot: false,
        channel_id: channel_id.clone(),
        content: text.to_string(),
    };
    let screen = MessageScreen::new(&config.screening)?;

    if let Some(reply) = commands::handle_message(&message, &screen, orchestrator).await {
        println!("{reply}");
        return Ok(());
    }
    if let ScreenOutcome::Skip(reason) = screen.screen(&message) {
        println!("Not evaluated: {}", reason.describe());
        return Ok(());
    }

    let decision = orchestrator.evaluate_message(text, user_id, &options).await?;
    println!("{}", serde_json::to_string_pretty(&decision)?);

    if matches.get_flag("enact") {
        let ctx = MessageContext {
            user_id: user_id.clone(),
            channel_id: Some(channel_id),
            message_id: None,
        };
        let report = platform::enact(
            &LoggingPlatform,
            &decision,
            &ctx,
            config.policy.escalation_limit,
        )
        .await;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn flush_on_exit(orchestrator: &ModerationOrchestrator) {
    if let Err(e) = orchestrator.store().flush().await {
        log::error!("Failed to write warning state on exit: {e}");
    }
    if let Some(statistics) = orchestrator.statistics() {
        statistics.flush().await;
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    match config.validate() {
        Ok(()) => {
            println!("✅ Configuration is valid");
            println!("   Bind address: {}", config.server.bind_address);
            println!(
                "   Classifier: {} ({})",
                config.classifier.endpoint,
                if config.classifier.api_key.is_some() {
                    "key configured"
                } else {
                    "NO key, every evaluation will fail open"
                }
            );
            println!(
                "   Escalation: timeout after {} warnings, {}s, reset after {}h",
                config.policy.escalation_limit,
                config.policy.timeout_seconds,
                config.policy.reset_window_hours
            );
            println!(
                "   Cache: {}",
                if config.cache.enabled {
                    format!("enabled, ttl {}s", config.cache.ttl_seconds)
                } else {
                    "disabled".to_string()
                }
            );
            if config.uses_default_api_key() {
                println!("⚠️  server.api_key is still the default value");
            }
        }
        Err(e) => {
            println!("❌ Configuration error: {e:#}");
            process::exit(1);
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<(Config, bool)> {
    if std::path::Path::new(path).exists() {
        Ok((Config::from_file(path)?, true))
    } else {
        Ok((Config::default(), false))
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
