use clap::{Arg, ArgAction, Command};
use log::LevelFilter;
use scanmill::config::Config;
use scanmill::milter::MilterConnector;
use scanmill::plugins::build_plugin_set;
use scanmill::replay::ReplayProtocolHandler;
use scanmill::session::SessionHandler;
use scanmill::statistics::StatisticsCollector;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("scanmill")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Plugin driven mail content scanner speaking the milter protocol")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/scanmill.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Load every plugin, run its lint checks and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show the last statistics dump")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Run message files through a full scan session and print the outcome")
                .num_args(1..)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("sender")
                .long("sender")
                .value_name("ADDRESS")
                .help("Envelope sender used with --test-email")
                .default_value("unknown@example.com"),
        )
        .arg(
            Arg::new("recipient")
                .long("recipient")
                .value_name("ADDRESS")
                .help("Envelope recipient used with --test-email (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // Initialize logger based on verbose flag
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/scanmill.yaml");
    let config = match load_config(config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("stats") {
        show_stats(&config);
        return;
    }

    let stats = Arc::new(match config.statistics.as_ref().filter(|s| s.enabled) {
        Some(stats_config) => StatisticsCollector::new(Some(PathBuf::from(&stats_config.dump_path))),
        None => StatisticsCollector::in_memory(),
    });

    let plugins = match build_plugin_set(&config.plugins, stats.clone()) {
        Ok(plugins) => Arc::new(plugins),
        Err(e) => {
            eprintln!("❌ Failed to load plugins: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config, &plugins);
        return;
    }

    if let Some(files) = matches.get_many::<String>("test-email") {
        let files: Vec<PathBuf> = files.map(PathBuf::from).collect();
        let sender = matches
            .get_one::<String>("sender")
            .cloned()
            .unwrap_or_default();
        let recipients: Vec<String> = matches
            .get_many::<String>("recipient")
            .map(|r| r.cloned().collect())
            .unwrap_or_else(|| vec!["test@example.com".to_string()]);
        test_email_files(config, plugins, stats, files, sender, recipients);
        return;
    }

    log::info!("Starting scanmill...");

    if let Some(stats_config) = config.statistics.as_ref().filter(|s| s.enabled) {
        stats.clone().spawn_flusher(stats_config.flush_interval_seconds);
    }

    let socket_path = config.socket_path.clone();
    let milter = MilterConnector::new(config, plugins, stats.clone());
    if let Err(e) = milter.run(&socket_path).await {
        log::error!("Milter error: {e:#}");
        process::exit(1);
    }

    if let Err(e) = stats.flush_to_file() {
        log::warn!("Failed to write final statistics: {e:#}");
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
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
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config, plugins: &scanmill::PluginSet) {
    println!("🔍 Testing configuration...");
    println!();

    let mut failed = false;
    for (kind, names) in [
        ("Prependers", scanmill::plugin::names(&plugins.prependers)),
        ("Scanners", scanmill::plugin::names(&plugins.scanners)),
        ("Appenders", scanmill::plugin::names(&plugins.appenders)),
    ] {
        println!("{kind}: {}", if names.is_empty() { "-".to_string() } else { names.join(", ") });
    }
    println!();

    for (name, error) in plugins.lint() {
        println!("❌ {name}: {error:#}");
        failed = true;
    }

    let trashdir = config.main.trashdir.trim();
    if !trashdir.is_empty() && !Path::new(trashdir).is_dir() {
        println!("❌ Trash directory {trashdir} does not exist");
        failed = true;
    }

    if failed {
        process::exit(1);
    }
    println!("✅ Configuration is valid");
}

fn show_stats(config: &Config) {
    let Some(stats_config) = config.statistics.as_ref().filter(|s| s.enabled) else {
        println!("❌ Statistics are not enabled in configuration");
        process::exit(1);
    };

    let snapshot = match StatisticsCollector::load_from_file(Path::new(&stats_config.dump_path)) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            println!("❌ Failed to read statistics: {e:#}");
            process::exit(1);
        }
    };

    let global = &snapshot.global;
    println!("📊 scanmill Statistics");
    println!("═══════════════════════════════════════");
    println!();
    println!("📈 Global Statistics:");
    println!("  Messages In:  {}", global.messages_in);
    println!("  Messages Out: {}", global.messages_out);
    println!("  Scanned:      {}", global.scanned);
    if global.scanned > 0 {
        let pct = |n: u64| (n as f64 / global.scanned as f64) * 100.0;
        println!("  ├─ Ham:       {} ({:.1}%)", global.ham, pct(global.ham));
        println!("  ├─ Spam:      {} ({:.1}%)", global.spam, pct(global.spam));
        println!("  ├─ High spam: {} ({:.1}%)", global.highspam, pct(global.highspam));
        println!("  ├─ Virus:     {} ({:.1}%)", global.virus, pct(global.virus));
        println!("  └─ Blocked:   {} ({:.1}%)", global.blocked, pct(global.blocked));
        println!(
            "  Average scan time: {:.4}s",
            global.total_scantime / global.scanned as f64
        );
    }
    println!();
    println!(
        "  Decisions: {} accept, {} delete, {} reject, {} defer, {} no opinion",
        global.accepts, global.deletes, global.rejects, global.defers, global.no_opinion
    );
    println!(
        "  Started: {}",
        global.start_time.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  Last Updated: {}",
        global.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();

    if snapshot.plugins.is_empty() {
        println!("📭 No plugin decisions recorded yet");
        return;
    }

    println!("🎯 Plugin Statistics (sorted by decisions):");
    println!("┌──────────────────────────────────────────────────────────────────────────┐");
    println!("│ Plugin                                       │ Decided │ Reject │ Delete │");
    println!("├──────────────────────────────────────────────────────────────────────────┤");
    for stats in snapshot.plugins.iter().take(20) {
        println!(
            "│ {:<44} │ {:>7} │ {:>6} │ {:>6} │",
            truncate_string(&stats.plugin, 44),
            stats.decisions,
            stats.rejects,
            stats.deletes
        );
    }
    println!("└──────────────────────────────────────────────────────────────────────────┘");
    if snapshot.plugins.len() > 20 {
        println!("  ... and {} more plugins", snapshot.plugins.len() - 20);
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn test_email_files(
    config: Arc<Config>,
    plugins: Arc<scanmill::PluginSet>,
    stats: Arc<StatisticsCollector>,
    files: Vec<PathBuf>,
    sender: String,
    recipients: Vec<String>,
) {
    println!("🧪 Testing {} message file(s)", files.len());
    println!("   Sender: {sender}");
    println!("   Recipients: {recipients:?}");
    println!();

    let protocol = ReplayProtocolHandler::new(files, sender, recipients);
    let mut session = SessionHandler::new(protocol, config, plugins, stats);
    session.handle_session();

    for result in session.into_protocol().into_results() {
        println!("📧 {}", result.file.display());
        if let Some(id) = &result.suspect_id {
            println!("   Suspect: {id}");
        }
        println!("   {}", result.outcome.to_string().replace('\n', "\n   "));
        println!();
    }
}
