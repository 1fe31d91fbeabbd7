use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use foff_contact::pipeline::AdmissionPipeline;
use foff_contact::rate_limit::SubmissionLimiter;
use foff_contact::reputation::{AbuseIpDb, ReputationGate};
use foff_contact::resource_cache::DEFAULT_KEY;
use foff_contact::server::{self, AppState};
use foff_contact::settings::{generate_default_settings, load_settings_or_default, Settings};
use foff_contact::smtp::{RelayDelivery, SmtpMailboxProbe, SystemResolver};
use foff_contact::templates::{TemplateCache, TemplateTreeLoader};
use foff_contact::tenant_config::{ConfigCache, ConfigLoader};
use foff_contact::watcher::spawn_watcher;
use log::LevelFilter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let matches = Command::new("foff-contact")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-tenant contact form service with reputation gating")
        .arg(
            Arg::new("settings")
                .short('c')
                .long("settings")
                .value_name("FILE")
                .help("Service settings file path")
                .default_value("/etc/foff-contact.yaml"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("DIR")
                .help("Directory holding <domain>.conf and default.conf"),
        )
        .arg(
            Arg::new("templates")
                .long("templates")
                .value_name("DIR")
                .help("Directory holding <domain>/contact.html templates"),
        )
        .arg(
            Arg::new("static")
                .long("static")
                .value_name("DIR")
                .help("Directory holding per-domain static assets"),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .help("Address to listen on, e.g. 0.0.0.0:8080"),
        )
        .arg(
            Arg::new("generate-settings")
                .long("generate-settings")
                .value_name("FILE")
                .help("Generate a default settings file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Check the default tenant config and template tree, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-settings") {
        match generate_default_settings(generate_path) {
            Ok(()) => println!("Default settings written to: {generate_path}"),
            Err(e) => {
                eprintln!("Error generating settings: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    let settings_path = matches
        .get_one::<String>("settings")
        .map(String::as_str)
        .unwrap_or("/etc/foff-contact.yaml");

    let settings = match load_settings_or_default(settings_path) {
        Ok(settings) => apply_overrides(settings, &matches),
        Err(e) => {
            eprintln!("Error loading settings: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        if !test_config(&settings).await {
            process::exit(1);
        }
        return;
    }

    if let Err(e) = run(settings).await {
        log::error!("{e:#}");
        process::exit(1);
    }
}

fn apply_overrides(mut settings: Settings, matches: &ArgMatches) -> Settings {
    if let Some(dir) = matches.get_one::<String>("config") {
        settings.config_dir = PathBuf::from(dir);
    }
    if let Some(dir) = matches.get_one::<String>("templates") {
        settings.templates_dir = PathBuf::from(dir);
    }
    if let Some(dir) = matches.get_one::<String>("static") {
        settings.static_dir = PathBuf::from(dir);
    }
    if let Some(listen) = matches.get_one::<String>("listen") {
        settings.listen = listen.clone();
    }
    settings
}

async fn test_config(settings: &Settings) -> bool {
    println!("🔍 Testing configuration...");
    println!();

    let mut ok = true;

    let configs = ConfigCache::new(ConfigLoader::new(&settings.config_dir));
    match configs.resolve(DEFAULT_KEY).await {
        Ok(config) => {
            println!(
                "✅ Default tenant config: relay {}:{} -> {}",
                config.delivery.host, config.delivery.port, config.delivery.recipient
            );
            println!("   Client address method: {:?}", config.admission.method());
            println!("   Mailbox probe: {}", config.mailbox_probe.enabled);
            println!("   AbuseIPDB gate: {}", config.reputation.enabled);
        }
        Err(e) => {
            println!("❌ Default tenant config: {e}");
            ok = false;
        }
    }

    match TemplateCache::load(TemplateTreeLoader::new(&settings.templates_dir)) {
        Ok(templates) => {
            println!("✅ Template tree: {} templates", templates.len().await);
            if templates.resolve(DEFAULT_KEY).await.is_err() {
                println!("⚠️  No default template; unknown domains will get a plain 500");
            }
        }
        Err(e) => {
            println!("❌ Template tree: {e}");
            ok = false;
        }
    }

    ok
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    log::info!("Starting foff-contact v{}", env!("CARGO_PKG_VERSION"));

    let configs = Arc::new(ConfigCache::new(ConfigLoader::new(&settings.config_dir)));
    let templates = Arc::new(
        TemplateCache::load(TemplateTreeLoader::new(&settings.templates_dir)).with_context(|| {
            format!(
                "Failed to load templates from {}",
                settings.templates_dir.display()
            )
        })?,
    );
    log::info!("Loaded {} templates", templates.len().await);

    spawn_watcher(settings.config_dir.clone(), configs.clone());
    spawn_watcher(settings.templates_dir.clone(), templates.clone());

    let provider = AbuseIpDb::new(
        &settings.reputation.endpoint,
        settings.reputation.timeout_seconds,
    )
    .context("Failed to build AbuseIPDB client")?;
    let reputation = Arc::new(ReputationGate::new(Arc::new(provider)));

    let limiter = Arc::new(SubmissionLimiter::new(&settings.rate_limit));
    let sweeper = limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweeper.cleanup().await;
        }
    });

    let resolver = SystemResolver::from_system_conf().context("Failed to initialise DNS resolver")?;
    let probe = SmtpMailboxProbe::new(
        Arc::new(resolver),
        settings.probe.port,
        settings.probe.timeout(),
    );

    let pipeline = AdmissionPipeline::new(
        configs,
        reputation,
        limiter,
        Arc::new(probe),
        Arc::new(RelayDelivery),
    );

    let app = server::router(AppState {
        pipeline: Arc::new(pipeline),
        templates,
        static_dir: settings.static_dir.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen))?;
    log::info!("Listening on {}", settings.listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    log::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}
