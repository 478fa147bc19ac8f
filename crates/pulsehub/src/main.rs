use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use pulsewire::stats::report_every;
use pulsewire::{
    AmqpTransport, Dispatcher, Route, ServerConfig, ServerPipeline, ServerStats, TransportConfig,
    TransportUrl,
};

mod app;
mod cli;

use app::ServeOptions;
use cli::{Args, CliError};

fn main() {
    match pulsehub() {
        Ok(()) => {}
        Err(cli_error) => cli_error.exit(),
    }
}

fn pulsehub() -> Result<(), CliError> {
    // Parse options and start logging
    let args = Args::try_parse()?;
    log_setup(&args);

    let registry = args
        .registry_options()?
        .build()
        .context("Unable to set up decoders")?;
    if args.wants_protocol_list() {
        list_protocols(&registry);
        return Ok(());
    }

    let url = TransportUrl::parse(&args.transport)
        .with_context(|| format!("Invalid --transport \"{}\"", args.transport))
        .map_err(|e| CliError::new(e, 2))?
        .with_env();
    let queue = Route::Signals.queue(url.content_type());

    let mut transport = AmqpTransport::connect(TransportConfig {
        prefetch: args.prefetch,
        ..TransportConfig::new(url.clone())
    })
    .with_context(|| format!("Unable to connect to {}", url))
    .map_err(|e| CliError::new(e, 3))?;

    let stats = Arc::new(ServerStats::new());
    let dispatcher = Dispatcher::new(registry).with_fsk_fallback(!args.no_fsk_fallback);
    let pipeline = ServerPipeline::new(
        ServerConfig {
            publish_unknown: !args.no_unknown,
            analyze: args.analyze,
        },
        dispatcher,
        stats.clone(),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("Unable to install signal handler")?;
    }

    let reporter = {
        let stats = stats.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(args.stats_interval);
        std::thread::Builder::new()
            .name("stats".to_owned())
            .spawn(move || report_every(interval, &shutdown, || info!("{}", stats.summary())))
            .context("Unable to start statistics")?
    };

    // processing: runs until ^C
    info!("decoding bursts from {} queue \"{}\"", url, queue);
    let handled = app::serve(&mut transport, &ServeOptions::new(queue), &pipeline, &shutdown);
    info!("{} deliveries handled", handled);

    if reporter.join().is_err() {
        warn!("statistics thread panicked");
    }
    transport.close();

    if !args.quiet {
        eprintln!("{}", stats.summary());
    }
    Ok(())
}

fn log_setup(args: &Args) {
    if args.quiet {
        // no logging
        return;
    } else if std::env::var_os("RUST_LOG").is_none() {
        // parameter controls
        let mut builder = pretty_env_logger::formatted_builder();
        for (target, filter) in args.log_filters() {
            builder.filter_module(target, filter);
        }
        builder.init();
    } else {
        // environment controls
        pretty_env_logger::init();
    }
}

fn list_protocols(registry: &pulsewire::Registry) {
    println!("Supported device protocols:");
    for info in registry.list() {
        println!(
            "    [{:02}]{} {} ({})",
            info.number,
            if info.enabled { " " } else { "*" },
            info.name,
            info.coding
        );
    }
    println!();
    println!("* Disabled, use -R n or a conf file to enable");
}
