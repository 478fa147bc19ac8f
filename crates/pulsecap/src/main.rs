use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use log::{info, warn};

use pulsewire::client::run_publisher;
use pulsewire::iq::FileInfo;
use pulsewire::stats::report_every;
use pulsewire::{
    AmqpTransport, ClientConfig, ClientPipeline, ClientStats, Dispatcher, IqReader, OutQueue,
    PublisherConfig, PulseDetectorBuilder, SampleFormat, TransportConfig, TransportUrl,
};

mod app;
mod cli;

use cli::{Args, CliError, DEFAULT_FREQUENCY, DEFAULT_SAMPLE_RATE};

fn main() {
    match pulsecap() {
        Ok(()) => {}
        Err(cli_error) => cli_error.exit(),
    }
}

fn pulsecap() -> Result<(), CliError> {
    // Parse options and start logging
    let args = Args::try_parse()?;
    log_setup(&args);

    // decoders are needed for -R help and --local-decode
    let registry = args
        .registry_options()?
        .build()
        .context("Unable to set up decoders")?;
    if args.wants_protocol_list() {
        app::list_protocols(&registry);
        return Ok(());
    }

    let url = TransportUrl::parse(&args.transport)
        .with_context(|| format!("Invalid --transport \"{}\"", args.transport))
        .map_err(|e| CliError::new(e, 2))?
        .with_env();

    if args.device.is_some() || args.gain.is_some() {
        warn!("no receiver support: --device and --gain are ignored; reading --file instead");
    }

    // input setup: locks stdin in case we need it
    let (format, sample_rate, center_freq) = input_params(&args)?;
    let stdin = io::stdin();
    let stdin_handle = stdin.lock();
    let input = file_setup(&args, stdin_handle)?;
    let mut reader = IqReader::new(input, format, args.frame_samples);

    let mut builder = PulseDetectorBuilder::new(sample_rate);
    builder
        .with_center_frequency(center_freq)
        .with_fsk_limit(args.fsk_limit)
        .with_analyze(args.analyze);
    args.apply_levels(&mut builder);
    let mut detector = builder.build();
    info!(
        "detecting at {} Hz, {} sps, {} samples, FSK {}",
        center_freq,
        sample_rate,
        format,
        detector.fsk_mode()
    );

    // connect before reading anything
    let mut transport = AmqpTransport::connect(TransportConfig::new(url.clone()))
        .with_context(|| format!("Unable to connect to {}", url))
        .map_err(|e| CliError::new(e, 3))?;
    info!("publishing to {}", url);

    let stats = Arc::new(ClientStats::new());
    let config = ClientConfig {
        content_type: url.content_type(),
        local_decode: args.local_decode,
        analyze: args.analyze,
        queue_capacity: args.queue_capacity,
    };
    let pipeline = ClientPipeline::new(config, stats.clone()).with_dispatcher(Dispatcher::new(registry));
    let queue = OutQueue::new(args.queue_capacity, stats.clone());

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("Unable to install signal handler")?;
    }

    let publisher = {
        let rx = queue.receiver();
        let stats = stats.clone();
        let shutdown = shutdown.clone();
        let config = PublisherConfig {
            drain_timeout: args.drain_timeout(),
            ..PublisherConfig::default()
        };
        std::thread::Builder::new()
            .name("publisher".to_owned())
            .spawn(move || run_publisher(&mut transport, &rx, &stats, &shutdown, &config))
            .context("Unable to start publisher")?
    };

    let reporter = {
        let stats = stats.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(args.stats_interval);
        std::thread::Builder::new()
            .name("stats".to_owned())
            .spawn(move || report_every(interval, &shutdown, || info!("{}", stats.summary())))
            .context("Unable to start statistics")?
    };

    // processing: runs until end of input or ^C
    let result = app::run(&mut reader, &mut detector, &pipeline, &queue, &shutdown);

    shutdown.store(true, Ordering::Relaxed);
    drop(queue);
    if publisher.join().is_err() {
        warn!("publisher thread panicked");
    }
    if reporter.join().is_err() {
        warn!("statistics thread panicked");
    }

    if !args.quiet {
        eprintln!("{}", stats.summary());
    }

    result.context("Unable to read samples")?;
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

// Sample format, rate and center frequency. The command line wins
// over the file name.
fn input_params(args: &Args) -> Result<(SampleFormat, u32, f64), anyhow::Error> {
    let named = if args.input_is_stdin() {
        None
    } else if args.format.is_some() {
        FileInfo::from_path(&args.file).ok()
    } else {
        Some(
            FileInfo::from_path(&args.file)
                .with_context(|| format!("Unable to tell the format of \"{}\"; use --format", args.file))?,
        )
    };

    let format = args
        .format
        .or(named.as_ref().map(|n| n.format))
        .unwrap_or(SampleFormat::Cu8);
    let sample_rate = args
        .sample_rate
        .or(named.as_ref().and_then(|n| n.sample_rate))
        .unwrap_or(DEFAULT_SAMPLE_RATE);
    let center_freq = args
        .frequency
        .or(named.as_ref().and_then(|n| n.center_freq))
        .unwrap_or(DEFAULT_FREQUENCY);
    Ok((format, sample_rate, center_freq))
}

fn file_setup<'stdin>(
    args: &Args,
    stdin: std::io::StdinLock<'stdin>,
) -> Result<Box<dyn io::Read + 'stdin>, anyhow::Error> {
    if args.input_is_stdin() {
        info!("reading standard input");
        if !is_terminal(&std::io::stdin()) {
            Ok(Box::new(io::BufReader::new(stdin)))
        } else {
            Err(anyhow!(
                "cowardly refusing to read I/Q samples from a terminal.

Pipe a source of raw I/Q samples from rtl_sdr, a capture file,
or similar into this program, or name a file with --file."
            ))
        }
    } else {
        info!("reading file: \"{}\"", &args.file);
        Ok(Box::new(io::BufReader::new(
            std::fs::File::open(&args.file)
                .with_context(|| format!("Unable to open --file \"{}\"", args.file))?,
        )))
    }
}

#[cfg(not(target_os = "windows"))]
fn is_terminal<S>(stream: &S) -> bool
where
    S: std::os::fd::AsRawFd,
{
    terminal_size::terminal_size_using_fd(stream.as_raw_fd()).is_some()
}

#[cfg(target_os = "windows")]
fn is_terminal<S>(stream: &S) -> bool
where
    S: std::os::windows::io::AsRawHandle,
{
    terminal_size::terminal_size_using_handle(stream.as_raw_handle()).is_some()
}
