use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use daqstream_core::catalog::{Catalog, ResponseCode};
use daqstream_core::layout::Value;
use daqstream_core::protocol::{
    BatchSink, FileSink, FrameReader, MemorySink, ProtocolError, Session, SessionConfig,
};

mod cli;
mod script;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.cmd {
        cli::Cmd::Run(opts) => run(opts),
        cli::Cmd::Parse(opts) => parse_dump(opts),
        cli::Cmd::Commands => {
            print_catalog();
            Ok(())
        }
        cli::Cmd::Ports => {
            for port in daqstream_core::protocol::list_ports() {
                println!("{}  {}", port.name, port.product.as_deref().unwrap_or("-"));
            }
            Ok(())
        }
    }
}

/// Print the catalog the way the firmware's command CSV dump does.
fn print_catalog() {
    for spec in Catalog::builtin().iter() {
        println!(
            "{},{:#06x},{},{}",
            spec.name,
            spec.id,
            spec.args.source(),
            spec.ret.source()
        );
    }
}

fn parse_dump(opts: cli::ParseOpts) -> Result<()> {
    let data =
        std::fs::read(&opts.file).with_context(|| format!("reading {}", opts.file.display()))?;
    let mut reader = FrameReader::new(&data, opts.sync);
    let mut frames = 0usize;

    loop {
        match reader.next() {
            Some(Ok(frame)) => {
                frames += 1;
                println!(
                    "frame {:6}  nsamples {:5}  ts {:14}  tdc {:#018x}",
                    frame.frame_id, frame.sample_count, frame.timestamp, frame.tdc_word
                );
            }
            Some(Err(e)) => {
                warn!(offset = reader.position(), "dump ends early: {e}");
                break;
            }
            None => break,
        }
    }

    info!(frames, bytes = data.len(), "dump parsed");
    Ok(())
}

fn run(opts: cli::RunOpts) -> Result<()> {
    let catalog = Catalog::builtin();
    let config = SessionConfig {
        baud_rate: opts.baud,
        mode: opts.mode.into(),
        verbose_binary: opts.device_verbose,
        timeout: Duration::from_secs_f64(opts.timeout),
        batch_mode: opts.batch_mode.into(),
        ..SessionConfig::default()
    };

    let mut session = match (&opts.port, &opts.tcp) {
        (Some(port), _) => Session::open(port, catalog, config)?,
        (None, Some(addr)) => Session::connect_tcp(addr, catalog, config)?,
        (None, None) => bail!("either --port or --tcp is required"),
    };

    if let Some(path) = &opts.script {
        let commands = script::load_script(path)?;
        run_setup(&mut session, &commands)?;
    }

    let mut sink: Box<dyn BatchSink> = match &opts.output {
        Some(path) => {
            info!(path = %path.display(), "logging captured data to file");
            Box::new(FileSink::create(path)?)
        }
        None => Box::new(MemorySink::new()),
    };

    let handle = session.handle();
    info!(count = opts.count, no_stop = opts.no_stop, "starting batch acquisition");

    let result = std::thread::scope(|scope| {
        let rx = scope.spawn(|| session.batch_recv(opts.count, opts.no_stop, sink.as_mut()));

        let tstart = Instant::now();
        let mut tlast = Instant::now();
        while !rx.is_finished() {
            if tlast.elapsed() > Duration::from_secs(1) {
                tlast = Instant::now();
                info!(
                    bytes = handle.bytes_received(),
                    frames = handle.frames_received(),
                    "progress"
                );
            }
            if opts.runtime > 0.0 && tstart.elapsed() > Duration::from_secs_f64(opts.runtime) {
                info!("runtime limit reached, requesting stop");
                handle.request_stop();
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        rx.join()
    });

    let summary = result
        .map_err(|_| anyhow!("receive thread panicked"))?
        .context("batch receive failed")?;
    info!(
        bytes = summary.bytes,
        frames = summary.frames,
        outcome = ?summary.outcome,
        "acquisition finished"
    );

    // Put the link back into its bring-up state and confirm the device is
    // answering again.
    if let Err(e) = session.send_recv_named("baud", &[Value::Int(-1)]) {
        warn!("failed to re-enable autobaud: {e}");
    }
    match session.send_recv_named("ok", &[]) {
        Ok(resp) => info!("device idle: {:?}", resp.code()),
        Err(e) => warn!("device did not acknowledge idle: {e}"),
    }

    Ok(())
}

/// Execute the setup script, retrying each command a bounded number of
/// times when the device reports a failure.
fn run_setup(session: &mut Session, commands: &[script::SetupCommand]) -> Result<()> {
    const MAX_RETRIES: u32 = 10;

    for cmd in commands {
        info!(command = %cmd.name, args = ?cmd.args, "setup command");
        let mut retries = 0;
        loop {
            match session.send_recv_named(&cmd.name, &cmd.args) {
                Ok(resp) if session.is_ascii() => {
                    info!("response:\n{}", resp.text());
                    break;
                }
                Ok(resp) => match resp.code() {
                    Some(ResponseCode::Ok) => {
                        info!(ret = ?resp.ret(), "ok");
                        break;
                    }
                    code => warn!(?code, "setup command unsuccessful"),
                },
                Err(
                    e @ (ProtocolError::InvalidCommand { .. }
                    | ProtocolError::ShortReadback { .. }
                    | ProtocolError::Timeout),
                ) => warn!("setup command failed: {e}"),
                Err(e) => {
                    return Err(e).with_context(|| format!("setup command {:?}", cmd.name))
                }
            }

            retries += 1;
            if retries > MAX_RETRIES {
                bail!("setup command {:?} exceeded {MAX_RETRIES} retries", cmd.name);
            }
            warn!(retries, max = MAX_RETRIES, "retrying");
        }
        std::thread::sleep(Duration::from_secs_f64(cmd.sleep));
    }

    Ok(())
}
