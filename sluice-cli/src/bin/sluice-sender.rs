//! Sluice Sender - publishes a byte stream over UDP
//!
//! Reads from stdin or a file and publishes it as a sluice stream to one or
//! more receivers. Runs the sender, receiver and conductor duty cycles on
//! their own threads around a single publication.

use clap::Parser;
use sluice_cli::{display_compact_stats, display_counters, SenderConfig};
use sluice::io::{BackoffIdleStrategy, Timer, UdpChannelEndpoint};
use sluice::protocol::{
    ChannelEndpoint, DefaultRetransmitHandler, LifecycleHost, NanoClock, NetworkPublication,
    OfferError, Position, PublicationError, PublicationHandle, PublicationParams,
    PublicationResources, Publisher, SystemCounters, SystemEpochClock, SystemNanoClock,
    UnicastFlowControl,
};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sluice-sender")]
#[command(about = "Sluice stream sender", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input source: file path or '-' for stdin
    #[arg(short, long)]
    input: Option<String>,

    /// Receiver addresses (host:port), repeatable
    #[arg(short, long)]
    destination: Vec<SocketAddr>,

    /// Local bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    #[arg(long)]
    session_id: Option<i32>,

    #[arg(long)]
    stream_id: Option<i32>,

    #[arg(long)]
    term_length: Option<usize>,

    #[arg(long)]
    mtu: Option<usize>,

    /// Multicast TTL
    #[arg(long)]
    ttl: Option<u32>,

    /// Statistics interval in seconds, 0 to disable
    #[arg(long)]
    stats: Option<u64>,

    /// Print an example configuration file and exit
    #[arg(long)]
    print_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn sender_config(&self) -> anyhow::Result<SenderConfig> {
        let mut config = match &self.config {
            Some(path) => SenderConfig::from_file(path)?,
            None => SenderConfig {
                destinations: Vec::new(),
                ..SenderConfig::example()
            },
        };

        if let Some(input) = &self.input {
            config.input = input.clone();
        }
        if !self.destination.is_empty() {
            config.destinations = self.destination.clone();
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(session_id) = self.session_id {
            config.session_id = session_id;
        }
        if let Some(stream_id) = self.stream_id {
            config.stream_id = stream_id;
        }
        if let Some(term_length) = self.term_length {
            config.term_length = term_length;
        }
        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
            config.message_length = config.message_length.min(mtu.saturating_sub(32));
        }
        if self.ttl.is_some() {
            config.ttl = self.ttl;
        }
        if let Some(stats) = self.stats {
            config.stats_interval_secs = stats;
        }
        Ok(config)
    }
}

/// Hands publications that reached end of life back to the endpoint.
struct SenderHost {
    endpoint: Arc<UdpChannelEndpoint>,
}

impl LifecycleHost for SenderHost {
    fn cleanup_publication(&mut self, publication: &PublicationHandle) -> Result<(), PublicationError> {
        self.endpoint
            .remove_publication(publication.session_id(), publication.stream_id());
        tracing::info!(
            "Cleaned up publication {}:{}",
            publication.session_id(),
            publication.stream_id()
        );
        Ok(())
    }
}

/// Unblocks the log when the sender position stops moving behind the
/// producer for longer than the timeout.
struct StallDetector {
    timeout_ns: i64,
    last_position: i64,
    time_of_last_progress: i64,
}

impl StallDetector {
    fn new(timeout: Duration, now: i64) -> Self {
        StallDetector {
            timeout_ns: timeout.as_nanos().min(i64::MAX as u128) as i64,
            last_position: 0,
            time_of_last_progress: now,
        }
    }

    fn check(&mut self, publication: &PublicationHandle, now: i64) -> usize {
        let consumer_position = publication.consumer_position();
        if consumer_position != self.last_position
            || publication.producer_position() <= consumer_position
        {
            self.last_position = consumer_position;
            self.time_of_last_progress = now;
            return 0;
        }

        if now - self.time_of_last_progress > self.timeout_ns {
            self.time_of_last_progress = now;
            if publication.unblock_at_consumer_position() {
                return 1;
            }
        }
        0
    }
}

fn create_input_reader(input: &str) -> anyhow::Result<Box<dyn Read + Send>> {
    if input == "-" {
        tracing::info!("Creating stdin reader");
        Ok(Box::new(io::stdin()))
    } else {
        tracing::info!("Creating file reader for {}", input);
        Ok(Box::new(BufReader::new(File::open(input)?)))
    }
}

/// Offer `message`, waiting out back pressure and log rotation.
fn offer_message(
    publication: &Publisher,
    message: &[u8],
    idle: &mut BackoffIdleStrategy,
) -> anyhow::Result<()> {
    let mut warned = false;
    loop {
        match publication.offer(message) {
            Ok(_) => {
                idle.reset();
                return Ok(());
            }
            Err(OfferError::AdminAction) => continue,
            Err(OfferError::NotConnected) => {
                if !warned {
                    tracing::info!("Waiting for a receiver");
                    warned = true;
                }
                idle.idle(0);
            }
            Err(OfferError::BackPressured) => idle.idle(0),
            Err(e) => return Err(e.into()),
        }
    }
}

fn publish(
    handle: &PublicationHandle,
    mut reader: Box<dyn Read + Send>,
    message_length: usize,
) -> anyhow::Result<u64> {
    let publisher = handle.publisher();
    let mut idle = BackoffIdleStrategy::default();
    let mut buffer = vec![0u8; message_length];
    let mut total_bytes = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::info!("End of input reached");
                return Ok(total_bytes);
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        offer_message(&publisher, &buffer[..n], &mut idle)?;
        total_bytes += n as u64;
    }
}

fn run_sender(mut publication: NetworkPublication, clock: &SystemNanoClock) {
    let handle = publication.handle().clone();
    let mut idle = BackoffIdleStrategy::default();
    while !handle.has_reached_end_of_life() {
        let work_count = publication.send(clock.nano_time());
        idle.idle(work_count);
    }
    tracing::debug!("Sender duty cycle stopped");
}

fn run_receiver(endpoint: &UdpChannelEndpoint, handle: &PublicationHandle) {
    let mut idle = BackoffIdleStrategy::default();
    let mut buf = vec![0u8; 64 * 1024];
    while !handle.has_reached_end_of_life() {
        match endpoint.poll_control(&mut buf) {
            Ok(delivered) => idle.idle(delivered),
            Err(e) => {
                tracing::warn!("Control poll failed: {}", e);
                idle.idle(0);
            }
        }
    }
    tracing::debug!("Receiver duty cycle stopped");
}

fn run_conductor(
    handle: &PublicationHandle,
    host: &mut SenderHost,
    clock: &SystemNanoClock,
    config: &SenderConfig,
) {
    let mut idle = BackoffIdleStrategy::default();
    let mut stall = StallDetector::new(config.unblock_timeout(), clock.nano_time());
    let mut stats_timer = Timer::new(config.stats_interval());
    let start = Instant::now();

    while !handle.has_reached_end_of_life() {
        let now = clock.nano_time();
        let mut work_count = usize::from(handle.update_publishers_limit());
        work_count += handle.clean_log_buffer();
        work_count += stall.check(handle, now);
        handle.on_time_event(now, &mut *host);

        if config.stats_interval_secs > 0 && stats_timer.try_fire() {
            display_compact_stats(handle, &handle.counters().snapshot(), start.elapsed());
        }
        idle.idle(work_count);
    }
    tracing::debug!("Conductor duty cycle stopped");
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    if args.print_config {
        print!("{}", toml::to_string_pretty(&SenderConfig::example())?);
        return Ok(());
    }

    let config = args.sender_config()?;
    let publication_config = config.publication_config()?;
    tracing::info!("Sluice sender starting...");

    let mut endpoint = UdpChannelEndpoint::bind(config.bind, config.destinations.clone())?;
    if let Some(ttl) = config.ttl {
        endpoint.set_multicast_ttl(ttl)?;
    }
    let endpoint = Arc::new(endpoint);
    tracing::info!(
        "Sender bound to {} for {:?}",
        endpoint.local_addr()?,
        endpoint.destinations()
    );

    let clock = SystemNanoClock::new();
    let counters = Arc::new(SystemCounters::new());
    let resources = PublicationResources {
        endpoint: endpoint.clone(),
        flow_control: Box::new(UnicastFlowControl::new()),
        retransmit_handler: Box::new(DefaultRetransmitHandler::from_config(&publication_config)),
        counters: counters.clone(),
        epoch_clock: Arc::new(SystemEpochClock),
        publisher_limit: Position::new(0, 0),
        sender_position: Position::new(1, 0),
    };
    let params = PublicationParams {
        session_id: config.session_id,
        stream_id: config.stream_id,
        initial_term_id: config.initial_term_id,
        config: publication_config,
    };
    let publication = NetworkPublication::new(params, resources, clock.nano_time())?;
    let handle = publication.handle().clone();
    endpoint.register_publication(handle.clone());
    handle.inc_ref();

    let reader = create_input_reader(&config.input)?;
    let start = Instant::now();
    let mut host = SenderHost {
        endpoint: endpoint.clone(),
    };

    let published = crossbeam::thread::scope(|s| {
        s.spawn(|_| run_sender(publication, &clock));
        s.spawn(|_| run_receiver(&endpoint, &handle));
        s.spawn(|_| run_conductor(&handle, &mut host, &clock, &config));

        let published = publish(&handle, reader, config.message_length);
        handle.dec_ref();
        tracing::info!("Draining publication");
        published
    })
    .map_err(|_| anyhow::anyhow!("Duty cycle thread panicked"))??;

    display_counters(&handle, &counters.snapshot(), start.elapsed());
    tracing::info!("Published {} bytes", published);
    Ok(())
}
