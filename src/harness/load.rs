//! Timed load generator.
//!
//! Sends a chunk of `b'A'` bytes to the target as fast as the socket
//! accepts it until the configured duration has elapsed, sampling TCP
//! telemetry along the way.

use crate::config::LoadConfig;
use crate::net;
use crate::runtime::{InterestSet, MioReactor, Reactor, Readiness};
use crate::stats::Throughput;
use crate::tcp_info;
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Write};
use std::time::Instant;
use tracing::{debug, info};

const STREAM: Token = Token(0);

/// Run the generator and log the final rate.
pub fn run(config: &LoadConfig) -> io::Result<()> {
    let total = generate(config)?;
    info!(target_addr = %config.target, "Total Data Sent: {:.6} GB, Rate: {:.6} Gbps", total.gigabytes(), total.gbps());
    Ok(())
}

/// Send until the deadline. The returned rate is computed over the
/// configured duration.
pub fn generate(config: &LoadConfig) -> io::Result<Throughput> {
    let chunk = vec![b'A'; config.chunk_size];
    let mut reactor = MioReactor::new(16)?;
    let mut stream = net::connect(config.target, &config.socket)?;
    reactor.register(&mut stream, STREAM, InterestSet::WRITABLE)?;

    let start = Instant::now();
    let deadline = start + config.duration;
    let mut next_sample = config.sample_interval.map(|every| start + every);
    let mut sent: u64 = 0;
    let mut ready = Vec::new();

    info!(target_addr = %config.target, duration_s = config.duration.as_secs_f64(), "Sending load");

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        if let (Some(at), Some(every)) = (next_sample, config.sample_interval) {
            if now >= at {
                log_telemetry(&stream, sent);
                next_sample = Some(at + every);
            }
        }

        let wake = next_sample.map_or(deadline, |at| at.min(deadline));
        ready.clear();
        reactor.wait(&mut ready, Some(wake.saturating_duration_since(now)))?;

        for event in &ready {
            check_event(&stream, event)?;
            if event.writable {
                sent += send_until_blocked(&mut stream, &chunk, deadline)?;
            }
        }
    }

    let _ = reactor.deregister(&mut stream);
    Ok(Throughput::new(sent, config.duration))
}

fn check_event(stream: &TcpStream, event: &Readiness) -> io::Result<()> {
    if event.error || event.write_closed {
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        return Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "target closed the connection",
        ));
    }
    Ok(())
}

/// Write `chunk` repeatedly until the socket pushes back or time runs out.
fn send_until_blocked(stream: &mut TcpStream, chunk: &[u8], deadline: Instant) -> io::Result<u64> {
    let mut sent = 0u64;
    while Instant::now() < deadline {
        match stream.write(chunk) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => sent += n as u64,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Still connecting
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => break,
            Err(e) => return Err(e),
        }
    }
    Ok(sent)
}

fn log_telemetry(stream: &TcpStream, sent: u64) {
    match tcp_info::sample(stream) {
        Ok(t) => info!(bytes_sent = sent, "{t}"),
        Err(e) => debug!(error = %e, "TCP telemetry unavailable"),
    }
}
