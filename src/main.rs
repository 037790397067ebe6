use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::net::{IpAddr, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ecmptrace::cli::Args;
use ecmptrace::config::{AddrFamily, Config};
use ecmptrace::export::{render_tables, write_json};
use ecmptrace::lookup::spawn_resolvers;
use ecmptrace::probe::{discover_source_addr, spawn_sender};
use ecmptrace::trace::{merge, spawn_icmp_receiver, spawn_tcp_receiver, Correlator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    let config = Config::try_from(&args)?;

    let target_addr = resolve_in_family(&args.target, config.family)
        .with_context(|| format!("failed to resolve target: {}", args.target))?;

    let src_addr = match &args.src_addr {
        Some(addr) => resolve_in_family(addr, config.family)
            .with_context(|| format!("failed to resolve source address: {}", addr))?,
        None => discover_source_addr(config.family)
            .context("could not identify a source address to trace from")?,
    };

    info!(
        "starting with {} probes per second/ttl, base src port {} and a port span of {}",
        config.probe_rate, config.base_src_port, config.max_src_ports
    );

    // One stop token per TTL; the correlator cancels the ones above the
    // shortest TTL at which the target answers.
    let sender_stops: Vec<CancellationToken> = (0..config.max_ttl)
        .map(|_| CancellationToken::new())
        .collect();

    let mut probe_streams = Vec::new();
    for ttl in config.min_ttl..=config.max_ttl {
        let stop = sender_stops[ttl as usize - 1].clone();
        let stream = spawn_sender(&config, src_addr, target_addr, ttl, stop)
            .with_context(|| format!("failed to start sender for ttl {}", ttl))?;
        probe_streams.push(stream);
    }

    let recv_stop = CancellationToken::new();
    let (icmp_handle, icmp_stream) = spawn_icmp_receiver(config.family, recv_stop.clone())?;
    let (tcp_handle, tcp_stream) = spawn_tcp_receiver(
        config.family,
        target_addr,
        config.target_port,
        config.max_ttl,
        recv_stop.clone(),
    )?;

    // Ctrl-C winds the senders down; the pipeline then drains normally and
    // reports on whatever was collected.
    {
        let stops = sender_stops.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, winding down senders");
                for stop in &stops {
                    stop.cancel();
                }
            }
        });
    }

    let unresolved = merge(vec![icmp_stream, tcp_stream]);
    let resolved = merge(spawn_resolvers(config.num_resolvers, unresolved));
    let probes = merge(probe_streams);

    let correlator = Correlator::new(&config, args.target.clone(), sender_stops, recv_stop);
    let summary = correlator.run(probes, resolved).await;

    for handle in [icmp_handle, tcp_handle] {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "receiver exited with error"),
            Err(_) => warn!("receiver thread panicked"),
        }
    }

    if summary.lossy.is_empty() {
        info!("did not find any faulty paths");
        return Ok(());
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if config.json_output {
        write_json(&mut out, &summary.lossy)?;
    } else {
        render_tables(
            &mut out,
            &summary.lossy,
            config.max_columns,
            summary.last_closed,
        )?;
    }

    Ok(())
}

/// Resolve a hostname or address literal within the configured family.
fn resolve_in_family(host: &str, family: AddrFamily) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if !family.matches(&ip) {
            bail!("address {} is not in family {}", ip, family);
        }
        return Ok(ip);
    }

    let addrs: Vec<IpAddr> = format!("{}:0", host)
        .to_socket_addrs()?
        .map(|sockaddr| sockaddr.ip())
        .collect();

    addrs
        .into_iter()
        .find(|ip| family.matches(ip))
        .ok_or_else(|| anyhow!("no {} addresses found for {}", family, host))
}
