//! Server side of an encrypted packet-level tunnel.
//!
//! Clients ship whole IP packets inside an encrypted TCP stream to the
//! listen port. The server synthesizes the TCP session at raw-frame level,
//! rewrites each inner packet to originate from its own upstream address,
//! and translates replies back through a NAT table onto the same stream.
//!
//! Usage:
//!   tunneld --port 8080 \
//!       --listen-device eth0,52:54:00:00:00:01,192.0.2.1 \
//!       --upstream-device eth1,52:54:00:00:00:03,203.0.113.7 \
//!       --gateway gw,52:54:00:00:00:02,192.0.2.254 \
//!       --method aes-gcm --password secret

mod capture;
mod config;
mod crypt;
mod error;
mod nat;
mod server;
mod session;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use crate::capture::{Connection, Filter};
use crate::config::{Args, Config};
use crate::server::Server;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = Config::resolve(args)?;
    let crypt = crypt::from_method(&config.method, &config.password)?;

    let mut listeners = Vec::with_capacity(config.listen_devices.len());
    for device in &config.listen_devices {
        // A loopback listener talks to itself; everything else replies via
        // the gateway.
        let dst = if device.loopback {
            device.clone()
        } else {
            config.gateway.clone()
        };
        let conn = Connection::open_raw(device.clone(), dst, Filter::Listen { port: config.port })
            .with_context(|| format!("open listen capture on {device}"))?;
        listeners.push(conn);
    }
    let upstream = Connection::open_raw(
        config.upstream_device.clone(),
        config.gateway.clone(),
        Filter::Upstream { port: config.port },
    )
    .with_context(|| format!("open upstream capture on {}", config.upstream_device))?;

    info!("tunneld listening on port {} ({})", config.port, config.method);
    info!("upstream {} via gateway {}", config.upstream_device, config.gateway);

    let server = Arc::new(Server::new(config.port, listeners, upstream, crypt)?);
    server.run().context("capture loop failed")?;
    Ok(())
}
