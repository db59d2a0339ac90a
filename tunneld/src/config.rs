//! CLI flags and the optional JSON config file. Flags win over file values.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use crate::capture::Device;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_METHOD: &str = "plain";

#[derive(Parser, Debug)]
#[command(author, version, about = "Server side of an encrypted packet-level tunnel")]
pub struct Args {
    /// Port the tunnel listens on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen device as `name,mac,ip[,ip...]`; repeatable
    #[arg(long = "listen-device")]
    pub listen_devices: Vec<String>,

    /// Device facing the upstream network, same spec format
    #[arg(long)]
    pub upstream_device: Option<String>,

    /// Gateway device, same spec format
    #[arg(long)]
    pub gateway: Option<String>,

    /// Encryption method: plain or aes-gcm
    #[arg(long)]
    pub method: Option<String>,

    /// Shared password for aes-gcm
    #[arg(long)]
    pub password: Option<String>,

    /// JSON config file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose packet logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub listen_devices: Vec<String>,
    pub upstream_device: Option<String>,
    pub gateway: Option<String>,
    pub method: Option<String>,
    pub password: Option<String>,
}

/// Everything the server needs to open, fully resolved.
#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub listen_devices: Vec<Device>,
    pub upstream_device: Device,
    pub gateway: Device,
    pub method: String,
    pub password: String,
    pub verbose: bool,
}

impl Config {
    pub fn resolve(args: Args) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read config file {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parse config file {}", path.display()))?
            }
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    fn merge(args: Args, file: FileConfig) -> anyhow::Result<Self> {
        let listen_specs = if args.listen_devices.is_empty() {
            file.listen_devices
        } else {
            args.listen_devices
        };
        anyhow::ensure!(!listen_specs.is_empty(), "no listen devices configured");

        let mut listen_devices = Vec::with_capacity(listen_specs.len());
        for spec in &listen_specs {
            listen_devices.push(parse_device(spec)?);
        }
        let upstream_device = parse_device(
            &args
                .upstream_device
                .or(file.upstream_device)
                .context("no upstream device configured")?,
        )?;
        let gateway = parse_device(
            &args
                .gateway
                .or(file.gateway)
                .context("no gateway configured")?,
        )?;

        Ok(Self {
            port: args.port.or(file.port).unwrap_or(DEFAULT_PORT),
            listen_devices,
            upstream_device,
            gateway,
            method: args
                .method
                .or(file.method)
                .unwrap_or_else(|| DEFAULT_METHOD.to_string()),
            password: args.password.or(file.password).unwrap_or_default(),
            verbose: args.verbose,
        })
    }
}

fn parse_device(spec: &str) -> anyhow::Result<Device> {
    spec.parse().map_err(|e: String| anyhow::anyhow!(e))
}
