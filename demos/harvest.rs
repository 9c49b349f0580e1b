use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;

use rustice::config::{HarvestConfig, StaticMapping};
use rustice::error::Result;
use rustice::harvest::HarvestOrchestrator;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// STUN server, as host or host:port.
    /// example: --stun stun.l.google.com:19302 --stun stun.miwifi.com
    #[arg(short, long)]
    stun: Option<Vec<String>>,
    /// Static mapping, as local_ip/public_ip or local_ip:port/public_ip:port.
    /// example: --mapping 10.0.0.5:5000/203.0.113.9:5000
    #[arg(short, long)]
    mapping: Option<Vec<String>>,
    /// Query the cloud metadata service even when the host does not
    /// look like a cloud instance
    #[arg(long)]
    cloud: bool,
    /// Per-attempt wait for one binding response, in milliseconds
    #[arg(short, long)]
    timeout: Option<u64>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let Args {
        stun,
        mapping,
        cloud,
        timeout,
    } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let mut config = HarvestConfig::default();
    if let Some(stun) = stun {
        config = config.set_stun_servers(stun);
    }
    if let Some(mapping) = mapping {
        let mappings = mapping
            .iter()
            .enumerate()
            .map(|(index, arg)| parse_mapping(index, arg))
            .collect();
        config = config.set_static_mappings(mappings);
    }
    if cloud {
        config = config
            .set_enable_cloud_harvester(true)
            .set_force_cloud_harvester(true);
    }
    if let Some(timeout) = timeout {
        config = config.set_probe_timeout(Duration::from_millis(timeout));
    }
    config.check()?;

    let orchestrator = HarvestOrchestrator::new(config);
    let harvesters = orchestrator.harvesters().await;
    if harvesters.is_empty() {
        println!("no usable address mappings were discovered");
    }
    for harvester in harvesters {
        println!("{harvester}");
    }
    if orchestrator.stun_discovery_failed() {
        println!("binding discovery failed for every configured server");
    }
    Ok(())
}

fn parse_mapping(index: usize, arg: &str) -> StaticMapping {
    let (local, public) = arg
        .split_once('/')
        .expect("--mapping expects local/public");
    let (local_ip, local_port) = parse_side(local);
    let (public_ip, public_port) = parse_side(public);
    let mut mapping = StaticMapping::new(format!("static-{index}"), local_ip, public_ip);
    match (local_port, public_port) {
        (Some(local_port), Some(public_port)) => {
            mapping = mapping.set_ports(local_port, public_port);
        }
        (None, None) => {}
        _ => panic!("--mapping expects ports on both sides or neither"),
    }
    mapping
}

fn parse_side(side: &str) -> (IpAddr, Option<u16>) {
    if let Some((ip, port)) = side.rsplit_once(':') {
        if let Ok(ip) = IpAddr::from_str(ip) {
            return (ip, Some(u16::from_str(port).expect("--mapping error")));
        }
    }
    (IpAddr::from_str(side).expect("--mapping error"), None)
}
