use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "skiff-harbor", about = "Room pairing and signaling coordinator")]
pub struct Cli {
    /// Listen port (overrides SKIFF_HARBOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Room lifetime in seconds (overrides SKIFF_ROOM_TTL)
    #[arg(long)]
    pub room_ttl: Option<u64>,

    /// Expiry sweep interval in seconds (overrides SKIFF_SWEEP_INTERVAL)
    #[arg(long)]
    pub sweep_interval: Option<u64>,
}

impl Cli {
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ttl) = self.room_ttl {
            config.room_ttl_seconds = ttl;
        }
        if let Some(interval) = self.sweep_interval {
            config.sweep_interval_seconds = interval;
        }
    }
}
