use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub room_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub max_code_attempts: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("SKIFF_HARBOR_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            room_ttl_seconds: env::var("SKIFF_ROOM_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(86_400), // 24 hours
            sweep_interval_seconds: env::var("SKIFF_SWEEP_INTERVAL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(3_600),
            max_code_attempts: env::var("SKIFF_CODE_ATTEMPTS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(16),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            room_ttl_seconds: 86_400,
            sweep_interval_seconds: 3_600,
            max_code_attempts: 16,
        }
    }
}
