use std::{net::SocketAddr, ops::RangeInclusive, time::Duration};

use anyhow::Context;

const DEFAULT_GAME_PORTS: RangeInclusive<u16> = 27015..=27515;
const DEFAULT_RCON_PORTS: RangeInclusive<u16> = 28015..=28515;
const DEFAULT_LOG_BUFFER_LINES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRanges {
    /// Scanned in steps of 2; the UDP port is always `game + 1`.
    pub game: RangeInclusive<u16>,
    pub rcon: RangeInclusive<u16>,
}

impl Default for PortRanges {
    fn default() -> Self {
        Self {
            game: DEFAULT_GAME_PORTS,
            rcon: DEFAULT_RCON_PORTS,
        }
    }
}

impl PortRanges {
    pub fn new(game: RangeInclusive<u16>, rcon: RangeInclusive<u16>) -> anyhow::Result<Self> {
        if game.is_empty() || rcon.is_empty() {
            anyhow::bail!("port ranges must not be empty");
        }
        // game range covers udp ports too (game + 1)
        let game_hi = game.end().saturating_add(1);
        if *rcon.start() <= game_hi && *game.start() <= *rcon.end() {
            anyhow::bail!(
                "game ports {}-{} overlap rcon ports {}-{}",
                game.start(),
                game_hi,
                rcon.start(),
                rcon.end()
            );
        }
        Ok(Self { game, rcon })
    }
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub listen_addr: SocketAddr,
    pub ledger: LedgerBackend,
    pub database_url: Option<String>,
    pub agent_token: Option<String>,
    /// Deadline for ordinary agent round trips.
    pub request_timeout: Duration,
    /// Deadline for create/rebuild, which may pull images.
    pub provision_timeout: Duration,
    pub ports: PortRanges,
    pub log_buffer_lines: usize,
    pub sync_interval: Option<Duration>,
    pub intent_grace: Duration,
    pub release_ports_on_delete: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8080).into(),
            ledger: LedgerBackend::Memory,
            database_url: None,
            agent_token: None,
            request_timeout: Duration::from_secs(30),
            provision_timeout: Duration::from_secs(10 * 60),
            ports: PortRanges::default(),
            log_buffer_lines: DEFAULT_LOG_BUFFER_LINES,
            sync_interval: Some(Duration::from_secs(60)),
            intent_grace: Duration::from_secs(300),
            release_ports_on_delete: false,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

fn env_flag(name: &str) -> bool {
    matches!(
        env_string(name)
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_timeout_ms(raw: Option<u64>, default_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(raw.unwrap_or(default_ms).clamp(1000, max_ms))
}

pub fn parse_port_range(raw: &str) -> anyhow::Result<RangeInclusive<u16>> {
    let (lo, hi) = raw
        .trim()
        .split_once('-')
        .with_context(|| format!("port range must look like start-end: {raw:?}"))?;
    let lo: u16 = lo.trim().parse().with_context(|| format!("bad range start: {lo:?}"))?;
    let hi: u16 = hi.trim().parse().with_context(|| format!("bad range end: {hi:?}"))?;
    if lo == 0 || lo > hi {
        anyhow::bail!("invalid port range {lo}-{hi}");
    }
    Ok(lo..=hi)
}

fn parse_ledger(raw: Option<&str>, has_database_url: bool) -> anyhow::Result<LedgerBackend> {
    match raw.map(|v| v.to_ascii_lowercase()) {
        None if has_database_url => Ok(LedgerBackend::Postgres),
        None => Ok(LedgerBackend::Memory),
        Some(v) if v == "memory" => Ok(LedgerBackend::Memory),
        Some(v) if v == "postgres" => Ok(LedgerBackend::Postgres),
        Some(v) => anyhow::bail!("unknown GARRISON_LEDGER: {v}"),
    }
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = match env_string("GARRISON_LISTEN") {
            Some(v) => v
                .parse()
                .with_context(|| format!("invalid GARRISON_LISTEN: {v}"))?,
            None => defaults.listen_addr,
        };

        let database_url = env_string("DATABASE_URL");
        let ledger = parse_ledger(
            env_string("GARRISON_LEDGER").as_deref(),
            database_url.is_some(),
        )?;
        if ledger == LedgerBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL is required for the postgres ledger");
        }

        let game = match env_string("GARRISON_GAME_PORTS") {
            Some(v) => parse_port_range(&v)?,
            None => defaults.ports.game.clone(),
        };
        let rcon = match env_string("GARRISON_RCON_PORTS") {
            Some(v) => parse_port_range(&v)?,
            None => defaults.ports.rcon.clone(),
        };

        let sync_interval = match env_u64("GARRISON_SYNC_INTERVAL_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs.clamp(5, 24 * 3600))),
            None => defaults.sync_interval,
        };

        Ok(Self {
            listen_addr,
            ledger,
            database_url,
            agent_token: env_string("GARRISON_AGENT_CONNECT_TOKEN"),
            request_timeout: parse_timeout_ms(
                env_u64("GARRISON_AGENT_TIMEOUT_MS"),
                30_000,
                10 * 60_000,
            ),
            provision_timeout: parse_timeout_ms(
                env_u64("GARRISON_PROVISION_TIMEOUT_MS"),
                10 * 60_000,
                60 * 60_000,
            ),
            ports: PortRanges::new(game, rcon)?,
            log_buffer_lines: env_u64("GARRISON_LOG_BUFFER_LINES")
                .map(|v| (v as usize).clamp(100, 50_000))
                .unwrap_or(DEFAULT_LOG_BUFFER_LINES),
            sync_interval,
            intent_grace: Duration::from_secs(
                env_u64("GARRISON_INTENT_GRACE_SECS")
                    .unwrap_or(300)
                    .clamp(10, 24 * 3600),
            ),
            release_ports_on_delete: env_flag("GARRISON_RELEASE_PORTS_ON_DELETE"),
        })
    }
}
