#![forbid(unsafe_code)]
//! Workload drivers behind `dmc-cli`.
//!
//! These stand in for the cache target (which issues `map` per bio) and the
//! metadata layer (which walks mappings at commit and loads them at
//! activation) so the policy can be exercised without a block device.

use anyhow::{Context, Result, ensure};
use dmc_hint::{HintLayout, MAX_HINT_WIDTH};
use dmc_policy::{CacheBlock, HintsPolicy, MapOutcome, OriginBlock, PolicyError, PolicyStats};
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

/// Block size used by the drivers, in sectors (32 KiB).
const DRIVER_BLOCK_SECTORS: u64 = 64;

// ── Deterministic RNG ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Rng64 {
    state: u64,
}

impl Rng64 {
    fn seeded(seed: u64) -> Self {
        Self {
            state: seed.wrapping_add(0x9E37_79B9_7F4A_7C15),
        }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut mixed = self.state;
        mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        mixed ^ (mixed >> 31)
    }

    fn below(&mut self, upper: u64) -> u64 {
        if upper <= 1 {
            return 0;
        }
        self.next_u64() % upper
    }
}

fn make_policy(cache_size: u32, span: u64, hint_size: Option<usize>) -> Result<HintsPolicy> {
    let policy = HintsPolicy::create(
        cache_size,
        span.saturating_mul(DRIVER_BLOCK_SECTORS),
        DRIVER_BLOCK_SECTORS,
    )
    .context("create policy")?;
    if let Some(width) = hint_size {
        policy.set_hint_width(width).context("set hint width")?;
    }
    Ok(policy)
}

// ── simulate ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateConfig {
    pub cache_size: u32,
    pub hint_size: Option<usize>,
    pub operations: u64,
    /// Number of distinct origin blocks the workload touches.
    pub span: u64,
    /// Percentage of requests sent to the hottest tenth of the span.
    pub hot_percent: u64,
    /// One request in `remove_every` drops a mapping instead.
    pub remove_every: u64,
    pub seed: u64,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            cache_size: 1024,
            hint_size: None,
            operations: 100_000,
            span: 8192,
            hot_percent: 80,
            remove_every: 97,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulateReport {
    pub config: SimulateConfig,
    /// Cache device capacity, `None` if it overflows `u64`.
    pub cache_bytes: Option<u64>,
    pub residency: usize,
    pub hit_ratio: f64,
    pub stats: PolicyStats,
}

pub fn run_simulation(config: &SimulateConfig) -> Result<SimulateReport> {
    ensure!(config.span > 0, "span must be > 0");
    ensure!(config.hot_percent <= 100, "hot percent must be <= 100");
    let policy = make_policy(config.cache_size, config.span, config.hint_size)?;
    let mut rng = Rng64::seeded(config.seed);
    let hot_span = (config.span / 10).max(1);

    for step in 0..config.operations {
        let oblock = if rng.below(100) < config.hot_percent {
            OriginBlock(rng.below(hot_span))
        } else {
            OriginBlock(rng.below(config.span))
        };

        if config.remove_every > 0 && step % config.remove_every == 0 {
            if policy.lookup(oblock).is_ok() {
                policy.remove_mapping(oblock).context("remove mapping")?;
            }
            continue;
        }

        if let MapOutcome::Replace { old_oblock, .. } =
            policy.map(oblock, true, true).context("map")?
        {
            trace!(target: "dmc::cli", event = "invalidate", old_oblock = old_oblock.0);
        }
        if step % 4096 == 0 {
            policy.tick();
        }
    }

    let stats = policy.stats().context("read stats")?;
    let lookups = stats.hits + stats.misses;
    #[expect(clippy::cast_precision_loss)]
    let hit_ratio = if lookups == 0 {
        0.0
    } else {
        stats.hits as f64 / lookups as f64
    };
    let report = SimulateReport {
        config: config.clone(),
        cache_bytes: policy.geometry().cache_bytes(),
        residency: policy.residency(),
        hit_ratio,
        stats,
    };
    info!(
        target: "dmc::cli",
        event = "simulate_done",
        residency = report.residency,
        hit_ratio = report.hit_ratio
    );
    policy.destroy();
    Ok(report)
}

// ── roundtrip ───────────────────────────────────────────────────────────

/// One mapping as the metadata layer would persist it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMapping {
    pub cblock: u32,
    pub oblock: u64,
    pub hint: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundtripConfig {
    pub cache_size: u32,
    pub hint_size: usize,
    pub operations: u64,
    /// Flip one byte in every `corrupt_every`-th persisted hint (0 = never).
    pub corrupt_every: usize,
    pub seed: u64,
}

impl Default for RoundtripConfig {
    fn default() -> Self {
        Self {
            cache_size: 256,
            hint_size: 40,
            operations: 10_000,
            corrupt_every: 0,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundtripReport {
    pub persisted: usize,
    pub loaded: usize,
    pub hint_mismatches: usize,
    pub corrupted: usize,
    /// Reloaded mappings that resolve to the persisted cache block.
    pub verified: usize,
}

/// Attempts a commit makes while the policy lock is contended.
const COMMIT_ATTEMPTS: u32 = 64;

/// Commit every mapping of `policy` into an in-memory metadata store.
///
/// A walk that finds the lock held is retried; any other error is fatal.
pub fn commit_mappings(policy: &HintsPolicy) -> Result<Vec<PersistedMapping>> {
    let mut attempt = 0;
    loop {
        let mut store = Vec::with_capacity(policy.residency());
        let walked = policy.walk_mappings::<_, PolicyError>(|cblock, oblock, hint| {
            store.push(PersistedMapping {
                cblock: cblock.0,
                oblock: oblock.0,
                hint: hint.to_vec(),
            });
            Ok(())
        });
        match walked {
            Ok(()) => return Ok(store),
            Err(err) if err.is_retryable() && attempt + 1 < COMMIT_ATTEMPTS => {
                attempt += 1;
                trace!(target: "dmc::cli", event = "commit_retry", attempt);
                std::thread::yield_now();
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("walk mappings (attempt {})", attempt + 1));
            }
        }
    }
}

/// Load a committed store into `policy`, counting hint mismatches.
pub fn load_mappings(policy: &HintsPolicy, store: &[PersistedMapping]) -> Result<(usize, usize)> {
    let hint_valid = policy.hint_width().is_some();
    let mut loaded = 0;
    let mut mismatches = 0;
    for record in store {
        match policy.load_mapping(
            OriginBlock(record.oblock),
            CacheBlock(record.cblock),
            &record.hint,
            hint_valid,
        ) {
            Ok(()) => loaded += 1,
            Err(err @ PolicyError::Mismatch { .. }) => {
                warn!(target: "dmc::cli", event = "hint_mismatch", oblock = record.oblock, error = %err);
                loaded += 1;
                mismatches += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("load oblock {}", record.oblock));
            }
        }
    }
    Ok((loaded, mismatches))
}

pub fn run_roundtrip(config: &RoundtripConfig) -> Result<RoundtripReport> {
    let span = u64::from(config.cache_size) * 4;
    let source = make_policy(config.cache_size, span, Some(config.hint_size))?;
    let mut rng = Rng64::seeded(config.seed);
    for _ in 0..config.operations {
        source
            .map(OriginBlock(rng.below(span)), true, true)
            .context("map")?;
    }

    let mut store = commit_mappings(&source)?;
    let mut corrupted = 0;
    if config.corrupt_every > 0 {
        for record in store.iter_mut().step_by(config.corrupt_every) {
            let at = usize::try_from(rng.below(record.hint.len() as u64))
                .context("corruption offset")?;
            record.hint[at] ^= 0xa5;
            corrupted += 1;
        }
    }

    let target = make_policy(config.cache_size, span, Some(config.hint_size))?;
    let (loaded, hint_mismatches) = load_mappings(&target, &store)?;
    let verified = store
        .iter()
        .filter(|r| target.lookup(OriginBlock(r.oblock)) == Ok(CacheBlock(r.cblock)))
        .count();

    Ok(RoundtripReport {
        persisted: store.len(),
        loaded,
        hint_mismatches,
        corrupted,
        verified,
    })
}

// ── selftest ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SelftestReport {
    pub widths_checked: usize,
    pub fields_checked: usize,
}

/// Encode and verify a hint for every width in `1..=max_width`.
pub fn run_hint_selftest(max_width: usize) -> Result<SelftestReport> {
    ensure!(
        (1..=MAX_HINT_WIDTH).contains(&max_width),
        "max width must be in 1..={MAX_HINT_WIDTH}"
    );
    let mut fields_checked = 0;
    for width in 1..=max_width {
        let layout = HintLayout::new(width)?;
        let mut buf = vec![0_u8; width];
        layout.encode(&mut buf)?;
        layout
            .decode_and_verify(&buf)
            .with_context(|| format!("hint width {width}"))?;
        fields_checked += layout.field_count();
    }
    Ok(SelftestReport {
        widths_checked: max_width,
        fields_checked,
    })
}
