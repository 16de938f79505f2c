use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scenario_engine::cache::MemoryCache;
use scenario_engine::config;
use scenario_engine::io::CsvWriter;
use scenario_engine::{
    ScenarioEngine, ScenarioRequest, ScenarioResponse, ScenarioType, SimulationSettings,
    SiteRegistry,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SCHEMA_VERSION: &str = "1.0.0";
const PROGRAM_ID: &str = "ScenarioIntelligence-ENGINE";

#[derive(Parser, Debug)]
#[command(name = "scenario-engine")]
#[command(version)]
#[command(about = "Scenario Intelligence Engine - what-if projections of protected-site value")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML configuration file
    #[arg(short, long, global = true, default_value = "config/engine.toml")]
    config: PathBuf,

    /// Site registry (overrides [sites].registry)
    #[arg(long, global = true)]
    sites: Option<PathBuf>,

    /// Output path stem; writes <out>.csv and the <out>.json result bundle
    #[arg(short, long, global = true)]
    out: Option<PathBuf>,

    /// Print the full response as JSON on stdout
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate a JSON ScenarioRequest file
    Run {
        request: PathBuf,
    },
    /// Project a site under an SSP pathway
    Climate {
        site: String,
        #[arg(long, default_value = "SSP2-4.5")]
        ssp: String,
        #[arg(long, default_value = "2050")]
        year: i32,
    },
    /// Value a site as if protection were removed
    Counterfactual {
        site: String,
    },
    /// Reef biomass threshold analysis
    Tipping {
        site: String,
    },
    /// Correlated portfolio stress test
    Stress {
        /// Comma-separated site list
        #[arg(value_delimiter = ',', required = true)]
        sites: Vec<String>,
        /// warming, acidification, storm or compound
        #[arg(long, default_value = "compound")]
        stress_type: String,
        #[arg(long, default_value = "SSP2-4.5")]
        ssp: String,
        #[arg(long, default_value = "25")]
        horizon: u32,
    },
    /// Real-options valuation of a conservation investment
    Options {
        site: String,
        #[arg(long)]
        investment: f64,
        #[arg(long, default_value = "0.04")]
        discount_rate: f64,
        #[arg(long, default_value = "20")]
        horizon: u32,
        /// Share of value retained without the intervention
        #[arg(long)]
        retention: Option<f64>,
    },
    /// Blue-carbon credit revenue
    Carbon {
        site: String,
        #[arg(long)]
        price_scenario: Option<String>,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        verified_fraction: Option<f64>,
        #[arg(long)]
        area_ha: Option<f64>,
    },
    /// List registered sites
    Sites,
    /// Validate the configuration and site registry
    Validate,
    /// Print version information
    Version,
}

// ============================================================================
// JSON Output Structures
// ============================================================================

#[derive(Serialize)]
struct Manifest {
    schema_version: String,
    engine_version: String,
    program_id: String,
    timestamp_utc: String,
    platform: String,
    config_hash: String,
    config_snapshot: config::Root,
    simulation: SimulationSettings,
}

#[derive(Serialize)]
struct ResultBundle<'a> {
    manifest: Manifest,
    wall_time_ms: f64,
    response: &'a ScenarioResponse,
}

// ============================================================================
// Helper Functions
// ============================================================================

fn compute_hash(data: &str) -> String {
    Sha256::digest(data.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn create_manifest(cfg: &config::Root, cfg_text: &str) -> Manifest {
    Manifest {
        schema_version: SCHEMA_VERSION.to_string(),
        engine_version: VERSION.to_string(),
        program_id: PROGRAM_ID.to_string(),
        timestamp_utc: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        platform: std::env::consts::OS.to_string(),
        config_hash: compute_hash(cfg_text),
        config_snapshot: cfg.clone(),
        simulation: cfg.settings(),
    }
}

fn load_registry(
    cfg: &config::Root,
    cfg_path: &Path,
    override_path: Option<&Path>,
) -> Result<SiteRegistry> {
    let path = match override_path {
        Some(p) => p.to_path_buf(),
        None => cfg
            .registry_path(cfg_path)
            .context("no site registry: set [sites].registry or pass --sites")?,
    };
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read site registry {}", path.display()))?;
    let registry = SiteRegistry::from_toml_str(&text)
        .with_context(|| format!("invalid site registry {}", path.display()))?;
    info!(path = %path.display(), sites = registry.len(), "site registry loaded");
    Ok(registry)
}

fn request_for(command: &Commands) -> Result<Option<ScenarioRequest>> {
    let req = match command {
        Commands::Run { request } => {
            let text = fs::read_to_string(request)
                .with_context(|| format!("failed to read request {}", request.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("malformed request {}", request.display()))?
        }
        Commands::Climate { site, ssp, year } => ScenarioRequest::climate(site, ssp, *year),
        Commands::Counterfactual { site } => {
            ScenarioRequest::new(ScenarioType::Counterfactual, &[site.as_str()])
        }
        Commands::Tipping { site } => {
            ScenarioRequest::new(ScenarioType::TippingPoint, &[site.as_str()])
        }
        Commands::Stress { sites, stress_type, ssp, horizon } => {
            let names: Vec<&str> = sites.iter().map(String::as_str).collect();
            ScenarioRequest::new(ScenarioType::Portfolio, &names)
                .with_horizon(*horizon)
                .with_assumption("stress_type", stress_type.as_str())
                .with_assumption("ssp_scenario", ssp.as_str())
        }
        Commands::Options { site, investment, discount_rate, horizon, retention } => {
            let mut req = ScenarioRequest::new(ScenarioType::Intervention, &[site.as_str()])
                .with_horizon(*horizon)
                .with_assumption("investment_usd", *investment)
                .with_assumption("discount_rate", *discount_rate);
            if let Some(r) = retention {
                req = req.with_assumption("counterfactual_retention", *r);
            }
            req
        }
        Commands::Carbon { site, price_scenario, price, verified_fraction, area_ha } => {
            let mut req = ScenarioRequest::new(ScenarioType::Market, &[site.as_str()]);
            if let Some(s) = price_scenario {
                req = req.with_assumption("carbon_price_scenario", s.as_str());
            }
            if let Some(p) = price {
                req = req.with_assumption("carbon_price_usd", *p);
            }
            if let Some(v) = verified_fraction {
                req = req.with_assumption("verified_fraction", *v);
            }
            if let Some(a) = area_ha {
                req = req.with_assumption("habitat_area_ha", *a);
            }
            req
        }
        Commands::Sites | Commands::Validate | Commands::Version => return Ok(None),
    };
    Ok(Some(req))
}

// ============================================================================
// Run Modes
// ============================================================================

fn run_scenario(args: &Args, request: ScenarioRequest) -> Result<()> {
    let (cfg, cfg_text) = config::Root::load(&args.config)?;
    info!("{} v{} - {}", cfg.engine.program, cfg.engine.version, cfg.engine.module);

    let tables = cfg.tables()?;
    let sites = load_registry(&cfg, &args.config, args.sites.as_deref())?;
    let cache = cfg.cache.as_ref().map(|c| MemoryCache::new(c.capacity, c.ttl()));

    let mut engine = ScenarioEngine::new(&tables, &sites, cfg.settings());
    if let Some(ref cache) = cache {
        engine = engine.with_cache(cache);
    }

    let start = Instant::now();
    let response = engine.run(&request);
    let wall_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    if response.is_fail_closed() {
        warn!(caveats = ?response.caveats, "no projection computed");
    } else {
        info!(
            confidence = response.confidence,
            p5 = response.uncertainty.p5,
            p95 = response.uncertainty.p95,
            wall_time_ms,
            "scenario complete"
        );
    }
    println!("{}", response.answer);

    if let Some(ref out) = args.out {
        let bundle = ResultBundle {
            manifest: create_manifest(&cfg, &cfg_text),
            wall_time_ms,
            response: &response,
        };
        write_outputs(out, &bundle)?;
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    Ok(())
}

/// Writes `<out>.csv` and `<out>.json`, returning both paths.
fn write_outputs(out: &Path, bundle: &ResultBundle) -> Result<(PathBuf, PathBuf)> {
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let csv_path = out.with_extension("csv");
    let mut w = CsvWriter::create(&csv_path)?;
    w.write_header()?;
    w.write_response(bundle.response)?;
    w.flush()?;
    info!(path = %csv_path.display(), "CSV deltas written");

    let json_path = out.with_extension("json");
    fs::write(&json_path, serde_json::to_string_pretty(bundle)?)
        .with_context(|| format!("failed to write {}", json_path.display()))?;
    info!(path = %json_path.display(), "JSON bundle written");
    Ok((csv_path, json_path))
}

fn list_sites(args: &Args) -> Result<()> {
    let (cfg, _) = config::Root::load(&args.config)?;
    let sites = load_registry(&cfg, &args.config, args.sites.as_deref())?;
    for s in sites.sites() {
        println!(
            "{:<18} {:<18} {:>14.0} USD/yr  {}",
            s.id,
            s.habitat,
            s.total_esv(),
            s.name
        );
    }
    Ok(())
}

fn validate_config(args: &Args) -> Result<()> {
    let (cfg, cfg_text) = config::Root::load(&args.config)?;
    cfg.tables()?;
    println!("config OK: {} (sha256 {})", args.config.display(), &compute_hash(&cfg_text)[..16]);
    match load_registry(&cfg, &args.config, args.sites.as_deref()) {
        Ok(sites) => {
            if sites.is_empty() {
                bail!("site registry is empty");
            }
            println!("site registry OK: {} sites", sites.len());
        }
        Err(e) if cfg.sites.is_none() && args.sites.is_none() => {
            println!("site registry not configured ({})", e);
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

fn print_version() {
    println!("scenario-engine {}", VERSION);
    println!("  schema  {}", SCHEMA_VERSION);
    println!("  program {}", PROGRAM_ID);
    println!(
        "  engines counterfactual, climate, tipping_point, shock/portfolio, intervention, market"
    );
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Validate => validate_config(&args),
        Commands::Sites => list_sites(&args),
        _ => {
            let request = request_for(&args.command)?
                .context("command does not describe a scenario")?;
            run_scenario(&args, request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenario_engine::ScenarioError;

    #[test]
    fn out_stem_writes_csv_and_json() {
        let cfg_text = include_str!("../config/engine.toml");
        let cfg = config::Root::from_toml_str(cfg_text).unwrap();
        let request = ScenarioRequest::new(ScenarioType::Counterfactual, &["atlantis"]);
        let response = ScenarioResponse::fail_closed(request, &ScenarioError::invalid("demo"));
        let bundle = ResultBundle {
            manifest: create_manifest(&cfg, cfg_text),
            wall_time_ms: 1.0,
            response: &response,
        };

        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("runs/result");
        let (csv_path, json_path) = write_outputs(&stem, &bundle).unwrap();
        assert_eq!(csv_path, dir.path().join("runs/result.csv"));
        assert!(fs::read_to_string(&csv_path).unwrap().starts_with("scenario_type,"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(json["manifest"]["config_hash"], compute_hash(cfg_text));
        assert_eq!(json["response"]["confidence"], 0.0);
    }
}
