use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use reap_api::{Owner, ReconcileOptions, Reconciler};
use reap_core::{Action, ObjRef};
use reap_persist::{BaselineStore, SqliteStore};
use reap_store::{diff, DiffInput, Inventory};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "reapctl", version, about = "Reap CLI: track applied objects and prune what was dropped")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an inventory from manifest files (offline)
    Build {
        /// Manifest files (multi-document YAML)
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
    },
    /// List objects in the previous inventory that the current one no longer has (offline)
    Diff {
        /// Inventory JSON produced by the running reconciliation
        #[arg(long = "current")]
        current: PathBuf,
        /// Inventory JSON from an earlier reconciliation
        #[arg(long = "previous")]
        previous: PathBuf,
    },
    /// Apply manifests for an owner, prune dropped objects and commit the baseline
    Apply {
        /// Owner of the inventory, as namespace/name
        #[arg(long = "owner", env = "REAP_OWNER")]
        owner: String,
        /// Manifest files (multi-document YAML)
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
        /// Leave stale objects on the cluster
        #[arg(long = "no-prune", action = ArgAction::SetTrue)]
        no_prune: bool,
        /// Server-side dry run; nothing is pruned or committed
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Take over fields owned by other field managers
        #[arg(long = "force-conflicts", action = ArgAction::Set, default_value_t = true)]
        force_conflicts: bool,
    },
    /// Delete every object recorded for an owner and forget its baseline
    Delete {
        /// Owner of the inventory, as namespace/name
        #[arg(long = "owner", env = "REAP_OWNER")]
        owner: String,
        /// List what would be deleted; delete nothing
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Show the persisted baseline of an owner
    Baseline {
        /// Owner of the inventory, as namespace/name
        #[arg(long = "owner", env = "REAP_OWNER")]
        owner: String,
        /// Number of revisions to show, newest first
        #[arg(long = "history", default_value_t = 1)]
        history: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("REAP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REAP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REAP_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_manifests(files: &[PathBuf]) -> Result<Vec<serde_json::Value>> {
    let mut out = Vec::new();
    for f in files {
        let yaml = std::fs::read_to_string(f).with_context(|| format!("reading {}", f.display()))?;
        out.extend(reap_apply::read_objects(&yaml).with_context(|| format!("parsing {}", f.display()))?);
    }
    Ok(out)
}

fn read_inventory(path: &Path) -> Result<Inventory> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing inventory {}", path.display()))
}

fn print_refs(output: Output, refs: &[ObjRef]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<28} {:<24} {:<16} NAME", "APIVERSION", "KIND", "NAMESPACE");
            for r in refs {
                println!("{:<28} {:<24} {:<16} {}", r.api_version(), r.kind, r.namespace.as_deref().unwrap_or("-"), r.name);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(refs)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { files } => {
            let objects = read_manifests(&files)?;
            let cs = reap_apply::change_set_from_objects(&objects, Action::Created)?;
            let mut inv = Inventory::new();
            inv.add_change_set(cs)?;
            info!(objects = objects.len(), entries = inv.len(), "inventory built");
            match cli.output {
                Output::Human => print_refs(cli.output, &inv.list()?)?,
                Output::Json => println!("{}", serde_json::to_string_pretty(&inv)?),
            }
        }
        Commands::Diff { current, previous } => {
            let current = read_inventory(&current)?;
            let previous = read_inventory(&previous)?;
            let stale = diff(DiffInput { current: &current, previous: &previous })?;
            info!(current = current.len(), previous = previous.len(), stale = stale.len(), "diff computed");
            print_refs(cli.output, &stale)?;
        }
        Commands::Apply { owner, files, no_prune, dry_run, force_conflicts } => {
            let owner = Owner::from_str(&owner)?;
            let objects = read_manifests(&files)?;
            info!(owner = %owner, objects = objects.len(), dry_run, "apply invoked");
            let client = reap_kubehub::get_kube_client().await?;
            let reconciler = Reconciler::new(
                Arc::new(reap_apply::KubeApply::new(client.clone()).dry_run(dry_run).force(force_conflicts)),
                Arc::new(reap_kubehub::KubePruner::new(client)),
                Arc::new(SqliteStore::open_default()?),
            )
            .with_options(ReconcileOptions { prune: !no_prune, dry_run });
            let report = reconciler.reconcile(&owner, objects).await?;
            match cli.output {
                Output::Human => {
                    print!("{}", report.applied);
                    print!("{}", report.pruned);
                    if !reconciler.options().prune || dry_run {
                        for r in &report.stale {
                            println!("{} stale", r);
                        }
                    }
                    match report.revision {
                        Some(rev) => println!("baseline {} revision {}", owner, rev),
                        None => println!("dry run: baseline {} unchanged", owner),
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Delete { owner, dry_run } => {
            let owner = Owner::from_str(&owner)?;
            info!(owner = %owner, dry_run, "delete invoked");
            let client = reap_kubehub::get_kube_client().await?;
            let reconciler = Reconciler::new(
                Arc::new(reap_apply::KubeApply::new(client.clone())),
                Arc::new(reap_kubehub::KubePruner::new(client)),
                Arc::new(SqliteStore::open_default()?),
            )
            .with_options(ReconcileOptions { prune: true, dry_run });
            let deleted = reconciler.finalize(&owner).await?;
            match cli.output {
                Output::Human => print!("{}", deleted),
                Output::Json => println!("{}", serde_json::to_string_pretty(&deleted)?),
            }
        }
        Commands::Baseline { owner, history } => {
            let owner = Owner::from_str(&owner)?;
            let store = SqliteStore::open_default()?;
            let revs = store.history(&owner.to_string(), Some(history.max(1)))?;
            if revs.is_empty() {
                eprintln!("no baseline for {}", owner);
                return Ok(());
            }
            match cli.output {
                Output::Human => {
                    for b in &revs {
                        println!("revision {} • ts {} • {} object(s)", b.revision, b.ts, b.inventory.len());
                        print_refs(cli.output, &b.inventory.list()?)?;
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&revs)?),
            }
        }
    }

    Ok(())
}
