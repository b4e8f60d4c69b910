//! LCA Engine
//!
//! Calculates life-cycle inventories and impacts of product systems stored
//! in a SQLite database.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lca_engine::allocation::AllocationMethod;
use lca_engine::cache::MatrixCache;
use lca_engine::calculator::{self, SimpleResult};
use lca_engine::contribution::{ContributionTree, format_tree};
use lca_engine::db::{SqliteStore, Store};
use lca_engine::library::{self, Library, LibraryInfo, LibraryMatrix};
use lca_engine::models::{ModelType, ProcessProduct};
use lca_engine::setup::CalculationSetup;
use lca_engine::{export, sample};

#[derive(Parser)]
#[command(name = "lca-engine")]
#[command(about = "Life-cycle inventory and impact calculator")]
struct Cli {
    /// Path to the SQLite database
    #[arg(short, long, default_value = "lca_data.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize empty database with schema
    Init,

    /// Load sample data for testing
    LoadSample,

    /// Calculate a product system
    Calc {
        /// Product system id
        system: i64,

        /// JSON file with calculation settings
        #[arg(short, long)]
        setup: Option<PathBuf>,

        /// Impact method id
        #[arg(short, long)]
        method: Option<i64>,

        /// Allocation method (none, physical, economic, causal)
        #[arg(short, long)]
        allocation: Option<String>,

        /// Show the contribution tree of an elementary flow
        #[arg(long)]
        tree: Option<i64>,

        /// Show the contribution tree of an impact category
        #[arg(long)]
        impact_tree: Option<i64>,
    },

    /// Write the matrix indices of a product system as CSV files
    ExportIndices {
        /// Output directory
        dir: PathBuf,

        /// Product system id
        #[arg(short, long)]
        system: i64,
    },

    /// Write the matrices of a product system as a library
    ExportLibrary {
        /// Output directory
        dir: PathBuf,

        /// Product system id
        #[arg(short, long)]
        system: i64,

        /// Library name
        #[arg(short, long)]
        name: Option<String>,

        #[arg(long, default_value = "1.0.0")]
        version: String,
    },

    /// List the libraries below a directory
    Libraries {
        root: PathBuf,

        /// Solve each library that matches the database
        #[arg(long)]
        calc: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let store = SqliteStore::open(&cli.database)
        .with_context(|| format!("Failed to open {}", cli.database.display()))?;

    match cli.command {
        Commands::Init => {
            println!("Database initialized at: {}", cli.database.display());
        }

        Commands::LoadSample => {
            store.with_connection(sample::load_sample_data)?;
            println!("Sample data loaded successfully!");
        }

        Commands::Calc {
            system,
            setup,
            method,
            allocation,
            tree,
            impact_tree,
        } => {
            let mut setup = match setup {
                Some(path) => CalculationSetup::from_file(&path)
                    .with_context(|| format!("Failed to read setup {}", path.display()))?,
                None => CalculationSetup::default(),
            };
            setup.product_system_id = system;
            if method.is_some() {
                setup.impact_method_id = method;
            }
            if let Some(name) = allocation {
                setup.allocation = AllocationMethod::parse(&name)
                    .ok_or_else(|| anyhow!("Unknown allocation method '{}'", name))?;
            }

            let cache = MatrixCache::create(Arc::new(store))?;
            let result = calculator::calculate(&cache, &setup)?;
            println!("{}", calculator::summarize(&result, cache.store())?);

            if let Some(flow_id) = tree {
                let t = result.flow_tree(flow_id, None, &setup.tree)?;
                print_tree(&t, cache.store())?;
            }
            if let Some(category_id) = impact_tree {
                let t = result.impact_tree(category_id, &setup.tree)?;
                print_tree(&t, cache.store())?;
            }
        }

        Commands::ExportIndices { dir, system } => {
            let cache = MatrixCache::create(Arc::new(store))?;
            let inventory = calculator::build_inventory(&cache, &CalculationSetup::new(system))?;
            export::write_csv_indices(&dir, &inventory, cache.store())
                .with_context(|| format!("Failed to write indices to {}", dir.display()))?;
            println!(
                "Wrote {} providers and {} flows to {}",
                inventory.tech_index.size(),
                inventory.flow_index.size(),
                dir.display()
            );
        }

        Commands::ExportLibrary {
            dir,
            system,
            name,
            version,
        } => {
            let cache = MatrixCache::create(Arc::new(store))?;
            let inventory = calculator::build_inventory(&cache, &CalculationSetup::new(system))?;
            let name = name.unwrap_or_else(|| format!("product system {}", system));
            library::write_library(&dir, &LibraryInfo::new(name, version), &inventory, cache.store())
                .with_context(|| format!("Failed to write library to {}", dir.display()))?;
            println!("Library written to {}", dir.display());
        }

        Commands::Libraries { root, calc } => {
            let libraries = library::discover(&root);
            if libraries.is_empty() {
                println!("No libraries found below {}", root.display());
            }
            for lib in &libraries {
                print_library(lib, &store, calc)?;
            }
        }
    }

    Ok(())
}

fn print_library(lib: &Library, store: &dyn Store, calc: bool) -> Result<()> {
    let info = match lib.info() {
        Ok(info) => info,
        Err(e) => {
            println!("{} (unreadable: {})", lib.folder.display(), e);
            return Ok(());
        }
    };
    let products = lib.sync_products(store);
    let matrices: Vec<&str> = [
        LibraryMatrix::A,
        LibraryMatrix::B,
        LibraryMatrix::C,
        LibraryMatrix::M,
        LibraryMatrix::INV,
    ]
    .into_iter()
    .filter(|m| lib.has_matrix(*m))
    .map(|m| m.name())
    .collect();

    println!("{} {} ({})", info.name, info.version, lib.folder.display());
    println!("  Matrices: {}", matrices.join(", "));
    if products.is_empty() {
        println!("  Does not match this database");
        return Ok(());
    }
    println!("  Providers: {}", products.len());

    if calc {
        let inventory = lib.inventory(store, 1.0)?;
        let result = SimpleResult::of(inventory, None, &Default::default(), &|| false)?;
        println!("{}", calculator::summarize(&result, store)?);
    }
    Ok(())
}

fn print_tree(tree: &ContributionTree, store: &dyn Store) -> Result<()> {
    let processes = store.descriptors(ModelType::Process)?;
    let flows = store.descriptors(ModelType::Flow)?;
    let label = |p: ProcessProduct| {
        let process = processes.iter().find(|d| d.id == p.process_id);
        let flow = flows.iter().find(|d| d.id == p.flow_id);
        match (process, flow) {
            (Some(process), Some(flow)) => format!("{} | {}", process.name, flow.name),
            _ => format!("{}/{}", p.process_id, p.flow_id),
        }
    };
    println!("Contribution tree:\n");
    println!("{}", format_tree(&tree.root, 0, &label));
    Ok(())
}
