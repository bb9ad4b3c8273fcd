// src/main.rs

use anyhow::{anyhow, Context, Result};
use cinchdb::branch::BranchManager;
use cinchdb::change_applier::ChangeApplier;
use cinchdb::change_tracker::ChangeTracker;
use cinchdb::data::{DataManager, Logic, Predicate};
use cinchdb::merge::MergeEngine;
use cinchdb::metadata::MetadataStore;
use cinchdb::project::Project;
use cinchdb::schema_objects::table::TableManager;
use cinchdb::schema_objects::{ColumnDef, ForeignKeyRef};
use cinchdb::tenant::TenantManager;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value as Json};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "cinchdb")]
#[command(author, version, about = "Multi-tenant, Git-like schema management over SQLite", long_about = None)]
struct Cli {
    /// Project directory to resolve `.cinchdb` from (default: current directory)
    #[arg(long, global = true)]
    project: Option<String>,

    /// Database to operate on (default: the project's active database)
    #[arg(long, global = true)]
    database: Option<String>,

    /// Branch to operate on (default: the project's active branch)
    #[arg(long, global = true)]
    branch: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a `.cinchdb` project in the given directory (default: current directory)
    Init {
        path: Option<String>,
    },
    /// Database-level operations
    Database {
        #[command(subcommand)]
        command: DatabaseCommands,
    },
    /// Branch-level operations
    Branch {
        #[command(subcommand)]
        command: BranchCommands,
    },
    /// Tenant-level operations
    Tenant {
        #[command(subcommand)]
        command: TenantCommands,
    },
    /// Table-level operations
    Table {
        #[command(subcommand)]
        command: TableCommands,
    },
    /// Read rows from a table in one tenant
    Query {
        table: String,
        /// Tenant to read from (default: "main")
        #[arg(long, default_value = "main")]
        tenant: String,
        /// A single `column=value` equality filter
        #[arg(long)]
        r#where: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },
}

#[derive(Subcommand)]
enum DatabaseCommands {
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
}

#[derive(Subcommand)]
enum BranchCommands {
    Create {
        name: String,
        #[arg(long)]
        from: Option<String>,
    },
    List,
    Delete {
        name: String,
    },
    /// Merge `source` into `target` (use `target` "main" to go through `merge_into_main`)
    Merge {
        source: String,
        target: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum TenantCommands {
    Create {
        name: String,
        /// Materialize the tenant's file immediately instead of lazily on first write
        #[arg(long)]
        no_lazy: bool,
    },
    List,
    Delete {
        name: String,
    },
}

#[derive(Subcommand)]
enum TableCommands {
    /// `columns` entries look like `name:TYPE` or `name:TYPE:null`
    Create {
        name: String,
        columns: Vec<String>,
    },
    List,
    Drop {
        name: String,
    },
}

struct Engine {
    metadata: Arc<MetadataStore>,
    applier: Arc<ChangeApplier>,
    project: Project,
}

impl Engine {
    fn open(project: Project) -> Result<Self> {
        let metadata = Arc::new(MetadataStore::open(&project.root)?);
        let applier = Arc::new(ChangeApplier::new(
            metadata.clone(),
            ChangeTracker::new(metadata.clone()),
            TenantManager::new(metadata.clone(), &project.root, project.database.clone()),
            &project.root,
            project.database.clone(),
        ));
        Ok(Self { metadata, applier, project })
    }

    fn tracker(&self) -> ChangeTracker {
        ChangeTracker::new(self.metadata.clone())
    }

    fn tenants(&self) -> TenantManager {
        TenantManager::new(self.metadata.clone(), &self.project.root, self.project.database.clone())
    }

    fn database(&self) -> Result<cinchdb::metadata::models::Database> {
        self.metadata
            .get_database(&self.project.database)?
            .ok_or_else(|| anyhow!("database '{}' not found; run 'cinchdb database create'", self.project.database))
    }

    fn branch(&self) -> Result<cinchdb::metadata::models::Branch> {
        let db = self.database()?;
        self.metadata
            .get_branch(&db.id, &self.project.branch)?
            .ok_or_else(|| anyhow!("branch '{}' not found", self.project.branch))
    }

    fn branch_named(&self, name: &str) -> Result<cinchdb::metadata::models::Branch> {
        let db = self.database()?;
        self.metadata
            .get_branch(&db.id, name)?
            .ok_or_else(|| anyhow!("branch '{name}' not found"))
    }

    fn branch_manager(&self) -> BranchManager {
        BranchManager::new(
            self.metadata.clone(),
            self.tracker(),
            self.tenants(),
            &self.project.root,
            self.project.database.clone(),
        )
    }

    fn table_manager(&self) -> TableManager {
        TableManager::new(self.metadata.clone(), self.applier.clone(), &self.project.root, self.project.database.clone())
    }

    fn merge_engine(&self) -> MergeEngine {
        let applier = ChangeApplier::new(self.metadata.clone(), self.tracker(), self.tenants(), &self.project.root, self.project.database.clone());
        MergeEngine::new(self.metadata.clone(), self.tracker(), applier)
    }

    fn data_manager(&self) -> DataManager {
        DataManager::new(self.metadata.clone(), self.tenants(), &self.project.root, self.project.database.clone())
    }
}

fn parse_column(spec: &str) -> Result<ColumnDef> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 2 {
        return Err(anyhow!("column '{spec}' must look like name:TYPE or name:TYPE:null"));
    }
    let nullable = parts.get(2).map(|f| f.eq_ignore_ascii_case("null")).unwrap_or(false);
    Ok(ColumnDef {
        name: parts[0].to_string(),
        sql_type: parts[1].to_string(),
        nullable,
        unique: false,
        default: None,
        foreign_key: None::<ForeignKeyRef>,
    })
}

fn parse_where(clause: &str) -> Result<Predicate> {
    let (column, value) = clause
        .split_once('=')
        .ok_or_else(|| anyhow!("--where must look like column=value"))?;
    Ok(Predicate::eq(column.to_string(), Json::String(value.to_string())))
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { path } = &cli.command {
        let dir = path.clone().unwrap_or_else(|| ".".to_string());
        let project = Project::init(&dir).context("initializing project")?;
        println!("Initialized CinchDB project at {}", project.root.display());
        return Ok(());
    }

    let start = cli.project.clone().unwrap_or_else(|| ".".to_string());
    let mut project = Project::find(&start).context("resolving CinchDB project")?;
    if let Some(database) = &cli.database {
        project.database = database.clone();
    }
    if let Some(branch) = &cli.branch {
        project.branch = branch.clone();
    }

    let engine = Engine::open(project)?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Database { command } => match command {
            DatabaseCommands::Create { name, description } => {
                let db = engine.metadata.create_database(&name, description.as_deref())?;
                let branch = engine.metadata.create_branch(&db.id, "main", None)?;
                engine.tenants().ensure_empty_tenant(&branch)?;
                info!(database = %name, "created database with empty main branch");
                println!("Created database '{name}' (id {})", db.id);
            }
            DatabaseCommands::List => {
                for db in engine.metadata.list_databases(false)? {
                    println!("{}\t{}", db.name, db.id);
                }
            }
        },
        Commands::Branch { command } => match command {
            BranchCommands::Create { name, from } => {
                let db = engine.database()?;
                let branch = engine.branch_manager().create_branch(&db.id, &name, from.as_deref())?;
                println!("Created branch '{}' from '{}'", branch.name, from.as_deref().unwrap_or("main"));
            }
            BranchCommands::List => {
                let db = engine.database()?;
                for branch in engine.branch_manager().list_branches(&db.id)? {
                    println!("{}", branch.name);
                }
            }
            BranchCommands::Delete { name } => {
                let branch = engine.branch_named(&name)?;
                engine.branch_manager().delete_branch(&branch)?;
                println!("Deleted branch '{name}'");
            }
            BranchCommands::Merge { source, target, force, dry_run } => {
                let source_branch = engine.branch_named(&source)?;
                let target_branch = engine.branch_named(&target)?;
                let outcome = if target_branch.is_main() {
                    engine.merge_engine().merge_into_main(&source_branch, &target_branch, force, dry_run)?
                } else {
                    engine.merge_engine().merge_branches(&source_branch, &target_branch, force, dry_run)?
                };
                println!(
                    "{} {} change(s) from '{source}' into '{target}'",
                    if dry_run { "Would apply" } else { "Applied" },
                    outcome.steps.len()
                );
            }
        },
        Commands::Tenant { command } => {
            let branch = engine.branch()?;
            match command {
                TenantCommands::Create { name, no_lazy } => {
                    let lazy = !no_lazy;
                    let tenant = engine.tenants().create_tenant(&branch, &name, lazy)?;
                    if lazy {
                        println!("Created tenant '{}' (lazy until first write)", tenant.name);
                    } else {
                        println!("Created tenant '{}' (materialized)", tenant.name);
                    }
                }
                TenantCommands::List => {
                    for tenant in engine.tenants().list_tenants(&branch.id)? {
                        println!("{}\t{}", tenant.name, if tenant.materialized { "materialized" } else { "lazy" });
                    }
                }
                TenantCommands::Delete { name } => {
                    let tenant = engine
                        .metadata
                        .get_tenant(&branch.id, &name)?
                        .ok_or_else(|| anyhow!("tenant '{name}' not found"))?;
                    engine.tenants().delete_tenant(&branch, &tenant)?;
                    println!("Deleted tenant '{name}'");
                }
            }
        }
        Commands::Table { command } => {
            let branch = engine.branch()?;
            let tables = engine.table_manager();
            match command {
                TableCommands::Create { name, columns } => {
                    let columns = columns.iter().map(|c| parse_column(c)).collect::<Result<Vec<_>>>()?;
                    tables.create_table(&branch, &name, &columns)?;
                    println!("Created table '{name}'");
                }
                TableCommands::List => {
                    for table in tables.list_tables(&branch)? {
                        println!("{table}");
                    }
                }
                TableCommands::Drop { name } => {
                    tables.drop_table(&branch, &name)?;
                    println!("Dropped table '{name}'");
                }
            }
        }
        Commands::Query { table, tenant, r#where, limit } => {
            let branch = engine.branch()?;
            let tenant = engine
                .metadata
                .get_tenant(&branch.id, &tenant)?
                .ok_or_else(|| anyhow!("tenant '{tenant}' not found"))?;
            let predicates = r#where.as_deref().map(parse_where).transpose()?.into_iter().collect::<Vec<_>>();
            let rows = engine.data_manager().select(&branch, &tenant, &table, &predicates, Logic::And, limit, None)?;
            let rows: Vec<Map<String, Json>> = rows
                .into_iter()
                .filter_map(|row| match row {
                    Json::Object(map) => Some(map),
                    _ => None,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}
