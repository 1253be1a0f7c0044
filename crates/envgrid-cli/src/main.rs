//! envgrid — manage template-driven environments from the command line.
//!
//! # Usage
//!
//! ```text
//! envgrid init
//! envgrid create shop dev --services services.yaml
//! envgrid globals shop dev --file globals.yaml --preview
//! envgrid status shop dev --format json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod local;

#[derive(Parser)]
#[command(
    name = "envgrid",
    about = "envgrid — reconcile environments against project templates",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "envgrid.toml")]
    config: PathBuf,

    /// Data directory; the store becomes `{data_dir}/envgrid.redb`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default envgrid.toml
    Init {
        #[arg(short, long, default_value = "envgrid.toml")]
        path: PathBuf,
    },
    /// Create an environment from its project template
    Create {
        project: String,
        name: String,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long, default_value = "local")]
        cluster: String,
        /// Default-values document (defaults to the template's)
        #[arg(long)]
        values: Option<PathBuf>,
        /// YAML list of global variables (defaults to the template's)
        #[arg(long)]
        globals: Option<PathBuf>,
        /// YAML list of per-service overrides and chart services
        #[arg(long)]
        services: Option<PathBuf>,
    },
    /// Refresh services to the template's current revision
    Update {
        project: String,
        env: String,
        /// Services to refresh
        names: Vec<String>,
        /// YAML list of per-service overrides, merged with NAMES
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Further environments of the project to update the same way
        #[arg(long = "also")]
        also: Vec<String>,
    },
    /// Replace the global variable set
    Globals {
        project: String,
        env: String,
        /// YAML list of `{key, value}` entries
        #[arg(short, long)]
        file: PathBuf,
        /// Fail if the environment revision moved past this one
        #[arg(long)]
        expected_revision: Option<u64>,
        /// Show the rendered difference without applying
        #[arg(long)]
        preview: bool,
    },
    /// Replace the default-values document
    Defaults {
        project: String,
        env: String,
        #[arg(short, long)]
        file: PathBuf,
        /// List the services the change may affect without applying
        #[arg(long)]
        preview: bool,
    },
    /// Template-declared global variables the environment lacks
    Candidates { project: String, env: String },
    /// Remove services from an environment
    Remove {
        project: String,
        env: String,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Tear down an environment
    Delete { project: String, env: String },
    /// Scale an environment's workloads to zero
    Sleep { project: String, env: String },
    /// Restore an environment's workloads
    Wake { project: String, env: String },
    /// Show environment and service status
    Status {
        project: String,
        env: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List a project's environments
    List {
        project: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,envgrid=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Commands::Init { path } = &cli.command {
        return commands::config::init(path);
    }

    let reconciler = commands::config::open(&cli.config, cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Create {
            project,
            name,
            namespace,
            cluster,
            values,
            globals,
            services,
        } => {
            let args = commands::env::CreateArgs {
                project,
                name,
                namespace,
                cluster,
                values,
                globals,
                services,
            };
            commands::env::create(&reconciler, args).await
        }
        Commands::Update {
            project,
            env,
            names,
            file,
            also,
        } => commands::env::update(&reconciler, &project, &env, names, file.as_deref(), also).await,
        Commands::Globals {
            project,
            env,
            file,
            expected_revision,
            preview,
        } => {
            commands::vars::globals(&reconciler, &project, &env, &file, expected_revision, preview)
                .await
        }
        Commands::Defaults {
            project,
            env,
            file,
            preview,
        } => commands::vars::defaults(&reconciler, &project, &env, &file, preview).await,
        Commands::Candidates { project, env } => {
            commands::vars::candidates(&reconciler, &project, &env).await
        }
        Commands::Remove {
            project,
            env,
            names,
        } => commands::env::remove(&reconciler, &project, &env, &names).await,
        Commands::Delete { project, env } => commands::env::delete(&reconciler, &project, &env).await,
        Commands::Sleep { project, env } => {
            commands::env::sleep(&reconciler, &project, &env, true).await
        }
        Commands::Wake { project, env } => {
            commands::env::sleep(&reconciler, &project, &env, false).await
        }
        Commands::Status {
            project,
            env,
            format,
        } => commands::env::status(&reconciler, &project, &env, format),
        Commands::List { project, format } => commands::env::list(&reconciler, &project, format),
    }
}
