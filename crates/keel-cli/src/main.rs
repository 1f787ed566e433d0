use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "keel",
    about = "Convention-driven serverless deployments",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a function directory into image labels.
    Labels {
        /// Function directory (default: current directory)
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        /// Function name. Defaults to the directory name.
        #[arg(long)]
        function: Option<String>,
        #[arg(long)]
        branch: String,
        #[arg(long)]
        sha: String,
        #[arg(long)]
        origin: String,
        /// Output format: json or docker (`--label k=v` arguments)
        #[arg(short, long, default_value = "json")]
        format: String,
    },
    /// Decode a label map (JSON object) into a manifest.
    Decode {
        /// Label JSON file, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,
        /// Render templates with the deploy configuration
        #[arg(long)]
        template: bool,
        /// Configuration file (keel.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the resource names derived for a function.
    Identity {
        #[arg(long)]
        origin: String,
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        function: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Plan image retention for a registry listing (JSON array).
    GcPlan {
        /// Listing JSON file, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,
        /// Evaluation time (RFC 3339). Defaults to now.
        #[arg(long)]
        now: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("keel=info".parse()?);
    let logger = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json {
        logger.json().init();
    } else {
        logger.init();
    }

    match cli.command {
        Commands::Labels {
            path,
            function,
            branch,
            sha,
            origin,
            format,
        } => commands::labels::labels(
            &path,
            function.as_deref(),
            keel_core::GitContext {
                branch,
                sha,
                origin,
            },
            &format,
        ),
        Commands::Decode {
            input,
            template,
            config,
        } => commands::decode::decode(&input, template, config.as_deref()),
        Commands::Identity {
            origin,
            namespace,
            function,
            config,
        } => commands::identity::identity(&origin, &namespace, &function, config.as_deref()),
        Commands::GcPlan { input, now } => commands::gc_plan::gc_plan(&input, now.as_deref()),
    }
}
