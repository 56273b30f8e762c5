use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use jira_installer::models::requests::{DatabaseMode, DatabaseOverrides, InstallRequest};
use jira_installer::update::validate::{self_check_line, SELF_CHECK_ARG};
use jira_installer::utils::version::Version;
use jira_installer::{run_cli, CliCommand};

#[derive(Debug, Parser)]
#[command(
    name = "jira-installer",
    version,
    about = "Install Jira 8.x - 11.x in Docker and keep this installer up to date",
    after_help = "Run with --self-check to print `jira-installer <version>` and exit."
)]
struct Cli {
    /// TOML configuration file (defaults to <config dir>/jira-installer/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install Jira <VERSION> (8.x - 11.x) in Docker
    Install(InstallArgs),
    /// Show Docker containers, networks and volumes
    Status,
    /// Check for a newer jira-installer
    CheckUpdate,
    /// Download and install a newer jira-installer
    Update,
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DbModeArg {
    #[value(name = "builtin", alias = "built-in", alias = "built_in")]
    BuiltIn,
    #[value(alias = "mysql")]
    External,
}

impl From<DbModeArg> for DatabaseMode {
    fn from(mode: DbModeArg) -> Self {
        match mode {
            DbModeArg::BuiltIn => DatabaseMode::BuiltIn,
            DbModeArg::External => DatabaseMode::External,
        }
    }
}

#[derive(Debug, Args)]
struct InstallArgs {
    /// Jira version, e.g. 9.15.0 or 10.0.0
    version: String,
    /// Host port for Jira (default 8081 for 8.x/9.x, 8080 for 10.x/11.x)
    #[arg(long)]
    port: Option<u32>,
    /// Jira container name (default jira<version>)
    #[arg(long)]
    name: Option<String>,
    /// Docker network (default jira_network)
    #[arg(long)]
    network: Option<String>,
    /// Database mode; must match the version
    #[arg(long, value_enum, ignore_case = true)]
    db_mode: Option<DbModeArg>,
    /// MySQL container name
    #[arg(long)]
    db_container: Option<String>,
    /// MySQL database name
    #[arg(long)]
    db_name: Option<String>,
    /// MySQL user for Jira
    #[arg(long)]
    db_user: Option<String>,
    /// MySQL password for Jira
    #[arg(long)]
    db_password: Option<String>,
    /// MySQL root password
    #[arg(long)]
    db_root_password: Option<String>,
    /// MySQL image
    #[arg(long)]
    db_image: Option<String>,
    /// MySQL port inside the network
    #[arg(long)]
    db_port: Option<u32>,
    /// MySQL data volume
    #[arg(long)]
    db_volume: Option<String>,
    /// MySQL Connector/J version
    #[arg(long)]
    driver_version: Option<String>,
    /// How long to wait for Jira to come up, in seconds
    #[arg(long, value_name = "SECONDS")]
    health_timeout: Option<u64>,
}

impl From<InstallArgs> for InstallRequest {
    fn from(args: InstallArgs) -> Self {
        InstallRequest {
            version: args.version,
            port: args.port,
            container_name: args.name,
            network_name: args.network,
            database_mode: args.db_mode.map(DatabaseMode::from),
            database: DatabaseOverrides {
                container_name: args.db_container,
                database_name: args.db_name,
                user: args.db_user,
                password: args.db_password,
                root_password: args.db_root_password,
                image: args.db_image,
                port: args.db_port,
                volume_name: args.db_volume,
            },
            driver_version: args.driver_version,
            health_deadline_secs: args.health_timeout,
        }
    }
}

impl Cli {
    fn into_parts(self) -> (CliCommand, Option<PathBuf>) {
        let command = match self.command {
            Commands::Install(args) => CliCommand::Install(args.into()),
            Commands::Status => CliCommand::Status,
            Commands::CheckUpdate => CliCommand::CheckUpdate,
            Commands::Update => CliCommand::Update,
            Commands::Config => CliCommand::ShowConfig,
        };
        (command, self.config)
    }
}

fn main() {
    // Run by the updater against a freshly swapped executable. Touches no config, logs or
    // pending updates, and accepts no other arguments.
    if std::env::args().skip(1).any(|a| a == SELF_CHECK_ARG) {
        println!("{}", self_check_line(&Version::current()));
        return;
    }

    let (command, config) = Cli::parse().into_parts();
    std::process::exit(run_cli(command, config.as_deref()));
}
