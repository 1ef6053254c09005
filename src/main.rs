use clap::{Args, Parser, Subcommand};
use resv::commands::reserve::{ReserveArgs, parse_meta};
use resv::model::{Mode, Purpose, ReservationStatus};
use resv::output::Format;

#[derive(Parser)]
#[command(
    name = "resv",
    version,
    about = "Lease-based file reservations for concurrent agents"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the .resv/ state directory in the current directory
    Init,
    /// Reserve one or more paths, or check who holds a path
    #[command(args_conflicts_with_subcommands = true)]
    Reserve {
        #[command(subcommand)]
        action: Option<ReserveAction>,
        #[command(flatten)]
        request: ReserveRequest,
    },
    /// Release a reservation, everything an agent holds, or force one free
    Release {
        /// Reservation ID
        id: Option<String>,
        /// Releasing agent (defaults to $RESV_AGENT)
        #[arg(long)]
        agent: Option<String>,
        /// Release every reservation held by --agent
        #[arg(long, conflicts_with_all = ["id", "force"])]
        all: bool,
        /// Coordinator override; needs --token
        #[arg(long, requires = "id")]
        force: bool,
        /// Coordinator credential
        #[arg(long, requires = "force")]
        token: Option<String>,
        /// Reason recorded with a forced release
        #[arg(long, requires = "force")]
        reason: Option<String>,
    },
    /// Push a reservation's expiry further out
    Extend {
        /// Reservation ID
        id: String,
        /// Owning agent (defaults to $RESV_AGENT)
        #[arg(long)]
        agent: Option<String>,
        /// Seconds to add
        #[arg(long)]
        seconds: u64,
    },
    /// Inspect and audit reservations
    Reservations {
        #[command(subcommand)]
        action: ReservationsAction,
    },
    /// Expire lapsed reservations and trim old history
    Sweep {
        /// Keep sweeping on the configured interval
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand)]
enum ReserveAction {
    /// Show whether a path is held and by whom
    Check {
        /// Resource path
        path: String,
    },
}

#[derive(Args)]
struct ReserveRequest {
    /// Paths to reserve; several paths are granted all-or-nothing
    paths: Vec<String>,
    /// Reserving agent (defaults to $RESV_AGENT)
    #[arg(long)]
    agent: Option<String>,
    /// What the agent intends to do
    #[arg(long, value_enum, default_value = "edit")]
    purpose: Purpose,
    /// Lock mode
    #[arg(long, value_enum, default_value = "exclusive")]
    mode: Mode,
    /// Lease length in seconds (config default when omitted)
    #[arg(long)]
    expires_in: Option<u64>,
    /// Metadata entry as key=value (repeatable)
    #[arg(long, value_parser = parse_meta)]
    meta: Vec<(String, String)>,
    /// Grant whatever paths are free instead of all-or-nothing
    #[arg(long)]
    best_effort: bool,
}

#[derive(Subcommand)]
enum ReservationsAction {
    /// List reservations
    List {
        /// Filter by status
        #[arg(long, value_enum)]
        status: Option<ReservationStatus>,
        /// Filter by agent
        #[arg(long)]
        agent: Option<String>,
        /// Only paths under this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Health summary, or long-held reservations with --stale
    Audit {
        /// List stale reservations instead of the summary
        #[arg(long)]
        stale: bool,
        /// Age threshold in seconds (config stale_after_secs when omitted)
        #[arg(long, requires = "stale")]
        older_than: Option<u64>,
    },
    /// Block until a path is free
    Wait {
        /// Resource path
        path: String,
        /// Give up after this many seconds (config wait_timeout_secs when omitted)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Read the lifecycle event log, newest first
    Events {
        /// Show only the most recent N events
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Report that an agent touched a path; fails if no reservation covered it
    Verify {
        /// Resource path
        path: String,
        /// Acting agent (defaults to $RESV_AGENT)
        #[arg(long)]
        agent: Option<String>,
        /// What the agent did
        #[arg(long, value_enum, default_value = "edit")]
        purpose: Purpose,
    },
}

fn run(cli: Cli, format: Format) -> resv::error::Result<()> {
    // Dispatched before state directory discovery
    if let Commands::Init = cli.command {
        let cwd = std::env::current_dir()?;
        return resv::commands::init::run(&cwd, format);
    }

    let dir = resv::workspace::find_state_dir()?;

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Reserve { action, request } => match action {
            Some(ReserveAction::Check { path }) => {
                resv::commands::reserve::check(&dir, &path, format)
            }
            None => resv::commands::reserve::reserve(
                &dir,
                ReserveArgs {
                    paths: request.paths,
                    agent: request.agent,
                    purpose: request.purpose,
                    mode: request.mode,
                    expires_in: request.expires_in,
                    meta: request.meta,
                    best_effort: request.best_effort,
                },
                format,
            ),
        },
        Commands::Release {
            id,
            agent,
            all,
            force,
            token,
            reason,
        } => match (id, all, force) {
            (_, true, _) => resv::commands::release::release_all(&dir, agent, format),
            (Some(id), false, true) => resv::commands::release::force(
                &dir,
                &id,
                token.as_deref(),
                reason.as_deref(),
                format,
            ),
            (Some(id), false, false) => {
                resv::commands::release::release(&dir, &id, agent, format)
            }
            (None, false, _) => Err(resv::commands::release::missing_target()),
        },
        Commands::Extend { id, agent, seconds } => {
            resv::commands::extend::run(&dir, &id, agent, seconds, format)
        }
        Commands::Reservations { action } => match action {
            ReservationsAction::List {
                status,
                agent,
                prefix,
            } => resv::commands::reservations::list(&dir, status, agent, prefix, format),
            ReservationsAction::Audit { stale, older_than } => {
                if stale {
                    resv::commands::reservations::audit_stale(&dir, older_than, format)
                } else {
                    resv::commands::reservations::audit_health(&dir, format)
                }
            }
            ReservationsAction::Wait { path, timeout } => {
                resv::commands::wait::run(&dir, &path, timeout, format)
            }
            ReservationsAction::Events { limit } => {
                resv::commands::reservations::events(&dir, limit, format)
            }
            ReservationsAction::Verify {
                path,
                agent,
                purpose,
            } => resv::commands::reservations::verify(&dir, &path, agent, purpose, format),
        },
        Commands::Sweep { watch } => resv::commands::sweep::run(&dir, watch, format),
    }
}

fn main() {
    resv::logging::init();
    let cli = Cli::parse();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                let mut body = serde_json::json!({
                    "error": e.code(),
                    "message": e.to_string()
                });
                let now = chrono::Utc::now();
                let conflicts: Vec<_> = e
                    .conflicts()
                    .iter()
                    .map(|c| resv::resolver::describe_conflict(c, now))
                    .collect();
                if !conflicts.is_empty() {
                    body["conflicts"] = serde_json::json!(conflicts);
                }
                eprintln!("{body}");
            }
            _ => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}
