//! MentorLink CLI, the main entry point.
//!
//! Commands:
//! - `serve`    Start the HTTP gateway
//! - `ask`      Ask one question through the pipeline
//! - `quiz`     Generate a multiple-choice quiz
//! - `sessions` Inspect stored sessions
//! - `config`   Show, locate, validate or initialise the configuration
//! - `doctor`   Diagnose setup problems

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "mentorlink",
    about = "MentorLink: retrieval-augmented tutoring over any OpenAI-compatible model",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the bind address
        #[arg(long)]
        host: Option<String>,
    },

    /// Ask a single question
    Ask {
        /// The question
        query: String,

        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,

        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,

        /// Subject, enables tutoring mode together with --level
        #[arg(long, requires = "level")]
        subject: Option<String>,

        /// Learner level (Beginner, Intermediate, Advanced)
        #[arg(long, requires = "subject")]
        level: Option<String>,

        /// Learning style (Visual, Text-Based, Hands-on)
        #[arg(long, requires = "subject")]
        style: Option<String>,
    },

    /// Generate a multiple-choice quiz
    Quiz {
        subject: String,

        level: String,

        /// Number of questions (1-10)
        #[arg(short = 'n', long, default_value_t = 5)]
        questions: usize,

        /// Write the quiz as an HTML page to this file
        #[arg(long)]
        html: Option<std::path::PathBuf>,
    },

    /// Inspect stored sessions (sqlite backend)
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Diagnose system health
    Doctor,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List sessions
    List,
    /// Print one session's turns
    Show { id: String },
    /// Delete a session
    Delete { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Validate the config file
    Validate,
    /// Write a default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { port, host } => commands::serve::run(port, host).await?,
        Commands::Ask {
            query,
            session,
            stream,
            subject,
            level,
            style,
        } => {
            let profile = commands::ask::profile(subject, level, style);
            commands::ask::run(query, session, stream, profile).await?
        }
        Commands::Quiz {
            subject,
            level,
            questions,
            html,
        } => commands::quiz::run(&subject, &level, questions, html).await?,
        Commands::Sessions { action } => match action {
            SessionAction::List => commands::sessions::list().await?,
            SessionAction::Show { id } => commands::sessions::show(&id).await?,
            SessionAction::Delete { id } => commands::sessions::delete(&id).await?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
            ConfigAction::Init => commands::config_cmd::init().await?,
        },
        Commands::Doctor => commands::doctor::run().await?,
    }

    Ok(())
}
