use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Gearman job server to connect to, as `host:port`. May be repeated;
    /// the first is used for `admin` subcommands.
    #[arg(short, long = "server", default_value = "127.0.0.1:4730")]
    pub servers: Vec<String>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submits one job and waits for its result.
    Submit {
        task: String,
        data: String,
        /// Don't wait for a result; return as soon as the server accepts it.
        #[arg(long)]
        background: bool,
    },
    /// Runs a demonstration worker that reverses the bytes it's handed.
    Work {
        #[arg(long)]
        task: String,
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
    },
    /// Issues an admin command against the first configured server.
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum AdminAction {
    Status,
    Workers,
    Version,
    Ping,
    Shutdown {
        #[arg(long)]
        graceful: bool,
    },
}
