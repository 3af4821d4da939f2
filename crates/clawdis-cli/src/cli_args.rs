use clap::{Parser, Subcommand};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "clawdis",
    about = "Personal messaging gateway fronting an LLM agent",
    version
)]
pub struct Cli {
    /// Override the state directory (default: ~/.clawdis).
    #[arg(long, global = true)]
    pub state_dir: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Gateway lifecycle.
    Gateway {
        #[command(subcommand)]
        command: GatewayCommand,
    },
    /// Channel adapters.
    Channels {
        #[command(subcommand)]
        command: ChannelsCommand,
    },
    /// Session store inspection.
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Cron jobs.
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
    /// Heartbeat controls.
    Heartbeat {
        #[command(subcommand)]
        command: HeartbeatCommand,
    },
    /// Run one agent turn from the terminal.
    Agent {
        /// Message to send to the agent.
        #[arg(long)]
        message: String,
        /// Deliver the reply out through a channel instead of printing only.
        #[arg(long)]
        deliver: bool,
        /// Channel for delivery (with --deliver).
        #[arg(long)]
        channel: Option<String>,
        /// Recipient for delivery (with --deliver).
        #[arg(long)]
        to: Option<String>,
        /// Abort the run after this many seconds.
        #[arg(long, value_parser = parse_positive_u64)]
        timeout_seconds: Option<u64>,
    },
    /// Handle a clawdis:// deep link.
    Open {
        /// The clawdis://agent?... URL.
        url: String,
        /// Skip the interactive confirm even without a key.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum GatewayCommand {
    /// Start the gateway server and channel runtimes.
    Run {
        /// Bind address, e.g. 127.0.0.1:9630.
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ChannelsCommand {
    /// Show adapter and account status.
    Status,
    /// Log a channel out and remove its credentials.
    Logout {
        #[arg(long)]
        channel: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionsCommand {
    /// List sessions, most recent first.
    List,
}

#[derive(Debug, Subcommand)]
pub enum CronCommand {
    /// List configured jobs.
    List,
    /// Show jobs plus the recent run log.
    Status,
    /// Run one job immediately.
    Run {
        #[arg(long)]
        job_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum HeartbeatCommand {
    /// Trigger one heartbeat cycle now.
    Now,
}
