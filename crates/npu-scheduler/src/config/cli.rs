use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::simulate::SimulateArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler extender daemon
    Daemon(Box<DaemonArgs>),
    /// Run one offline scheduling cycle against a snapshot file
    Simulate(SimulateArgs),
}
