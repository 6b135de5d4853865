use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// YAML file with the nodes, jobs and fault state of one cycle
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub snapshot: PathBuf,

    /// Scheduler configuration file
    #[arg(long, env = "NPU_SCHEDULER_CONFIG", value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,
}
