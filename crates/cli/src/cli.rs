use clap::Parser;

/// Drive a bounded job pool with simulated work.
///
/// Enqueues one sleeping job per entry in `--durations`, flushes the pool,
/// and reports how the jobs settled.
#[derive(Parser, Debug)]
#[command(name = "drainpool", about = "Run simulated jobs through a bounded pool")]
pub struct CliArgs {
    /// Maximum concurrent jobs (defaults to POOL_CAPACITY from the environment)
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Pool name used in log output (defaults to POOL_NAME)
    #[arg(long)]
    pub name: Option<String>,

    /// Comma-separated job durations in milliseconds
    #[arg(long, value_delimiter = ',', default_value = "10,50,10,10,10")]
    pub durations: Vec<u64>,

    /// 1-based positions of jobs that should fail
    #[arg(long, value_delimiter = ',')]
    pub fail: Vec<usize>,

    /// Extra jobs to enqueue after flush has started
    #[arg(long, default_value = "0")]
    pub late: usize,

    /// Duration in milliseconds of each late job
    #[arg(long, default_value = "10")]
    pub late_duration: u64,

    /// Print final pool statistics as JSON
    #[arg(long)]
    pub json: bool,
}

impl CliArgs {
    pub fn should_fail(&self, position: usize) -> bool {
        self.fail.contains(&position)
    }
}
