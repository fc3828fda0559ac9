use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use raid5_rs::Algorithm;
use raid5_rs::ArrayConfig;
use raid5_rs::config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_DISK_SIZE, DEFAULT_HASH_BUCKETS, DEFAULT_NR_STRIPES, DEFAULT_RAID_DISKS,
};

#[derive(Parser)]
#[command(author, version, about = "RAID-5 stripe cache simulator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a random workload against a simulated array and verify every byte.
    Simulate(SimulateArgs),

    /// Print where data and parity chunks land for the first stripes.
    Layout(LayoutArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ArrayArgs {
    #[arg(long, env = "RAID5_DISKS", default_value_t = DEFAULT_RAID_DISKS)]
    pub disks: usize,

    #[arg(long, env = "RAID5_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    #[arg(long, env = "RAID5_LAYOUT", value_enum, default_value_t = LayoutArg::LeftSymmetric)]
    pub layout: LayoutArg,

    #[arg(long, env = "RAID5_DISK_SIZE", default_value_t = DEFAULT_DISK_SIZE)]
    pub disk_size: u64,

    #[arg(long, env = "RAID5_NR_STRIPES", default_value_t = DEFAULT_NR_STRIPES)]
    pub nr_stripes: usize,

    #[arg(long, env = "RAID5_HASH_BUCKETS", default_value_t = DEFAULT_HASH_BUCKETS)]
    pub hash_buckets: usize,
}

impl ArrayArgs {
    pub fn config(&self) -> ArrayConfig {
        ArrayConfig {
            raid_disks: self.disks,
            chunk_size: self.chunk_size,
            layout: self.layout.into(),
            disk_size: self.disk_size,
            nr_stripes: self.nr_stripes,
            hash_buckets: self.hash_buckets,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub array: ArrayArgs,

    /// Keep member images here instead of in memory.
    #[arg(long, env = "RAID5_DISK_DIR")]
    pub disk_dir: Option<PathBuf>,

    #[arg(long, env = "RAID5_OPS", default_value_t = 2000)]
    pub ops: u64,

    /// Largest transfer in bytes.
    #[arg(long, env = "RAID5_MAX_IO", default_value_t = 16 * 1024)]
    pub max_io: usize,

    #[arg(long, env = "RAID5_WRITE_RATIO", default_value_t = 0.6)]
    pub write_ratio: f64,

    #[arg(long, env = "RAID5_SEED")]
    pub seed: Option<u64>,

    /// Device to hot-fail partway through the workload.
    #[arg(long, env = "RAID5_FAIL_DISK")]
    pub fail_disk: Option<usize>,

    /// Rebuild the failed member onto a spare before verifying.
    #[arg(long, env = "RAID5_REBUILD", default_value_t = false)]
    pub rebuild: bool,

    /// Recompute every stripe's parity before verifying (healthy arrays only).
    #[arg(long, env = "RAID5_RESYNC", default_value_t = false)]
    pub resync: bool,

    #[arg(long, env = "RAID5_METRICS_QUEUE_CAP", default_value_t = 4096)]
    pub metrics_queue_cap: usize,
}

#[derive(Args, Debug, Clone)]
pub struct LayoutArgs {
    #[command(flatten)]
    pub array: ArrayArgs,

    #[arg(long, default_value_t = 8)]
    pub stripes: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LayoutArg {
    FixedParity,
    LeftAsymmetric,
    RightAsymmetric,
    LeftSymmetric,
    RightSymmetric,
}

impl From<LayoutArg> for Algorithm {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::FixedParity => Self::FixedParity,
            LayoutArg::LeftAsymmetric => Self::LeftAsymmetric,
            LayoutArg::RightAsymmetric => Self::RightAsymmetric,
            LayoutArg::LeftSymmetric => Self::LeftSymmetric,
            LayoutArg::RightSymmetric => Self::RightSymmetric,
        }
    }
}
