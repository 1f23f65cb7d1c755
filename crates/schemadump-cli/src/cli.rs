use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "schemadump", version, about = "Dump schema field offsets from a running target process")]
pub struct Args {
    /// Image name of the target process.
    #[arg(long, default_value = "cs2.exe")]
    pub process: String,

    /// Attach by PID instead of image name.
    #[arg(long)]
    pub pid: Option<u32>,

    /// Directory the generated files are written to.
    #[arg(long, default_value = "generated")]
    pub output: PathBuf,
}
