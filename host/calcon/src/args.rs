use crate::image::Mode;
use std::path::PathBuf;

#[derive(clap::Parser, Debug, Clone)]
#[command(
    about = "Upload an image to a Calypso/Compal phone over serial and bridge \
             its console and tool channels",
    long_about = None,
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct Args {
    /// Serial port connected to the phone
    #[arg(short = 'p', long = "port", default_value = "/dev/ttyUSB1")]
    pub port: PathBuf,

    /// Loader dialect and image shape
    #[arg(short = 'm', long = "mode", default_value_t)]
    pub mode: Mode,

    /// Socket path exported for L1A/L23 tools
    #[arg(short = 's', long = "l2-socket", default_value = "/tmp/osmocom_l2")]
    pub l2_socket: PathBuf,

    /// Socket path exported for loader tools
    #[arg(short = 'l', long = "loader-socket", default_value = "/tmp/osmocom_loader")]
    pub loader_socket: PathBuf,

    /// Print version and exit
    #[arg(short = 'v')]
    pub version: bool,

    /// Print this help and exit
    #[arg(short = 'h', long = "help")]
    pub help: bool,

    /// Increase message verbosity
    #[arg(short = 'd', long = "debug", action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Silence all output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Microsecond timestamping for debugging timing issues
    #[arg(long)]
    pub timestamps: bool,

    /// Binary image to upload (at most 64 kiB)
    // optional so that bare `-v`/`-h` invocations parse; main() rejects a
    // missing filename with a usage error
    pub image: Option<PathBuf>,
}
