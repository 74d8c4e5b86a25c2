//! ipcview worker - prefix sums over CUDA memory exported by another process
//!
//! Usage:
//! ```bash
//! ipcview cumsum --ipc-mem-handle <HEX> --typestr "<f4" --length 4
//! ipcview cumsum-into --ipc-mem-handle-data <HEX> --ipc-mem-handle-output <HEX> \
//!     --typestr "<i4" --length 10
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use ipcview_core::{
    Completion, DType, DeviceContext, Driver, Error, IpcHandleResolver, IpcMemHandle,
    IpcOpenFlags, OperationExecutor, Result, SyncPolicy, TypedBufferView,
};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ipcview",
    about = "Process data on CUDA GPUs via IPC",
    long_about = "Maps device memory exported by another process, views it as a typed\n1-D array without copying and replaces it (or a second buffer) with its prefix sum.",
    version
)]
struct Cli {
    /// The index of the CUDA device to use
    #[arg(long = "cuda-device", global = true, env = "IPCVIEW_DEVICE", default_value_t = 0)]
    device_id: usize,

    /// Let the driver enable peer access when the exporter used another device
    #[arg(long, global = true)]
    lazy_peer_access: bool,

    /// Log output format (filter with RUST_LOG)
    #[arg(long, global = true, value_enum, env = "IPCVIEW_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ViewArgs {
    /// The datatype of the memory in __array_interface__ format, e.g. "<f4"
    #[arg(long, env = "IPCVIEW_TYPESTR")]
    typestr: String,

    /// The length of the buffer (elements, not bytes)
    #[arg(long, env = "IPCVIEW_LENGTH", value_parser = parse_length)]
    length: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replace an exported buffer with its prefix sum
    Cumsum {
        /// The IPC memory handle as a 128-character hex string
        #[arg(long = "ipc-mem-handle", alias = "IpcMemHandle")]
        handle: String,
        #[command(flatten)]
        view: ViewArgs,
    },
    /// Write the prefix sum of one exported buffer into another
    CumsumInto {
        /// IPC memory handle of the input data
        #[arg(long = "ipc-mem-handle-data", alias = "IpcMemHandleData")]
        data: String,
        /// IPC memory handle of the output buffer
        #[arg(long = "ipc-mem-handle-output", alias = "IpcMemHandleOutput")]
        output: String,
        /// Exit without waiting for the kernel; readers of the output must
        /// not assume it is complete
        #[arg(long)]
        no_output_barrier: bool,
        #[command(flatten)]
        view: ViewArgs,
    },
    /// Bring up the driver and report the device count
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn parse_length(s: &str) -> std::result::Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("length must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .try_init(),
    };
}

impl Cli {
    #[cfg_attr(not(feature = "cuda"), allow(dead_code))]
    fn open_flags(&self) -> IpcOpenFlags {
        if self.lazy_peer_access {
            IpcOpenFlags::LAZY_ENABLE_PEER_ACCESS
        } else {
            IpcOpenFlags::NONE
        }
    }
}

/// Run one worker invocation against `driver`.
///
/// Handles and the type string are validated before the driver is touched.
#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
fn run<D: Driver>(cli: &Cli, driver: D) -> Result<()> {
    match &cli.command {
        Commands::Info => {
            driver.init().map_err(Error::Initialization)?;
            let count = driver.device_count().map_err(Error::Initialization)?;
            println!("{} CUDA device(s) available", count);
            Ok(())
        }
        Commands::Cumsum { handle, view } => {
            let handle = IpcMemHandle::from_hex(handle)?;
            let dtype = DType::parse_typestr(&view.typestr)?;

            let ctx = DeviceContext::initialize(driver, cli.device_id)?;
            let buf = IpcHandleResolver::new(&ctx)
                .with_flags(cli.open_flags())
                .open_handle(&handle)?;
            let mut data = TypedBufferView::with_dtype(buf, dtype, view.length)?;

            let done = OperationExecutor::new(&ctx, SyncPolicy::Hardened).cumsum_in_place(&mut data)?;
            report(done);
            Ok(())
        }
        Commands::CumsumInto {
            data,
            output,
            no_output_barrier,
            view,
        } => {
            let data = IpcMemHandle::from_hex(data)?;
            let output = IpcMemHandle::from_hex(output)?;
            let dtype = DType::parse_typestr(&view.typestr)?;
            if data == output {
                warn!("data and output handles are identical; the scan runs in place");
            }

            let ctx = DeviceContext::initialize(driver, cli.device_id)?;
            let resolver = IpcHandleResolver::new(&ctx).with_flags(cli.open_flags());
            let input = TypedBufferView::with_dtype(resolver.open_handle(&data)?, dtype, view.length)?;
            let mut out =
                TypedBufferView::with_dtype(resolver.open_handle(&output)?, dtype, view.length)?;

            let policy = if *no_output_barrier {
                SyncPolicy::Faithful
            } else {
                SyncPolicy::Hardened
            };
            let done = OperationExecutor::new(&ctx, policy).cumsum_into(&input, &mut out)?;
            report(done);
            Ok(())
        }
    }
}

#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
fn report(done: Completion) {
    match done {
        Completion::Synchronized => info!("results written"),
        Completion::Pending => {
            warn!("no barrier after the launch; waiting for it only when the mappings close")
        }
    }
}

#[cfg(feature = "cuda")]
fn execute(cli: &Cli) -> Result<()> {
    run(cli, ipcview_core::CudaDriver::new())
}

#[cfg(not(feature = "cuda"))]
fn execute(_cli: &Cli) -> Result<()> {
    Err(Error::Initialization(ipcview_core::DriverError::new(
        "cuInit",
        801,
        "CUDA_ERROR_NOT_SUPPORTED: ipcview was built without the `cuda` feature",
    )))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "worker failed");
            eprintln!("error: {}", e);
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                eprintln!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
