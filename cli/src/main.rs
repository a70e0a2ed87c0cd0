//! bpptool - Command-line interface for the BPP peer engine.
//!
//! This is a simple CLI for testing and manual use of the engine. It parses
//! SOAP bodies, extracts job ids, and runs a sender and a printer against
//! each other in-process to exercise the transfer path.

use std::cell::Cell;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bpp_engine::{
    build_from_file, build_from_xml, files_match, pump, ChecksumAlgorithm, LoopbackTransport,
    PeerConfig, PortOperation, ProgressCallback, ResponseCode, Role, ServerPort, Session,
    SoapDocument,
};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{debug, info};

/// bpptool - Basic Printing Profile peer tool
#[derive(Parser, Debug)]
#[command(name = "bpptool")]
#[command(version = "0.1.0")]
#[command(about = "Parse BPP SOAP bodies and run loopback document transfers")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,

    /// Log level: off, error, warn, info, debug, trace
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the element tree of an XML document and print it
    Parse {
        /// XML document
        xml: PathBuf,

        /// Print the tree as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the JobId carried by an XML document
    JobId {
        /// XML document
        xml: PathBuf,
    },

    /// Push a file from a sender to a printer over an in-process transport
    Push {
        /// File to send
        file: PathBuf,

        /// Directory the printer stores received documents in
        #[arg(long, value_name = "PATH")]
        root: PathBuf,

        /// Transfer buffer size in bytes
        #[arg(long, value_name = "BYTES", default_value_t = bpp_engine::config::DEFAULT_BUFFER_SIZE)]
        buffer_size: usize,

        /// MIME type announced for the document
        #[arg(long, value_name = "TYPE", default_value = "application/octet-stream")]
        mime_type: String,

        /// Create a job with this request body and send the file as its document
        #[arg(long, value_name = "XML")]
        create_job: Option<PathBuf>,

        /// Enable verification after transfer (compares checksums)
        #[arg(long)]
        verify: bool,

        /// Checksum algorithm for verification: md5, sha256, blake3
        #[arg(long, value_name = "ALGORITHM", default_value = "sha256", requires = "verify")]
        hash: String,
    },
}

/// CLI implementation of ProgressCallback for displaying transfer progress
struct CliProgress {
    verbose: bool,
    start_time: Cell<Instant>,
    last_progress_update: Cell<Instant>,
    total_size: Cell<Option<u64>>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        let now = Instant::now();
        CliProgress {
            verbose,
            start_time: Cell::new(now),
            last_progress_update: Cell::new(now),
            total_size: Cell::new(None),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: std::time::Duration) -> String {
        let millis = elapsed.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else {
            format!("{:.1}s", elapsed.as_secs_f64())
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }
}

impl ProgressCallback for CliProgress {
    fn on_transfer_started(
        &self,
        port: ServerPort,
        op: PortOperation,
        path: &Path,
        total_size: Option<u64>,
    ) {
        self.start_time.set(Instant::now());
        self.total_size.set(total_size);
        eprintln!("{} on {} port: {}", op, port, path.display());
        if let Some(total) = total_size {
            eprintln!("  Total: {}", Self::format_bytes(total));
        }
    }

    fn on_transfer_progress(&self, _port: ServerPort, _op: PortOperation, bytes_so_far: u64) {
        // Throttle progress updates to avoid spam (max once per 200ms)
        if !self.verbose && self.last_progress_update.get().elapsed().as_millis() < 200 {
            return;
        }
        self.last_progress_update.set(Instant::now());

        match self.total_size.get() {
            Some(total) if total > 0 => {
                let percent = (bytes_so_far as f64 / total as f64 * 100.0) as u32;
                eprint!(
                    "\rProgress: {} | {}/{}",
                    Self::print_progress_bar(percent),
                    Self::format_bytes(bytes_so_far),
                    Self::format_bytes(total)
                );
            }
            _ => eprint!("\rProgress: {}", Self::format_bytes(bytes_so_far)),
        }
        let _ = std::io::stderr().flush();
    }

    fn on_transfer_completed(
        &self,
        _port: ServerPort,
        op: PortOperation,
        code: ResponseCode,
        bytes: u64,
    ) {
        eprintln!();
        eprintln!("{} finished: {}", op, code);
        eprintln!("Bytes sent: {}", Self::format_bytes(bytes));
        eprintln!(
            "Elapsed: {}",
            Self::format_duration(self.start_time.get().elapsed())
        );
    }
}

/// Parse and validate command-line arguments, then run the command
fn main() {
    let args = Args::parse();
    init_logging(&args);

    // Exit code tracking
    let exit_code = match run_cli(&args) {
        Ok(()) => 0,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

fn init_logging(args: &Args) {
    let level = match args.log_level.as_deref().map(str::to_lowercase).as_deref() {
        Some("off") => log::LevelFilter::Off,
        Some("error") => log::LevelFilter::Error,
        Some("warn") => log::LevelFilter::Warn,
        Some("info") => log::LevelFilter::Info,
        Some("debug") => log::LevelFilter::Debug,
        Some("trace") => log::LevelFilter::Trace,
        _ if args.verbose => log::LevelFilter::Debug,
        _ => log::LevelFilter::Warn,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<(), String> {
    match &args.command {
        Command::Parse { xml, json } => {
            let document = load_document(xml)?;
            print!("{}", render_document(&document, *json)?);
            Ok(())
        }
        Command::JobId { xml } => {
            let document = load_document(xml)?;
            match document.job_id() {
                Some(job_id) => {
                    println!("{}", job_id);
                    Ok(())
                }
                None => Err(format!("No JobId in {}", xml.display())),
            }
        }
        Command::Push {
            file,
            root,
            buffer_size,
            mime_type,
            create_job,
            verify,
            hash,
        } => {
            let request = PushRequest {
                file,
                root,
                buffer_size: *buffer_size,
                mime_type,
                create_job: create_job.as_deref(),
                checksum: if *verify { Some(hash.as_str()) } else { None },
                verbose: args.verbose,
            };
            run_push(&request)
        }
    }
}

fn load_document(xml: &Path) -> Result<SoapDocument, String> {
    build_from_file(xml).map_err(|e| format!("{}: {}", xml.display(), e))
}

fn render_document(document: &SoapDocument, json: bool) -> Result<String, String> {
    if json {
        let mut out = serde_json::to_string_pretty(document)
            .map_err(|e| format!("JSON encoding failed: {}", e))?;
        out.push('\n');
        return Ok(out);
    }

    Ok(format!(
        "{}\n{} top-level elements, {} in total\n",
        document,
        document.number_of_elements(),
        document.total_elements()
    ))
}

struct PushRequest<'a> {
    file: &'a Path,
    root: &'a Path,
    buffer_size: usize,
    mime_type: &'a str,
    create_job: Option<&'a Path>,
    checksum: Option<&'a str>,
    verbose: bool,
}

fn run_push(request: &PushRequest<'_>) -> Result<(), String> {
    // Validate source file exists
    if !request.file.is_file() {
        return Err(format!("Source file does not exist: {}", request.file.display()));
    }

    // Parse checksum algorithm if verification is enabled
    let checksum_algorithm = match request.checksum {
        Some(name) => Some(ChecksumAlgorithm::parse(name).ok_or_else(|| {
            format!(
                "Invalid hash algorithm '{}'. Must be 'md5', 'sha256', or 'blake3'",
                name
            )
        })?),
        None => None,
    };

    let file_name = request
        .file
        .file_name()
        .ok_or_else(|| format!("Source has no file name: {}", request.file.display()))?;
    let received = request.root.join(file_name);
    if same_file(request.file, &received) {
        return Err("The printer root already holds the source file".to_string());
    }

    let sender_root = match request.file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut sender = Session::new(
        PeerConfig::new(sender_root).with_buffer_size(request.buffer_size),
        LoopbackTransport::new(),
    )
    .map_err(|e| format!("Sender setup failed: {}", e))?;
    let mut printer = Session::new(
        PeerConfig::new(request.root).with_buffer_size(request.buffer_size),
        LoopbackTransport::new(),
    )
    .map_err(|e| format!("Printer setup failed: {}", e))?;
    sender.set_progress(Box::new(CliProgress::new(request.verbose)));

    let mut next_job_id = 1i64;
    let mut respond = |port: ServerPort, op: PortOperation, document: &SoapDocument| {
        debug!("printer answering {} on {} port:\n{}", op, port, document);
        if op != PortOperation::CreateJob {
            return (ResponseCode::NOT_IMPLEMENTED, None);
        }
        let body = format!(
            "<CreateJobResponse><JobId>{}</JobId><OperationStatus>0x0000</OperationStatus></CreateJobResponse>",
            next_job_id
        );
        next_job_id += 1;
        match build_from_xml(body.as_bytes()) {
            Ok(reply) => (ResponseCode::OK, Some(reply)),
            Err(_) => (ResponseCode::INTERNAL_SERVER_ERROR, None),
        }
    };

    match request.create_job {
        Some(xml) => {
            sender
                .create_job(xml)
                .map_err(|e| format!("Create Job failed: {}", e))?;
            pump(&mut sender, &mut printer, &mut respond)
                .map_err(|e| format!("Create Job failed: {}", e))?;
            let job_id = sender
                .job_id()
                .ok_or_else(|| "Printer returned no JobId".to_string())?;
            info!("sending document for job {}", job_id);
            sender
                .send_document(request.file, request.mime_type, Some(job_id))
                .map_err(|e| format!("Send Document failed: {}", e))?;
        }
        None => sender
            .file_push(request.file, request.mime_type)
            .map_err(|e| format!("File Push failed: {}", e))?,
    }

    let delivered = pump(&mut sender, &mut printer, &mut respond)
        .map_err(|e| format!("Transfer failed: {}", e))?;
    debug!("{} transport calls delivered", delivered);

    if !sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle() {
        return Err("Transfer did not finish".to_string());
    }
    if !received.is_file() {
        return Err(format!("Printer did not store {}", received.display()));
    }

    if let Some(algorithm) = checksum_algorithm {
        let matches = files_match(request.file, &received, algorithm)
            .map_err(|e| format!("Verification failed: {}", e))?;
        if !matches {
            return Err("Verification: source and received checksums differ".to_string());
        }
        eprintln!("Verification: OK ({})", algorithm);
    }

    println!("{}", received.display());
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
