use clap::Parser;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    version,
    about = "Transparent file cache for remote resources",
    long_about = "Resolves URLs through a size-bounded local file cache.\n\
                  \n\
                  Cached URLs print their local file path. Other URLs are fetched in the\n\
                  background, and with --wait the command reports where each one was\n\
                  installed. The oldest files are evicted once the cache exceeds its budget."
)]
pub struct CliArgs {
    /// URLs to resolve
    #[arg(required = true, help = "Remote URL(s) to resolve through the cache")]
    pub urls: Vec<String>,

    /// JSON file holding a proxy configuration
    #[arg(
        short,
        long,
        help = "Load the proxy configuration (identifier, root_dir, max_bytes) from a JSON file"
    )]
    pub config: Option<PathBuf>,

    /// Name of the cache
    #[arg(short, long, help = "Proxy identifier, naming the cache directory")]
    pub identifier: Option<String>,

    /// Directory holding all caches
    #[arg(short, long, help = "Root directory of the caches")]
    pub root_dir: Option<PathBuf>,

    /// Byte budget with optional unit (B, KB, MB, GB, TB)
    #[arg(
        short,
        long,
        help = "Maximum cache size with optional unit (B, KB, MB, GB, TB). Examples: \"500MB\", \"2GB\""
    )]
    pub max_bytes: Option<String>,

    /// Expected download size
    #[arg(
        long,
        help = "Expected size of each download; larger than the budget is rejected up front"
    )]
    pub expected_size: Option<String>,

    /// Wait for transfers
    #[arg(short, long, help = "Wait for background transfers and print the installed paths")]
    pub wait: bool,

    /// Remove cached items instead of resolving them
    #[arg(long, conflicts_with = "wait", help = "Delete the cached copies of the given URLs")]
    pub remove: bool,

    /// Overall timeout in seconds
    #[arg(
        long,
        default_value = "0",
        help = "Overall timeout in seconds for HTTP requests (0 for none)"
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value = "10",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    /// Read timeout in seconds
    #[arg(
        long,
        default_value = "30",
        help = "Read timeout in seconds (maximum time between receiving data chunks)"
    )]
    pub read_timeout: u64,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Start partial downloads over
    #[arg(long, help = "Do not resume partial downloads with range requests")]
    pub no_resume: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,
}
