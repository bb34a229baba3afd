use clap::Parser;

/// Offline-first session tracking client with a durable mutation queue
#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = None,
    version = concat!("v", env!("CARGO_PKG_VERSION")),
    disable_version_flag = true
)]
pub struct Cli {
    /// Remote operation to invoke, e.g. "sessions.start". Queued when offline.
    #[arg(long, value_name = "OPERATION")]
    pub call: Option<String>,

    /// JSON object passed as the argument bag of --call. Defaults to {}.
    #[arg(long, value_name = "JSON", requires = "call")]
    pub args: Option<String>,

    /// Replay queued operations now, then exits.
    #[arg(long)]
    pub sync_now: bool,

    /// Prints the number of queued operations, then exits.
    #[arg(long)]
    pub queue_count: bool,

    /// Prints the queued operations in replay order, then exits.
    #[arg(long)]
    pub list_queue: bool,

    /// Deletes every queued operation without replaying it, then exits.
    #[arg(long)]
    pub clear_queue: bool,

    /// Keeps running, replaying the queue whenever connectivity returns.
    #[arg(long)]
    pub watch: bool,

    /// Treat the device as offline regardless of connectivity.
    #[arg(long)]
    pub offline: bool,

    /// Optional config file. Defaults to '~/.session-sync.cfg'.
    #[arg(long, default_value = "~/.session-sync.cfg")]
    pub config: String,

    /// API base url for remote operations. Overrides api_url from the config file.
    #[arg(long)]
    pub api_url: Option<String>,

    /// Your api key; uses api_key from the config file by default.
    #[arg(long)]
    pub key: Option<String>,

    /// Optional queue database. Defaults to '~/.session-sync/queue.db'.
    #[arg(long)]
    pub queue_file: Option<String>,

    /// Optional log file. Defaults to '~/.session-sync.log'.
    #[arg(long)]
    pub log_file: Option<String>,

    /// Number of seconds to wait for the api. Defaults to timeout from the config file, or 30.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Optional front end name and version for the User-Agent header.
    #[arg(long)]
    pub client: Option<String>,

    /// Format output. Can be "text" or "json". Defaults to "text".
    #[arg(long)]
    pub output: Option<String>,

    /// Turns on debug messages in the log file.
    #[arg(long)]
    pub verbose: bool,

    /// (internal) Prints the user agent, as it will be sent to the api, then exits.
    #[arg(long)]
    pub user_agent: bool,

    /// Print version information and exit
    #[arg(long)]
    pub version: bool,
}

impl Cli {
    pub fn is_json_output(&self) -> bool {
        self.output
            .as_deref()
            .is_some_and(|format| format == "json" || format == "raw-json")
    }
}
