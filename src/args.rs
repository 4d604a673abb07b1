use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "statushub")]
#[command(version)]
#[command(about = "Status host for out-of-process extensions", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the host in the foreground (Ctrl+C to stop)
    Run,

    /// Show whether the host is running
    Status,

    /// List installed extensions
    List {
        /// Only extensions any client may read
        #[arg(long)]
        world_readable: bool,
    },

    /// Print the latest status of an extension
    Get {
        /// Extension identity (package/component)
        identity: String,
    },

    /// Ask extensions to refresh
    Update {
        /// Extension identity; all active extensions if omitted
        identity: Option<String>,

        /// Update reason (initial, periodic, settings_changed, content_changed, screen_on, manual)
        #[arg(short, long, default_value = "manual")]
        reason: String,
    },

    /// Stream status changes for the given extensions (Ctrl+C to stop)
    Watch {
        /// Extension identities (package/component)
        #[arg(required = true)]
        identities: Vec<String>,
    },

    /// Report a screen-on event to the host
    ScreenOn,

    /// Report installed, removed or replaced packages
    PackagesChanged {
        /// Package that changed, if known
        package: Option<String>,
    },

    /// Stop the running host
    Shutdown,
}
