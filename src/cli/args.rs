use crate::api::{AnonymizeSettings, EntityType};
use crate::settings::{parse_keep, parse_mask_char, parse_rules};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "redact-desk",
    version,
    about = "Upload documents for de-identification and chat with the service"
)]
pub struct Cli {
    /// Debug-level logs on stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload a PDF or Word document and follow its processing live
    Upload(UploadArgs),
    /// Send a chat message in the current session
    Chat {
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Show stored conversation messages, oldest first
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Include the masked document text of upload results
        #[arg(long)]
        text: bool,
        /// Show the history the service keeps for the current chat session
        #[arg(long, conflicts_with = "text")]
        remote: bool,
    },
    /// Inspect or change stored settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Check that the service is reachable
    Health,
    /// List the tools and masking rules the service offers
    Tools,
    /// List exported (masked) files on the service
    Exports,
    /// Download an exported file
    Download {
        filename: String,
        /// Target path; defaults to the file name in the current directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Drop the chat session on the service and locally
    ClearSession,
}

#[derive(Debug, Subcommand)]
pub enum SettingsAction {
    Show,
    Set { key: String, value: String },
    Unset { key: String },
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    pub file: PathBuf,

    /// Comma-separated rules, e.g. IDCARD,PHONE
    #[arg(long, value_parser = parse_rules)]
    pub rules: Option<BTreeSet<EntityType>>,

    #[arg(long, value_parser = parse_mask_char)]
    pub mask_char: Option<char>,

    #[arg(long, value_parser = parse_keep)]
    pub keep_prefix: Option<u32>,

    #[arg(long, value_parser = parse_keep)]
    pub keep_suffix: Option<u32>,

    /// Use the single request/response endpoint instead of the event stream
    #[arg(long)]
    pub legacy: bool,

    /// Save the exported file into DIR once processing succeeds
    #[arg(long, value_name = "DIR")]
    pub download: Option<PathBuf>,

    /// Print the masked text of the result
    #[arg(long)]
    pub show_text: bool,

    /// With --show-text, print the original text instead
    #[arg(long, requires = "show_text")]
    pub show_original: bool,
}

impl UploadArgs {
    /// Overlay the flags given on the command line onto `base`.
    pub fn apply(&self, base: AnonymizeSettings) -> AnonymizeSettings {
        AnonymizeSettings {
            enabled_rules: self.rules.clone().unwrap_or(base.enabled_rules),
            mask_char: self.mask_char.unwrap_or(base.mask_char),
            keep_prefix: self.keep_prefix.unwrap_or(base.keep_prefix),
            keep_suffix: self.keep_suffix.unwrap_or(base.keep_suffix),
        }
    }
}
