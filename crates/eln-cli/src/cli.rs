use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use eln_types::DocumentType;

#[derive(Parser)]
#[command(
    name = "eln",
    about = "ELN document store: inspect drafts, final records and uploads",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Storage configuration (TOML). Defaults to the local backend.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// List drafts or final records of a SOP, newest first
    List(ListArgs),
    /// Print a stored document
    Get(GetArgs),
    /// Find a final record by its short id across all SOPs
    Find(FindArgs),
    /// Query final records of a SOP by exact form-data values
    Query(QueryArgs),
    /// Delete drafts older than a retention period
    Cleanup(CleanupArgs),
    /// Screen local files against the upload rules
    CheckUpload(CheckUploadArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// `drafts` or `submissions`
    pub doc_type: DocumentType,
    /// SOP id; empty lists drafts across every SOP
    #[arg(long, default_value = "")]
    pub sop: String,
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long)]
    pub status: Option<String>,
    /// Filename variables, matched by position
    #[arg(long = "var")]
    pub vars: Vec<String>,
    /// 0 means unlimited
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
}

#[derive(Args)]
pub struct GetArgs {
    pub doc_type: DocumentType,
    pub sop: String,
    /// Filename without `.json`; not needed for `sops`
    #[arg(default_value = "")]
    pub basename: String,
}

#[derive(Args)]
pub struct FindArgs {
    pub uuid: String,
}

#[derive(Args)]
pub struct QueryArgs {
    pub sop: String,
    /// `key=value`; the value is read as JSON when it parses, else as a string
    #[arg(long = "field", required = true)]
    pub fields: Vec<String>,
}

#[derive(Args)]
pub struct CleanupArgs {
    pub sop: String,
    #[arg(long, default_value = "30")]
    pub days: u32,
}

#[derive(Args)]
pub struct CheckUploadArgs {
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}
