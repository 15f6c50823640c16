use anyhow::{bail, Context};
use colored::Colorize;
use eln_records::upload::{validate_batch, validate_file};
use eln_records::{DocumentStore, ListFilter, Metadata, MetadataKind, MetadataType};
use eln_store::StorageConfig;
use eln_types::DocumentType;
use serde_json::{Map, Value};
use tracing::debug;

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    if let Command::CheckUpload(args) = cli.command {
        return cmd_check_upload(args, format);
    }

    let config = match &cli.config {
        Some(path) => StorageConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StorageConfig::default(),
    };
    debug!(backend = ?config.backend, config = ?cli.config, "opening document store");
    let store = DocumentStore::from_config(&config)?;

    match cli.command {
        Command::List(args) => cmd_list(&store, args, format).await,
        Command::Get(args) => cmd_get(&store, args).await,
        Command::Find(args) => cmd_find(&store, args, format).await,
        Command::Query(args) => cmd_query(&store, args, format).await,
        Command::Cleanup(args) => cmd_cleanup(&store, args, format).await,
        Command::CheckUpload(_) => Ok(()),
    }
}

async fn cmd_list(store: &DocumentStore, args: ListArgs, format: OutputFormat) -> anyhow::Result<()> {
    let metadata_type = match args.doc_type {
        DocumentType::Drafts => MetadataType::Draft,
        DocumentType::Submissions => MetadataType::Final,
        DocumentType::Sops => bail!("sops have no listing; use `eln get sops <id>`"),
    };
    let filter = ListFilter {
        user_id: args.user,
        status: args.status,
        filename_variables: args.vars,
    };
    let items = store
        .list(args.doc_type, &args.sop, metadata_type, &filter, Some(args.limit))
        .await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("No {} found.", args.doc_type);
        return Ok(());
    }
    for item in &items {
        print_metadata(item);
    }
    println!("\n{} {}", items.len().to_string().bold(), args.doc_type);
    Ok(())
}

async fn cmd_get(store: &DocumentStore, args: GetArgs) -> anyhow::Result<()> {
    match store.get(args.doc_type, &args.sop, &args.basename).await? {
        Some(document) => println!("{}", serde_json::to_string_pretty(&document)?),
        None => bail!("{} {}/{} not found", args.doc_type, args.sop, args.basename),
    }
    Ok(())
}

async fn cmd_find(store: &DocumentStore, args: FindArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (document, metadata) = store.get_by_uuid(&args.uuid).await?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        print_metadata(&metadata);
    }
    Ok(())
}

async fn cmd_query(store: &DocumentStore, args: QueryArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut filters = Map::new();
    for raw in &args.fields {
        let (key, value) = parse_field(raw)?;
        filters.insert(key, value);
    }
    let hits = store.query_by_fields(&args.sop, &filters).await?;

    if format == OutputFormat::Json {
        let documents: Vec<&Value> = hits.iter().map(|(doc, _)| doc).collect();
        println!("{}", serde_json::to_string_pretty(&documents)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No matching records.");
    }
    for (_, metadata) in &hits {
        print_metadata(metadata);
    }
    Ok(())
}

async fn cmd_cleanup(store: &DocumentStore, args: CleanupArgs, format: OutputFormat) -> anyhow::Result<()> {
    let deleted = store.cleanup_older_than(&args.sop, args.days).await?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::json!({ "sop_id": args.sop, "deleted": deleted }));
    } else {
        println!(
            "{} Removed {} draft(s) older than {} days from {}",
            "✓".green().bold(),
            deleted.to_string().bold(),
            args.days,
            args.sop.yellow()
        );
    }
    Ok(())
}

fn cmd_check_upload(args: CheckUploadArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut report = Vec::new();
    let mut sizes = Vec::new();
    let mut rejected = 0;

    for path in &args.paths {
        let content = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let name = path.to_string_lossy();
        sizes.push((name.to_string(), content.len()));
        match validate_file(&name, &content) {
            Ok(screened) => {
                if format == OutputFormat::Text {
                    println!("  {} {} ({} bytes)", "ok".green(), screened.sanitized_name, screened.size);
                }
                report.push(serde_json::json!({ "path": name, "accepted": screened }));
            }
            Err(err) => {
                rejected += 1;
                if format == OutputFormat::Text {
                    println!("  {} {}: {}", "rejected".red(), name, err.message);
                }
                report.push(serde_json::json!({
                    "path": name,
                    "code": err.code,
                    "message": err.message,
                }));
            }
        }
    }

    let batch: Vec<(&str, usize)> = sizes.iter().map(|(n, s)| (n.as_str(), *s)).collect();
    let batch_error = validate_batch(&batch).err();
    if format == OutputFormat::Json {
        let batch = batch_error
            .as_ref()
            .map(|e| serde_json::json!({ "code": e.code, "message": e.message }));
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "files": report, "batch": batch }))?
        );
    } else if let Some(err) = &batch_error {
        println!("  {} batch: {}", "rejected".red(), err.message);
    }

    if rejected > 0 || batch_error.is_some() {
        bail!("upload check failed");
    }
    Ok(())
}

fn print_metadata(item: &Metadata) {
    let when = item.timestamp.format("%Y-%m-%d %H:%M:%S");
    match &item.kind {
        MetadataKind::Draft(draft) => {
            println!(
                "{}  {}  {}  {:.0}%",
                draft.draft_uuid.yellow(),
                when.to_string().dimmed(),
                draft.draft_id,
                draft.completion_percentage
            );
        }
        MetadataKind::Final(fin) => {
            println!(
                "{}  {}  {}  {}",
                fin.eln_uuid.yellow().bold(),
                when.to_string().dimmed(),
                fin.filename,
                item.checksum.as_deref().unwrap_or("-").cyan()
            );
        }
    }
    println!("  sop: {}  user: {}  size: {} bytes", item.sop_id, item.user_id, item.size_bytes);
}

/// Parse `key=value`, reading the value as JSON when possible.
fn parse_field(raw: &str) -> anyhow::Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected key=value, got `{raw}`");
    };
    if key.is_empty() {
        bail!("empty field name in `{raw}`");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
