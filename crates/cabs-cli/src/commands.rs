use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use colored::Colorize;
use futures::TryStreamExt;
use serde_json::json;
use thiserror::Error;

use cabs_registry::{default_registry, RegistryError};
use cabs_store::cursor::each_ref;
use cabs_store::{get_anchor, list_anchors, put_anchor, BlobStore, Context};
use cabs_sync::sync_all;
use cabs_types::{parse_timestamp, time, Blob, Ref, TypeError};

use crate::cli::*;

/// Failures attributable to how the command was invoked.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("no store configured; pass --config or set CABS_CONFIG")]
    NoConfig,

    #[error("cannot read configuration {}: {source}", path.display())]
    ReadConfig { path: PathBuf, source: io::Error },
}

/// Exit status for a failed command: 2 when the configuration or the
/// command-line arguments are at fault, 1 otherwise.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    let usage = error.chain().any(|cause| {
        cause.is::<UsageError>()
            || cause.is::<TypeError>()
            || cause
                .downcast_ref::<RegistryError>()
                .is_some_and(RegistryError::is_config)
    });
    if usage {
        2
    } else {
        1
    }
}

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let ctx = Context::background();
    let Cli {
        command,
        config,
        format,
        ..
    } = cli;
    if let Command::Sync(args) = &command {
        return cmd_sync(&ctx, args, &format).await;
    }

    let config = config.ok_or(UsageError::NoConfig)?;
    let store = open_store(&ctx, &config).await?;
    let result = run_on_store(&ctx, store.as_ref(), command, &format).await;
    let closed = store.close(&ctx).await;
    result?;
    closed.context("closing store")?;
    Ok(())
}

async fn run_on_store(
    ctx: &Context,
    store: &dyn BlobStore,
    command: Command,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    match command {
        Command::Get(args) => cmd_get(ctx, store, args).await,
        Command::Put(args) => cmd_put(ctx, store, args, format).await,
        Command::GetAnchor(args) => cmd_get_anchor(ctx, store, args).await,
        Command::PutAnchor(args) => cmd_put_anchor(ctx, store, args).await,
        Command::ListRefs(args) => cmd_list_refs(ctx, store, args).await,
        Command::ListAnchors(args) => cmd_list_anchors(ctx, store, args, format).await,
        // Sync names its own stores.
        Command::Sync(args) => cmd_sync(ctx, &args, format).await,
    }
}

async fn open_store(ctx: &Context, path: &Path) -> anyhow::Result<Arc<dyn BlobStore>> {
    let text = std::fs::read_to_string(path).map_err(|source| UsageError::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    let store = default_registry()
        .open_json(ctx, &text)
        .await
        .with_context(|| format!("opening store from {}", path.display()))?;
    Ok(store)
}

fn parse_ref(s: &str) -> anyhow::Result<Ref> {
    Ref::from_hex(s).with_context(|| format!("invalid ref {s:?}"))
}

async fn cmd_get(ctx: &Context, store: &dyn BlobStore, args: GetArgs) -> anyhow::Result<()> {
    let r = parse_ref(&args.r#ref)?;
    let blob = store.get(ctx, &r).await?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(&blob)?;
    stdout.flush()?;
    Ok(())
}

async fn cmd_put(
    ctx: &Context,
    store: &dyn BlobStore,
    args: PutArgs,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let data = if args.path == Path::new("-") {
        let mut buf = Vec::new();
        io::stdin().lock().read_to_end(&mut buf)?;
        buf
    } else {
        std::fs::read(&args.path).with_context(|| format!("reading {}", args.path.display()))?
    };
    let (r, added) = store.put(ctx, Blob::from(data)).await?;
    match format {
        OutputFormat::Text => {
            let status = if added { "added".green() } else { "present".dimmed() };
            println!("{r} {status}");
        }
        OutputFormat::Json => println!("{}", json!({"ref": r.to_hex(), "added": added})),
    }
    Ok(())
}

async fn cmd_get_anchor(
    ctx: &Context,
    store: &dyn BlobStore,
    args: GetAnchorArgs,
) -> anyhow::Result<()> {
    let at = match &args.time {
        Some(t) => parse_timestamp(t)?,
        None => time::now(),
    };
    let r = get_anchor(store, ctx, &args.name, at).await?;
    println!("{r}");
    Ok(())
}

async fn cmd_put_anchor(
    ctx: &Context,
    store: &dyn BlobStore,
    args: PutAnchorArgs,
) -> anyhow::Result<()> {
    let r = parse_ref(&args.r#ref)?;
    let at = parse_timestamp(&args.time)?;
    put_anchor(store, ctx, &args.name, r, at).await?;
    Ok(())
}

async fn cmd_list_refs(
    ctx: &Context,
    store: &dyn BlobStore,
    args: ListRefsArgs,
) -> anyhow::Result<()> {
    let start = match &args.start {
        Some(s) => parse_ref(s)?,
        None => Ref::zero(),
    };
    let mut stdout = io::stdout().lock();
    each_ref(store.list_refs(ctx, start), |r| -> anyhow::Result<()> {
        writeln!(stdout, "{r}")?;
        Ok(())
    })
    .await
}

async fn cmd_list_anchors(
    ctx: &Context,
    store: &dyn BlobStore,
    args: ListAnchorsArgs,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let start = args.start.unwrap_or_default();
    let mut anchors = list_anchors(store, ctx, &start);
    let mut stdout = io::stdout().lock();
    while let Some(anchor) = anchors.try_next().await? {
        match format {
            OutputFormat::Text => writeln!(
                stdout,
                "{}\t{}\t{}",
                anchor.name,
                anchor.at.to_rfc3339(),
                anchor.target
            )?,
            OutputFormat::Json => writeln!(
                stdout,
                "{}",
                json!({
                    "name": anchor.name,
                    "at": anchor.at.to_rfc3339(),
                    "ref": anchor.target.to_hex(),
                })
            )?,
        }
    }
    Ok(())
}

async fn cmd_sync(ctx: &Context, args: &SyncArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let mut stores = Vec::with_capacity(args.configs.len());
    for path in &args.configs {
        stores.push(open_store(ctx, path).await?);
    }
    let result = sync_all(ctx, &stores).await;
    for store in &stores {
        store.close(ctx).await.context("closing store")?;
    }
    let report = result?;

    match format {
        OutputFormat::Text => {
            println!(
                "{} {} refs, {} anchor entries across {} stores",
                "✓".green().bold(),
                report.refs.to_string().bold(),
                report.anchors.to_string().bold(),
                stores.len()
            );
            for (path, store) in args.configs.iter().zip(&report.stores) {
                println!(
                    "  {}: {} refs, {} anchors copied",
                    path.display().to_string().cyan(),
                    store.refs_copied,
                    store.anchors_copied
                );
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use cabs_store::StoreError;

    #[test]
    fn usage_errors_exit_with_two() {
        let missing = anyhow::Error::from(UsageError::NoConfig);
        assert_eq!(exit_code(&missing), 2);

        let bad_ref = parse_ref("xyz").unwrap_err();
        assert_eq!(exit_code(&bad_ref), 2);

        let unknown = anyhow::Error::from(RegistryError::UnknownType("tape".into()))
            .context("opening store from s.json");
        assert_eq!(exit_code(&unknown), 2);
    }

    #[test]
    fn runtime_errors_exit_with_one() {
        let not_found = anyhow::Error::from(StoreError::NotFound(Ref::of(b"x")));
        assert_eq!(exit_code(&not_found), 1);

        let opening = anyhow::Error::from(RegistryError::Store(StoreError::Fatal("disk".into())));
        assert_eq!(exit_code(&opening), 1);

        assert_eq!(exit_code(&anyhow!("anything else")), 1);
    }
}
