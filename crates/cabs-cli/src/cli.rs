use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cabs",
    about = "Content-addressed blob store: get, put, anchor and sync blobs",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Store configuration document (JSON)
    #[arg(short, long, global = true, env = "CABS_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a blob's bytes to stdout
    Get(GetArgs),
    /// Store a file's contents as a blob
    Put(PutArgs),
    /// Resolve an anchor as of a time
    GetAnchor(GetAnchorArgs),
    /// Point an anchor at a ref from a time onward
    PutAnchor(PutAnchorArgs),
    /// List refs in order
    ListRefs(ListRefsArgs),
    /// List anchor entries by name, then time
    ListAnchors(ListAnchorsArgs),
    /// Bring two or more stores to the same contents
    Sync(SyncArgs),
}

#[derive(Args)]
pub struct GetArgs {
    /// Ref in hex
    #[arg(value_name = "REF")]
    pub r#ref: String,
}

#[derive(Args)]
pub struct PutArgs {
    /// File to store; `-` reads stdin
    pub path: PathBuf,
}

#[derive(Args)]
pub struct GetAnchorArgs {
    pub name: String,
    /// Defaults to now
    pub time: Option<String>,
}

#[derive(Args)]
pub struct PutAnchorArgs {
    pub name: String,
    #[arg(value_name = "REF")]
    pub r#ref: String,
    pub time: String,
}

#[derive(Args)]
pub struct ListRefsArgs {
    /// List refs strictly after this one
    pub start: Option<String>,
}

#[derive(Args)]
pub struct ListAnchorsArgs {
    /// List names strictly after this one
    pub start: Option<String>,
}

#[derive(Args)]
pub struct SyncArgs {
    /// Configuration documents of the stores to reconcile
    #[arg(num_args = 2.., required = true)]
    pub configs: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_get() {
        let cli = Cli::try_parse_from(["cabs", "get", "abcd"]).unwrap();
        if let Command::Get(args) = cli.command {
            assert_eq!(args.r#ref, "abcd");
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_put_with_config() {
        let cli = Cli::try_parse_from(["cabs", "--config", "store.json", "put", "file.txt"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("store.json")));
        assert!(matches!(cli.command, Command::Put(_)));
    }

    #[test]
    fn parse_get_anchor_time_optional() {
        let cli = Cli::try_parse_from(["cabs", "get-anchor", "head"]).unwrap();
        if let Command::GetAnchor(args) = cli.command {
            assert_eq!(args.name, "head");
            assert!(args.time.is_none());
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_put_anchor_needs_time() {
        assert!(Cli::try_parse_from(["cabs", "put-anchor", "head", "abcd"]).is_err());
        let cli = Cli::try_parse_from(["cabs", "put-anchor", "head", "abcd", "2020-01-01"]).unwrap();
        if let Command::PutAnchor(args) = cli.command {
            assert_eq!(args.r#ref, "abcd");
            assert_eq!(args.time, "2020-01-01");
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_list_refs_from_start() {
        let cli = Cli::try_parse_from(["cabs", "list-refs"]).unwrap();
        assert!(matches!(cli.command, Command::ListRefs(ListRefsArgs { start: None })));
        let cli = Cli::try_parse_from(["cabs", "list-anchors", "m"]).unwrap();
        if let Command::ListAnchors(args) = cli.command {
            assert_eq!(args.start, Some("m".into()));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_sync_needs_two_stores() {
        assert!(Cli::try_parse_from(["cabs", "sync", "a.json"]).is_err());
        let cli = Cli::try_parse_from(["cabs", "sync", "a.json", "b.json", "c.json"]).unwrap();
        if let Command::Sync(args) = cli.command {
            assert_eq!(args.configs.len(), 3);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_verbose() {
        let cli = Cli::try_parse_from(["cabs", "--verbose", "list-refs"]).unwrap();
        assert!(cli.verbose);
    }

    #[test]
    fn parse_json_format() {
        let cli = Cli::try_parse_from(["cabs", "--format", "json", "list-anchors"]).unwrap();
        assert!(matches!(cli.format, OutputFormat::Json));
    }
}
