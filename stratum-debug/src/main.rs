use std::env;
use std::io::Write;

use anyhow::{anyhow, Result};
use clap::Parser;
use stratum::stratum::DebugKind;
use stratum::{Addr, OpenMode, Stratum};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// File location
    file: String,

    /// Address of the structure to print (decimal or 0x prefixed hex), or "header"
    target: String,

    /// Kind of structure (btree, snode, heap, ohdr or fs). Worked out from the structure's
    /// signature if not given.
    #[arg(short, long)]
    kind: Option<DebugKind>,

    /// Local heap holding link names, used when printing a symbol table node
    #[arg(long, value_parser = parse_addr)]
    heap: Option<Addr>,
}

fn parse_addr(input: &str) -> Result<Addr> {
    let value = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => input.parse::<u64>()?,
    };
    let addr = Addr::new(value);
    if !addr.is_defined() {
        return Err(anyhow!("{input} is not a valid file address"));
    }
    Ok(addr)
}

async fn print_target(file: &mut Stratum, cli: &Cli, out: &mut dyn Write) -> Result<()> {
    if cli.target.eq_ignore_ascii_case("header") {
        file.header_debug(out)?;
        return Ok(());
    }

    let addr = parse_addr(&cli.target)?;
    let kind = match cli.kind {
        Some(kind) => kind,
        None => file.detect(addr).await?,
    };
    tracing::info!(%addr, %kind, "printing structure");
    match kind {
        DebugKind::Snode => file.symbol_node_debug(addr, cli.heap, out).await?,
        kind => file.debug(addr, kind, out).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = match env::var("TMPDIR") {
        Ok(d) => d,
        Err(_e) => ".".to_string(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "stratum-debug.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt().with_writer(non_blocking).init();

    let mut file = Stratum::try_open(&cli.file, OpenMode::ReadOnly).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let printed = print_target(&mut file, &cli, &mut out).await;
    out.flush()?;
    file.close().await?;
    printed
}
