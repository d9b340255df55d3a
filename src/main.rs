use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use sqlweave::export;
use sqlweave::{Catalog, CellValue, Engine, Paging, QueryRequest};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
    Tsv,
    Json,
}

/// Run a catalog statement (or literal SQL) and print the shaped result
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Statement id from the catalog, or literal SQL
    statement: String,

    /// Catalog file; defaults to the user config directory
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Named parameter, repeatable: `-p status=1`
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Run against this data source instead of the routed one
    #[arg(long = "data-source")]
    data_source: Option<String>,

    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Page number; prints the page as JSON
    #[arg(long)]
    page: Option<u64>,

    #[arg(long = "page-size", default_value_t = 20)]
    page_size: u64,

    /// Treat the statement as a write, commit it and print the row count
    #[arg(long)]
    execute: bool,
}

fn parse_param(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got `{}`", s)),
    }
}

fn param_value(raw: &str) -> CellValue {
    match raw.parse::<i64>() {
        Ok(n) => CellValue::Int64(n),
        Err(_) if raw.eq_ignore_ascii_case("null") => CellValue::Null,
        Err(_) => CellValue::from(raw),
    }
}

fn load_catalog(path: Option<&PathBuf>) -> Result<Catalog> {
    let mut catalog = match path {
        Some(p) => Catalog::load(p).with_context(|| format!("loading {}", p.display()))?,
        None => Catalog::load_default()?,
    };
    if catalog.data_sources.is_empty() {
        bail!("the catalog declares no data sources");
    }

    // Resolve passwords: PGPASSWORD env var, then interactive prompt
    for ds in catalog.data_sources.iter_mut().filter(|d| d.password.is_empty()) {
        if let Ok(pw) = std::env::var("PGPASSWORD") {
            ds.password = pw;
        } else {
            let prompt = format!("Password for {}: ", ds.display_string());
            ds.password = rpassword::read_password_from_tty(Some(&prompt))?;
        }
    }
    Ok(catalog)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let catalog = load_catalog(cli.catalog.as_ref())?;
    let engine = Engine::from_catalog(catalog)?.build();

    let mut req = QueryRequest::new(cli.statement.clone());
    for (name, value) in &cli.params {
        req = req.param(name.clone(), param_value(value));
    }
    if let Some(ds) = &cli.data_source {
        req = req.data_source(ds.clone());
    }

    if cli.execute {
        let affected = engine.execute(req.auto_commit(true)).await?;
        println!("{} row(s) affected", affected);
        return Ok(());
    }

    if let Some(page_no) = cli.page {
        let page = engine
            .find_page_maps(req, Paging::new(page_no, cli.page_size))
            .await?;
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    let data = engine.find_table(req).await?;
    let rendered = match cli.format {
        OutputFormat::Table => export::to_table(&data),
        OutputFormat::Csv => export::to_csv(&data),
        OutputFormat::Tsv => export::to_tsv(&data),
        OutputFormat::Json => export::to_json(&data),
    };
    print!("{}", rendered);
    Ok(())
}
