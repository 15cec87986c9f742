use std::path::PathBuf;

use clap::Parser;

use accesslog_pipeline::config::{load_config, SearchConfig};
use accesslog_pipeline::index::{
    ElasticsearchBackend, SearchBackend, SearchHits, SearchRequest, SortField,
};

#[derive(Parser)]
#[command(name = "accesslog-search")]
#[command(about = "List indexed access-log documents", long_about = None)]
struct Cli {
    /// Pipeline config file; its [search] section supplies endpoints and index
    #[arg(short, long, conflicts_with = "endpoint")]
    config: Option<PathBuf>,

    /// Search backend URL (repeatable)
    #[arg(short, long, default_value = "http://localhost:9200")]
    endpoint: Vec<String>,

    /// Index to read, defaults to the configured index
    #[arg(short, long)]
    index: Option<String>,

    #[arg(long, default_value_t = 0)]
    from: usize,

    #[arg(long, default_value_t = 10)]
    size: usize,

    /// Sort field, `-field` for descending (repeatable)
    #[arg(long, allow_hyphen_values = true)]
    sort: Vec<String>,

    /// Pretty-print each document
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (search, default_index) = match &cli.config {
        Some(path) => {
            let config = load_config(path)?;
            let index = config.index_name().to_string();
            (config.search, index)
        }
        None => (
            SearchConfig {
                endpoints: cli.endpoint.clone(),
                ..SearchConfig::default()
            },
            "accesslog".to_string(),
        ),
    };
    let index = cli.index.clone().unwrap_or(default_index);

    let backend = ElasticsearchBackend::new(&search)?;
    let request = SearchRequest {
        from: cli.from,
        size: cli.size,
        sort: cli.sort.iter().map(|s| SortField::parse(s)).collect(),
    };

    let hits = backend.search(&index, &request).await?;
    print_hits(&hits, cli.pretty)?;
    Ok(())
}

fn print_hits(hits: &SearchHits, pretty: bool) -> Result<(), serde_json::Error> {
    println!("{} documents in total, showing {}", hits.total, hits.hits.len());
    for hit in &hits.hits {
        let source = if pretty {
            serde_json::to_string_pretty(&hit.source)?
        } else {
            serde_json::to_string(&hit.source)?
        };
        println!("{} {}", hit.id, source);
    }
    Ok(())
}
