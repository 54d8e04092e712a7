//! trawl: polite, hook-driven web crawling from the command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;
use trawl::{
    config::{Config, LimitRuleConfig, LogFormat, LogLevel, LoggingConfig},
    crawler::{Crawler, Extraction},
    queue::Queue,
    util::{parse_seed, truncate_str},
    Outcome, Response,
};

#[derive(Parser)]
#[command(name = "trawl")]
#[command(about = "Polite, hook-driven web crawler")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "trawl.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl from one or more seed URLs
    Crawl {
        /// Seed URLs to start crawling from
        #[arg(required = true)]
        urls: Vec<String>,

        /// Maximum link depth (0 = unlimited)
        #[arg(short, long)]
        depth: Option<u32>,

        /// Only follow links on these domains (defaults to the seed domains)
        #[arg(long = "allowed-domain")]
        allowed_domains: Vec<String>,

        /// Follow links to any domain
        #[arg(long)]
        any_domain: bool,

        /// Stop after this many requests
        #[arg(short, long)]
        max_requests: Option<u64>,

        /// Delay between requests to the same host, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Concurrent requests per host
        #[arg(long)]
        parallelism: Option<usize>,

        /// Run discovered requests through a worker queue with this many workers
        #[arg(short, long)]
        threads: Option<usize>,

        /// Fetch in background tasks instead of inline
        #[arg(long = "async")]
        async_mode: bool,

        /// Cache responses in this directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Do not consult robots.txt
        #[arg(long)]
        ignore_robots: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Write a default configuration file
    Init {
        /// Output directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first so the logging section applies
    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Crawl {
            urls,
            depth,
            allowed_domains,
            any_domain,
            max_requests,
            delay_ms,
            parallelism,
            threads,
            async_mode,
            cache_dir,
            ignore_robots,
            format,
        } => {
            let options = CrawlOptions {
                depth,
                allowed_domains,
                any_domain,
                max_requests,
                delay_ms,
                parallelism,
                threads,
                async_mode,
                cache_dir,
                ignore_robots,
                json: format == "json",
            };
            crawl(config, urls, options).await
        }
        Commands::Init { path } => init_config(&path),
    }
}

fn init_logging(logging: &LoggingConfig, verbose: u8) -> Result<()> {
    let level = LogLevel::from_verbosity(verbose).unwrap_or(logging.level);

    let builder = FmtSubscriber::builder()
        .with_max_level(level.as_tracing())
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}

struct CrawlOptions {
    depth: Option<u32>,
    allowed_domains: Vec<String>,
    any_domain: bool,
    max_requests: Option<u64>,
    delay_ms: Option<u64>,
    parallelism: Option<usize>,
    threads: Option<usize>,
    async_mode: bool,
    cache_dir: Option<PathBuf>,
    ignore_robots: bool,
    json: bool,
}

async fn crawl(mut config: Config, url_strings: Vec<String>, options: CrawlOptions) -> Result<()> {
    let seeds: Vec<_> = url_strings.iter().filter_map(|s| parse_seed(s)).collect();
    if seeds.is_empty() {
        anyhow::bail!("No valid URLs provided");
    }
    info!("Seed URLs: {:?}", seeds.iter().map(|u| u.as_str()).collect::<Vec<_>>());

    // Command line flags override the config file
    let crawler_config = &mut config.crawler;
    if let Some(depth) = options.depth {
        crawler_config.max_depth = depth;
    }
    if let Some(max_requests) = options.max_requests {
        crawler_config.max_requests = max_requests;
    }
    if !options.allowed_domains.is_empty() {
        crawler_config.allowed_domains = options.allowed_domains;
    } else if crawler_config.allowed_domains.is_empty() && !options.any_domain {
        crawler_config.allowed_domains = seeds
            .iter()
            .filter_map(|u| u.host_str().map(str::to_string))
            .collect();
    }
    if options.delay_ms.is_some() || options.parallelism.is_some() {
        crawler_config.limits.push(LimitRuleConfig {
            domain_glob: Some("*".to_string()),
            parallelism: options.parallelism.unwrap_or(1),
            delay_ms: options.delay_ms.unwrap_or(0),
            ..Default::default()
        });
    }
    if options.async_mode {
        crawler_config.async_mode = true;
    }
    if options.cache_dir.is_some() {
        crawler_config.cache_dir = options.cache_dir;
    }
    if options.ignore_robots {
        crawler_config.ignore_robots_txt = true;
    }
    if let Some(threads) = options.threads {
        config.queue.threads = threads;
    }
    config.validate()?;

    let crawler = Crawler::new(config.crawler.clone()).context("Failed to build crawler")?;
    let queue = match options.threads {
        Some(_) => {
            let queue = Queue::from_config(&config.queue).context("Failed to open queue")?;
            crawler.attach_queue(queue.handle());
            Some(queue)
        }
        None => None,
    };

    let json = options.json;
    let use_queue = queue.is_some();
    crawler.on_html(move |response, extraction, follow| {
        print_page(response, extraction, json);
        for link in &extraction.links {
            if use_queue {
                follow.enqueue(link.as_str());
            } else {
                follow.visit_url(link.clone());
            }
        }
    });
    crawler.on_error(|request, response, error, _follow| {
        let status = response.map(|r| r.status.to_string()).unwrap_or_else(|| "-".to_string());
        warn!("{} {} failed ({}): {}", request.method, request.url, status, error);
    });

    // Ctrl-C stops in-flight fetches and lets the run wind down
    let canceller = crawler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let started = std::time::Instant::now();
    match &queue {
        Some(queue) => {
            for seed in &seeds {
                queue.add_url(seed.as_str())?;
            }
            queue.run(&crawler).await?;
        }
        None => {
            for seed in &seeds {
                match crawler.visit(seed.as_str()).await {
                    Ok(Outcome::Failed { error }) => warn!("{}: {}", seed, error),
                    Ok(_) => {}
                    Err(e) => warn!("{}: {}", seed, e),
                }
            }
            crawler.wait().await;
        }
    }

    print_summary(&crawler, started.elapsed(), json);
    Ok(())
}

fn print_page(response: &Response, extraction: &Extraction, json: bool) {
    for record in &extraction.records {
        if json {
            println!("{}", record);
            continue;
        }
        let title = record
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or_default();
        println!(
            "{} {} {}",
            response.status,
            response.url(),
            truncate_str(title, 60)
        );
    }
}

fn print_summary(crawler: &Crawler, elapsed: Duration, json: bool) {
    let stats = crawler.stats();
    if json {
        let summary = serde_json::json!({
            "admitted": stats.admitted,
            "delivered": stats.delivered,
            "cache_hits": stats.cache_hits,
            "failed": stats.failed,
            "aborted": stats.aborted,
            "skipped": stats.total_skipped(),
            "elapsed_ms": elapsed.as_millis() as u64,
        });
        eprintln!("{}", summary);
        return;
    }

    eprintln!("\nCrawl summary");
    eprintln!("=============");
    eprintln!("  Delivered:  {} ({} from cache)", stats.delivered, stats.cache_hits);
    eprintln!("  Failed:     {}", stats.failed);
    eprintln!("  Aborted:    {}", stats.aborted);
    eprintln!("  Skipped:    {}", stats.total_skipped());
    for reason in trawl::SkipReason::ALL {
        let count = stats.skipped(reason);
        if count > 0 {
            eprintln!("    {:<18} {}", reason.as_str(), count);
        }
    }
    eprintln!("  Elapsed:    {:.1}s", elapsed.as_secs_f64());
}

fn init_config(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory '{}'", path.display()))?;
    let config_path = path.join("trawl.toml");
    if config_path.exists() {
        anyhow::bail!("'{}' already exists", config_path.display());
    }

    let content = format!("# trawl configuration\n\n{}", Config::default_toml()?);
    std::fs::write(&config_path, content)
        .with_context(|| format!("Failed to write '{}'", config_path.display()))?;

    println!("Created configuration at {}", config_path.display());
    Ok(())
}
