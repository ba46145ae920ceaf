mod app;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use repolens_index::context::{file_summary, summarize};
use repolens_index::reranker::{
    diversity_rerank, mmr, mmr_with_vectors, reciprocal_rank_fusion,
};
use repolens_index::{ContextAssembler, IndexReport, IndexWatcher, RetrievedChunk};
use repolens_store::VectorFilter;
use tokio_util::sync::CancellationToken;

use crate::app::App;
use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "repolens", version, about = "Index a repository and search it by meaning")]
struct Cli {
    /// Configuration file; missing files fall back to defaults.
    #[arg(long, global = true, env = "REPOLENS_CONFIG", default_value = "config/default.toml")]
    config: PathBuf,

    /// Repository working tree.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Repository id; defaults to the repository directory name.
    #[arg(long, global = true)]
    id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Index every tracked file, skipping files whose content is unchanged.
    Index {
        /// Re-embed every file regardless of stored hashes.
        #[arg(long)]
        force: bool,
    },
    /// Re-index files with uncommitted changes.
    Update,
    /// Re-index one repository-relative file.
    ReindexFile {
        path: String,
        /// Tag the chunks with the current commit instead of as uncommitted.
        #[arg(long)]
        committed: bool,
    },
    /// Search the index and print an assembled context.
    Query(QueryArgs),
    /// Show index totals for the repository.
    Stats,
    /// Release an indexing run left in progress by a killed process.
    Unlock,
    /// Watch the working tree and re-index files as they change.
    Watch,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum Rerank {
    None,
    #[default]
    Mmr,
    VectorMmr,
    Diversity,
    Fusion,
}

#[derive(Debug, clap::Args)]
struct QueryArgs {
    query: String,

    /// Number of chunks to return.
    #[arg(short = 'n', long)]
    results: Option<usize>,

    #[arg(long)]
    language: Option<String>,

    #[arg(long)]
    file: Option<String>,

    #[arg(long = "type")]
    chunk_type: Option<String>,

    /// Only chunks indexed from uncommitted changes.
    #[arg(long)]
    uncommitted: bool,

    /// Blend keyword hits into the score (comma separated).
    #[arg(long, value_delimiter = ',')]
    keywords: Vec<String>,

    #[arg(long, value_enum, default_value_t = Rerank::default())]
    rerank: Rerank,

    /// Print a full prompt instead of the bare context.
    #[arg(long)]
    prompt: bool,
}

fn init_subscriber(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Token cancelled on Ctrl-C; a second Ctrl-C is left to the default handler.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current batch");
            trigger.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_subscriber(&config.log_level);

    let app = App::new(config).await?;
    match cli.command {
        Command::Index { force } => {
            let target = app.open_target(&cli.repo, cli.id.as_deref()).await?;
            let indexer = app.indexer(&target);
            indexer
                .ensure_repository(&target.repo_id, &target.collection)
                .await?;
            let report = indexer
                .index_repository(&target.repo_id, force, &cancel_on_ctrl_c())
                .await?;
            print_report(&report);
        }
        Command::Update => {
            let target = app.open_target(&cli.repo, cli.id.as_deref()).await?;
            app.repository(&target.repo_id).await?;
            let report = app
                .indexer(&target)
                .incremental_index(&target.repo_id, &cancel_on_ctrl_c())
                .await?;
            print_report(&report);
        }
        Command::ReindexFile { path, committed } => {
            let target = app.open_target(&cli.repo, cli.id.as_deref()).await?;
            app.repository(&target.repo_id).await?;
            let written = app
                .indexer(&target)
                .index_single_file(&target.repo_id, &path, !committed)
                .await?;
            println!("{path}: {written} chunk(s) written");
        }
        Command::Query(args) => {
            let repo_id = match cli.id {
                Some(id) => id,
                None => app.open_target(&cli.repo, None).await?.repo_id,
            };
            query(&app, &repo_id, &args).await?;
        }
        Command::Stats => {
            let target = app.open_target(&cli.repo, cli.id.as_deref()).await?;
            app.repository(&target.repo_id).await?;
            let stats = app.indexer(&target).indexing_stats(&target.repo_id).await?;
            let repo = &stats.repository;
            println!("repository:   {} ({})", repo.id, repo.path);
            println!("collection:   {}", repo.collection_name);
            println!("status:       {}", repo.indexing_status);
            println!("files:        {}", stats.indexed_files);
            println!("chunks:       {} ({} stored)", repo.total_chunks, stats.collection_count);
            if let (Some(provider), Some(model)) = (&repo.embedding_provider, &repo.embedding_model) {
                println!("embedder:     {provider}/{model}");
            }
            if let Some(commit) = &repo.last_commit_hash {
                println!("commit:       {commit}");
            }
            if let Some(at) = &repo.last_indexed_at {
                println!("indexed at:   {at}");
            }
        }
        Command::Unlock => {
            let target = app.open_target(&cli.repo, cli.id.as_deref()).await?;
            if app.indexer(&target).unlock(&target.repo_id).await? {
                println!("{}: stale run released", target.repo_id);
            } else {
                println!("{}: no run in progress", target.repo_id);
            }
        }
        Command::Watch => {
            let target = app.open_target(&cli.repo, cli.id.as_deref()).await?;
            app.repository(&target.repo_id).await?;
            let root = target.vcs.root().to_path_buf();
            let indexer = Arc::new(app.indexer(&target));
            let _watcher =
                IndexWatcher::start(&root, &target.repo_id, indexer, app.config.debounce())?;
            println!("watching {} (Ctrl-C to stop)", root.display());
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
        }
    }
    Ok(())
}

fn print_report(report: &IndexReport) {
    println!(
        "{}: {} indexed, {} unchanged, {} failed, {} removed of {} files",
        report.repo_id,
        report.indexed_files,
        report.skipped_files,
        report.failed_files,
        report.removed_files,
        report.total_files,
    );
    println!(
        "{} chunks written, {} in collection {} ({:.1}s, {:.1} chunks/s)",
        report.chunks_written,
        report.total_chunks,
        report.collection,
        report.elapsed.as_secs_f64(),
        report.chunks_per_second,
    );
    if let Some(commit) = &report.latest_commit {
        println!("commit {commit}");
    }
}

fn query_filter(args: &QueryArgs) -> Option<VectorFilter> {
    let mut conditions = Vec::new();
    if let Some(language) = &args.language {
        conditions.push(("language", language.as_str()));
    }
    if let Some(file) = &args.file {
        conditions.push(("file_path", file.as_str()));
    }
    if let Some(chunk_type) = &args.chunk_type {
        conditions.push(("chunk_type", chunk_type.as_str()));
    }
    if args.uncommitted {
        conditions.push(("is_uncommitted", "true"));
    }

    let mut iter = conditions.into_iter();
    let (field, value) = iter.next()?;
    Some(iter.fold(VectorFilter::eq(field, value), |filter, (field, value)| {
        filter.and_eq(field, value)
    }))
}

async fn query(app: &App, repo_id: &str, args: &QueryArgs) -> anyhow::Result<()> {
    let repo = app.repository(repo_id).await?;
    let retriever = app.retriever();
    retriever.check_embedding_identity(&repo)?;

    let collection = repo.collection_name.as_str();
    let n = args.results.unwrap_or(retriever.config().default_results);
    let candidates = n * 2;
    let rerank = &app.config.retrieval.rerank;
    let min_similarity = retriever.config().min_similarity;
    let filter = query_filter(args);

    let chunks: Vec<RetrievedChunk> = match args.rerank {
        Rerank::VectorMmr => {
            let scored = retriever
                .retrieve_with_vectors(collection, &args.query, candidates, filter)
                .await?;
            mmr_with_vectors(
                scored.chunks,
                &scored.query_vector,
                &scored.vectors,
                rerank.mmr_lambda,
                n,
            )
        }
        Rerank::Fusion => {
            let semantic = retriever
                .retrieve(collection, &args.query, candidates, filter, min_similarity)
                .await?;
            let mut lists = vec![semantic];
            if !args.keywords.is_empty() {
                lists.push(
                    retriever
                        .hybrid_search(
                            collection,
                            &args.query,
                            &args.keywords,
                            candidates,
                            retriever.config().semantic_weight,
                        )
                        .await?,
                );
            }
            reciprocal_rank_fusion(&lists, rerank.rrf_k, Some(n))
        }
        mode => {
            let found = if args.keywords.is_empty() {
                retriever
                    .retrieve(collection, &args.query, candidates, filter, min_similarity)
                    .await?
            } else {
                retriever
                    .hybrid_search(
                        collection,
                        &args.query,
                        &args.keywords,
                        candidates,
                        retriever.config().semantic_weight,
                    )
                    .await?
            };
            match mode {
                Rerank::Mmr => mmr(found, rerank.mmr_lambda, n),
                Rerank::Diversity => diversity_rerank(found, n),
                _ => found.into_iter().take(n).collect(),
            }
        }
    };

    let summary = summarize(&chunks);
    tracing::info!(
        chunks = summary.total_chunks,
        files = summary.unique_files,
        avg_similarity = summary.avg_similarity,
        "query answered"
    );

    if chunks.is_empty() {
        println!("no matching chunks");
        return Ok(());
    }

    let assembler = ContextAssembler::new(&app.config.context);
    if args.prompt {
        println!("{}", assembler.assemble_prompt(&chunks, &args.query, None, true));
    } else {
        println!("{}\n", file_summary(&chunks));
        println!("{}", assembler.assemble(&chunks, None));
    }
    Ok(())
}
