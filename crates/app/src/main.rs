use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use journal_ingest_core::{
    expand_inputs, records_path, Category, CharacterNgramEmbedder, ChatClient, Embedder, IndexPaths,
    InfluenceOutcome, JournalIngestor, MemoryRecordStore, NoopTagger, OcrChain, OpenAiConfig,
    OpenAiEmbedder, OpenAiTagger, PromptChoice, SimilarityIndex, Tagger, TesseractOcr, VisionOcr,
    DEFAULT_OPENAI_BASE_URL,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "journal-ingest", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the index artifacts and the record store
    #[arg(long, env = "JOURNAL_DATA_DIR", default_value = "./data", global = true)]
    data_dir: PathBuf,

    /// API key for the OpenAI-compatible endpoint
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    openai_api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL, global = true)]
    openai_base_url: String,

    /// Embedding model name
    #[arg(long, default_value = "text-embedding-3-small", global = true)]
    embedding_model: String,

    /// Embedding vector dimension; must match the model and any existing index
    #[arg(long, default_value = "1536", global = true)]
    embedding_dimensions: usize,

    /// Vision model used for OCR
    #[arg(long, default_value = "gpt-4o-mini", global = true)]
    vision_model: String,

    /// Chat model used for tags and insights
    #[arg(long, default_value = "gpt-4o-mini", global = true)]
    tagging_model: String,

    /// Tesseract binary used as the fallback OCR engine
    #[arg(long, default_value = "tesseract", global = true)]
    tesseract_bin: String,

    /// Timeout for each external request, in seconds
    #[arg(long, default_value = "60", global = true)]
    request_timeout_secs: u64,

    /// Use the local embedder and tesseract only, without tagging
    #[arg(long, default_value_t = false, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest journal page images, files or folders.
    Ingest {
        /// Image files or folders searched recursively.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Built-in prompt preset: default, therapist, coach, stoic, productivity.
        #[arg(long)]
        preset: Option<String>,
        /// JSON prompt file with name, system_prompt and instructions.
        #[arg(long)]
        prompt_file: Option<PathBuf>,
    },
    /// Search the similarity index.
    Search {
        /// Search query
        #[arg(long)]
        query: String,
        /// Number of results to return.
        #[arg(long, default_value = "5")]
        top_k: usize,
        /// Restrict results to journal or influence.
        #[arg(long)]
        category: Option<Category>,
    },
    /// Print index statistics.
    Stats,
    /// Delete a record from storage and the index.
    Remove {
        #[arg(long)]
        id: u64,
        #[arg(long, default_value = "journal")]
        category: Category,
    },
    /// Add a quote or excerpt as an influence.
    AddInfluence {
        #[arg(long)]
        text: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        source_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        data_dir = %cli.data_dir.display(),
        offline = cli.offline,
        "journal-ingest boot"
    );

    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("cannot create data dir {}", cli.data_dir.display()))?;

    let prompt = match &cli.command {
        Command::Ingest {
            preset,
            prompt_file,
            ..
        } => PromptChoice::resolve(preset.as_deref(), prompt_file.as_deref())?,
        _ => PromptChoice::default_prompt(),
    };

    let timeout = Duration::from_secs(cli.request_timeout_secs);
    let tesseract = Box::new(TesseractOcr::new(cli.tesseract_bin.clone(), timeout));

    if cli.offline {
        let embedder = CharacterNgramEmbedder {
            dimensions: cli.embedding_dimensions,
        };
        return run(&cli, embedder, OcrChain::new(tesseract), NoopTagger, prompt).await;
    }

    if cli.openai_api_key.is_none() {
        bail!("OPENAI_API_KEY (or --openai-api-key) is required unless --offline is set");
    }

    let config = OpenAiConfig::new(&cli.openai_base_url, cli.openai_api_key.clone(), timeout)?;
    let embedder = OpenAiEmbedder::new(
        config.clone(),
        Some(cli.embedding_model.clone()),
        cli.embedding_dimensions,
    )?;
    let vision = VisionOcr::new(ChatClient::new(config.clone(), Some(cli.vision_model.clone()))?);
    let tagger = OpenAiTagger::new(ChatClient::new(config, Some(cli.tagging_model.clone()))?);
    let ocr = OcrChain::new(Box::new(vision)).with_fallback(tesseract);

    info!(model = embedder.model(), dimensions = cli.embedding_dimensions, "using OpenAI embeddings");
    run(&cli, embedder, ocr, tagger, prompt).await
}

async fn run<E, T>(cli: &Cli, embedder: E, ocr: OcrChain, tagger: T, prompt: PromptChoice) -> anyhow::Result<()>
where
    E: Embedder + Send + Sync,
    T: Tagger + Send + Sync,
{
    let store = MemoryRecordStore::open(records_path(&cli.data_dir))?;
    let index = SimilarityIndex::open(embedder, IndexPaths::in_dir(&cli.data_dir));
    let ingestor = JournalIngestor::new(store, index, ocr, tagger, prompt)?;

    match &cli.command {
        Command::Ingest { inputs, .. } => {
            let images = expand_inputs(inputs);
            if images.is_empty() {
                warn!("no images found in the given inputs");
            }

            let summary = ingestor.ingest_batch(&images).await;
            for failure in &summary.errors {
                warn!(file = %failure.file, reason = %failure.reason, "ingest error");
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Search {
            query,
            top_k,
            category,
        } => {
            let hits = ingestor.search(query, *top_k, *category).await?;
            if hits.is_empty() {
                println!("no matches");
            }
            for hit in hits {
                println!(
                    "[{}] score={:.4} record_id={}",
                    hit.category, hit.score, hit.record_id
                );
                println!("  {}", hit.entry.text_preview);
            }
        }
        Command::Stats => {
            let stats = ingestor.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Remove { id, category } => {
            let removed = ingestor.delete_record(*category, *id).await?;
            println!("removed {} record {}", removed.category, removed.id);
        }
        Command::AddInfluence {
            text,
            title,
            source_url,
        } => match ingestor
            .ingest_influence(text, title.clone(), source_url.clone())
            .await?
        {
            InfluenceOutcome::Created {
                record_id,
                tag_count,
            } => println!("added influence {record_id} with {tag_count} tags"),
            InfluenceOutcome::Duplicate { existing_id } => {
                println!("influence already stored as {existing_id}")
            }
        },
    }

    ingestor.flush().await?;
    Ok(())
}
