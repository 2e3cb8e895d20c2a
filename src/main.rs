use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::fmt::time::Uptime;
use tracing_subscriber::EnvFilter;

use mtcore::cluster::{Engine, LocalNode};
use mtcore::config::AppConfig;
use mtcore::context::{IndexContextAnalyzer, MemoryIndex};
use mtcore::decoder::NeuralDecoder;
use mtcore::facade::TranslationService;
use mtcore::ir::ContextVector;
use mtcore::processing::{SimplePostprocessor, SimplePreprocessor};

#[derive(Parser, Debug)]
#[command(name = "mtcore")]
#[command(about = "Context-aware neural machine translation over external decoder processes", long_about = None)]
struct Args {
    /// Config file path (default: $MTCORE_CONFIG, or mtcore.toml searched upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Text whose domain similarity biases the translation
    #[arg(long, conflicts_with = "context_file")]
    context: Option<String>,

    /// File whose content is used as context
    #[arg(long, value_name = "FILE")]
    context_file: Option<PathBuf>,

    /// Maximum number of domains kept in the context vector
    #[arg(long, value_name = "K")]
    context_limit: Option<usize>,

    /// Alternative translations to request
    #[arg(long, default_value_t = 0)]
    nbest: usize,

    /// Zero-based GPU indices, one decoder process each (overrides config)
    #[arg(long, value_delimiter = ',')]
    gpu: Vec<usize>,

    /// Print the computed context vector to stderr
    #[arg(long)]
    print_context: bool,

    /// Text to translate; reads stdin lines when empty
    #[arg(value_name = "TEXT")]
    text: Vec<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(Uptime::default())
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let (mut cfg, cfg_path) = AppConfig::discover(args.config.clone())?;
    if let Some(p) = cfg_path.as_ref() {
        info!(config = %p.display(), "config loaded");
    }
    if !args.gpu.is_empty() {
        cfg.decoder.gpus = args.gpu.clone();
    }
    let limit = args.context_limit.unwrap_or(cfg.context.limit);

    let index = match cfg.context.corpora_dir.as_ref() {
        Some(dir) => MemoryIndex::load_dir(dir)
            .with_context(|| format!("index corpora: {}", dir.display()))?,
        None => MemoryIndex::new(),
    };
    info!(domains = index.len(), "context index ready");
    let analyzer = IndexContextAnalyzer::new(Arc::new(index), cfg.context.boost);

    let command = cfg.decoder_command()?;
    let decoder = Arc::new(
        NeuralDecoder::start(&command, &cfg.decoder.gpus).context("start decoder processes")?,
    );

    let engine = Arc::new(Engine {
        decoder: decoder.clone(),
        preprocessor: Arc::new(SimplePreprocessor::default()),
        postprocessor: Arc::new(SimplePostprocessor),
        context_analyzer: Arc::new(analyzer),
        source_language: cfg.engine.source_lang.clone(),
        target_language: cfg.engine.target_lang.clone(),
    });
    let node = Arc::new(LocalNode::new(engine, cfg.workers()).context("build job pool")?);
    let service = TranslationService::new(node.clone());

    let result = run(&service, &args, limit);
    node.shutdown();
    decoder.close();
    result
}

fn run(service: &TranslationService, args: &Args, limit: usize) -> anyhow::Result<()> {
    let context = if let Some(text) = args.context.as_deref() {
        Some(service.context_vector(text, limit).context("compute context")?)
    } else if let Some(path) = args.context_file.as_deref() {
        Some(
            service
                .context_vector_from_file(path, limit)
                .with_context(|| format!("compute context: {}", path.display()))?,
        )
    } else {
        None
    };
    if args.print_context {
        if let Some(cv) = context.as_ref() {
            eprintln!("{}", format_context(cv));
        }
    }

    let translate = |text: &str| -> anyhow::Result<()> {
        let t = service
            .get(text, context.as_ref(), args.nbest)
            .with_context(|| format!("translate: {text}"))?;
        println!("{}", t.text());
        for alt in t.nbest.iter().flatten() {
            println!("  | {}", alt.text());
        }
        Ok(())
    };

    if !args.text.is_empty() {
        for text in &args.text {
            translate(text)?;
        }
        return Ok(());
    }
    for line in io::stdin().lock().lines() {
        let line = line.context("read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        translate(&line)?;
    }
    Ok(())
}

fn format_context(cv: &ContextVector) -> String {
    let parts: Vec<String> = cv
        .entries()
        .iter()
        .map(|s| format!("{}:{:.4}", s.domain, s.weight))
        .collect();
    format!("context [{}]", parts.join(", "))
}
