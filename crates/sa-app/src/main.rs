use std::env;
use std::path::PathBuf;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use sa_app::backend;
use sa_app::collections::DEFAULT_COLLECTION;
use sa_app::config::AppConfig;
use sa_app::settings::Overrides;
use sa_app::{AppContext, WorkerEvent};
use sa_core::progress::ProgressEvent;
use sa_core::Scheduler;

#[derive(Parser, Debug)]
#[command(
    name = "seed-alchemy",
    version,
    about = "Local image generation with a reusable pipeline cache"
)]
struct Cli {
    /// Working directory holding images, thumbnails and settings
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one generation request to completion
    Generate(GenerateArgs),
    /// Serve the HTTP generation API
    Serve,
    /// List collections, or the images of one collection
    List { collection: Option<String> },
    /// Copy an image file into a collection
    Import {
        file: PathBuf,
        #[arg(long, default_value = DEFAULT_COLLECTION)]
        collection: String,
    },
    /// Move an image (`collection/NNNNN.png`) into another collection
    Move { image: String, collection: String },
    /// Delete an image and its thumbnail
    Delete { image: String },
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    scheduler: Option<Scheduler>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    guidance_scale: Option<f32>,
    #[arg(long)]
    count: Option<u32>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    collection: Option<String>,
    /// Upscale by this factor (2 or 4)
    #[arg(long)]
    upscale: Option<u32>,
    /// Restore faces
    #[arg(long)]
    face: bool,
}

impl From<GenerateArgs> for Overrides {
    fn from(args: GenerateArgs) -> Self {
        Self {
            prompt: args.prompt,
            negative_prompt: args.negative_prompt,
            model: args.model,
            scheduler: args.scheduler,
            seed: args.seed,
            steps: args.steps,
            guidance_scale: args.guidance_scale,
            width: args.width,
            height: args.height,
            count: args.count,
            collection: args.collection,
            upscale: args.upscale,
            face: args.face.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Some(root) = &cli.root {
        env::set_current_dir(root).with_context(|| format!("Failed to enter {}", root.display()))?;
    }

    let config = AppConfig::load()?;
    let ctx = AppContext::new(config)?;

    match cli.command {
        Command::Generate(args) => generate(ctx, args.into()).await,
        Command::Serve => backend::serve(ctx).await,
        Command::List { collection } => list(&ctx, collection.as_deref()),
        Command::Import { file, collection } => {
            let imported = ctx.collections.import_image(&file, &collection)?;
            ctx.collections.thumbnail(&imported)?;
            println!("{}", imported);
            Ok(())
        }
        Command::Move { image, collection } => {
            let moved = ctx.collections.move_image(&image, &collection)?;
            ctx.collections.thumbnail(&moved)?;
            println!("{}", moved);
            Ok(())
        }
        Command::Delete { image } => ctx.collections.delete_image(&image),
    }
}

fn list(ctx: &AppContext, collection: Option<&str>) -> anyhow::Result<()> {
    match collection {
        Some(name) => {
            for image in ctx.collections.images(name)? {
                println!("{}", image);
            }
        }
        None => {
            for name in ctx.collections.names() {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

async fn generate(mut ctx: AppContext, overrides: Overrides) -> anyhow::Result<()> {
    let request = ctx.settings.request(&overrides);
    info!(
        id = %request.id,
        seed = request.metadata.seed,
        prompt = %request.metadata.prompt,
        "Generating"
    );

    let written = tokio::task::spawn_blocking(move || {
        ctx.run_to_completion(request, |event| {
            if let WorkerEvent::Progress(ProgressEvent::Percent(p)) = event {
                info!("{}%", p);
            }
        })
    })
    .await??;

    for path in &written {
        println!("{}", path.display());
    }
    Ok(())
}
