// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::error::Error;
use std::path::PathBuf;

use clap::{crate_version, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use loopdeck::banks::summarize_source;
use loopdeck::bridge::ImportBridge;
use loopdeck::config::Settings;
use loopdeck::github::GithubResolver;
use loopdeck::scan;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "Sample bank tooling for the loopdeck live-coding engine."
)]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scans a local samples directory and writes a bootstrap sample map.
    ScanSamples {
        /// The samples directory. One sub-directory per sound.
        dir: PathBuf,
        /// Where to write the map. Printed to stdout if omitted.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Base URL the samples are served from.
        #[arg(long)]
        base: Option<String>,
    },
    /// Resolves a GitHub reference to owner, repo, ref and path.
    Resolve {
        /// e.g. github:owner/repo@ref/path or a github.com URL.
        reference: String,
    },
    /// Lists the audio files below a GitHub reference.
    Tree {
        reference: String,
    },
    /// Builds a sample pack from a GitHub reference and stashes it for import.
    Import {
        reference: String,
        /// Label for the imported bank.
        #[arg(long)]
        label: Option<String>,
    },
    /// Shows the pending sample import, if any.
    Pending {
        /// Consume the import instead of only showing it.
        #[arg(long)]
        take: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::ScanSamples { dir, out, base } => {
            let base = base.unwrap_or_else(|| settings.samples().base_url().to_string());
            let rendered = scan::write_sample_map(&dir, &base, out.as_deref())?;
            match out {
                Some(out) => println!("Wrote sample map to {}.", out.display()),
                None => println!("{}", rendered),
            }
        }
        Commands::Resolve { reference } => {
            let resolver = GithubResolver::from_settings(settings.github())?;
            let resolved = resolver.resolve(&reference).await?;
            println!("Owner: {}", resolved.owner);
            println!("Repo:  {}", resolved.repo);
            println!("Ref:   {}", resolved.git_ref);
            println!("Path:  {}", if resolved.path.is_empty() { "/" } else { &resolved.path });
        }
        Commands::Tree { reference } => {
            let resolver = GithubResolver::from_settings(settings.github())?;
            let resolved = resolver.resolve(&reference).await?;
            let tree = resolver.list_tree(&resolved).await?;
            let files: Vec<&str> = tree
                .iter()
                .filter(|entry| entry.is_file() && scan::is_audio_path(&entry.path))
                .map(|entry| entry.path.as_str())
                .collect();
            if files.is_empty() {
                println!("No audio files found.");
                return Ok(());
            }

            println!("Audio files (count: {}):", files.len());
            for file in files {
                println!("- {}", file);
            }
        }
        Commands::Import { reference, label } => {
            let resolver = GithubResolver::from_settings(settings.github())?;
            let resolved = resolver.resolve(&reference).await?;
            let tree = resolver.list_tree(&resolved).await?;
            let import = resolver.build_import(&resolved, &tree, label.as_deref());
            if import.map.is_empty() {
                return Err(format!("no audio files found below {}", reference).into());
            }

            let bridge = ImportBridge::new(settings.storage_dir());
            bridge.stash(&import)?;
            println!(
                "Stashed {} ({}) for import.",
                import.label,
                summarize_source(&import.source(), None)
            );
        }
        Commands::Pending { take } => {
            let bridge = ImportBridge::new(settings.storage_dir());
            let pending = if take { bridge.take()? } else { bridge.peek()? };
            let Some(import) = pending else {
                println!("No pending import.");
                return Ok(());
            };

            println!("Label: {}", import.label);
            if let Some(base_url) = &import.base_url {
                println!("Base:  {}", base_url);
            }
            println!("Sounds (count: {}):", import.map.len());
            for (sound, paths) in &import.map {
                println!("- {} ({} files)", sound, paths.file_count());
            }
        }
    }

    Ok(())
}
