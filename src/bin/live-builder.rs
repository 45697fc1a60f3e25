use std::path::Path;

use anyhow::{bail, Context, Result};
use live_builder::{build, preflight, BuildConfig};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  live-builder build <config.toml> <rootdir> <architecture>\n  live-builder preflight <config.toml>"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, config, rootdir, arch] if cmd == "build" => {
            let config = load(config)?;
            init_tracing(&config);
            run_build(&config, Path::new(rootdir), arch)
        }
        [cmd, config] if cmd == "preflight" => {
            let config = load(config)?;
            init_tracing(&config);
            preflight::check_host_tools(&config).context("host preflight")?;
            println!("[preflight] all host tools present");
            Ok(())
        }
        _ => bail!(usage()),
    }
}

fn load(path: &str) -> Result<BuildConfig> {
    BuildConfig::load(Path::new(path)).with_context(|| format!("loading configuration '{path}'"))
}

fn init_tracing(config: &BuildConfig) {
    let default = if config.debug {
        "debug"
    } else if config.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn run_build(config: &BuildConfig, rootdir: &Path, arch: &str) -> Result<()> {
    preflight::check_host_tools(config).context("host preflight")?;

    let image = build::build(config, rootdir, arch).with_context(|| {
        format!("building {arch} image in '{}'", rootdir.display())
    })?;

    match image {
        Some(path) => println!("[build] image: {}", path.display()),
        None => println!("[build] no image format configured, packaging skipped"),
    }
    Ok(())
}
