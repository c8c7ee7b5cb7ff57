//! IMG.LY Background Removal CLI Tool
//!
//! Command-line frontend of the imgly-bgremove-web library: preload assets,
//! remove backgrounds, and manage the asset cache.

#[cfg(feature = "cli")]
use imgly_bgremove_web::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
