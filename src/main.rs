use anyhow::Result;
use betterpm::cli::BetterpmCli;

fn main() {
    if let Err(e) = real_main() {
        eprintln!("betterpm error: {e:#}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let cli = BetterpmCli::parse();
    cli.run()
}
