use anyhow::Result;

fn main() -> Result<()> {
    let code = benchbox::cli::run()?;
    std::process::exit(code);
}
