use anyhow::Result;

fn main() -> Result<()> {
    ftl_cli::run()
}
