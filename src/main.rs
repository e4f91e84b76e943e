fn main() -> anyhow::Result<()> {
    countdown::cli::run()
}
