fn main() -> anyhow::Result<()> {
    capkeep_lib::run()
}
