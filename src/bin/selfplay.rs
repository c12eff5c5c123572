fn main() -> anyhow::Result<()> {
    tengen::selfplay_cmd::run_main()
}
