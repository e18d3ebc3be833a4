fn main() -> anyhow::Result<()> {
    lesion_core::run()
}
