fn main() -> anyhow::Result<()> {
    devcanvas_lib::run()
}
