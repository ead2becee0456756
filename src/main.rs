fn main() -> anyhow::Result<()> {
    udp_call_lib::run()
}
