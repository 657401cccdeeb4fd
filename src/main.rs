use gdbadapter::process::install_signal_protection;

#[tokio::main]
async fn main() {
    // stdout carries the DAP stream, so logs go to stderr
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("gdbadapter", log::LevelFilter::Info)
        .with_module_level("gdbdap", log::LevelFilter::Info)
        .env()
        .init()
        .unwrap();

    log::info!("GDB debug adapter starting...");

    // Pausing GDB with SIGINT must not take the adapter down with it
    install_signal_protection();

    let exit_code = match gdbdap::run_stdio().await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("Debug session failed: {}", e);
            1
        }
    };

    log::info!("Debug adapter exited with code: {exit_code}");
    std::process::exit(exit_code);
}
