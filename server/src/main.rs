use gateway_core::Config;
use gateway_server::Gateway;
use gateway_server::run_main;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout belongs to the JSON-RPC stream.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    info!(
        persistent = config.persistent_workspace_id.is_some(),
        http_port = ?config.http_port,
        "starting agent gateway"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let gateway = Gateway::new(config);
        // A termination signal is a clean exit; transports finish on their
        // own when stdin closes.
        tokio::select! {
            result = run_main(gateway) => result,
            _ = gateway_server::shutdown_signal() => Ok(()),
        }
    })?;

    Ok(())
}
