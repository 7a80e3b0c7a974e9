use clap::Parser;
use frame_relay::{listener, session::SessionController, web::Web, Cli, VERSION};
use miette::{IntoDiagnostic, Result};
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .parse_default_env()
        .init();

    log::info!("frame-relay {} starting", VERSION);

    // Both are fatal before anything is served
    let settings = args.encoder_settings()?;
    let listener = listener::bind_first_available(args.address, &args.ports)
        .await
        .into_diagnostic()?;

    let web = Web::new(SessionController::shared(settings), args.max_body_bytes);

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("Web", move |subsys| {
            web.run(subsys, listener)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(args.shutdown_timeout))
    .await
    .into_diagnostic()
}
