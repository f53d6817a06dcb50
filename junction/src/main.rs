mod cli;
mod config;
mod routes;

use std::process;
use std::sync::Arc;

use clap::Parser;
use pingora::server::Server;
use tokio::runtime::Runtime;

use junction_core::engine::{DataClient, Engine, InMemoryDataClient};
use junction_core::metrics::{Metrics, TracingMetrics};
use junction_core::proxy::{self, JunctionProxy};
use junction_core::route::RouteDef;
use junction_core::{core_filters, core_predicates, core_processors};

use cli::Cli;
use config::Config;

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt().with_thread_ids(true).init();

    let cli = Cli::parse();
    let mut conf = Config::load(cli.config.as_deref())?;
    conf.apply_cli(&cli);
    let route_defs = routes::from_cli(&cli);

    tracing::info!(listen = %conf.listen, routes = route_defs.len(), "junction configuration resolved");

    let rt = Runtime::new().expect("failed to build tokio runtime");
    let (mut server, service, _engine) = rt.block_on(bootstrap(&conf, route_defs))?;

    server.bootstrap();
    server.add_services(vec![service]);

    tracing::info!(pid = process::id(), "starting junction proxy");
    server.run_forever();
}

/// Builds the routing engine, spawns its poll-compile-publish loop, waits
/// for the first snapshot to publish, then wraps the compiled proxy
/// transport in a `pingora` service ready to be added to `server`.
async fn bootstrap(
    conf: &Config,
    route_defs: Vec<RouteDef>,
) -> miette::Result<(Server, Box<dyn pingora::services::Service>, Arc<Engine>)> {
    let predicates = core_predicates();
    let filters = core_filters();
    let (pre, post) = core_processors(conf.queue_close_delay());

    let client: Arc<dyn DataClient> = Arc::new(InMemoryDataClient::new("static", route_defs));
    let engine =
        Arc::new(Engine::new(vec![client], pre, post, predicates, filters, conf.poll_interval()));

    let background = engine.clone();
    tokio::spawn(async move { background.run().await });
    engine.wait_first_load().await;

    let server = Server::new_with_opt_and_conf(conf.pingora_opt(), conf.pingora_server_conf());

    let metrics: Arc<dyn Metrics> = Arc::new(TracingMetrics::default());
    let junction_proxy = JunctionProxy::new(engine.store(), metrics, conf.loop_cap);
    let mut service = proxy::service(junction_proxy, &server.configuration);
    service.add_tcp(&conf.listen);

    Ok((server, Box::new(service), engine))
}
