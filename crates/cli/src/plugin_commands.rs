use std::path::{Path, PathBuf};

use {
    anyhow::{Result, bail},
    clap::Args,
    switchyard_gateway::{
        RestServer, RestServerOptions, SocketServer, SocketServerOptions, builtin,
    },
    switchyard_plugins::{HandlerSink, ImportReport, PluginCatalog},
};

#[derive(Args)]
pub struct CheckArgs {
    /// REST plugin directory.
    #[arg(long)]
    rest: Option<PathBuf>,
    /// Socket plugin directory.
    #[arg(long)]
    socket: Option<PathBuf>,
}

pub async fn check_plugins(args: CheckArgs) -> Result<()> {
    if args.rest.is_none() && args.socket.is_none() {
        bail!("nothing to check: pass --rest and/or --socket");
    }

    // Never listens; registering is all that's exercised.
    let rest = RestServer::new(RestServerOptions::default());
    let socket = SocketServer::new(SocketServerOptions::new(&rest)).await?;

    let mut failed = 0;
    if let Some(dir) = &args.rest {
        let report = check("rest", dir, &builtin::rest_catalog(), &rest).await?;
        failed += report.failures.len();
    }
    if let Some(dir) = &args.socket {
        let report = check("socket", dir, &builtin::socket_catalog(), &socket).await?;
        failed += report.failures.len();
    }

    if failed > 0 {
        bail!("{failed} plugin(s) failed to import");
    }
    println!("all plugins OK");
    Ok(())
}

async fn check<H, S>(
    kind: &str,
    dir: &Path,
    catalog: &PluginCatalog<H>,
    sink: &S,
) -> Result<ImportReport>
where
    H: Send + 'static,
    S: HandlerSink<H>,
{
    let report = switchyard_plugins::import(dir, catalog, sink).await?;
    println!("{kind} ({}): {} loaded", dir.display(), report.loaded);
    let mut failures = report.failures.clone();
    failures.sort();
    for failure in &failures {
        println!("  ✗ {failure}");
    }
    Ok(report)
}
