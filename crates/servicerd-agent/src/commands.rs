//! Agent subcommands

use std::io::Write;

use serde::Serialize;
use servicerd_common::{
    Discovery, Registry, RegistryError, ServiceInstance, ServiceRegistry, Watcher,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One line of `list`/`watch` output
#[derive(Debug, Serialize)]
struct ServiceSnapshot<'a> {
    service: &'a str,
    instances: &'a [ServiceInstance],
}

fn write_snapshot(
    out: &mut (impl Write + ?Sized),
    service: &str,
    instances: &[ServiceInstance],
) -> anyhow::Result<()> {
    let line = serde_json::to_string(&ServiceSnapshot { service, instances })?;
    writeln!(out, "{}", line)?;
    out.flush()?;
    Ok(())
}

/// Register `instance` and keep it registered until `shutdown` fires, then
/// deregister it.
pub async fn register(
    registry: &dyn ServiceRegistry,
    instance: &ServiceInstance,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    registry.register(instance).await?;
    info!(
        "Registered {} ({}) with {} endpoints",
        instance.name,
        instance.id,
        instance.endpoints.len()
    );

    shutdown.cancelled().await;

    if let Err(e) = registry.deregister(instance).await {
        warn!("Failed to deregister {}: {}", instance.id, e);
        return Err(e.into());
    }
    info!("Deregistered {} ({})", instance.name, instance.id);
    Ok(())
}

/// Print the current instances of `name` as one JSON line.
pub async fn list(
    registry: &dyn ServiceRegistry,
    name: &str,
    out: &mut (impl Write + ?Sized),
) -> anyhow::Result<()> {
    let instances = registry.get_service(name).await?;
    write_snapshot(out, name, &instances)
}

/// Print a JSON line for every change of `name` until `cancel` fires.
pub async fn watch(
    registry: &dyn ServiceRegistry,
    name: &str,
    cancel: CancellationToken,
    out: &mut (impl Write + Send + ?Sized),
) -> anyhow::Result<()> {
    let mut watcher = registry.watch(name, cancel).await?;
    info!("Watching {}", name);

    loop {
        match watcher.next().await {
            Ok(()) => write_snapshot(out, name, &watcher.snapshot())?,
            Err(RegistryError::Cancelled) | Err(RegistryError::Closed) => break,
            Err(e) => {
                watcher.close();
                return Err(e.into());
            }
        }
    }
    watcher.close();
    Ok(())
}
