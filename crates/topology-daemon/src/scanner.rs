//! Bounded discovery scans.

use crate::actor::TopologyHandle;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use topology_core::DiscoveryReport;
use topology_core::error::Result;
use topology_core::transport::{DiscoveryService, RoleFilter};
use tracing::{debug, info};

/// Start a scan and feed its results into the topology until the stream
/// ends or `timeout` elapses, whichever comes first. The deadline covers
/// starting the scan too.
pub async fn run(
    handle: &TopologyHandle,
    discovery: &dyn DiscoveryService,
    filter: RoleFilter,
    timeout: Duration,
) -> Result<DiscoveryReport> {
    let deadline = sleep_until(Instant::now() + timeout);
    tokio::pin!(deadline);

    let mut report = DiscoveryReport::default();
    let mut hellos = tokio::select! {
        _ = &mut deadline => {
            debug!("Scan did not start within {:?}", timeout);
            report.timed_out = true;
            return Ok(report);
        }
        stream = discovery.scan(filter) => stream?,
    };

    loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!("Scan deadline reached after {:?}", timeout);
                report.timed_out = true;
                break;
            }
            hello = hellos.next() => {
                let Some(hello) = hello else {
                    break;
                };
                report.seen += 1;
                match handle.add_discovered(hello).await? {
                    Some(identity) => report.added.push(identity),
                    None => report.duplicates += 1,
                }
            }
        }
    }

    info!(
        "Scan finished: {} hello(s), {} new, {} duplicate(s)",
        report.seen,
        report.added.len(),
        report.duplicates
    );
    Ok(report)
}
