//! Runtime diagnostics routes, mounted when `profiling` is enabled.

use serde::Serialize;

use crate::http::handler::{sync_handler, Flow};
use crate::http::request::Request;
use crate::http::router::{join_path, RouteTable};

/// Structured answer of the diagnostics route.
#[derive(Debug, Serialize)]
pub struct Report {
    pub name: String,
    pub listen: String,
    pub pid: u32,
    pub version: String,
    pub uptime_secs: u64,
    pub in_flight: u64,
    pub served: u64,
}

fn report(req: &mut Request) -> Flow {
    let runtime = req.runtime();
    let config = runtime.config();
    let report = Report {
        name: config.name().to_string(),
        listen: config.listen_address().to_string(),
        pid: std::process::id(),
        version: config.version().to_string(),
        uptime_secs: runtime.uptime().as_secs(),
        in_flight: runtime.tracker().active_count(),
        served: runtime.tracker().served_count(),
    };
    req.send_structured(&report)
}

/// Register the diagnostics route under `prefix`, with and without a
/// trailing slash. Returns `false` when a registered route already owns it.
pub(crate) fn mount(routes: &mut RouteTable, prefix: &str) -> bool {
    let bare = join_path(prefix, "");
    let slashed = join_path(prefix, "/");
    if routes.contains(&bare) || routes.contains(&slashed) {
        return false;
    }

    routes.route(&bare, vec![sync_handler(report)]);
    if slashed != bare {
        routes.route(&slashed, vec![sync_handler(report)]);
    }
    true
}
