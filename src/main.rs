//! Demo binary: one `echo` server driven by the standard command line.
//!
//! ```text
//! roost start -c conf/roost.yaml
//! curl localhost:8080/hello?name=roost
//! ```

use std::process::ExitCode;

use futures_util::future::BoxFuture;
use roost::http::BoxedHandler;
use roost::{handler, sync_handler, Flow, ProxyOverrides, Request, ServerInstance};
use serde::Serialize;

#[derive(Serialize)]
struct Echo<'a> {
    method: &'a str,
    uri: &'a str,
    remote: Option<String>,
    request_id: Option<&'a str>,
}

fn hello(req: &mut Request) -> Flow {
    let greeting = req
        .config()
        .get::<String>("greeting")
        .unwrap_or_else(|| "hello".to_string());
    let name = req.arg("name").unwrap_or("world").to_string();
    req.send_string(format!("{greeting}, {name}\n"))
}

fn echo(req: &mut Request) -> Flow {
    let body = Echo {
        method: req.method().as_str(),
        uri: req.request_uri(),
        remote: req.remote_addr().map(|a| a.to_string()),
        request_id: req.request_id(),
    };
    let value = serde_json::to_value(&body).unwrap_or_default();
    req.send_structured(&value)
}

fn upstream(req: &mut Request) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        let address = req
            .config()
            .get::<String>("upstream")
            .unwrap_or_else(|| "127.0.0.1:9000".to_string());
        req.proxy_pass(&address, ProxyOverrides::new()).await
    })
}

fn tag(req: &mut Request) -> Flow {
    req.var_mut().log_attach = "demo".to_string();
    req.next()
}

fn main() -> ExitCode {
    let common: Vec<BoxedHandler> = vec![sync_handler(tag)];

    let mut echo_server = ServerInstance::new("echo");
    echo_server
        .route("/hello", vec![sync_handler(hello)])
        .route("/echo", vec![sync_handler(echo)]);
    echo_server
        .group("/proxy", common)
        .route("/{*rest}", vec![handler(upstream)]);

    roost::cli::run(vec![echo_server])
}
