//! Forked host role
//!
//! Runs inside the child process: builds an in-process sandbox over the
//! launch code paths, binds a loopback listener, announces its port on
//! stdout and serves one request per connection, each on its own thread.

use crate::config::types::{ExecutionRequest, Result};
use crate::core::sandbox::Sandbox;
use crate::core::types::{read_message, write_message, ForkHostLaunch, RpcRequest, RpcResponse};
use crate::loader::CodePath;
use std::io::{self, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

fn code_path(locations: &[std::path::PathBuf]) -> CodePath {
    locations
        .iter()
        .fold(CodePath::new(), |path, location| path.with_location(location.clone()))
}

/// Entry point of `--internal-role fork-host`. Never returns while the
/// listener is healthy.
pub fn run_fork_host_role(launch: ForkHostLaunch) -> Result<()> {
    let sandbox = Arc::new(Sandbox::new(
        &code_path(&launch.restricted),
        &code_path(&launch.support),
        launch.config,
    )?);

    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", port)?;
        out.flush()?;
    }
    log::debug!("Fork host {} listening on port {}", std::process::id(), port);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Fork host accept failed: {}", e);
                continue;
            }
        };
        let sandbox = sandbox.clone();
        thread::Builder::new()
            .name("gradebox-fork-conn".to_string())
            .spawn(move || {
                if let Err(e) = serve_connection(&sandbox, stream) {
                    log::warn!("Fork host connection failed: {}", e);
                }
            })?;
    }
    Ok(())
}

fn serve_connection(sandbox: &Sandbox, stream: TcpStream) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let request: RpcRequest = match read_message(&mut reader)? {
        Some(request) => request,
        None => return Ok(()),
    };
    let request = ExecutionRequest::from(request);
    log::debug!("Fork host serving {}", request.entry_name());

    let response = RpcResponse::from_result(sandbox.run(&request));
    let mut writer = stream;
    write_message(&mut writer, &response)
}
